// Copyright 2020 Joyent, Inc.

//! CB_COMPOUND argument and result types (RFC 5661 section 20) and their
//! XDR encoding.

use std::fmt;
use std::str::FromStr;

use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::xdr::{
    XdrDecode, XdrDecoder, XdrEncode, XdrEncoder, XdrError, XdrResult,
};

pub const NFS4_SESSIONID_SIZE: usize = 16;
pub const NFS4_OTHER_SIZE: usize = 12;
pub const NFS4_FHSIZE: usize = 128;
pub const CB_COMPOUND_MAX_TAG: usize = 64;

const NFS4_OPAQUE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Nfs4Status {
    Ok = 0,
    NotSupported = 10004,
    ServerFault = 10006,
    Delay = 10008,
    MinorVersMismatch = 10021,
    BadXdr = 10036,
    BadSession = 10052,
    BadSlot = 10053,
    NoMatchingLayout = 10060,
    SeqMisordered = 10063,
    SequencePos = 10064,
    ReplyTooBigToCache = 10067,
    RetryUncachedReply = 10068,
    OpNotInSession = 10071,
    SeqFalseRetry = 10076,
    BadHighSlot = 10077,
}

impl Nfs4Status {
    pub fn is_ok(self) -> bool {
        self == Nfs4Status::Ok
    }
}

impl fmt::Display for Nfs4Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Nfs4Status::Ok => "NFS4_OK",
            Nfs4Status::NotSupported => "NFS4ERR_NOTSUPP",
            Nfs4Status::ServerFault => "NFS4ERR_SERVERFAULT",
            Nfs4Status::Delay => "NFS4ERR_DELAY",
            Nfs4Status::MinorVersMismatch => "NFS4ERR_MINOR_VERS_MISMATCH",
            Nfs4Status::BadXdr => "NFS4ERR_BADXDR",
            Nfs4Status::BadSession => "NFS4ERR_BADSESSION",
            Nfs4Status::BadSlot => "NFS4ERR_BADSLOT",
            Nfs4Status::NoMatchingLayout => "NFS4ERR_NOMATCHING_LAYOUT",
            Nfs4Status::SeqMisordered => "NFS4ERR_SEQ_MISORDERED",
            Nfs4Status::SequencePos => "NFS4ERR_SEQUENCE_POS",
            Nfs4Status::ReplyTooBigToCache => "NFS4ERR_REP_TOO_BIG_TO_CACHE",
            Nfs4Status::RetryUncachedReply => "NFS4ERR_RETRY_UNCACHED_REP",
            Nfs4Status::OpNotInSession => "NFS4ERR_OP_NOT_IN_SESSION",
            Nfs4Status::SeqFalseRetry => "NFS4ERR_SEQ_FALSE_RETRY",
            Nfs4Status::BadHighSlot => "NFS4ERR_BAD_HIGH_SLOT",
        };
        f.write_str(name)
    }
}

impl XdrEncode for Nfs4Status {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_u32(*self as u32)
    }
}

impl XdrDecode for Nfs4Status {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let raw = dec.get_u32()?;
        FromPrimitive::from_u32(raw)
            .ok_or(XdrError::InvalidValue("nfs4 status", raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum OpCode {
    GetAttr = 3,
    Recall = 4,
    LayoutRecall = 5,
    Notify = 6,
    PushDelegation = 7,
    RecallAny = 8,
    RecallableObjectAvailable = 9,
    RecallSlot = 10,
    Sequence = 11,
    WantsCancelled = 12,
    NotifyLock = 13,
    NotifyDeviceId = 14,
    Illegal = 10044,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; NFS4_SESSIONID_SIZE]);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

impl FromStr for SessionId {
    type Err = XdrError;

    /// Parses the 32 hex digit form produced by `Display`.
    fn from_str(s: &str) -> Result<SessionId, XdrError> {
        let digits = s.as_bytes();
        if digits.len() != NFS4_SESSIONID_SIZE * 2 {
            return Err(XdrError::InvalidValue(
                "session id length",
                digits.len() as u32,
            ));
        }

        let mut id = [0; NFS4_SESSIONID_SIZE];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = s
                .get(i * 2..i * 2 + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or(XdrError::InvalidValue("session id digit", i as u32))?;
        }
        Ok(SessionId(id))
    }
}

impl XdrEncode for SessionId {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_fixed_opaque(&self.0)
    }
}

impl XdrDecode for SessionId {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let mut id = [0; NFS4_SESSIONID_SIZE];
        id.copy_from_slice(dec.get_fixed_opaque(NFS4_SESSIONID_SIZE)?);
        Ok(SessionId(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateId {
    pub seqid: u32,
    pub other: [u8; NFS4_OTHER_SIZE],
}

impl XdrEncode for StateId {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_u32(self.seqid)?;
        enc.put_fixed_opaque(&self.other)
    }
}

impl XdrDecode for StateId {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let seqid = dec.get_u32()?;
        let mut other = [0; NFS4_OTHER_SIZE];
        other.copy_from_slice(dec.get_fixed_opaque(NFS4_OTHER_SIZE)?);
        Ok(StateId { seqid, other })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle(pub Vec<u8>);

impl XdrEncode for FileHandle {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_opaque(&self.0)
    }
}

impl XdrDecode for FileHandle {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(FileHandle(dec.get_opaque(NFS4_FHSIZE)?.to_vec()))
    }
}

fn encode_bitmap(enc: &mut XdrEncoder, bitmap: &[u32]) -> XdrResult<()> {
    enc.put_array(bitmap, |e, word| e.put_u32(*word))
}

fn decode_bitmap(dec: &mut XdrDecoder<'_>) -> XdrResult<Vec<u32>> {
    dec.get_array(|d| d.get_u32())
}

/*
 * CB_SEQUENCE
 */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferringCall {
    pub sequence_id: u32,
    pub slot_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferringCallList {
    pub session_id: SessionId,
    pub calls: Vec<ReferringCall>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceArgs {
    pub session_id: SessionId,
    pub sequence_id: u32,
    pub slot_id: u32,
    pub highest_slot_id: u32,
    pub cache_this: bool,
    pub referring_call_lists: Vec<ReferringCallList>,
}

impl XdrEncode for SequenceArgs {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        self.session_id.encode(enc)?;
        enc.put_u32(self.sequence_id)?;
        enc.put_u32(self.slot_id)?;
        enc.put_u32(self.highest_slot_id)?;
        enc.put_bool(self.cache_this)?;
        enc.put_array(&self.referring_call_lists, |e, list| {
            list.session_id.encode(e)?;
            e.put_array(&list.calls, |e, call| {
                e.put_u32(call.sequence_id)?;
                e.put_u32(call.slot_id)
            })
        })
    }
}

impl XdrDecode for SequenceArgs {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(SequenceArgs {
            session_id: SessionId::decode(dec)?,
            sequence_id: dec.get_u32()?,
            slot_id: dec.get_u32()?,
            highest_slot_id: dec.get_u32()?,
            cache_this: dec.get_bool()?,
            referring_call_lists: dec.get_array(|d| {
                Ok(ReferringCallList {
                    session_id: SessionId::decode(d)?,
                    calls: d.get_array(|d| {
                        Ok(ReferringCall {
                            sequence_id: d.get_u32()?,
                            slot_id: d.get_u32()?,
                        })
                    })?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceResOk {
    pub session_id: SessionId,
    pub sequence_id: u32,
    pub slot_id: u32,
    pub highest_slot_id: u32,
    pub target_highest_slot_id: u32,
}

/// The CB_SEQUENCE result; only a successful result carries a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceRes {
    Ok(SequenceResOk),
    Err(Nfs4Status),
}

impl SequenceRes {
    pub fn status(&self) -> Nfs4Status {
        match self {
            SequenceRes::Ok(_) => Nfs4Status::Ok,
            SequenceRes::Err(status) => *status,
        }
    }
}

impl XdrEncode for SequenceRes {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        self.status().encode(enc)?;
        if let SequenceRes::Ok(ok) = self {
            ok.session_id.encode(enc)?;
            enc.put_u32(ok.sequence_id)?;
            enc.put_u32(ok.slot_id)?;
            enc.put_u32(ok.highest_slot_id)?;
            enc.put_u32(ok.target_highest_slot_id)?;
        }
        Ok(())
    }
}

impl XdrDecode for SequenceRes {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        match Nfs4Status::decode(dec)? {
            Nfs4Status::Ok => Ok(SequenceRes::Ok(SequenceResOk {
                session_id: SessionId::decode(dec)?,
                sequence_id: dec.get_u32()?,
                slot_id: dec.get_u32()?,
                highest_slot_id: dec.get_u32()?,
                target_highest_slot_id: dec.get_u32()?,
            })),
            status => Ok(SequenceRes::Err(status)),
        }
    }
}

/*
 * CB_LAYOUTRECALL
 */

const LAYOUTRECALL4_FILE: u32 = 1;
const LAYOUTRECALL4_FSID: u32 = 2;
const LAYOUTRECALL4_ALL: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutRecallType {
    File {
        fh: FileHandle,
        offset: u64,
        length: u64,
        stateid: StateId,
    },
    Fsid {
        major: u64,
        minor: u64,
    },
    All,
}

impl fmt::Display for LayoutRecallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutRecallType::File { .. } => f.write_str("FILE"),
            LayoutRecallType::Fsid { .. } => f.write_str("FSID"),
            LayoutRecallType::All => f.write_str("ALL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRecallArgs {
    pub layout_type: u32,
    pub iomode: u32,
    pub changed: bool,
    pub recall: LayoutRecallType,
}

impl XdrEncode for LayoutRecallArgs {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_u32(self.layout_type)?;
        enc.put_u32(self.iomode)?;
        enc.put_bool(self.changed)?;
        match &self.recall {
            LayoutRecallType::File {
                fh,
                offset,
                length,
                stateid,
            } => {
                enc.put_u32(LAYOUTRECALL4_FILE)?;
                fh.encode(enc)?;
                enc.put_u64(*offset)?;
                enc.put_u64(*length)?;
                stateid.encode(enc)
            }
            LayoutRecallType::Fsid { major, minor } => {
                enc.put_u32(LAYOUTRECALL4_FSID)?;
                enc.put_u64(*major)?;
                enc.put_u64(*minor)
            }
            LayoutRecallType::All => enc.put_u32(LAYOUTRECALL4_ALL),
        }
    }
}

impl XdrDecode for LayoutRecallArgs {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let layout_type = dec.get_u32()?;
        let iomode = dec.get_u32()?;
        let changed = dec.get_bool()?;
        let recall = match dec.get_u32()? {
            LAYOUTRECALL4_FILE => LayoutRecallType::File {
                fh: FileHandle::decode(dec)?,
                offset: dec.get_u64()?,
                length: dec.get_u64()?,
                stateid: StateId::decode(dec)?,
            },
            LAYOUTRECALL4_FSID => LayoutRecallType::Fsid {
                major: dec.get_u64()?,
                minor: dec.get_u64()?,
            },
            LAYOUTRECALL4_ALL => LayoutRecallType::All,
            other => {
                return Err(XdrError::InvalidValue("layout recall type", other))
            }
        };
        Ok(LayoutRecallArgs {
            layout_type,
            iomode,
            changed,
            recall,
        })
    }
}

/*
 * CB_RECALL, CB_RECALL_SLOT
 */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallArgs {
    pub stateid: StateId,
    pub truncate: bool,
    pub fh: FileHandle,
}

impl XdrEncode for RecallArgs {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        self.stateid.encode(enc)?;
        enc.put_bool(self.truncate)?;
        self.fh.encode(enc)
    }
}

impl XdrDecode for RecallArgs {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(RecallArgs {
            stateid: StateId::decode(dec)?,
            truncate: dec.get_bool()?,
            fh: FileHandle::decode(dec)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallSlotArgs {
    pub target_highest_slot_id: u32,
}

/*
 * Operations answered with NFS4ERR_NOTSUPP.  Their arguments are still
 * decoded so the rest of the compound can be parsed.
 */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAttrArgs {
    pub fh: FileHandle,
    pub attr_request: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub mask: Vec<u32>,
    pub values: Vec<u8>,
}

impl XdrEncode for Notify {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        encode_bitmap(enc, &self.mask)?;
        enc.put_opaque(&self.values)
    }
}

impl XdrDecode for Notify {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(Notify {
            mask: decode_bitmap(dec)?,
            values: dec.get_opaque(NFS4_OPAQUE_LIMIT)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyArgs {
    pub stateid: StateId,
    pub fh: FileHandle,
    pub changes: Vec<Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ace {
    pub ace_type: u32,
    pub flag: u32,
    pub access_mask: u32,
    pub who: Vec<u8>,
}

impl XdrEncode for Ace {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_u32(self.ace_type)?;
        enc.put_u32(self.flag)?;
        enc.put_u32(self.access_mask)?;
        enc.put_opaque(&self.who)
    }
}

impl XdrDecode for Ace {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(Ace {
            ace_type: dec.get_u32()?,
            flag: dec.get_u32()?,
            access_mask: dec.get_u32()?,
            who: dec.get_opaque(NFS4_OPAQUE_LIMIT)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceLimit {
    Size(u64),
    Blocks { num_blocks: u32, bytes_per_block: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDelegation {
    None,
    Read {
        stateid: StateId,
        recall: bool,
        permissions: Ace,
    },
    Write {
        stateid: StateId,
        recall: bool,
        space_limit: SpaceLimit,
        permissions: Ace,
    },
    /// `signal` is present only for the contention and resource reasons.
    NoneExt { why: u32, signal: Option<bool> },
}

const WND4_CONTENTION: u32 = 4;
const WND4_RESOURCE: u32 = 5;

impl XdrEncode for OpenDelegation {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        match self {
            OpenDelegation::None => enc.put_u32(0),
            OpenDelegation::Read {
                stateid,
                recall,
                permissions,
            } => {
                enc.put_u32(1)?;
                stateid.encode(enc)?;
                enc.put_bool(*recall)?;
                permissions.encode(enc)
            }
            OpenDelegation::Write {
                stateid,
                recall,
                space_limit,
                permissions,
            } => {
                enc.put_u32(2)?;
                stateid.encode(enc)?;
                enc.put_bool(*recall)?;
                match space_limit {
                    SpaceLimit::Size(size) => {
                        enc.put_u32(1)?;
                        enc.put_u64(*size)?;
                    }
                    SpaceLimit::Blocks {
                        num_blocks,
                        bytes_per_block,
                    } => {
                        enc.put_u32(2)?;
                        enc.put_u32(*num_blocks)?;
                        enc.put_u32(*bytes_per_block)?;
                    }
                }
                permissions.encode(enc)
            }
            OpenDelegation::NoneExt { why, signal } => {
                enc.put_u32(3)?;
                enc.put_u32(*why)?;
                match signal {
                    Some(signal) => enc.put_bool(*signal),
                    None => Ok(()),
                }
            }
        }
    }
}

impl XdrDecode for OpenDelegation {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        match dec.get_u32()? {
            0 => Ok(OpenDelegation::None),
            1 => Ok(OpenDelegation::Read {
                stateid: StateId::decode(dec)?,
                recall: dec.get_bool()?,
                permissions: Ace::decode(dec)?,
            }),
            2 => {
                let stateid = StateId::decode(dec)?;
                let recall = dec.get_bool()?;
                let space_limit = match dec.get_u32()? {
                    1 => SpaceLimit::Size(dec.get_u64()?),
                    2 => SpaceLimit::Blocks {
                        num_blocks: dec.get_u32()?,
                        bytes_per_block: dec.get_u32()?,
                    },
                    other => {
                        return Err(XdrError::InvalidValue(
                            "space limit",
                            other,
                        ))
                    }
                };
                Ok(OpenDelegation::Write {
                    stateid,
                    recall,
                    space_limit,
                    permissions: Ace::decode(dec)?,
                })
            }
            3 => {
                let why = dec.get_u32()?;
                let signal = match why {
                    WND4_CONTENTION | WND4_RESOURCE => Some(dec.get_bool()?),
                    _ => None,
                };
                Ok(OpenDelegation::NoneExt { why, signal })
            }
            other => Err(XdrError::InvalidValue("delegation type", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushDelegationArgs {
    pub fh: FileHandle,
    pub delegation: OpenDelegation,
}

/// Arguments of both CB_RECALL_ANY and CB_RECALLABLE_OBJ_AVAIL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallAnyArgs {
    pub objects_to_keep: u32,
    pub type_mask: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantsCancelledArgs {
    pub contended_wants_cancelled: bool,
    pub resourced_wants_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub client_id: u64,
    pub owner: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyLockArgs {
    pub fh: FileHandle,
    pub lock_owner: LockOwner,
}

/// One operation of a CB_COMPOUND request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CbArgOp {
    Sequence(SequenceArgs),
    LayoutRecall(LayoutRecallArgs),
    RecallSlot(RecallSlotArgs),
    Recall(RecallArgs),
    GetAttr(GetAttrArgs),
    Notify(NotifyArgs),
    PushDelegation(PushDelegationArgs),
    RecallAny(RecallAnyArgs),
    RecallableObjectAvailable(RecallAnyArgs),
    WantsCancelled(WantsCancelledArgs),
    NotifyLock(NotifyLockArgs),
    NotifyDeviceId(Vec<Notify>),
    Illegal,
    Unknown(u32),
}

impl CbArgOp {
    pub fn opnum(&self) -> u32 {
        let op = match self {
            CbArgOp::Sequence(_) => OpCode::Sequence,
            CbArgOp::LayoutRecall(_) => OpCode::LayoutRecall,
            CbArgOp::RecallSlot(_) => OpCode::RecallSlot,
            CbArgOp::Recall(_) => OpCode::Recall,
            CbArgOp::GetAttr(_) => OpCode::GetAttr,
            CbArgOp::Notify(_) => OpCode::Notify,
            CbArgOp::PushDelegation(_) => OpCode::PushDelegation,
            CbArgOp::RecallAny(_) => OpCode::RecallAny,
            CbArgOp::RecallableObjectAvailable(_) => {
                OpCode::RecallableObjectAvailable
            }
            CbArgOp::WantsCancelled(_) => OpCode::WantsCancelled,
            CbArgOp::NotifyLock(_) => OpCode::NotifyLock,
            CbArgOp::NotifyDeviceId(_) => OpCode::NotifyDeviceId,
            CbArgOp::Illegal => OpCode::Illegal,
            CbArgOp::Unknown(opnum) => return *opnum,
        };
        op as u32
    }
}

impl XdrEncode for CbArgOp {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_u32(self.opnum())?;
        match self {
            CbArgOp::Sequence(args) => args.encode(enc),
            CbArgOp::LayoutRecall(args) => args.encode(enc),
            CbArgOp::RecallSlot(args) => {
                enc.put_u32(args.target_highest_slot_id)
            }
            CbArgOp::Recall(args) => args.encode(enc),
            CbArgOp::GetAttr(args) => {
                args.fh.encode(enc)?;
                encode_bitmap(enc, &args.attr_request)
            }
            CbArgOp::Notify(args) => {
                args.stateid.encode(enc)?;
                args.fh.encode(enc)?;
                enc.put_array(&args.changes, |e, n| n.encode(e))
            }
            CbArgOp::PushDelegation(args) => {
                args.fh.encode(enc)?;
                args.delegation.encode(enc)
            }
            CbArgOp::RecallAny(args)
            | CbArgOp::RecallableObjectAvailable(args) => {
                enc.put_u32(args.objects_to_keep)?;
                encode_bitmap(enc, &args.type_mask)
            }
            CbArgOp::WantsCancelled(args) => {
                enc.put_bool(args.contended_wants_cancelled)?;
                enc.put_bool(args.resourced_wants_cancelled)
            }
            CbArgOp::NotifyLock(args) => {
                args.fh.encode(enc)?;
                enc.put_u64(args.lock_owner.client_id)?;
                enc.put_opaque(&args.lock_owner.owner)
            }
            CbArgOp::NotifyDeviceId(changes) => {
                enc.put_array(changes, |e, n| n.encode(e))
            }
            CbArgOp::Illegal | CbArgOp::Unknown(_) => Ok(()),
        }
    }
}

fn decode_recall_any(dec: &mut XdrDecoder<'_>) -> XdrResult<RecallAnyArgs> {
    Ok(RecallAnyArgs {
        objects_to_keep: dec.get_u32()?,
        type_mask: decode_bitmap(dec)?,
    })
}

/// Decodes the arguments of a known opcode.
fn decode_arg_op(op: OpCode, dec: &mut XdrDecoder<'_>) -> XdrResult<CbArgOp> {
    let arg = match op {
        OpCode::Sequence => CbArgOp::Sequence(SequenceArgs::decode(dec)?),
        OpCode::LayoutRecall => {
            CbArgOp::LayoutRecall(LayoutRecallArgs::decode(dec)?)
        }
        OpCode::RecallSlot => CbArgOp::RecallSlot(RecallSlotArgs {
            target_highest_slot_id: dec.get_u32()?,
        }),
        OpCode::Recall => CbArgOp::Recall(RecallArgs::decode(dec)?),
        OpCode::GetAttr => CbArgOp::GetAttr(GetAttrArgs {
            fh: FileHandle::decode(dec)?,
            attr_request: decode_bitmap(dec)?,
        }),
        OpCode::Notify => CbArgOp::Notify(NotifyArgs {
            stateid: StateId::decode(dec)?,
            fh: FileHandle::decode(dec)?,
            changes: dec.get_array(Notify::decode)?,
        }),
        OpCode::PushDelegation => {
            CbArgOp::PushDelegation(PushDelegationArgs {
                fh: FileHandle::decode(dec)?,
                delegation: OpenDelegation::decode(dec)?,
            })
        }
        OpCode::RecallAny => CbArgOp::RecallAny(decode_recall_any(dec)?),
        OpCode::RecallableObjectAvailable => {
            CbArgOp::RecallableObjectAvailable(decode_recall_any(dec)?)
        }
        OpCode::WantsCancelled => CbArgOp::WantsCancelled(WantsCancelledArgs {
            contended_wants_cancelled: dec.get_bool()?,
            resourced_wants_cancelled: dec.get_bool()?,
        }),
        OpCode::NotifyLock => CbArgOp::NotifyLock(NotifyLockArgs {
            fh: FileHandle::decode(dec)?,
            lock_owner: LockOwner {
                client_id: dec.get_u64()?,
                owner: dec.get_opaque(NFS4_OPAQUE_LIMIT)?.to_vec(),
            },
        }),
        OpCode::NotifyDeviceId => {
            CbArgOp::NotifyDeviceId(dec.get_array(Notify::decode)?)
        }
        OpCode::Illegal => CbArgOp::Illegal,
    };
    Ok(arg)
}

/// A decoded CB_COMPOUND request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundArgs {
    pub tag: Vec<u8>,
    pub minor_version: u32,
    pub callback_ident: u32,
    pub ops: Vec<CbArgOp>,
}

impl XdrEncode for CompoundArgs {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_opaque(&self.tag)?;
        enc.put_u32(self.minor_version)?;
        enc.put_u32(self.callback_ident)?;
        enc.put_array(&self.ops, |e, op| op.encode(e))
    }
}

impl XdrDecode for CompoundArgs {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let tag = dec.get_opaque(CB_COMPOUND_MAX_TAG)?.to_vec();
        let minor_version = dec.get_u32()?;
        let callback_ident = dec.get_u32()?;
        let count = dec.get_u32()? as usize;
        if count > dec.remaining() / 4 {
            return Err(XdrError::Truncated {
                needed: count * 4,
                available: dec.remaining(),
            });
        }

        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            let opnum = dec.get_u32()?;
            match FromPrimitive::from_u32(opnum) {
                Some(op) => ops.push(decode_arg_op(op, dec)?),
                None => {
                    // The argument length of an unknown operation can't be
                    // known, so nothing after it is decodable.
                    ops.push(CbArgOp::Unknown(opnum));
                    break;
                }
            }
        }

        Ok(CompoundArgs {
            tag,
            minor_version,
            callback_ident,
            ops,
        })
    }
}

/// One operation result of a CB_COMPOUND reply.  Everything other than
/// CB_SEQUENCE carries only a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CbResOp {
    Sequence(SequenceRes),
    LayoutRecall(Nfs4Status),
    RecallSlot(Nfs4Status),
    Recall(Nfs4Status),
    GetAttr(Nfs4Status),
    Notify(Nfs4Status),
    PushDelegation(Nfs4Status),
    RecallAny(Nfs4Status),
    RecallableObjectAvailable(Nfs4Status),
    WantsCancelled(Nfs4Status),
    NotifyLock(Nfs4Status),
    NotifyDeviceId(Nfs4Status),
    Illegal(Nfs4Status),
    Unknown(u32, Nfs4Status),
}

impl CbResOp {
    /// A status-only result for operation `opnum`.
    pub fn from_status(opnum: u32, status: Nfs4Status) -> CbResOp {
        match FromPrimitive::from_u32(opnum) {
            Some(OpCode::Sequence) => {
                CbResOp::Sequence(SequenceRes::Err(status))
            }
            Some(OpCode::LayoutRecall) => CbResOp::LayoutRecall(status),
            Some(OpCode::RecallSlot) => CbResOp::RecallSlot(status),
            Some(OpCode::Recall) => CbResOp::Recall(status),
            Some(OpCode::GetAttr) => CbResOp::GetAttr(status),
            Some(OpCode::Notify) => CbResOp::Notify(status),
            Some(OpCode::PushDelegation) => CbResOp::PushDelegation(status),
            Some(OpCode::RecallAny) => CbResOp::RecallAny(status),
            Some(OpCode::RecallableObjectAvailable) => {
                CbResOp::RecallableObjectAvailable(status)
            }
            Some(OpCode::WantsCancelled) => CbResOp::WantsCancelled(status),
            Some(OpCode::NotifyLock) => CbResOp::NotifyLock(status),
            Some(OpCode::NotifyDeviceId) => CbResOp::NotifyDeviceId(status),
            Some(OpCode::Illegal) => CbResOp::Illegal(status),
            None => CbResOp::Unknown(opnum, status),
        }
    }

    pub fn opnum(&self) -> u32 {
        let op = match self {
            CbResOp::Sequence(_) => OpCode::Sequence,
            CbResOp::LayoutRecall(_) => OpCode::LayoutRecall,
            CbResOp::RecallSlot(_) => OpCode::RecallSlot,
            CbResOp::Recall(_) => OpCode::Recall,
            CbResOp::GetAttr(_) => OpCode::GetAttr,
            CbResOp::Notify(_) => OpCode::Notify,
            CbResOp::PushDelegation(_) => OpCode::PushDelegation,
            CbResOp::RecallAny(_) => OpCode::RecallAny,
            CbResOp::RecallableObjectAvailable(_) => {
                OpCode::RecallableObjectAvailable
            }
            CbResOp::WantsCancelled(_) => OpCode::WantsCancelled,
            CbResOp::NotifyLock(_) => OpCode::NotifyLock,
            CbResOp::NotifyDeviceId(_) => OpCode::NotifyDeviceId,
            CbResOp::Illegal(_) => OpCode::Illegal,
            CbResOp::Unknown(opnum, _) => return *opnum,
        };
        op as u32
    }

    pub fn status(&self) -> Nfs4Status {
        match self {
            CbResOp::Sequence(res) => res.status(),
            CbResOp::LayoutRecall(s)
            | CbResOp::RecallSlot(s)
            | CbResOp::Recall(s)
            | CbResOp::GetAttr(s)
            | CbResOp::Notify(s)
            | CbResOp::PushDelegation(s)
            | CbResOp::RecallAny(s)
            | CbResOp::RecallableObjectAvailable(s)
            | CbResOp::WantsCancelled(s)
            | CbResOp::NotifyLock(s)
            | CbResOp::NotifyDeviceId(s)
            | CbResOp::Illegal(s)
            | CbResOp::Unknown(_, s) => *s,
        }
    }

    pub fn set_status(&mut self, status: Nfs4Status) {
        *self = CbResOp::from_status(self.opnum(), status);
    }
}

impl XdrEncode for CbResOp {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_u32(self.opnum())?;
        match self {
            CbResOp::Sequence(res) => res.encode(enc),
            other => other.status().encode(enc),
        }
    }
}

impl XdrDecode for CbResOp {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let opnum = dec.get_u32()?;
        match FromPrimitive::from_u32(opnum) {
            Some(OpCode::Sequence) => {
                Ok(CbResOp::Sequence(SequenceRes::decode(dec)?))
            }
            Some(OpCode::GetAttr) => match Nfs4Status::decode(dec)? {
                // a successful CB_GETATTR carries attributes this side never
                // produces
                Nfs4Status::Ok => {
                    Err(XdrError::InvalidValue("getattr result", opnum))
                }
                status => Ok(CbResOp::GetAttr(status)),
            },
            _ => Ok(CbResOp::from_status(opnum, Nfs4Status::decode(dec)?)),
        }
    }
}

/// Reported when a compound result does not fit its encoder.  `op_index`
/// names the first result that failed to encode, or is `None` when the
/// header itself did not fit.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultOverflow {
    pub op_index: Option<usize>,
    pub error: XdrError,
}

/// A CB_COMPOUND reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundRes {
    pub status: Nfs4Status,
    pub tag: Vec<u8>,
    pub ops: Vec<CbResOp>,
}

impl CompoundRes {
    pub fn new(status: Nfs4Status, tag: &[u8]) -> CompoundRes {
        CompoundRes {
            status,
            tag: tag.to_vec(),
            ops: Vec::new(),
        }
    }

    pub fn encode_tracked(
        &self,
        enc: &mut XdrEncoder,
    ) -> Result<(), ResultOverflow> {
        let header = |error| ResultOverflow {
            op_index: None,
            error,
        };
        self.status.encode(enc).map_err(header)?;
        enc.put_opaque(&self.tag).map_err(header)?;
        enc.put_u32(self.ops.len() as u32).map_err(header)?;
        for (i, op) in self.ops.iter().enumerate() {
            op.encode(enc).map_err(|error| ResultOverflow {
                op_index: Some(i),
                error,
            })?;
        }
        Ok(())
    }
}

impl XdrEncode for CompoundRes {
    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        self.encode_tracked(enc).map_err(|overflow| overflow.error)
    }
}

impl XdrDecode for CompoundRes {
    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(CompoundRes {
            status: Nfs4Status::decode(dec)?,
            tag: dec.get_opaque(CB_COMPOUND_MAX_TAG)?.to_vec(),
            ops: dec.get_array(CbResOp::decode)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};
    use rand::Rng;

    fn sequence_op(sequence_id: u32) -> CbArgOp {
        CbArgOp::Sequence(SequenceArgs {
            session_id: SessionId([7; NFS4_SESSIONID_SIZE]),
            sequence_id,
            slot_id: 0,
            highest_slot_id: 0,
            cache_this: true,
            referring_call_lists: vec![ReferringCallList {
                session_id: SessionId([9; NFS4_SESSIONID_SIZE]),
                calls: vec![ReferringCall {
                    sequence_id: 4,
                    slot_id: 2,
                }],
            }],
        })
    }

    #[test]
    fn session_id_hex() {
        let id: SessionId = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        assert_eq!(id.0[15], 0x0f);
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!("00".parse::<SessionId>().is_err());
        let bad_digit = "zz0102030405060708090a0b0c0d0e0f";
        assert!(bad_digit.parse::<SessionId>().is_err());
    }

    fn encode<T: XdrEncode>(value: &T) -> Vec<u8> {
        let mut enc = XdrEncoder::unbounded();
        value.encode(&mut enc).unwrap();
        enc.as_slice().to_vec()
    }

    #[derive(Clone, Debug)]
    struct RawBytes(Vec<u8>);

    impl Arbitrary for RawBytes {
        fn arbitrary<G: Gen>(g: &mut G) -> RawBytes {
            // Start from a plausible header so the op decoders get exercised.
            let mut bytes = vec![0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
            let size = g.size().max(1);
            let len = g.gen_range(0, size * 4);
            bytes.extend((0..len).map(|_| g.gen::<u8>()));
            RawBytes(bytes)
        }
    }

    #[test]
    fn compound_args_survive_encoding() {
        let args = CompoundArgs {
            tag: b"cb".to_vec(),
            minor_version: 1,
            callback_ident: 0x2883a,
            ops: vec![
                sequence_op(3),
                CbArgOp::LayoutRecall(LayoutRecallArgs {
                    layout_type: 1,
                    iomode: 3,
                    changed: false,
                    recall: LayoutRecallType::Fsid { major: 1, minor: 2 },
                }),
                CbArgOp::PushDelegation(PushDelegationArgs {
                    fh: FileHandle(vec![1, 2, 3]),
                    delegation: OpenDelegation::NoneExt {
                        why: WND4_CONTENTION,
                        signal: Some(true),
                    },
                }),
                CbArgOp::Illegal,
            ],
        };

        let bytes = encode(&args);
        let decoded = CompoundArgs::decode(&mut XdrDecoder::new(&bytes));
        assert_eq!(decoded, Ok(args));
    }

    #[test]
    fn unknown_opcode_ends_argument_array() {
        let mut enc = XdrEncoder::unbounded();
        enc.put_opaque(b"").unwrap();
        enc.put_u32(1).unwrap();
        enc.put_u32(0).unwrap();
        enc.put_u32(3).unwrap();
        sequence_op(1).encode(&mut enc).unwrap();
        enc.put_u32(99).unwrap();
        enc.put_u32(0xdead_beef).unwrap();

        let args = CompoundArgs::decode(&mut XdrDecoder::new(enc.as_slice()))
            .unwrap();
        assert_eq!(args.ops.len(), 2);
        assert_eq!(args.ops[1], CbArgOp::Unknown(99));
    }

    #[test]
    fn result_overflow_names_failing_op() {
        let mut res = CompoundRes::new(Nfs4Status::Ok, b"tag");
        res.ops.push(CbResOp::RecallSlot(Nfs4Status::Ok));
        res.ops.push(CbResOp::Recall(Nfs4Status::Ok));

        // status + tag + count + first op
        let mut enc = XdrEncoder::new(4 + 8 + 4 + 8);
        let err = res.encode_tracked(&mut enc).unwrap_err();
        assert_eq!(err.op_index, Some(1));

        let mut enc = XdrEncoder::new(4);
        assert_eq!(res.encode_tracked(&mut enc).unwrap_err().op_index, None);
    }

    #[test]
    fn set_status_drops_sequence_body() {
        let mut op = CbResOp::Sequence(SequenceRes::Ok(SequenceResOk {
            session_id: SessionId([1; NFS4_SESSIONID_SIZE]),
            sequence_id: 1,
            slot_id: 0,
            highest_slot_id: 0,
            target_highest_slot_id: 0,
        }));
        op.set_status(Nfs4Status::ReplyTooBigToCache);
        assert_eq!(
            op,
            CbResOp::Sequence(SequenceRes::Err(Nfs4Status::ReplyTooBigToCache))
        );
        assert_eq!(op.opnum(), OpCode::Sequence as u32);
    }

    #[test]
    fn decode_never_panics() {
        fn prop(raw: RawBytes) -> bool {
            let _ = CompoundArgs::decode(&mut XdrDecoder::new(&raw.0));
            let _ = CompoundRes::decode(&mut XdrDecoder::new(&raw.0));
            true
        }
        quickcheck(prop as fn(RawBytes) -> bool);
    }
}
