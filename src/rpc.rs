// Copyright 2020 Joyent, Inc.

//! ONC RPC (RFC 5531) framing for the callback program.
//!
//! Messages travel as records.  Each record is one or more fragments, and
//! every fragment starts with a 4-byte big-endian header:
//!
//! * bit 31        set on the last fragment of a record
//!
//! * bits 0..30    number of fragment bytes that follow
//!
//! Only the parts of the call and reply headers the callback server needs
//! are modelled: calls carry any credential flavor, replies are always
//! MSG_ACCEPTED with an AUTH_NONE verifier.

use std::io::{Error, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};
use tokio_util::codec::{Decoder, Encoder};

use crate::xdr::{XdrDecoder, XdrEncoder, XdrError, XdrResult};

pub const RPC_VERSION: u32 = 2;
pub const CB_NULL: u32 = 0;
pub const CB_COMPOUND: u32 = 1;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const AUTH_NONE: u32 = 0;
const MAX_AUTH_BYTES: usize = 400;

const RM_HEADER_SZ: usize = 4;
const RM_LAST_FRAGMENT: u32 = 0x8000_0000;
const RM_LENGTH_MASK: u32 = 0x7fff_ffff;
const DEFAULT_MAX_RECORD: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProcUnavail = 3,
    GarbageArgs = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    pub fn none() -> OpaqueAuth {
        OpaqueAuth {
            flavor: AUTH_NONE,
            body: vec![],
        }
    }

    fn encode(&self, enc: &mut XdrEncoder) -> XdrResult<()> {
        enc.put_u32(self.flavor)?;
        enc.put_opaque(&self.body)
    }

    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<OpaqueAuth> {
        Ok(OpaqueAuth {
            flavor: dec.get_u32()?,
            body: dec.get_opaque(MAX_AUTH_BYTES)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
    /// Procedure arguments, still encoded.
    pub args: Bytes,
}

impl RpcCall {
    /// Reads only the transaction id, which leads every message.
    pub fn parse_xid(record: &[u8]) -> XdrResult<u32> {
        XdrDecoder::new(record).get_u32()
    }

    pub fn parse(record: &[u8]) -> XdrResult<RpcCall> {
        let mut dec = XdrDecoder::new(record);
        let xid = dec.get_u32()?;
        let msg_type = dec.get_u32()?;
        if msg_type != MSG_CALL {
            return Err(XdrError::InvalidValue("rpc message type", msg_type));
        }
        let rpcvers = dec.get_u32()?;
        if rpcvers != RPC_VERSION {
            return Err(XdrError::InvalidValue("rpc version", rpcvers));
        }

        Ok(RpcCall {
            xid,
            program: dec.get_u32()?,
            version: dec.get_u32()?,
            procedure: dec.get_u32()?,
            cred: OpaqueAuth::decode(&mut dec)?,
            verf: OpaqueAuth::decode(&mut dec)?,
            args: Bytes::copy_from_slice(dec.rest()),
        })
    }

    pub fn encode(&self) -> XdrResult<Bytes> {
        let mut enc = XdrEncoder::unbounded();
        enc.put_u32(self.xid)?;
        enc.put_u32(MSG_CALL)?;
        enc.put_u32(RPC_VERSION)?;
        enc.put_u32(self.program)?;
        enc.put_u32(self.version)?;
        enc.put_u32(self.procedure)?;
        self.cred.encode(&mut enc)?;
        self.verf.encode(&mut enc)?;
        let mut buf = enc.into_bytes();
        buf.put_slice(&self.args);
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub xid: u32,
    pub stat: AcceptStat,
    /// Procedure results, already encoded.  Empty unless `stat` is
    /// `Success`.
    pub results: Bytes,
}

impl RpcReply {
    pub fn parse(record: &[u8]) -> XdrResult<RpcReply> {
        let mut dec = XdrDecoder::new(record);
        let xid = dec.get_u32()?;
        let msg_type = dec.get_u32()?;
        if msg_type != MSG_REPLY {
            return Err(XdrError::InvalidValue("rpc message type", msg_type));
        }
        let reply_stat = dec.get_u32()?;
        if reply_stat != MSG_ACCEPTED {
            return Err(XdrError::InvalidValue("rpc reply status", reply_stat));
        }
        OpaqueAuth::decode(&mut dec)?;
        let raw = dec.get_u32()?;
        let stat = FromPrimitive::from_u32(raw)
            .ok_or(XdrError::InvalidValue("rpc accept status", raw))?;

        Ok(RpcReply {
            xid,
            stat,
            results: Bytes::copy_from_slice(dec.rest()),
        })
    }

    pub fn encode(&self) -> XdrResult<Bytes> {
        let mut enc = XdrEncoder::unbounded();
        enc.put_u32(self.xid)?;
        enc.put_u32(MSG_REPLY)?;
        enc.put_u32(MSG_ACCEPTED)?;
        OpaqueAuth::none().encode(&mut enc)?;
        enc.put_u32(self.stat as u32)?;
        let mut buf = enc.into_bytes();
        buf.put_slice(&self.results);
        Ok(buf.freeze())
    }
}

/// Record marking codec.  Decodes whole records, reassembling fragments,
/// and encodes each record as a single fragment.
pub struct CallbackRpc {
    max_record: usize,
    partial: BytesMut,
}

impl CallbackRpc {
    pub fn new(max_record: usize) -> CallbackRpc {
        CallbackRpc {
            max_record,
            partial: BytesMut::new(),
        }
    }
}

impl Default for CallbackRpc {
    fn default() -> CallbackRpc {
        CallbackRpc::new(DEFAULT_MAX_RECORD)
    }
}

impl Decoder for CallbackRpc {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        loop {
            if buf.len() < RM_HEADER_SZ {
                return Ok(None);
            }
            let header = BigEndian::read_u32(&buf[..RM_HEADER_SZ]);
            let frag_len = (header & RM_LENGTH_MASK) as usize;
            if self.partial.len() + frag_len > self.max_record {
                let msg = format!(
                    "record exceeds {} bytes",
                    self.max_record
                );
                return Err(Error::new(ErrorKind::InvalidData, msg));
            }
            if buf.len() < RM_HEADER_SZ + frag_len {
                buf.reserve(RM_HEADER_SZ + frag_len - buf.len());
                return Ok(None);
            }

            buf.advance(RM_HEADER_SZ);
            self.partial.extend_from_slice(&buf.split_to(frag_len));
            if header & RM_LAST_FRAGMENT != 0 {
                return Ok(Some(self.partial.split().freeze()));
            }
        }
    }
}

impl Encoder<Bytes> for CallbackRpc {
    type Error = Error;

    fn encode(
        &mut self,
        record: Bytes,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        if record.len() > RM_LENGTH_MASK as usize {
            let msg = "record too large for a single fragment";
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }
        buf.reserve(RM_HEADER_SZ + record.len());
        buf.put_u32(RM_LAST_FRAGMENT | record.len() as u32);
        buf.put_slice(&record);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn call() -> RpcCall {
        RpcCall {
            xid: 0x1234,
            program: 0x2883a,
            version: 1,
            procedure: CB_COMPOUND,
            cred: OpaqueAuth {
                flavor: 1,
                body: vec![0, 0, 0, 0, 0, 0, 0, 1],
            },
            verf: OpaqueAuth::none(),
            args: Bytes::from_static(&[0, 0, 0, 9]),
        }
    }

    #[test]
    fn reassembles_fragments() {
        let record = call().encode().unwrap();
        let (head, tail) = record.split_at(10);

        let mut buf = BytesMut::new();
        buf.put_u32(head.len() as u32);
        buf.put_slice(head);
        buf.put_u32(RM_LAST_FRAGMENT | tail.len() as u32);
        buf.put_slice(&tail[..3]);

        let mut codec = CallbackRpc::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_slice(&tail[3..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(RpcCall::parse(&decoded).unwrap(), call());
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut codec = CallbackRpc::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(RM_LAST_FRAGMENT | 17);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn reply_header() {
        let reply = RpcReply {
            xid: 7,
            stat: AcceptStat::ProcUnavail,
            results: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        CallbackRpc::default()
            .encode(reply.encode().unwrap(), &mut buf)
            .unwrap();
        assert_eq!(&buf[..4], &[0x80, 0, 0, 24]);
        assert_eq!(RpcReply::parse(&buf[4..]).unwrap(), reply);
    }

    #[test]
    fn reply_is_not_a_call() {
        let reply = RpcReply {
            xid: 7,
            stat: AcceptStat::Success,
            results: Bytes::new(),
        };
        let bytes = reply.encode().unwrap();
        assert_eq!(
            RpcCall::parse(&bytes),
            Err(XdrError::InvalidValue("rpc message type", MSG_REPLY))
        );
    }
}
