// Copyright 2020 Joyent, Inc.

//! The per-session replay cache.
//!
//! Holds the encoded reply of the last sequenced compound and, when the
//! server asked for it with `cachethis`, the encoded request.  Both buffers
//! are bounded by the configured cache size.

use bytes::Bytes;
use slog::{debug, error, warn, Logger};

use crate::protocol::{CompoundArgs, CompoundRes, Nfs4Status};
use crate::xdr::{XdrDecode, XdrDecoder, XdrEncode, XdrEncoder};

pub struct ReplayCache {
    limit: usize,
    args: Bytes,
    reply: Bytes,
}

impl ReplayCache {
    pub fn new(limit: usize) -> ReplayCache {
        ReplayCache {
            limit,
            args: Bytes::new(),
            reply: Bytes::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.limit
    }

    pub fn has_reply(&self) -> bool {
        !self.reply.is_empty()
    }

    pub fn cached_args(&self) -> &[u8] {
        &self.args
    }

    pub fn cached_reply(&self) -> &[u8] {
        &self.reply
    }

    /// Replaces the cache contents with `res` and, if given, `args`.
    ///
    /// A reply that does not fit leaves the cache empty.  If the server
    /// asked for caching that is reported back to it: `res` gets
    /// NFS4ERR_REP_TOO_BIG_TO_CACHE and its results are cut off after the
    /// first one that did not fit.
    pub fn write(
        &mut self,
        args: Option<&CompoundArgs>,
        res: &mut CompoundRes,
        cache_this: bool,
        log: &Logger,
    ) {
        self.args = Bytes::new();
        self.reply = Bytes::new();

        let mut enc = XdrEncoder::new(self.limit);
        match res.encode_tracked(&mut enc) {
            Ok(()) => {
                self.reply = enc.into_bytes().freeze();

                if let Some(args) = args {
                    // a request that doesn't fit only weakens retry checks
                    let mut enc = XdrEncoder::new(self.limit);
                    match args.encode(&mut enc) {
                        Ok(()) => self.args = enc.into_bytes().freeze(),
                        Err(e) => debug!(log, "request not cached";
                            "err" => %e),
                    }
                }
            }
            Err(overflow) if cache_this => {
                warn!(log, "reply too big to cache";
                    "limit" => self.limit, "op" => ?overflow.op_index);
                res.status = Nfs4Status::ReplyTooBigToCache;
                if let Some(i) = overflow.op_index {
                    res.ops[i].set_status(Nfs4Status::ReplyTooBigToCache);
                    res.ops.truncate(i + 1);
                }
            }
            Err(overflow) => {
                debug!(log, "reply not cached"; "err" => %overflow.error);
            }
        }
    }

    /// Returns the cached reply if `args` is a genuine retry of the request
    /// that produced it, or NFS4ERR_SEQ_FALSE_RETRY.  Never modifies the
    /// cache.
    pub fn read(
        &self,
        args: &CompoundArgs,
        log: &Logger,
    ) -> Result<CompoundRes, Nfs4Status> {
        let replay = CompoundRes::decode(&mut XdrDecoder::new(&self.reply))
            .map_err(|e| {
                error!(log, "failed to decode replay buffer"; "err" => %e);
                Nfs4Status::SeqFalseRetry
            })?;

        if !self.args.is_empty() {
            if !self.matches_args(args) {
                error!(log, "retry attempt with different arguments");
                return Err(Nfs4Status::SeqFalseRetry);
            }
        } else if !matches_ops(args, &replay) {
            // comparing opcodes is the best that can be done
            error!(log, "retry attempt with different operations");
            return Err(Nfs4Status::SeqFalseRetry);
        }

        debug!(log, "retry: returning cached response");
        Ok(replay)
    }

    fn matches_args(&self, args: &CompoundArgs) -> bool {
        let mut enc = XdrEncoder::new(self.limit);
        args.encode(&mut enc).is_ok() && enc.as_slice() == &self.args[..]
    }
}

/// Each cached result up to the first failure must answer the request
/// operation in the same position.
fn matches_ops(args: &CompoundArgs, replay: &CompoundRes) -> bool {
    for (i, res) in replay.ops.iter().enumerate() {
        match args.ops.get(i) {
            Some(arg) if arg.opnum() == res.opnum() => (),
            _ => return false,
        }
        if !res.status().is_ok() {
            break;
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    use slog::{o, Discard};

    use crate::protocol::{
        CbArgOp, CbResOp, RecallSlotArgs, SequenceArgs, SequenceRes,
        SequenceResOk, SessionId, NFS4_SESSIONID_SIZE,
    };

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn request(sequence_id: u32, target: u32) -> CompoundArgs {
        CompoundArgs {
            tag: b"srv".to_vec(),
            minor_version: 1,
            callback_ident: 1,
            ops: vec![
                CbArgOp::Sequence(SequenceArgs {
                    session_id: SessionId([3; NFS4_SESSIONID_SIZE]),
                    sequence_id,
                    slot_id: 0,
                    highest_slot_id: 0,
                    cache_this: true,
                    referring_call_lists: vec![],
                }),
                CbArgOp::RecallSlot(RecallSlotArgs {
                    target_highest_slot_id: target,
                }),
            ],
        }
    }

    fn reply(ops: usize) -> CompoundRes {
        let mut res = CompoundRes::new(Nfs4Status::Ok, b"cb");
        res.ops.push(CbResOp::Sequence(SequenceRes::Ok(SequenceResOk {
            session_id: SessionId([3; NFS4_SESSIONID_SIZE]),
            sequence_id: 1,
            slot_id: 0,
            highest_slot_id: 0,
            target_highest_slot_id: 0,
        })));
        for _ in 1..ops {
            res.ops.push(CbResOp::RecallSlot(Nfs4Status::Ok));
        }
        res
    }

    fn encoded_len(res: &CompoundRes) -> usize {
        let mut enc = XdrEncoder::unbounded();
        res.encode(&mut enc).unwrap();
        enc.position()
    }

    #[test]
    fn reply_filling_cache_exactly_is_cached() {
        let mut res = reply(3);
        let mut cache = ReplayCache::new(encoded_len(&res));
        cache.write(None, &mut res, true, &log());
        assert_eq!(res.status, Nfs4Status::Ok);
        assert_eq!(cache.cached_reply().len(), cache.capacity());
    }

    #[test]
    fn oversized_reply_is_truncated_when_caching_requested() {
        let mut res = reply(3);
        // room for everything but the last 8-byte result, less one byte
        let mut cache = ReplayCache::new(encoded_len(&res) - 9);
        cache.write(None, &mut res, true, &log());

        assert!(!cache.has_reply());
        assert_eq!(res.status, Nfs4Status::ReplyTooBigToCache);
        assert_eq!(res.ops.len(), 2);
        assert_eq!(res.ops[1].status(), Nfs4Status::ReplyTooBigToCache);
        assert_eq!(res.ops[0].status(), Nfs4Status::Ok);
    }

    #[test]
    fn oversized_reply_is_dropped_silently_without_cachethis() {
        let mut cache = ReplayCache::new(1024);
        cache.write(Some(&request(1, 0)), &mut reply(2), true, &log());
        assert!(cache.has_reply());

        let mut res = reply(2);
        cache.limit = encoded_len(&res) - 1;
        cache.write(Some(&request(2, 0)), &mut res, false, &log());
        assert_eq!(res, reply(2));
        assert!(!cache.has_reply());
        assert!(cache.cached_args().is_empty());
    }

    #[test]
    fn retry_validated_by_request_bytes() {
        let mut cache = ReplayCache::new(1024);
        let mut res = reply(2);
        cache.write(Some(&request(1, 0)), &mut res, true, &log());
        assert!(!cache.cached_args().is_empty());

        assert_eq!(cache.read(&request(1, 0), &log()), Ok(res));
        assert_eq!(
            cache.read(&request(1, 5), &log()),
            Err(Nfs4Status::SeqFalseRetry)
        );
    }

    #[test]
    fn retry_validated_by_opcodes_without_request() {
        let mut cache = ReplayCache::new(1024);
        let mut res = reply(2);
        cache.write(None, &mut res, false, &log());

        // same opcodes, different arguments: the best check available passes
        assert_eq!(cache.read(&request(1, 5), &log()), Ok(res));

        let mut different = request(1, 0);
        different.ops.pop();
        assert_eq!(
            cache.read(&different, &log()),
            Err(Nfs4Status::SeqFalseRetry)
        );
    }

    #[test]
    fn opcode_check_stops_at_first_failure() {
        let mut res = reply(1);
        res.ops.push(CbResOp::RecallSlot(Nfs4Status::Delay));
        res.ops.push(CbResOp::Recall(Nfs4Status::Ok));

        let mut args = request(1, 0);
        args.ops.push(CbArgOp::Illegal);
        assert!(matches_ops(&args, &res));

        args.ops[1] = CbArgOp::Illegal;
        assert!(!matches_ops(&args, &res));
    }

    #[test]
    fn empty_cache_is_a_false_retry() {
        let cache = ReplayCache::new(1024);
        assert_eq!(
            cache.read(&request(1, 0), &log()),
            Err(Nfs4Status::SeqFalseRetry)
        );
    }
}
