// Copyright 2020 Joyent, Inc.

//! CB_COMPOUND processing.
//!
//! Operations run in order and processing stops at the first one that
//! fails.  CB_SEQUENCE must come first: it picks the session, and the
//! session stays locked until the compound is done so that two compounds
//! for one session can never interleave.

use std::sync::{Arc, PoisonError};

use slog::{debug, error, o, warn, Drain, Logger};

use crate::config::CallbackConfig;
use crate::protocol::{
    CbArgOp, CbResOp, CompoundArgs, CompoundRes, Nfs4Status, OpCode,
    SequenceRes, SessionId,
};
use crate::recall::RecallContext;
use crate::session::{CallbackSession, SequenceOutcome, SessionRegistry};
use crate::xdr::{XdrDecode, XdrDecoder};

pub struct CompoundProcessor {
    config: Arc<CallbackConfig>,
    sessions: Arc<SessionRegistry>,
    recalls: RecallContext,
    log: Logger,
}

impl CompoundProcessor {
    pub fn new(
        config: Arc<CallbackConfig>,
        sessions: Arc<SessionRegistry>,
        recalls: RecallContext,
        log: Option<&Logger>,
    ) -> CompoundProcessor {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        CompoundProcessor {
            config,
            sessions,
            recalls,
            log,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Decodes and processes one CB_COMPOUND request body.
    pub fn process(&self, raw_args: &[u8]) -> CompoundRes {
        match CompoundArgs::decode(&mut XdrDecoder::new(raw_args)) {
            Ok(args) => self.process_args(&args),
            Err(e) => {
                error!(self.log, "failed to decode compound arguments";
                    "err" => %e);
                CompoundRes::new(Nfs4Status::BadXdr, self.config.reply_tag())
            }
        }
    }

    pub fn process_args(&self, args: &CompoundArgs) -> CompoundRes {
        let mut res = CompoundRes::new(Nfs4Status::Ok, self.config.reply_tag());
        if res.ops.try_reserve_exact(args.ops.len()).is_err() {
            res.status = Nfs4Status::ServerFault;
            return res;
        }

        debug!(self.log, "CB_COMPOUND";
            "tag" => %String::from_utf8_lossy(&args.tag),
            "ops" => args.ops.len());

        if args.minor_version != self.config.minor_version {
            warn!(self.log, "minor version mismatch";
                "minorversion" => args.minor_version);
            res.status = Nfs4Status::MinorVersMismatch;
            return res;
        }

        // CB_SEQUENCE must be first; anything else is rejected before a
        // session is touched.
        let sequence = match args.ops.first() {
            None => return res,
            Some(CbArgOp::Sequence(sequence)) => sequence,
            Some(op) => {
                fail(&mut res, op.opnum(), Nfs4Status::OpNotInSession);
                return res;
            }
        };

        let session = match self.sessions.get(&sequence.session_id) {
            Some(session) => session,
            None => {
                error!(self.log, "callback for unknown session";
                    "sessionid" => %sequence.session_id);
                fail(&mut res, OpCode::Sequence as u32, Nfs4Status::BadSession);
                return res;
            }
        };
        let mut session =
            session.lock().unwrap_or_else(PoisonError::into_inner);

        let res = self.run(&mut session, args, res);
        debug!(self.log, "CB_COMPOUND done";
            "status" => %res.status, "results" => res.ops.len());
        res
    }

    fn run(
        &self,
        session: &mut CallbackSession,
        args: &CompoundArgs,
        mut res: CompoundRes,
    ) -> CompoundRes {
        let mut accepted = false;
        let mut cache_this = false;
        let mut retry_uncached = false;

        for (i, op) in args.ops.iter().enumerate() {
            if i != 0 {
                if let CbArgOp::Sequence(_) = op {
                    fail(&mut res, op.opnum(), Nfs4Status::SequencePos);
                    break;
                }
                if retry_uncached {
                    fail(&mut res, op.opnum(), Nfs4Status::RetryUncachedReply);
                    break;
                }
            }

            let result = match op {
                CbArgOp::Sequence(sequence) => {
                    match session.validate_sequence(sequence, &self.log) {
                        SequenceOutcome::Accepted(ok) => {
                            accepted = true;
                            cache_this = sequence.cache_this;
                            CbResOp::Sequence(SequenceRes::Ok(ok))
                        }
                        SequenceOutcome::RetryUncached(ok) => {
                            retry_uncached = true;
                            CbResOp::Sequence(SequenceRes::Ok(ok))
                        }
                        SequenceOutcome::Retry => {
                            res.ops.push(CbResOp::Sequence(SequenceRes::Err(
                                Nfs4Status::SeqFalseRetry,
                            )));
                            return match session.replay().read(args, &self.log)
                            {
                                Ok(replay) => replay,
                                Err(status) => {
                                    res.status = status;
                                    res
                                }
                            };
                        }
                        SequenceOutcome::Rejected(status) => {
                            CbResOp::Sequence(SequenceRes::Err(status))
                        }
                    }
                }
                _ => self.dispatch(session.session_id(), op),
            };

            let status = result.status();
            res.ops.push(result);
            if !status.is_ok() {
                res.status = status;
                break;
            }
        }

        // nothing followed the sequence op to carry the failure
        if retry_uncached && res.status.is_ok() {
            res.status = Nfs4Status::RetryUncachedReply;
        }

        if accepted {
            let cached_args = if cache_this { Some(args) } else { None };
            session
                .replay_mut()
                .write(cached_args, &mut res, cache_this, &self.log);
        }
        res
    }

    fn dispatch(&self, session_id: &SessionId, op: &CbArgOp) -> CbResOp {
        match op {
            CbArgOp::LayoutRecall(args) => CbResOp::LayoutRecall(
                self.recalls.layout_recall(args, &self.log),
            ),
            CbArgOp::RecallSlot(args) => {
                CbResOp::RecallSlot(self.recalls.recall_slot(args, &self.log))
            }
            CbArgOp::Recall(args) => CbResOp::Recall(self.recalls.recall(
                *session_id,
                args,
                &self.log,
            )),
            other => {
                debug!(self.log, "operation not supported";
                    "opnum" => other.opnum());
                CbResOp::from_status(other.opnum(), Nfs4Status::NotSupported)
            }
        }
    }
}

fn fail(res: &mut CompoundRes, opnum: u32, status: Nfs4Status) {
    res.ops.push(CbResOp::from_status(opnum, status));
    res.status = status;
}
