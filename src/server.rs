// Copyright 2020 Joyent, Inc.

//! The callback entry point and the per-connection task that feeds it.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::compound::CompoundProcessor;
use crate::config::CallbackConfig;
use crate::protocol::CompoundRes;
use crate::recall::RecallContext;
use crate::rpc::{
    AcceptStat, CallbackRpc, RpcCall, RpcReply, CB_COMPOUND, CB_NULL,
};
use crate::session::SessionRegistry;
use crate::xdr::{XdrEncode, XdrEncoder, XdrError};

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackError {
    ProgramUnavailable(u32),
    ProcedureUnavailable(u32),
}

impl CallbackError {
    pub fn accept_stat(&self) -> AcceptStat {
        match self {
            CallbackError::ProgramUnavailable(_) => AcceptStat::ProgUnavail,
            CallbackError::ProcedureUnavailable(_) => AcceptStat::ProcUnavail,
        }
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackError::ProgramUnavailable(prog) => {
                write!(f, "invalid rpc program {}", prog)
            }
            CallbackError::ProcedureUnavailable(procedure) => {
                write!(f, "invalid rpc procedure {}", procedure)
            }
        }
    }
}

impl StdError for CallbackError {}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackReply {
    Null,
    Compound(CompoundRes),
}

pub struct CallbackServer {
    config: Arc<CallbackConfig>,
    processor: CompoundProcessor,
    log: Logger,
}

impl CallbackServer {
    pub fn new(
        config: Arc<CallbackConfig>,
        sessions: Arc<SessionRegistry>,
        recalls: RecallContext,
        log: Option<&Logger>,
    ) -> CallbackServer {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        let processor = CompoundProcessor::new(
            Arc::clone(&config),
            sessions,
            recalls,
            Some(&log),
        );
        CallbackServer {
            config,
            processor,
            log,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.processor.sessions()
    }

    /// Routes one callback by program and procedure number.
    pub fn handle_callback(
        &self,
        program: u32,
        procedure: u32,
        args: &[u8],
    ) -> Result<CallbackReply, CallbackError> {
        if program != self.config.program {
            error!(self.log, "invalid rpc program"; "program" => program);
            return Err(CallbackError::ProgramUnavailable(program));
        }

        match procedure {
            CB_NULL => {
                debug!(self.log, "CB_NULL");
                Ok(CallbackReply::Null)
            }
            CB_COMPOUND => {
                Ok(CallbackReply::Compound(self.processor.process(args)))
            }
            other => {
                debug!(self.log, "invalid rpc procedure"; "procedure" => other);
                Err(CallbackError::ProcedureUnavailable(other))
            }
        }
    }

    /// Answers one RPC record with the encoded reply record.  A call whose
    /// header is malformed gets GARBAGE_ARGS; only a record too short to
    /// hold a transaction id is an error.
    pub fn respond(&self, record: &[u8]) -> Result<Bytes, XdrError> {
        let call = match RpcCall::parse(record) {
            Ok(call) => call,
            Err(e) => {
                let xid = RpcCall::parse_xid(record)?;
                warn!(self.log, "malformed rpc call";
                    "xid" => xid, "err" => %e);
                let reply = RpcReply {
                    xid,
                    stat: AcceptStat::GarbageArgs,
                    results: Bytes::new(),
                };
                return reply.encode();
            }
        };
        let reply = match self.handle_callback(
            call.program,
            call.procedure,
            &call.args,
        ) {
            Ok(CallbackReply::Null) => RpcReply {
                xid: call.xid,
                stat: AcceptStat::Success,
                results: Bytes::new(),
            },
            Ok(CallbackReply::Compound(res)) => {
                let mut enc = XdrEncoder::unbounded();
                res.encode(&mut enc)?;
                RpcReply {
                    xid: call.xid,
                    stat: AcceptStat::Success,
                    results: enc.into_bytes().freeze(),
                }
            }
            Err(e) => RpcReply {
                xid: call.xid,
                stat: e.accept_stat(),
                results: Bytes::new(),
            },
        };
        reply.encode()
    }
}

/// Serves callback calls arriving on `socket` until the peer disconnects
/// or sends a record that cannot be framed or holds no transaction id.
pub fn make_task<S>(
    socket: S,
    server: Arc<CallbackServer>,
    log: Option<&Logger>,
) -> impl Future<Output = ()> + Send
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

    async move {
        let (mut tx, mut rx) =
            Framed::new(socket, CallbackRpc::default()).split();
        while let Some(record) = rx.next().await {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    error!(log, "failed to read callback record"; "err" => %e);
                    break;
                }
            };

            match server.respond(&record) {
                Ok(reply) => {
                    if let Err(e) = tx.send(reply).await {
                        error!(log, "failed to send callback reply";
                            "err" => %e);
                        break;
                    }
                }
                Err(e) => {
                    error!(log, "unreadable callback record"; "err" => %e);
                    break;
                }
            }
        }
        info!(log, "callback connection closed");
    }
}
