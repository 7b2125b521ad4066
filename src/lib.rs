// Copyright 2020 Joyent, Inc.

//! nfs41-callback: the NFSv4.1 back channel of a filesystem client
//!
//! An NFSv4.1 server calls back into its clients to recall delegations and
//! layouts.  Those calls arrive as CB_COMPOUND requests on the back channel
//! of a session, and this crate is the client side that answers them.
//!
//! Back channel contract
//!
//! * Every CB_COMPOUND starts with CB_SEQUENCE.  Any other first operation
//!   fails with NFS4ERR_OP_NOT_IN_SESSION, and CB_SEQUENCE anywhere else
//!   fails with NFS4ERR_SEQUENCE_POS.
//!
//! * The back channel has a single slot.  A request must carry the next
//!   sequence id for that slot; repeating the last one is a retry, and
//!   anything else is NFS4ERR_SEQ_MISORDERED.
//!
//! * The reply to the last accepted request is kept in a bounded replay
//!   cache.  A retry that matches the cached request gets the cached reply
//!   back byte for byte; a retry that doesn't is NFS4ERR_SEQ_FALSE_RETRY.
//!
//! * CB_RECALL is answered at once and the delegation is returned by a
//!   detached task.  CB_LAYOUTRECALL always reports that no layout matches,
//!   and CB_RECALL_SLOT always succeeds.  Everything else is
//!   NFS4ERR_NOTSUPP.
//!
//! Calls are carried as ONC RPC records; `server::make_task` serves a
//! connection and `server::CallbackServer::handle_callback` is the entry
//! point for callers that bring their own transport.

#![allow(missing_docs)]

pub mod client;
pub mod compound;
pub mod config;
pub mod protocol;
pub mod recall;
pub mod replay;
pub mod rpc;
pub mod server;
pub mod session;
pub mod xdr;
