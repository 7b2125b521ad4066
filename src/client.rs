// Copyright 2020 Joyent, Inc.

//! A minimal caller of the callback program, playing the part of the NFS
//! server.  Used to drive a callback server over TCP.
//!
//! Calls and replies go through one `Framed` stream per connection, so a
//! reply that arrives in the same read as the one before it is kept for
//! the next `receive`.

use std::io::{Error, ErrorKind};
use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::{CompoundArgs, CompoundRes};
use crate::rpc::{
    AcceptStat, CallbackRpc, OpaqueAuth, RpcCall, RpcReply, CB_COMPOUND,
};
use crate::xdr::{XdrDecode, XdrDecoder, XdrEncode, XdrEncoder};

const CB_VERSION: u32 = 1;

pub type CallbackStream<S> = Framed<S, CallbackRpc>;

/// Transaction ids, allocated sequentially from a 32-bit space.
pub struct CallId(u32);

impl CallId {
    pub fn new() -> CallId {
        CallId(0)
    }

    pub fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }
}

impl Default for CallId {
    fn default() -> CallId {
        CallId::new()
    }
}

fn other_error<E: std::fmt::Display>(e: E) -> Error {
    Error::new(ErrorKind::Other, e.to_string())
}

pub fn framed<S>(socket: S) -> CallbackStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Framed::new(socket, CallbackRpc::default())
}

pub async fn connect(
    addr: &SocketAddr,
) -> Result<CallbackStream<TcpStream>, Error> {
    Ok(framed(TcpStream::connect(addr).await?))
}

/// Sends one call and returns its transaction id.
pub async fn send<S>(
    program: u32,
    procedure: u32,
    args: Bytes,
    xid: &mut CallId,
    stream: &mut CallbackStream<S>,
) -> Result<u32, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let call = RpcCall {
        xid: xid.next(),
        program,
        version: CB_VERSION,
        procedure,
        cred: OpaqueAuth::none(),
        verf: OpaqueAuth::none(),
        args,
    };
    stream.send(call.encode().map_err(other_error)?).await?;
    Ok(call.xid)
}

pub async fn send_compound<S>(
    program: u32,
    args: &CompoundArgs,
    xid: &mut CallId,
    stream: &mut CallbackStream<S>,
) -> Result<u32, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut enc = XdrEncoder::unbounded();
    args.encode(&mut enc).map_err(other_error)?;
    send(program, CB_COMPOUND, enc.into_bytes().freeze(), xid, stream).await
}

/// Reads the next reply record from `stream`.
pub async fn receive<S>(
    stream: &mut CallbackStream<S>,
) -> Result<RpcReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.next().await {
        Some(record) => RpcReply::parse(&record?).map_err(other_error),
        None => {
            let msg = "connection closed before a reply arrived";
            Err(Error::new(ErrorKind::UnexpectedEof, msg))
        }
    }
}

/// Decodes the CB_COMPOUND result carried by a successful reply.
pub fn compound_result(reply: &RpcReply) -> Result<CompoundRes, Error> {
    if reply.stat != AcceptStat::Success {
        let msg = format!("call not accepted: {:?}", reply.stat);
        return Err(Error::new(ErrorKind::Other, msg));
    }
    CompoundRes::decode(&mut XdrDecoder::new(&reply.results))
        .map_err(other_error)
}
