// Copyright 2020 Joyent, Inc.

use std::io::Error;
use std::net::SocketAddr;
use std::process;

use bytes::Bytes;
use clap::{crate_version, value_t, App, Arg, ArgMatches};

use nfs41_callback::client::{self, CallId};
use nfs41_callback::config::CallbackConfig;
use nfs41_callback::protocol::{
    CbArgOp, CompoundArgs, FileHandle, LayoutRecallArgs, LayoutRecallType,
    RecallArgs, RecallSlotArgs, SequenceArgs, SessionId, StateId,
    NFS4_OTHER_SIZE,
};
use nfs41_callback::rpc::CB_NULL;

static APP: &'static str = "cbcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Send a CB_COMPOUND to an NFSv4.1 callback server")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address of the callback server")
                .long("host")
                .short("H")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port of the callback server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("session")
                .help("Session id (32 hex digits)")
                .long("session")
                .short("s")
                .takes_value(true)
                .required_unless("ping"),
        )
        .arg(
            Arg::with_name("seq")
                .help("Sequence id for the back channel slot")
                .long("seq")
                .short("q")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("op")
                .help("Operation to send after CB_SEQUENCE")
                .long("op")
                .short("o")
                .takes_value(true)
                .possible_values(&["recall-slot", "recall", "layoutrecall"]),
        )
        .arg(
            Arg::with_name("nocache")
                .help("Ask the server not to cache the reply")
                .long("no-cache")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("ping")
                .help("Send CB_NULL instead of a compound")
                .long("ping")
                .takes_value(false),
        )
        .get_matches()
}

fn operation(name: &str) -> CbArgOp {
    match name {
        "recall" => CbArgOp::Recall(RecallArgs {
            stateid: StateId {
                seqid: 1,
                other: [0; NFS4_OTHER_SIZE],
            },
            truncate: false,
            fh: FileHandle(vec![0; 32]),
        }),
        "layoutrecall" => CbArgOp::LayoutRecall(LayoutRecallArgs {
            layout_type: 1,
            iomode: 3,
            changed: false,
            recall: LayoutRecallType::All,
        }),
        _ => CbArgOp::RecallSlot(RecallSlotArgs {
            target_highest_slot_id: 0,
        }),
    }
}

async fn run(matches: &ArgMatches<'_>, addr: SocketAddr) -> Result<(), Error> {
    let program = CallbackConfig::default().program;
    let mut stream = client::connect(&addr).await?;
    let mut xid = CallId::new();

    if matches.is_present("ping") {
        client::send(program, CB_NULL, Bytes::new(), &mut xid, &mut stream)
            .await?;
        let reply = client::receive(&mut stream).await?;
        println!("CB_NULL: {:?}", reply.stat);
        return Ok(());
    }

    let session_id = value_t!(matches, "session", SessionId)
        .unwrap_or_else(|e| e.exit());
    let sequence_id = value_t!(matches, "seq", u32).unwrap_or(1);
    let args = CompoundArgs {
        tag: APP.as_bytes().to_vec(),
        minor_version: 1,
        callback_ident: 0,
        ops: vec![
            CbArgOp::Sequence(SequenceArgs {
                session_id,
                sequence_id,
                slot_id: 0,
                highest_slot_id: 0,
                cache_this: !matches.is_present("nocache"),
                referring_call_lists: vec![],
            }),
            operation(matches.value_of("op").unwrap_or("recall-slot")),
        ],
    };

    client::send_compound(program, &args, &mut xid, &mut stream).await?;
    let res = client::compound_result(&client::receive(&mut stream).await?)?;
    println!("CB_COMPOUND: {}", res.status);
    for op in res.ops.iter() {
        println!("  op {}: {}", op.opnum(), op.status());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });

    if let Err(e) = run(&matches, addr).await {
        eprintln!("Error: {}", e);
        process::exit(1)
    }
}
