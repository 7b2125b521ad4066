// Copyright 2020 Joyent, Inc.

use std::fs;
use std::io::Error;
use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use nfs41_callback::config::CallbackConfig;
use nfs41_callback::protocol::{
    FileHandle, LayoutRecallArgs, SessionId, StateId,
};
use nfs41_callback::recall::{
    ClientRoot, DelegationReturn, LayoutRecall, LayoutRecallStatus,
    RecallContext, TokioSpawner,
};
use nfs41_callback::server::{self, CallbackServer};
use nfs41_callback::session::SessionRegistry;

static APP: &'static str = "cbserve";
static DEFAULT_ADDR: &'static str = "127.0.0.1:2030";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serve the NFSv4.1 callback program for a set of sessions")
        .version(crate_version!())
        .arg(
            Arg::with_name("listen")
                .help("Address to accept callback connections on")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("session")
                .help("Session id (32 hex digits) to accept callbacks for")
                .long("session")
                .short("s")
                .takes_value(true)
                .multiple(true)
                .required(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON file with callback settings")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("root")
                .help("Mount point the delegations belong to")
                .long("root")
                .short("r")
                .takes_value(true),
        )
        .get_matches()
}

/// Layouts are never handed out here, so there is never one to recall.
struct NoLayouts;

impl LayoutRecall for NoLayouts {
    fn resolve_layout_recall(
        &self,
        _args: &LayoutRecallArgs,
    ) -> LayoutRecallStatus {
        LayoutRecallStatus::Resolved
    }
}

/// Logs each delegation it is asked to return.
struct LoggingReturn {
    log: Logger,
}

impl DelegationReturn for LoggingReturn {
    fn delegation_return(
        &self,
        session_id: SessionId,
        fh: FileHandle,
        stateid: StateId,
    ) -> BoxFuture<'static, Result<(), Error>> {
        let log = self.log.clone();
        async move {
            info!(log, "returning delegation";
                "sessionid" => %session_id,
                "fh_len" => fh.0.len(),
                "stateid_seq" => stateid.seqid);
            Ok(())
        }
        .boxed()
    }
}

fn load_config(path: Option<&str>) -> CallbackConfig {
    let path = match path {
        Some(path) => path,
        None => return CallbackConfig::default(),
    };
    let json = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path, e);
        process::exit(1)
    });
    CallbackConfig::from_json(&json).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path, e);
        process::exit(1)
    })
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let addr = value_t!(matches, "listen", SocketAddr).unwrap_or_else(|e| {
        if matches.is_present("listen") {
            e.exit()
        }
        DEFAULT_ADDR.parse().expect("default address")
    });
    let config = Arc::new(load_config(matches.value_of("config")));

    let sessions =
        Arc::new(SessionRegistry::new(Arc::clone(&config), &root_log));
    for session in matches.values_of("session").into_iter().flatten() {
        let id = session.parse::<SessionId>().unwrap_or_else(|e| {
            eprintln!("Bad session id {}: {}", session, e);
            process::exit(1)
        });
        sessions.register(id);
    }

    let recalls = RecallContext {
        root: ClientRoot::new(matches.value_of("root").unwrap_or("/")),
        layouts: Arc::new(NoLayouts),
        delegations: Arc::new(LoggingReturn {
            log: root_log.new(o!("component" => "delegreturn")),
        }),
        spawner: Arc::new(TokioSpawner),
    };
    let callback_server = Arc::new(CallbackServer::new(
        config,
        sessions,
        recalls,
        Some(&root_log),
    ));

    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", addr, e);
        process::exit(1)
    });
    info!(root_log, "listening for callbacks"; "address" => addr);

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let process_log = root_log.new(o!("peer" => peer));
                let callback_server = Arc::clone(&callback_server);
                tokio::spawn(async move {
                    server::make_task(
                        socket,
                        callback_server,
                        Some(&process_log),
                    )
                    .await;
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
