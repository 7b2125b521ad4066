// Copyright 2020 Joyent, Inc.

//! Recall operation handlers and the filesystem collaborators they call.
//!
//! CB_LAYOUTRECALL and CB_RECALL_SLOT are answered on the spot.  CB_RECALL
//! only starts a delegation return: returning a delegation can need more
//! round trips to the server, and waiting for those on the callback path
//! can deadlock when both directions share a connection.

use std::io::{Error, ErrorKind};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, error, info, warn, Logger};
use tokio::runtime::Handle;

use crate::protocol::{
    FileHandle, LayoutRecallArgs, Nfs4Status, RecallArgs, RecallSlotArgs,
    SessionId, StateId,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayoutRecallStatus {
    /// Not enough is known yet to process the recall.
    Pending,
    Resolved,
}

pub trait LayoutRecall: Send + Sync {
    fn resolve_layout_recall(&self, args: &LayoutRecallArgs)
        -> LayoutRecallStatus;
}

pub trait DelegationReturn: Send + Sync {
    fn delegation_return(
        &self,
        session_id: SessionId,
        fh: FileHandle,
        stateid: StateId,
    ) -> BoxFuture<'static, Result<(), Error>>;
}

/// Starts detached work.  Failing to start it is the only error.
pub trait Spawn: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), Error>;
}

/// Spawns onto the tokio runtime the caller is running on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl Spawn for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), Error> {
        let handle = Handle::try_current()
            .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
        handle.spawn(task);
        Ok(())
    }
}

/// The client's root of the mounted filesystem.  A recall in progress holds
/// a reference to it so the root outlives the delegation return.
#[derive(Debug)]
pub struct ClientRoot {
    pub path: String,
}

impl ClientRoot {
    pub fn new(path: &str) -> Arc<ClientRoot> {
        Arc::new(ClientRoot {
            path: String::from(path),
        })
    }
}

pub struct RecallContext {
    pub root: Arc<ClientRoot>,
    pub layouts: Arc<dyn LayoutRecall>,
    pub delegations: Arc<dyn DelegationReturn>,
    pub spawner: Arc<dyn Spawn>,
}

impl RecallContext {
    /// Layouts are not tracked, so the answer is always that nothing
    /// matches unless the layout code needs more time.
    pub fn layout_recall(
        &self,
        args: &LayoutRecallArgs,
        log: &Logger,
    ) -> Nfs4Status {
        let status = match self.layouts.resolve_layout_recall(args) {
            LayoutRecallStatus::Pending => Nfs4Status::Delay,
            LayoutRecallStatus::Resolved => Nfs4Status::NoMatchingLayout,
        };
        debug!(log, "OP_CB_LAYOUTRECALL";
            "type" => args.layout_type, "iomode" => args.iomode,
            "recall" => %args.recall, "status" => %status);
        status
    }

    /// The slot count never changes, so any target is already met.
    pub fn recall_slot(
        &self,
        args: &RecallSlotArgs,
        log: &Logger,
    ) -> Nfs4Status {
        debug!(log, "OP_CB_RECALL_SLOT";
            "target_highest_slotid" => args.target_highest_slot_id);
        Nfs4Status::Ok
    }

    /// Starts returning the recalled delegation and answers immediately.
    /// The outcome of the return is never reported back.
    pub fn recall(
        &self,
        session_id: SessionId,
        args: &RecallArgs,
        log: &Logger,
    ) -> Nfs4Status {
        debug!(log, "OP_CB_RECALL"; "stateid_seq" => args.stateid.seqid,
            "truncate" => args.truncate);

        let root = Arc::clone(&self.root);
        let delegations = Arc::clone(&self.delegations);
        let args = args.clone();
        let task_log = log.clone();

        let task = async move {
            debug!(task_log, "delegation recall: sending delegreturn";
                "root" => &root.path);
            match delegations
                .delegation_return(session_id, args.fh, args.stateid)
                .await
            {
                Ok(()) => info!(task_log, "delegation returned";
                    "stateid_seq" => args.stateid.seqid),
                Err(e) => warn!(task_log, "delegation return failed";
                    "err" => %e),
            }
            drop(root);
            debug!(task_log, "delegation recall: end");
        };

        match self.spawner.spawn(task.boxed()) {
            Ok(()) => Nfs4Status::Ok,
            Err(e) => {
                error!(log, "failed to start delegation recall"; "err" => %e);
                Nfs4Status::ServerFault
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use std::sync::Mutex;

    use slog::{o, Discard};
    use tokio::sync::{mpsc, oneshot};

    use crate::protocol::{LayoutRecallType, NFS4_OTHER_SIZE};

    pub(crate) struct FixedLayouts(pub LayoutRecallStatus);

    impl LayoutRecall for FixedLayouts {
        fn resolve_layout_recall(
            &self,
            _args: &LayoutRecallArgs,
        ) -> LayoutRecallStatus {
            self.0
        }
    }

    /// Reports each delegation return on a channel, optionally waiting for
    /// a go-ahead and optionally failing.
    pub(crate) struct RecordingDelegations {
        pub returned: mpsc::UnboundedSender<StateId>,
        pub gate: Mutex<Option<oneshot::Receiver<()>>>,
        pub fail: bool,
    }

    impl DelegationReturn for RecordingDelegations {
        fn delegation_return(
            &self,
            _session_id: SessionId,
            _fh: FileHandle,
            stateid: StateId,
        ) -> BoxFuture<'static, Result<(), Error>> {
            let gate = self.gate.lock().unwrap().take();
            let returned = self.returned.clone();
            let fail = self.fail;
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                let _ = returned.send(stateid);
                if fail {
                    Err(Error::new(ErrorKind::Other, "server unreachable"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    pub(crate) struct FailingSpawner;

    impl Spawn for FailingSpawner {
        fn spawn(&self, _task: BoxFuture<'static, ()>) -> Result<(), Error> {
            Err(Error::new(ErrorKind::Other, "no threads left"))
        }
    }

    pub(crate) fn context(
        layouts: LayoutRecallStatus,
        delegations: RecordingDelegations,
        spawner: Arc<dyn Spawn>,
    ) -> RecallContext {
        RecallContext {
            root: ClientRoot::new("/mnt/nfs"),
            layouts: Arc::new(FixedLayouts(layouts)),
            delegations: Arc::new(delegations),
            spawner,
        }
    }

    pub(crate) fn delegations(
        fail: bool,
    ) -> (RecordingDelegations, mpsc::UnboundedReceiver<StateId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delegations = RecordingDelegations {
            returned: tx,
            gate: Mutex::new(None),
            fail,
        };
        (delegations, rx)
    }

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn recall_args() -> RecallArgs {
        RecallArgs {
            stateid: StateId {
                seqid: 2,
                other: [8; NFS4_OTHER_SIZE],
            },
            truncate: false,
            fh: FileHandle(vec![0xf, 0xe]),
        }
    }

    fn layout_args() -> LayoutRecallArgs {
        LayoutRecallArgs {
            layout_type: 1,
            iomode: 1,
            changed: true,
            recall: LayoutRecallType::All,
        }
    }

    #[test]
    fn layout_recall_is_forgetful() {
        let (d, _rx) = delegations(false);
        let ctx =
            context(LayoutRecallStatus::Resolved, d, Arc::new(TokioSpawner));
        assert_eq!(
            ctx.layout_recall(&layout_args(), &log()),
            Nfs4Status::NoMatchingLayout
        );

        let (d, _rx) = delegations(false);
        let ctx =
            context(LayoutRecallStatus::Pending, d, Arc::new(TokioSpawner));
        assert_eq!(
            ctx.layout_recall(&layout_args(), &log()),
            Nfs4Status::Delay
        );
    }

    #[test]
    fn recall_slot_always_succeeds() {
        let (d, _rx) = delegations(false);
        let ctx =
            context(LayoutRecallStatus::Resolved, d, Arc::new(TokioSpawner));
        let args = RecallSlotArgs {
            target_highest_slot_id: 0,
        };
        assert_eq!(ctx.recall_slot(&args, &log()), Nfs4Status::Ok);
    }

    #[tokio::test]
    async fn recall_answers_before_delegation_is_returned() {
        let (d, mut returned) = delegations(false);
        let (go, gate) = oneshot::channel();
        *d.gate.lock().unwrap() = Some(gate);
        let ctx =
            context(LayoutRecallStatus::Resolved, d, Arc::new(TokioSpawner));

        assert_eq!(
            ctx.recall(SessionId([0; 16]), &recall_args(), &log()),
            Nfs4Status::Ok
        );
        // the pending task keeps the root alive
        assert_eq!(Arc::strong_count(&ctx.root), 2);

        go.send(()).unwrap();
        assert_eq!(returned.recv().await, Some(recall_args().stateid));
        while Arc::strong_count(&ctx.root) > 1 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn failed_delegation_return_still_releases_root() {
        let (d, mut returned) = delegations(true);
        let ctx =
            context(LayoutRecallStatus::Resolved, d, Arc::new(TokioSpawner));

        assert_eq!(
            ctx.recall(SessionId([0; 16]), &recall_args(), &log()),
            Nfs4Status::Ok
        );
        assert!(returned.recv().await.is_some());
        while Arc::strong_count(&ctx.root) > 1 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn spawn_failure_is_a_server_fault() {
        let (d, _rx) = delegations(false);
        let ctx = context(
            LayoutRecallStatus::Resolved,
            d,
            Arc::new(FailingSpawner),
        );
        assert_eq!(
            ctx.recall(SessionId([0; 16]), &recall_args(), &log()),
            Nfs4Status::ServerFault
        );
        assert_eq!(Arc::strong_count(&ctx.root), 1);
    }

    #[test]
    fn tokio_spawner_needs_a_runtime() {
        let task = async {}.boxed();
        assert!(TokioSpawner.spawn(task).is_err());
    }
}
