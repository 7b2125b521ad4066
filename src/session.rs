// Copyright 2020 Joyent, Inc.

//! Back channel sessions and the single-slot sequence validator.
//!
//! The back channel has exactly one slot (slot 0), so a session only needs
//! to remember the last sequence id it accepted and the reply it sent for
//! it.  Sessions live in a `SessionRegistry` keyed by session id; the
//! compound processor looks a session up by the id carried in CB_SEQUENCE
//! and holds its lock until the compound is finished.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use slog::{error, warn, Logger};

use crate::config::CallbackConfig;
use crate::protocol::{
    CompoundRes, Nfs4Status, SequenceArgs, SequenceResOk, SessionId,
};
use crate::replay::ReplayCache;

/// Result of validating a CB_SEQUENCE against the session state.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOutcome {
    /// The expected next sequence id; the session has advanced to it.
    Accepted(SequenceResOk),
    /// A retry of the last sequence id with no reply cached to replay.  The
    /// sequence op succeeds but the compound must fail.
    RetryUncached(SequenceResOk),
    /// A retry of the last sequence id; the cached reply should be replayed
    /// if the retry validates against it.
    Retry,
    Rejected(Nfs4Status),
}

pub struct CallbackSession {
    session_id: SessionId,
    sequence_number: u32,
    replay: ReplayCache,
}

impl CallbackSession {
    /// Creates a session whose replay cache holds a synthetic
    /// NFS4ERR_SEQ_MISORDERED reply, so that a retry arriving before any
    /// real request fails safely.
    pub fn new(
        session_id: SessionId,
        config: &CallbackConfig,
        log: &Logger,
    ) -> CallbackSession {
        let mut replay = ReplayCache::new(config.max_cache);
        let mut seed =
            CompoundRes::new(Nfs4Status::SeqMisordered, config.reply_tag());
        replay.write(None, &mut seed, false, log);

        CallbackSession {
            session_id,
            sequence_number: 0,
            replay,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The last sequence id accepted on slot 0.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn replay(&self) -> &ReplayCache {
        &self.replay
    }

    pub(crate) fn replay_mut(&mut self) -> &mut ReplayCache {
        &mut self.replay
    }

    /// Applies the CB_SEQUENCE rules.  Only an `Accepted` outcome changes
    /// the session, and only after every check has passed.
    pub fn validate_sequence(
        &mut self,
        args: &SequenceArgs,
        log: &Logger,
    ) -> SequenceOutcome {
        if args.session_id != self.session_id {
            error!(log, "received sessionid doesn't match session";
                "expected" => %self.session_id, "received" => %args.session_id);
            return SequenceOutcome::Rejected(Nfs4Status::BadSession);
        }

        // only one back channel slot is supported
        if args.slot_id != 0 {
            error!(log, "received unexpected slotid"; "slotid" => args.slot_id);
            return SequenceOutcome::Rejected(Nfs4Status::BadSlot);
        }
        if args.highest_slot_id != 0 {
            error!(log, "received unexpected highest_slotid";
                "highest_slotid" => args.highest_slot_id);
            return SequenceOutcome::Rejected(Nfs4Status::BadHighSlot);
        }

        if args.sequence_id == self.sequence_number {
            if self.replay.has_reply() {
                return SequenceOutcome::Retry;
            }
            warn!(log, "retry with no cached reply";
                "seqid" => args.sequence_id);
            return SequenceOutcome::RetryUncached(echo(args));
        }

        let expected = self.sequence_number.wrapping_add(1);
        if args.sequence_id != expected {
            error!(log, "bad received sequence id";
                "received" => args.sequence_id, "expected" => expected);
            return SequenceOutcome::Rejected(Nfs4Status::SeqMisordered);
        }

        self.sequence_number = args.sequence_id;
        SequenceOutcome::Accepted(echo(args))
    }
}

fn echo(args: &SequenceArgs) -> SequenceResOk {
    SequenceResOk {
        session_id: args.session_id,
        sequence_id: args.sequence_id,
        slot_id: args.slot_id,
        highest_slot_id: args.highest_slot_id,
        target_highest_slot_id: args.highest_slot_id,
    }
}

pub type SessionRef = Arc<Mutex<CallbackSession>>;

/// Back channel sessions indexed by session id.
pub struct SessionRegistry {
    config: Arc<CallbackConfig>,
    sessions: RwLock<HashMap<SessionId, SessionRef>>,
    log: Logger,
}

impl SessionRegistry {
    pub fn new(config: Arc<CallbackConfig>, log: &Logger) -> SessionRegistry {
        SessionRegistry {
            config,
            sessions: RwLock::new(HashMap::new()),
            log: log.clone(),
        }
    }

    /// Creates the back channel state for a newly established session,
    /// replacing any previous state held under the same id.
    pub fn register(&self, session_id: SessionId) -> SessionRef {
        let session = Arc::new(Mutex::new(CallbackSession::new(
            session_id,
            &self.config,
            &self.log,
        )));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, Arc::clone(&session));
        session
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionRef> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &SessionId) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
