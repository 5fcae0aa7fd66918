use std::{thread::ThreadId, time::Duration};

use thiserror::Error;

use super::heartbeat::HeartbeatTracker;
use crate::common::types::{SecretToken, ShardInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Connecting,
    Ready,
    Resumed,
    Recreated,
    Disconnected,
    Invalidated,
    Shutdown,
}

impl SessionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Resumed | Self::Recreated)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (Connecting | Disconnected, Ready) => true,
            (Ready | Resumed | Recreated, Disconnected) => true,
            (Disconnected, Resumed | Recreated | Invalidated) => true,
            (Invalidated, Recreated) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Control-plane state of one shard.
///
/// Owned by the shard's gateway thread. Every mutator checks (in debug
/// builds) that it runs on the thread that created the state, which is what
/// lets the fields go without locks.
#[derive(Debug)]
pub struct SessionState {
    token: SecretToken,
    shard: ShardInfo,
    seq: Option<u64>,
    session_id: Option<String>,
    resume_url: Option<String>,
    heartbeat_interval: Option<Duration>,
    pub(crate) heartbeat: HeartbeatTracker,
    status: SessionStatus,
    ever_ready: bool,
    owner: ThreadId,
}

impl SessionState {
    pub fn new(token: SecretToken, shard: ShardInfo) -> Self {
        Self {
            token,
            shard,
            seq: None,
            session_id: None,
            resume_url: None,
            heartbeat_interval: None,
            heartbeat: HeartbeatTracker::default(),
            status: SessionStatus::Connecting,
            ever_ready: false,
            owner: std::thread::current().id(),
        }
    }

    #[inline]
    fn assert_owner(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "session state of shard {} mutated off its gateway thread",
            self.shard
        );
    }

    pub fn token(&self) -> &SecretToken {
        &self.token
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn ever_ready(&self) -> bool {
        self.ever_ready
    }

    /// A resume needs both a session id and a sequence to replay from.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.seq.is_some()
    }

    pub fn record_seq(&mut self, seq: u64) {
        self.assert_owner();
        self.seq = Some(self.seq.map_or(seq, |current| current.max(seq)));
    }

    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.assert_owner();
        self.heartbeat_interval = Some(interval);
        self.heartbeat.set_interval(interval);
    }

    /// Stores a fresh session. Returns `true` if an earlier session existed,
    /// i.e. this READY recreated the session.
    pub fn on_ready(&mut self, session_id: String, resume_url: Option<String>) -> bool {
        self.assert_owner();
        let recreated = self.ever_ready;
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
        self.ever_ready = true;
        recreated
    }

    /// Forgets the session so the next connection identifies.
    pub fn invalidate(&mut self) {
        self.assert_owner();
        self.session_id = None;
        self.resume_url = None;
        self.seq = None;
    }

    pub fn transition(
        &mut self,
        next: SessionStatus,
    ) -> Result<SessionStatus, IllegalTransition> {
        self.assert_owner();
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        let old = self.status;
        self.status = next;
        Ok(old)
    }
}
