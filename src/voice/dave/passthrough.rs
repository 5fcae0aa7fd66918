use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, warn};

use super::{DaveCallbacks, DaveError, DaveSession, DaveSessionFactory, MediaCodec};
use crate::common::types::{ChannelId, UserId};

/// Set once the passthrough warning has been logged by any factory.
static WARNED: AtomicBool = AtomicBool::new(false);

/// Transport encryption only. Media passes through untouched.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughDaveSessionFactory;

impl PassthroughDaveSessionFactory {
    pub fn new() -> Self {
        Self
    }

    /// `true` only for the first caller in the process.
    fn warn_once(&self) -> bool {
        if WARNED.swap(true, Ordering::AcqRel) {
            return false;
        }
        warn!(
            "Voice connections are using the passthrough DAVE session (no end-to-end encryption). \
             The voice service is phasing out non-E2EE connections; configure `voice.dave = \"mls\"`."
        );
        true
    }
}

impl Default for PassthroughDaveSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DaveSessionFactory for PassthroughDaveSessionFactory {
    fn create(&self, user_id: UserId, channel_id: ChannelId) -> Box<dyn DaveSession> {
        self.warn_once();
        Box::new(PassthroughDaveSession::new(user_id, channel_id))
    }
}

pub struct PassthroughDaveSession {
    user_id: UserId,
    channel_id: ChannelId,
    callbacks: Option<Arc<dyn DaveCallbacks>>,
    pending_transitions: HashMap<u16, u16>,
    codecs: HashMap<u32, MediaCodec>,
}

impl PassthroughDaveSession {
    pub fn new(user_id: UserId, channel_id: ChannelId) -> Self {
        Self {
            user_id,
            channel_id,
            callbacks: None,
            pending_transitions: HashMap::new(),
            codecs: HashMap::new(),
        }
    }
}

impl DaveSession for PassthroughDaveSession {
    fn max_protocol_version(&self) -> u16 {
        0
    }

    fn protocol_version(&self) -> u16 {
        0
    }

    fn initialize(&mut self, callbacks: Arc<dyn DaveCallbacks>) {
        debug!(
            "Passthrough DAVE session for user {} in channel {}",
            self.user_id, self.channel_id
        );
        self.callbacks = Some(callbacks);
    }

    fn destroy(&mut self) {
        self.callbacks = None;
        self.pending_transitions.clear();
        self.codecs.clear();
    }

    fn encrypt(&mut self, _ssrc: u32, opus: &[u8]) -> Result<Vec<u8>, DaveError> {
        Ok(opus.to_vec())
    }

    fn decrypt(&mut self, _user_id: UserId, packet: &[u8]) -> Result<Vec<u8>, DaveError> {
        Ok(packet.to_vec())
    }

    fn add_user(&mut self, _user_id: UserId) {}

    fn remove_user(&mut self, _user_id: UserId) {}

    fn assign_ssrc_to_codec(&mut self, ssrc: u32, codec: MediaCodec) {
        self.codecs.insert(ssrc, codec);
    }

    fn on_select_protocol_ack(&mut self, protocol_version: u16) {
        if protocol_version != 0 {
            warn!(
                "Server selected DAVE v{} but this session is passthrough",
                protocol_version
            );
        }
    }

    fn on_prepare_transition(&mut self, transition_id: u16, protocol_version: u16) {
        self.pending_transitions
            .insert(transition_id, protocol_version);
        if transition_id == 0 {
            self.on_execute_transition(0);
        } else if let Some(callbacks) = &self.callbacks {
            callbacks.send_ready_for_transition(transition_id);
        }
    }

    fn on_execute_transition(&mut self, transition_id: u16) {
        self.pending_transitions.remove(&transition_id);
    }

    fn on_prepare_epoch(&mut self, _epoch: u64, _protocol_version: u16) {}

    fn on_external_sender(&mut self, _data: &[u8]) {}

    fn on_proposals(&mut self, _data: &[u8]) {}

    fn on_commit(&mut self, transition_id: u16, _commit: &[u8]) {
        if transition_id != 0 {
            if let Some(callbacks) = &self.callbacks {
                callbacks.send_ready_for_transition(transition_id);
            }
        }
    }

    fn on_welcome(&mut self, transition_id: u16, welcome: &[u8]) {
        self.on_commit(transition_id, welcome);
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ready: Mutex<Vec<u16>>,
    }

    impl DaveCallbacks for Recorder {
        fn send_key_package(&self, _key_package: Vec<u8>) {}
        fn send_ready_for_transition(&self, transition_id: u16) {
            self.ready.lock().push(transition_id);
        }
        fn send_commit_welcome(&self, _commit_welcome: Vec<u8>) {}
        fn send_invalid_commit_welcome(&self, _transition_id: u16) {}
    }

    #[test]
    fn media_passes_through_unchanged() {
        let mut session = PassthroughDaveSession::new(UserId(1), ChannelId(2));
        let frame = [0xF8, 0x01, 0x02, 0x03];
        let sealed = session.encrypt(99, &frame).unwrap();
        assert_eq!(session.decrypt(UserId(3), &sealed).unwrap(), frame);
    }

    #[test]
    fn transition_ids_are_echoed_verbatim() {
        let recorder = Arc::new(Recorder::default());
        let mut session = PassthroughDaveSession::new(UserId(1), ChannelId(2));
        session.initialize(recorder.clone());

        session.on_prepare_transition(0xBEEF, 0);
        session.on_prepare_transition(7, 0);
        session.on_prepare_transition(0, 0);
        assert_eq!(*recorder.ready.lock(), vec![0xBEEF, 7]);

        session.on_execute_transition(0xBEEF);
        assert_eq!(session.pending_transitions.len(), 1);
    }

    #[test]
    fn warning_is_logged_once_per_process() {
        // Other tests may already have created sessions.
        let _ = PassthroughDaveSessionFactory::new().create(UserId(1), ChannelId(2));
        assert!(!PassthroughDaveSessionFactory::new().warn_once());
        assert!(!PassthroughDaveSessionFactory::new().warn_once());
    }
}
