use std::{
    collections::{HashMap, HashSet},
    num::NonZeroU16,
    sync::Arc,
};

use davey::{DaveSession as MlsGroup, MediaType, ProposalsOperationType};
use tracing::{debug, info, warn};

use super::{DaveCallbacks, DaveError, DaveSession, DaveSessionFactory, MediaCodec};
use crate::{
    common::types::{ChannelId, UserId},
    voice::constants::{DAVE_INITIAL_VERSION, MAX_PENDING_PROPOSALS, SILENCE_FRAME},
};

const DAVE_MIN_VERSION: NonZeroU16 = match NonZeroU16::new(DAVE_INITIAL_VERSION) {
    Some(v) => v,
    None => unreachable!(),
};

/// MLS-backed sessions through `davey`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MlsDaveSessionFactory;

impl DaveSessionFactory for MlsDaveSessionFactory {
    fn create(&self, user_id: UserId, channel_id: ChannelId) -> Box<dyn DaveSession> {
        Box::new(MlsDaveSession::new(user_id, channel_id))
    }
}

pub struct MlsDaveSession {
    group: Option<MlsGroup>,
    user_id: UserId,
    channel_id: ChannelId,
    callbacks: Option<Arc<dyn DaveCallbacks>>,
    protocol_version: u16,
    /// transition id -> protocol version it switches to
    pending_transitions: HashMap<u16, u16>,
    connected_users: HashSet<UserId>,
    codecs: HashMap<u32, MediaCodec>,
    external_sender_set: bool,
    pending_proposals: Vec<Vec<u8>>,
    was_ready: bool,
}

impl MlsDaveSession {
    pub fn new(user_id: UserId, channel_id: ChannelId) -> Self {
        let mut connected_users = HashSet::new();
        connected_users.insert(user_id);
        Self {
            group: None,
            user_id,
            channel_id,
            callbacks: None,
            protocol_version: 0,
            pending_transitions: HashMap::new(),
            connected_users,
            codecs: HashMap::new(),
            external_sender_set: false,
            pending_proposals: Vec::new(),
            was_ready: false,
        }
    }

    /// (Re)creates the MLS group and announces a fresh key package.
    fn setup_group(&mut self, version: u16) -> Result<(), DaveError> {
        self.protocol_version = version;
        let nz_version = NonZeroU16::new(version).unwrap_or(DAVE_MIN_VERSION);

        let group = match &mut self.group {
            Some(group) => {
                group
                    .reinit(nz_version, self.user_id.0, self.channel_id.0, None)
                    .map_err(|e| DaveError::Protocol(e.to_string()))?;
                group
            }
            slot => slot.insert(
                MlsGroup::new(nz_version, self.user_id.0, self.channel_id.0, None)
                    .map_err(|e| DaveError::Protocol(e.to_string()))?,
            ),
        };

        self.external_sender_set = false;
        self.pending_proposals.clear();
        self.was_ready = false;

        let key_package = group
            .create_key_package()
            .map_err(|e| DaveError::Protocol(e.to_string()))?;
        debug!("DAVE group set up for version {}", version);
        if let Some(callbacks) = &self.callbacks {
            callbacks.send_key_package(key_package);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.protocol_version = 0;
        self.pending_transitions.clear();
        self.external_sender_set = false;
        self.pending_proposals.clear();
        self.was_ready = false;
        self.group = None;
        info!("DAVE session reset to passthrough");
    }

    /// Reports a commit or welcome we could not apply and rejoins.
    fn recover(&mut self, transition_id: u16) {
        if let Some(callbacks) = &self.callbacks {
            callbacks.send_invalid_commit_welcome(transition_id);
        }
        self.reset();
        if let Err(e) = self.setup_group(DAVE_INITIAL_VERSION) {
            warn!("DAVE re-initialization failed: {}", e);
        }
    }

    fn process_proposals(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, DaveError> {
        let Some(group) = &mut self.group else {
            return Ok(None);
        };
        let op_type = match data.first() {
            Some(0) => ProposalsOperationType::APPEND,
            Some(1) => ProposalsOperationType::REVOKE,
            Some(raw) => {
                return Err(DaveError::Protocol(format!(
                    "unknown proposals op type {raw}"
                )));
            }
            None => return Err(DaveError::ShortPayload("DAVE proposals")),
        };

        let user_ids: Vec<u64> = self.connected_users.iter().map(|u| u.0).collect();
        let result = group
            .process_proposals(op_type, &data[1..], Some(&user_ids))
            .map_err(|e| DaveError::Protocol(e.to_string()))?;

        Ok(result.map(|cw| {
            let mut out = cw.commit;
            if let Some(welcome) = cw.welcome {
                out.extend_from_slice(&welcome);
            }
            out
        }))
    }

    fn send_commit_welcome(&self, commit_welcome: Vec<u8>) {
        if let Some(callbacks) = &self.callbacks {
            callbacks.send_commit_welcome(commit_welcome);
        }
    }

    fn track_readiness(&mut self, ready: bool) {
        if ready == self.was_ready {
            return;
        }
        if ready {
            info!(
                "DAVE session (v{}) is ready, media is now end-to-end encrypted",
                self.protocol_version
            );
        } else {
            warn!(
                "DAVE session (v{}) lost readiness, falling back to plaintext",
                self.protocol_version
            );
        }
        self.was_ready = ready;
    }
}

impl DaveSession for MlsDaveSession {
    fn max_protocol_version(&self) -> u16 {
        DAVE_INITIAL_VERSION
    }

    fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    fn initialize(&mut self, callbacks: Arc<dyn DaveCallbacks>) {
        self.callbacks = Some(callbacks);
    }

    fn destroy(&mut self) {
        self.reset();
        self.callbacks = None;
        self.codecs.clear();
        self.connected_users.clear();
    }

    fn encrypt(&mut self, _ssrc: u32, opus: &[u8]) -> Result<Vec<u8>, DaveError> {
        if opus == SILENCE_FRAME || self.protocol_version == 0 {
            return Ok(opus.to_vec());
        }
        let ready = self.group.as_ref().is_some_and(|g| g.is_ready());
        self.track_readiness(ready);
        match &mut self.group {
            Some(group) if ready => group
                .encrypt_opus(opus)
                .map(|c| c.into_owned())
                .map_err(|e| DaveError::Encrypt(e.to_string())),
            _ => Ok(opus.to_vec()),
        }
    }

    fn decrypt(&mut self, user_id: UserId, packet: &[u8]) -> Result<Vec<u8>, DaveError> {
        if packet == SILENCE_FRAME || self.protocol_version == 0 {
            return Ok(packet.to_vec());
        }
        match &mut self.group {
            Some(group) if group.is_ready() => group
                .decrypt(user_id.0, MediaType::AUDIO, packet)
                .map(|p| p.to_vec())
                .map_err(|e| DaveError::Decrypt(e.to_string())),
            _ => Ok(packet.to_vec()),
        }
    }

    fn add_user(&mut self, user_id: UserId) {
        self.connected_users.insert(user_id);
    }

    fn remove_user(&mut self, user_id: UserId) {
        self.connected_users.remove(&user_id);
    }

    fn assign_ssrc_to_codec(&mut self, ssrc: u32, codec: MediaCodec) {
        self.codecs.insert(ssrc, codec);
    }

    fn on_select_protocol_ack(&mut self, protocol_version: u16) {
        if protocol_version == 0 {
            self.protocol_version = 0;
            return;
        }
        if let Err(e) = self.setup_group(protocol_version) {
            warn!("DAVE setup failed: {}", e);
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
        if let Some(next_version) = self.pending_transitions.remove(&transition_id) {
            self.protocol_version = next_version;
            info!(
                "DAVE transition {} executed, protocol version now {}",
                transition_id, next_version
            );
        }
    }

    fn on_prepare_epoch(&mut self, epoch: u64, protocol_version: u16) {
        if epoch == 1 {
            if let Err(e) = self.setup_group(protocol_version) {
                warn!("DAVE prepare epoch failed: {}", e);
            }
        }
    }

    fn on_external_sender(&mut self, data: &[u8]) {
        let Some(group) = &mut self.group else {
            return;
        };
        if let Err(e) = group.set_external_sender(data) {
            warn!("DAVE external sender rejected: {}", e);
            return;
        }
        self.external_sender_set = true;

        let pending = std::mem::take(&mut self.pending_proposals);
        if !pending.is_empty() {
            debug!("DAVE processing {} buffered proposals", pending.len());
        }
        for proposals in pending {
            match self.process_proposals(&proposals) {
                Ok(Some(commit_welcome)) => self.send_commit_welcome(commit_welcome),
                Ok(None) => {}
                Err(e) => warn!("DAVE buffered proposals failed: {}", e),
            }
        }
    }

    fn on_proposals(&mut self, data: &[u8]) {
        if !self.external_sender_set {
            if self.pending_proposals.len() < MAX_PENDING_PROPOSALS {
                self.pending_proposals.push(data.to_vec());
            } else {
                warn!(
                    "DAVE proposal buffer full ({} entries), dropping proposal",
                    MAX_PENDING_PROPOSALS
                );
            }
            return;
        }
        match self.process_proposals(data) {
            Ok(Some(commit_welcome)) => self.send_commit_welcome(commit_welcome),
            Ok(None) => {}
            Err(e) => {
                warn!("DAVE proposals failed, resetting session: {}", e);
                self.recover(0);
            }
        }
    }

    fn on_commit(&mut self, transition_id: u16, commit: &[u8]) {
        let Some(group) = &mut self.group else {
            return;
        };
        match group.process_commit(commit) {
            Ok(_) => {
                debug!("DAVE commit processed for transition {}", transition_id);
                if transition_id != 0 {
                    let version = self.protocol_version;
                    self.on_prepare_transition(transition_id, version);
                }
            }
            Err(e) => {
                warn!("DAVE commit for transition {} failed: {}", transition_id, e);
                self.recover(transition_id);
            }
        }
    }

    fn on_welcome(&mut self, transition_id: u16, welcome: &[u8]) {
        let Some(group) = &mut self.group else {
            return;
        };
        match group.process_welcome(welcome) {
            Ok(_) => {
                debug!("DAVE welcome processed for transition {}", transition_id);
                if transition_id != 0 {
                    let version = self.protocol_version;
                    self.on_prepare_transition(transition_id, version);
                }
            }
            Err(e) => {
                warn!("DAVE welcome for transition {} failed: {}", transition_id, e);
                self.recover(transition_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_until_a_version_is_negotiated() {
        let mut session = MlsDaveSession::new(UserId(1), ChannelId(2));
        assert_eq!(session.max_protocol_version(), 1);
        assert_eq!(session.encrypt(1, b"opus").unwrap(), b"opus");
        assert_eq!(session.decrypt(UserId(5), b"opus").unwrap(), b"opus");
        assert_eq!(session.encrypt(1, &SILENCE_FRAME).unwrap(), SILENCE_FRAME);
    }

    #[test]
    fn execute_applies_the_prepared_version() {
        let mut session = MlsDaveSession::new(UserId(1), ChannelId(2));
        session.on_prepare_transition(3, 1);
        assert_eq!(session.protocol_version(), 0);
        session.on_execute_transition(3);
        assert_eq!(session.protocol_version(), 1);
        session.on_execute_transition(3);
        assert_eq!(session.protocol_version(), 1);
    }

    #[test]
    fn proposals_are_buffered_until_the_external_sender_arrives() {
        let mut session = MlsDaveSession::new(UserId(1), ChannelId(2));
        for _ in 0..MAX_PENDING_PROPOSALS + 3 {
            session.on_proposals(&[0, 1, 2]);
        }
        assert_eq!(session.pending_proposals.len(), MAX_PENDING_PROPOSALS);
    }
}
