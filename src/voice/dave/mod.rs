//! DAVE end-to-end encryption, layered above transport encryption.
//!
//! A [`DaveSession`] is created by the context's [`DaveSessionFactory`] when
//! a voice transport identifies, kept across resumes, and destroyed when the
//! transport stops. Protocol messages the session wants to send go out
//! through [`DaveCallbacks`].

use std::sync::Arc;

use thiserror::Error;

use crate::common::types::{ChannelId, UserId};

pub mod mls;
pub mod passthrough;

pub use mls::{MlsDaveSession, MlsDaveSessionFactory};
pub use passthrough::{PassthroughDaveSession, PassthroughDaveSessionFactory};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaveError {
    #[error("invalid {0} payload: too short")]
    ShortPayload(&'static str),
    #[error("DAVE protocol error: {0}")]
    Protocol(String),
    #[error("DAVE encryption failed: {0}")]
    Encrypt(String),
    #[error("DAVE decryption failed: {0}")]
    Decrypt(String),
}

/// Media codec carried on an SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCodec {
    Opus,
}

/// Outbound DAVE messages; implemented by the voice gateway.
pub trait DaveCallbacks: Send + Sync {
    /// Binary op 26.
    fn send_key_package(&self, key_package: Vec<u8>);
    /// Op 23. The id must be the one the server sent, verbatim.
    fn send_ready_for_transition(&self, transition_id: u16);
    /// Binary op 28.
    fn send_commit_welcome(&self, commit_welcome: Vec<u8>);
    /// Op 31.
    fn send_invalid_commit_welcome(&self, transition_id: u16);
}

pub trait DaveSession: Send {
    /// Highest protocol version announced in the voice IDENTIFY.
    fn max_protocol_version(&self) -> u16;

    /// Version currently applied to media.
    fn protocol_version(&self) -> u16;

    fn initialize(&mut self, callbacks: Arc<dyn DaveCallbacks>);
    fn destroy(&mut self);

    fn encrypt(&mut self, ssrc: u32, opus: &[u8]) -> Result<Vec<u8>, DaveError>;
    fn decrypt(&mut self, user_id: UserId, packet: &[u8]) -> Result<Vec<u8>, DaveError>;

    fn add_user(&mut self, user_id: UserId);
    fn remove_user(&mut self, user_id: UserId);
    fn assign_ssrc_to_codec(&mut self, ssrc: u32, codec: MediaCodec);

    fn on_select_protocol_ack(&mut self, protocol_version: u16);
    fn on_prepare_transition(&mut self, transition_id: u16, protocol_version: u16);
    fn on_execute_transition(&mut self, transition_id: u16);
    fn on_prepare_epoch(&mut self, epoch: u64, protocol_version: u16);
    fn on_external_sender(&mut self, data: &[u8]);
    fn on_proposals(&mut self, data: &[u8]);
    fn on_commit(&mut self, transition_id: u16, commit: &[u8]);
    fn on_welcome(&mut self, transition_id: u16, welcome: &[u8]);
}

pub trait DaveSessionFactory: Send + Sync {
    fn create(&self, user_id: UserId, channel_id: ChannelId) -> Box<dyn DaveSession>;
}

/// Splits the 2-byte transition id prefix off a commit or welcome payload.
pub fn split_transition_id(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < 2 {
        return None;
    }
    Some((u16::from_be_bytes([data[0], data[1]]), &data[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_id_prefix_is_big_endian() {
        assert_eq!(
            split_transition_id(&[0x01, 0x02, 0xAA]),
            Some((0x0102, &[0xAA][..]))
        );
        assert_eq!(split_transition_id(&[0x01]), None);
    }
}
