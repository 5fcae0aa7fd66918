use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    /// Server sequence number, acknowledged in heartbeats and RESUME.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl VoiceGatewayMessage {
    pub fn new(op: u8, d: Value) -> Self {
        Self { op, d, seq: None }
    }
}

/// Voice gateway opcodes.
pub mod op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENTS_CONNECT: u8 = 11;
    pub const CLIENT_DISCONNECT: u8 = 13;
    pub const DAVE_PREPARE_TRANSITION: u8 = 21;
    pub const DAVE_EXECUTE_TRANSITION: u8 = 22;
    pub const DAVE_TRANSITION_READY: u8 = 23;
    pub const DAVE_PREPARE_EPOCH: u8 = 24;
    pub const DAVE_MLS_EXTERNAL_SENDER: u8 = 25;
    pub const DAVE_MLS_KEY_PACKAGE: u8 = 26;
    pub const DAVE_MLS_PROPOSALS: u8 = 27;
    pub const DAVE_MLS_COMMIT_WELCOME: u8 = 28;
    pub const DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION: u8 = 29;
    pub const DAVE_MLS_WELCOME: u8 = 30;
    pub const DAVE_MLS_INVALID_COMMIT_WELCOME: u8 = 31;
}

/// Outcome of a single voice websocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Reconnect with op 7.
    Resume,
    /// Start over with a fresh op 0.
    Identify,
    Shutdown(TransportEnd),
}

/// Why a voice transport stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEnd {
    /// Closed locally.
    Cancelled,
    /// The voice server closed the session with a non-retryable code.
    Closed { code: u16, reason: String },
    /// Retries ran out.
    Failed(String),
}

/// Close codes that allow op 7 resume.
///
/// `1006` is a local abnormal-close marker, not a voice gateway code; read
/// errors are handled separately and must not be listed here.
pub fn is_resumable_close(code: u16) -> bool {
    matches!(code, 4009 | 4015)
}

/// Session no longer valid; identify again.
pub fn is_reidentify_close(code: u16) -> bool {
    matches!(code, 4006)
}

/// - `4004`: authentication failed
/// - `4014`: disconnected (kicked, moved or channel deleted)
/// - `4021`: disconnected by rate limit
/// - `4022`: call terminated
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4014 | 4021 | 4022)
}

pub fn close_outcome(code: u16, reason: String) -> SessionOutcome {
    if is_resumable_close(code) {
        SessionOutcome::Resume
    } else if is_reidentify_close(code) {
        SessionOutcome::Identify
    } else if is_fatal_close(code) {
        SessionOutcome::Shutdown(TransportEnd::Closed { code, reason })
    } else {
        SessionOutcome::Resume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_map_to_outcomes() {
        assert_eq!(close_outcome(4015, String::new()), SessionOutcome::Resume);
        assert_eq!(close_outcome(4006, String::new()), SessionOutcome::Identify);
        assert_eq!(
            close_outcome(4014, "kicked".into()),
            SessionOutcome::Shutdown(TransportEnd::Closed {
                code: 4014,
                reason: "kicked".into()
            })
        );
        assert_eq!(close_outcome(1001, String::new()), SessionOutcome::Resume);
    }

    #[test]
    fn seq_is_optional() {
        let hello: VoiceGatewayMessage =
            serde_json::from_str(r#"{"op":8,"d":{"heartbeat_interval":13750}}"#).unwrap();
        assert_eq!(hello.seq, None);
        let speaking: VoiceGatewayMessage =
            serde_json::from_str(r#"{"op":5,"d":{},"seq":12}"#).unwrap();
        assert_eq!(speaking.seq, Some(12));
        assert_eq!(
            serde_json::to_string(&VoiceGatewayMessage::new(3, serde_json::json!(1))).unwrap(),
            r#"{"op":3,"d":1}"#
        );
    }
}
