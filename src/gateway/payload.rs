use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::common::types::{ChannelId, GuildId, SecretToken, ShardInfo};

/// Gateway opcodes of the main (non-voice) gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

/// A control frame: opcode, payload, and for dispatches the sequence number
/// and event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op as u8,
            d,
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    pub fn identify(
        token: &SecretToken,
        shard: ShardInfo,
        intents: u64,
        large_threshold: u8,
    ) -> Self {
        Self::new(
            OpCode::Identify,
            json!({
                "token": token.expose(),
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": env!("CARGO_PKG_NAME"),
                    "device": env!("CARGO_PKG_NAME"),
                },
                "shard": [shard.id, shard.total],
                "intents": intents,
                "large_threshold": large_threshold,
                "compress": false,
            }),
        )
    }

    pub fn resume(token: &SecretToken, session_id: &str, seq: u64) -> Self {
        Self::new(
            OpCode::Resume,
            json!({
                "token": token.expose(),
                "session_id": session_id,
                "seq": seq,
            }),
        )
    }

    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, json!(seq))
    }

    /// Joins, moves or (with `channel_id = None`) leaves a voice channel.
    pub fn voice_state_update(
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Self {
        Self::new(
            OpCode::VoiceStateUpdate,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_fields_are_optional() {
        let hello: GatewayPayload =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(hello.opcode(), Some(OpCode::Hello));
        assert_eq!(hello.s, None);
        assert_eq!(hello.d["heartbeat_interval"], 41250);

        let ack: GatewayPayload = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert!(ack.d.is_null());
    }

    #[test]
    fn voice_state_update_serializes_snowflakes_as_strings() {
        let p = GatewayPayload::voice_state_update(GuildId(1), None, false, true);
        let text = serde_json::to_string(&p).unwrap();
        assert!(text.contains(r#""guild_id":"1""#));
        assert!(text.contains(r#""channel_id":null"#));
        assert!(!text.contains(r#""s""#));
    }
}
