use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::Value;

use super::session::SessionStatus;
use crate::common::types::{ChannelId, GuildId, ShardInfo, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuildAvailability {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadyEvent {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    pub user: CurrentUser,
    #[serde(default)]
    pub guilds: Vec<GuildAvailability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VoiceState {
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VoiceServer {
    pub token: String,
    pub guild_id: GuildId,
    /// `None` while the voice server is being reallocated.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Dispatch (op 0) events the core understands. Everything else is passed
/// through untouched as [`DispatchEvent::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Ready(ReadyEvent),
    Resumed,
    GuildCreate(GuildAvailability),
    GuildDelete(GuildAvailability),
    VoiceStateUpdate(VoiceState),
    VoiceServerUpdate(VoiceServer),
    Unknown { name: String, data: Value },
}

impl DispatchEvent {
    pub fn parse(name: &str, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match name {
            "READY" => Self::Ready(serde_json::from_value(data)?),
            "RESUMED" => Self::Resumed,
            "GUILD_CREATE" => Self::GuildCreate(serde_json::from_value(data)?),
            "GUILD_DELETE" => Self::GuildDelete(serde_json::from_value(data)?),
            "VOICE_STATE_UPDATE" => Self::VoiceStateUpdate(serde_json::from_value(data)?),
            "VOICE_SERVER_UPDATE" => Self::VoiceServerUpdate(serde_json::from_value(data)?),
            _ => Self::Unknown {
                name: name.to_string(),
                data,
            },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ready(_) => "READY",
            Self::Resumed => "RESUMED",
            Self::GuildCreate(_) => "GUILD_CREATE",
            Self::GuildDelete(_) => "GUILD_DELETE",
            Self::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            Self::VoiceServerUpdate(_) => "VOICE_SERVER_UPDATE",
            Self::Unknown { name, .. } => name,
        }
    }
}

/// Lifecycle and dispatch notifications emitted by a shard.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// First READY of this client.
    Ready {
        shard: ShardInfo,
        session_id: String,
        user_id: UserId,
    },
    /// Missed events were replayed after a reconnect.
    Resumed,
    /// A new session replaced a lost one. Cached state must be rebuilt.
    Recreated {
        shard: ShardInfo,
        session_id: String,
    },
    /// The server rejected the session.
    Invalidated { resumable: bool },
    Disconnected {
        code: Option<u16>,
        reason: String,
        by_remote: bool,
    },
    /// Terminal. No further events follow.
    Shutdown { code: Option<u16>, reason: String },
    StatusChange {
        old: SessionStatus,
        new: SessionStatus,
    },
    /// Heartbeat round trip.
    Ping { latency: Duration },
    Dispatch {
        seq: u64,
        event: Arc<DispatchEvent>,
    },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &GatewayEvent);
}

impl<F> EventListener for F
where
    F: Fn(&GatewayEvent) + Send + Sync,
{
    fn on_event(&self, event: &GatewayEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn known_dispatches_are_typed() {
        let event = DispatchEvent::parse(
            "VOICE_SERVER_UPDATE",
            json!({"token": "t", "guild_id": "41771983423143937", "endpoint": null}),
        )
        .unwrap();
        assert_eq!(
            event,
            DispatchEvent::VoiceServerUpdate(VoiceServer {
                token: "t".into(),
                guild_id: GuildId(41771983423143937),
                endpoint: None,
            })
        );
    }

    #[test]
    fn unknown_dispatches_pass_through() {
        let event = DispatchEvent::parse("MESSAGE_CREATE", json!({"id": "1"})).unwrap();
        assert_eq!(event.name(), "MESSAGE_CREATE");
        assert!(matches!(event, DispatchEvent::Unknown { .. }));
    }

    #[test]
    fn ready_accepts_integer_snowflakes() {
        let event = DispatchEvent::parse(
            "READY",
            json!({
                "session_id": "abc",
                "user": {"id": 80351110224678912u64, "username": "bot"},
                "guilds": [{"id": 1, "unavailable": true}],
            }),
        )
        .unwrap();
        let DispatchEvent::Ready(ready) = event else {
            panic!("expected READY");
        };
        assert_eq!(ready.user.id, UserId(80351110224678912));
        assert!(ready.guilds[0].unavailable);
        assert!(ready.resume_gateway_url.is_none());
    }
}
