use thiserror::Error;

use crate::common::types::{AnyError, ChannelId, GuildId};

/// Converts any `Display`-able value into the project's boxed error type.
///
/// Using `Display` (rather than `std::error::Error`) means this works with
/// every error type in the codebase, including those that don't impl `Error`
/// (e.g. `audiopus::Error`).
#[inline]
pub fn map_boxed_err<E: std::fmt::Display>(e: E) -> AnyError {
    Box::new(std::io::Error::other(e.to_string()))
}

/// Configuration rejected at build time, before any connection is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("streamed decompression is only supported with JSON encoding")]
    StreamedRequiresJson,
    #[error("buffer shrink threshold must be greater than zero")]
    ZeroShrinkThreshold,
    #[error("shard {id} is out of range for a total of {total}")]
    ShardOutOfRange { id: u32, total: u32 },
    #[error("invalid close code override '{0}'")]
    InvalidCloseCode(String),
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Synchronous precondition failures of the voice API.
///
/// These are reported to the caller directly rather than through the async
/// audio pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoiceError {
    #[error("audio is not supported on this platform: {0}")]
    Unsupported(String),
    #[error("guild {guild_id} is already connected to channel {channel_id}")]
    AlreadyConnected {
        guild_id: GuildId,
        channel_id: ChannelId,
    },
    #[error("guild {guild_id} is already connecting to channel {channel_id}")]
    AlreadyConnecting {
        guild_id: GuildId,
        channel_id: ChannelId,
    },
    #[error("guild {0} is unavailable")]
    GuildUnavailable(GuildId),
    #[error("cannot move the connection of guild {from} to a channel of guild {to}")]
    CrossGuildMove { from: GuildId, to: GuildId },
    #[error("guild {0} has no audio connection")]
    NotConnected(GuildId),
    #[error("the gateway is not running")]
    GatewayClosed,
}

/// Failures of [`crate::gateway::GatewayClient::start`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn the gateway thread: {0}")]
    Spawn(std::io::Error),
}
