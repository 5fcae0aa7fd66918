use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    common::{ConfigError, ShardInfo},
    gateway::{CloseAction, CloseCodeTable},
};

/// Default high-water mark for the inflate buffers (8 KiB).
pub const DEFAULT_BUFFER_SHRINK_THRESHOLD: usize = 8 * 1024;

/// Intents requested when none are configured: GUILDS | GUILD_VOICE_STATES.
pub const DEFAULT_INTENTS: u64 = (1 << 0) | (1 << 7);

/// Transport compression negotiated through the `compress` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Plain frames, no inflate state.
    None,
    /// `zlib-stream`; each complete message is inflated into a buffer.
    #[default]
    Buffered,
    /// `zlib-stream`; each complete message is exposed as a lazy reader.
    Streamed,
}

impl Compression {
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Buffered | Self::Streamed => Some("zlib-stream"),
        }
    }
}

/// Control-frame wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    Etf,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Etf => "etf",
        }
    }
}

/// Immutable transport configuration consumed by the decompressor and
/// message-reader factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    compression: Compression,
    encoding: Encoding,
    buffer_shrink_threshold: usize,
}

impl GatewayConfig {
    /// Validates the combination up front: a streamed reader can only feed a
    /// JSON parser.
    pub fn new(
        compression: Compression,
        encoding: Encoding,
        buffer_shrink_threshold: usize,
    ) -> Result<Self, ConfigError> {
        if compression == Compression::Streamed && encoding != Encoding::Json {
            return Err(ConfigError::StreamedRequiresJson);
        }
        if buffer_shrink_threshold == 0 {
            return Err(ConfigError::ZeroShrinkThreshold);
        }
        Ok(Self {
            compression,
            encoding,
            buffer_shrink_threshold,
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn buffer_shrink_threshold(&self) -> usize {
        self.buffer_shrink_threshold
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            encoding: Encoding::default(),
            buffer_shrink_threshold: DEFAULT_BUFFER_SHRINK_THRESHOLD,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            max_attempts: None,
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewaySettings {
    /// Explicit gateway URL. When unset the URL is discovered over REST.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_shrink_threshold")]
    pub buffer_shrink_threshold: usize,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u8,
    #[serde(default)]
    pub shard_id: u32,
    #[serde(default = "default_shard_total")]
    pub shard_total: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Overrides of the close-code table, keyed by code (`"4008" = "resume"`).
    #[serde(default)]
    pub close_codes: HashMap<String, CloseAction>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: None,
            compression: Compression::default(),
            encoding: Encoding::default(),
            buffer_shrink_threshold: default_shrink_threshold(),
            intents: default_intents(),
            large_threshold: default_large_threshold(),
            shard_id: 0,
            shard_total: default_shard_total(),
            backoff: BackoffConfig::default(),
            close_codes: HashMap::new(),
        }
    }
}

impl GatewaySettings {
    pub fn gateway_config(&self) -> Result<GatewayConfig, ConfigError> {
        GatewayConfig::new(
            self.compression,
            self.encoding,
            self.buffer_shrink_threshold,
        )
    }

    pub fn shard(&self) -> Result<ShardInfo, ConfigError> {
        if self.shard_total == 0 || self.shard_id >= self.shard_total {
            return Err(ConfigError::ShardOutOfRange {
                id: self.shard_id,
                total: self.shard_total,
            });
        }
        Ok(ShardInfo::new(self.shard_id, self.shard_total))
    }

    pub fn close_code_table(&self) -> Result<CloseCodeTable, ConfigError> {
        let mut overrides = HashMap::with_capacity(self.close_codes.len());
        for (raw, action) in &self.close_codes {
            let code: u16 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidCloseCode(raw.clone()))?;
            overrides.insert(code, *action);
        }
        Ok(CloseCodeTable::default().with_overrides(overrides))
    }
}

fn default_shrink_threshold() -> usize {
    DEFAULT_BUFFER_SHRINK_THRESHOLD
}

fn default_intents() -> u64 {
    DEFAULT_INTENTS
}

fn default_large_threshold() -> u8 {
    250
}

fn default_shard_total() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamed_requires_json() {
        assert!(matches!(
            GatewayConfig::new(Compression::Streamed, Encoding::Etf, 1024),
            Err(ConfigError::StreamedRequiresJson)
        ));
        assert!(GatewayConfig::new(Compression::Buffered, Encoding::Etf, 1024).is_ok());
        assert!(GatewayConfig::new(Compression::Streamed, Encoding::Json, 1024).is_ok());
    }

    #[test]
    fn shard_must_be_in_range() {
        let settings = GatewaySettings {
            shard_id: 2,
            shard_total: 2,
            ..GatewaySettings::default()
        };
        assert!(settings.shard().is_err());
    }

    #[test]
    fn bad_close_code_keys_are_rejected() {
        let mut settings = GatewaySettings::default();
        settings
            .close_codes
            .insert("not-a-code".into(), CloseAction::Resume);
        assert!(matches!(
            settings.close_code_table(),
            Err(ConfigError::InvalidCloseCode(_))
        ));
    }
}
