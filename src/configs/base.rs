use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{common::ConfigError, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub voice: VoiceSettings,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Loads `config.toml`, falling back to `config.default.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err(ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "config.toml or config.default.toml not found",
            )));
        };

        debug!("Loading configuration from: {}", config_path);
        Self::from_toml(&std::fs::read_to_string(config_path)?)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.gateway.gateway_config()?;
        config.gateway.shard()?;
        config.gateway.close_code_table()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CloseAction;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.gateway.compression, Compression::Buffered);
        assert_eq!(config.gateway.encoding, Encoding::Json);
        assert_eq!(config.voice.dave, DaveMode::Passthrough);
        assert!(config.logging.is_none());
    }

    #[test]
    fn full_document_parses() {
        let config = Config::from_toml(
            r#"
            [gateway]
            compression = "streamed"
            encoding = "json"
            buffer_shrink_threshold = 4096
            intents = 129
            shard_id = 1
            shard_total = 2

            [gateway.backoff]
            base_ms = 500
            max_ms = 8000
            max_attempts = 6

            [gateway.close_codes]
            "4008" = "shutdown"

            [voice]
            queue_timeout_ms = 5000
            dave = "mls"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.compression, Compression::Streamed);
        assert_eq!(config.gateway.shard().unwrap().id, 1);
        assert_eq!(config.gateway.backoff.max_attempts, Some(6));
        assert_eq!(
            config.gateway.close_code_table().unwrap().action(4008),
            CloseAction::Shutdown
        );
        assert_eq!(config.voice.dave, DaveMode::Mls);
        assert_eq!(config.voice.queue_timeout().as_millis(), 5000);
    }

    #[test]
    fn streamed_etf_is_rejected_at_load_time() {
        let err = Config::from_toml(
            r#"
            [gateway]
            compression = "streamed"
            encoding = "etf"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::StreamedRequiresJson));
    }
}
