use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which DAVE session implementation the context installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaveMode {
    /// Transport encryption only.
    #[default]
    Passthrough,
    /// MLS-backed end-to-end encryption.
    Mls,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceSettings {
    /// How long a join request may wait for voice server details.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// How long a started transport may take to become ready.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Re-request the channel after a server-initiated disconnect.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub dave: DaveMode,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            queue_timeout_ms: default_queue_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            auto_reconnect: true,
            self_mute: false,
            self_deaf: false,
            dave: DaveMode::default(),
        }
    }
}

impl VoiceSettings {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

fn default_queue_timeout_ms() -> u64 {
    10_000
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}
