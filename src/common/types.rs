use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};

/// A thread-safe, mutually exclusive shared component.
///
/// Backed by a synchronous lock: it is taken on the 20 ms audio path and must
/// never be held across an `.await`.
pub type Shared<T> = Arc<Mutex<T>>;

/// A generic boxed error type.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// A convenient Result alias returning `AnyError`.
pub type AnyResult<T> = std::result::Result<T, AnyError>;

/// Accepts a snowflake either as a JSON string (`"1234"`) or as an integer,
/// which is how ETF-encoded payloads carry them.
pub fn deserialize_snowflake<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}

fn serialize_snowflake<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_str(value)
}

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(
            #[serde(
                deserialize_with = "deserialize_snowflake",
                serialize_with = "serialize_snowflake"
            )]
            pub u64,
        );

        impl From<u64> for $name {
            fn from(u: u64) -> Self {
                Self(u)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake_id!(
    /// Strongly typed guild identifier.
    GuildId
);
snowflake_id!(
    /// Strongly typed channel identifier.
    ChannelId
);
snowflake_id!(
    /// Strongly typed user identifier.
    UserId
);

/// Shard coordinates sent with IDENTIFY as `[id, total]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: u32,
    pub total: u32,
}

impl ShardInfo {
    pub fn new(id: u32, total: u32) -> Self {
        Self { id, total }
    }
}

impl Default for ShardInfo {
    fn default() -> Self {
        Self { id: 0, total: 1 }
    }
}

impl std::fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.id, self.total)
    }
}

/// Authentication token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let token = token.strip_prefix("Bot ").map(str::to_owned).unwrap_or(token);
        Self(token)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken(..)")
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflakes_accept_strings_and_integers() {
        let a: GuildId = serde_json::from_str("\"81384788765712384\"").unwrap();
        let b: GuildId = serde_json::from_str("81384788765712384").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"81384788765712384\"");
    }

    #[test]
    fn token_strips_bot_prefix_and_hides_debug() {
        let token = SecretToken::new("Bot abc.def");
        assert_eq!(token.expose(), "abc.def");
        assert_eq!(format!("{token:?}"), "SecretToken(..)");
    }
}
