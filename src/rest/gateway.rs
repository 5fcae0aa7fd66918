use serde::Deserialize;
use tracing::{debug, warn};

use super::{API_BASE, http_client};
use crate::{
    common::{
        errors::map_boxed_err,
        types::{AnyResult, SecretToken},
    },
    configs::GatewaySettings,
    gateway::constants::DEFAULT_GATEWAY_URL,
};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    /// Recommended shard count.
    #[serde(default = "default_shards")]
    pub shards: u32,
}

fn default_shards() -> u32 {
    1
}

pub async fn fetch_gateway_bot(token: &SecretToken) -> AnyResult<GatewayBot> {
    let client = http_client().map_err(map_boxed_err)?;
    let response = client
        .get(format!("{API_BASE}/gateway/bot"))
        .header("Authorization", format!("Bot {}", token.expose()))
        .send()
        .await
        .map_err(map_boxed_err)?
        .error_for_status()
        .map_err(map_boxed_err)?;
    response.json::<GatewayBot>().await.map_err(map_boxed_err)
}

/// Configured URL if any, otherwise the discovered one, otherwise the
/// well-known default.
pub async fn resolve_gateway_url(settings: &GatewaySettings, token: &SecretToken) -> String {
    if let Some(url) = settings.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return url.to_owned();
    }
    match fetch_gateway_bot(token).await {
        Ok(bot) => {
            debug!(
                "Discovered gateway {} (recommended shards: {})",
                bot.url, bot.shards
            );
            bot.url
        }
        Err(e) => {
            warn!(
                "Gateway discovery failed, falling back to {}: {}",
                DEFAULT_GATEWAY_URL, e
            );
            DEFAULT_GATEWAY_URL.to_owned()
        }
    }
}
