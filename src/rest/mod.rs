//! The single REST call the gateway needs: `GET /gateway/bot`.

pub mod gateway;

use std::time::Duration;

use reqwest::Client;

pub use gateway::{GatewayBot, fetch_gateway_bot, resolve_gateway_url};

/// Base of the versioned HTTP API.
pub const API_BASE: &str = "https://discord.com/api/v10";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(format!(
            "DiscordBot ({}, {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))
        .timeout(REQUEST_TIMEOUT)
        .build()
}
