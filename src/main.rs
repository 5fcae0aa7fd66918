use std::time::Duration;

use rustacord::{
    GatewayClient, GatewayEvent,
    common::{
        logger,
        types::{ChannelId, GuildId},
    },
    configs::Config,
    voice::VoiceChannel,
};
use tracing::{error, info, warn};

/// Connects one shard, optionally joins the voice channel named by
/// `VOICE_GUILD_ID` and `VOICE_CHANNEL_ID`, and logs events until Ctrl-C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Using default configuration: {e}");
            Config::default()
        }
    };
    logger::init(config.logging.as_ref());

    let token = std::env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN is not set")?;
    let (events_tx, events_rx) = flume::unbounded::<GatewayEvent>();

    let client = GatewayClient::builder(token)
        .config(config)
        .listener(move |event: &GatewayEvent| {
            let _ = events_tx.send(event.clone());
        })
        .start()
        .await?;

    let voice_target = env_id("VOICE_GUILD_ID").zip(env_id("VOICE_CHANNEL_ID"));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events_rx.recv_async() => {
                let Ok(event) = event else { break };
                match &event {
                    GatewayEvent::Ready { shard, user_id, .. } => {
                        info!("[{}] Ready as {}", shard, user_id);
                        if let Some((guild, channel)) = voice_target {
                            join_voice(&client, GuildId(guild), ChannelId(channel));
                        }
                    }
                    GatewayEvent::Shutdown { code, reason } => {
                        warn!("Gateway stopped: code={:?}, reason='{}'", code, reason);
                        break;
                    }
                    other => info!("{:?}", other),
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

fn env_id(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

fn join_voice(client: &GatewayClient, guild_id: GuildId, channel_id: ChannelId) {
    match client
        .audio()
        .open_audio_connection(VoiceChannel::new(guild_id, channel_id))
    {
        Ok(connection) => {
            connection
                .ready()
                .set_timeout(Duration::from_secs(30))
                .on_success(move |_| info!("[{}] Voice ready", guild_id))
                .on_error(move |e| error!("[{}] Voice failed: {}", guild_id, e));
        }
        Err(e) => error!("[{}] Cannot join voice: {}", guild_id, e),
    }
}
