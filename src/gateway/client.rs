use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{error, info};

use super::{
    events::EventListener,
    handle::GatewayHandle,
    session::{SessionSettings, ShardSession},
};
use crate::{
    common::{
        errors::ClientError,
        types::{SecretToken, ShardInfo},
    },
    configs::Config,
    context::ClientContext,
    rest::resolve_gateway_url,
    task::Task,
    voice::AudioManager,
};

/// Configures and starts one shard.
pub struct GatewayClientBuilder {
    token: SecretToken,
    config: Config,
    listeners: Vec<Arc<dyn EventListener>>,
    context: Option<ClientContext>,
}

impl GatewayClientBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretToken::new(token.into()),
            config: Config::default(),
            listeners: Vec::new(),
            context: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Listeners run on the shard's gateway thread, in registration order.
    pub fn listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Shares codecs, DAVE factory and runtime with other clients. A fresh
    /// context is built from the current runtime otherwise.
    pub fn context(mut self, context: ClientContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Validates the configuration, resolves the gateway URL and starts the
    /// shard on its own thread.
    pub async fn start(self) -> Result<GatewayClient, ClientError> {
        let settings = &self.config.gateway;
        let gateway_config = settings.gateway_config()?;
        let shard = settings.shard()?;
        let close_codes = settings.close_code_table()?;
        let ctx = match self.context {
            Some(ctx) => ctx,
            None => ClientContext::builder()
                .dave_mode(self.config.voice.dave)
                .build()?,
        };

        let url = resolve_gateway_url(settings, &self.token).await;
        let session_settings = SessionSettings {
            url,
            config: gateway_config,
            intents: settings.intents,
            large_threshold: settings.large_threshold,
            close_codes,
            backoff: settings.backoff.clone(),
        };

        let (handle, commands) = GatewayHandle::channel();
        let audio = AudioManager::new(ctx.clone(), handle.clone(), self.config.voice.clone());
        let (ready, ready_completer) = Task::pending(ctx.runtime_handle(), ctx.gateway_threads());

        let session = ShardSession::new(
            self.token,
            shard,
            session_settings,
            self.listeners.into(),
            Some(Arc::new(audio.clone())),
            commands,
            handle.view(),
            handle.cancellation_token(),
            ready_completer,
        );

        // The session is pumped by a dedicated current-thread runtime so a
        // busy voice runtime never delays heartbeats.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientError::Spawn)?;
        let threads = ctx.gateway_threads();
        let thread = thread::Builder::new()
            .name(format!("gateway-shard-{}", shard.id))
            .spawn(move || {
                let id = threads.register_current();
                runtime.block_on(session.run());
                threads.unregister(id);
            })
            .map_err(ClientError::Spawn)?;
        info!("[{}] Gateway thread started", shard);

        Ok(GatewayClient {
            shard,
            handle,
            audio,
            ready,
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// A running shard.
pub struct GatewayClient {
    shard: ShardInfo,
    handle: GatewayHandle,
    audio: AudioManager,
    ready: Task<ShardInfo>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    pub fn builder(token: impl Into<String>) -> GatewayClientBuilder {
        GatewayClientBuilder::new(token)
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    pub fn handle(&self) -> &GatewayHandle {
        &self.handle
    }

    pub fn audio(&self) -> &AudioManager {
        &self.audio
    }

    /// Resolves on the first READY, fails if the shard stops before it.
    pub fn ready(&self) -> Task<ShardInfo> {
        self.ready.clone()
    }

    /// Stops the shard and waits for its thread to exit.
    pub async fn shutdown(&self) {
        self.handle.shutdown();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => info!("[{}] Gateway thread stopped", self.shard),
            Ok(Err(_)) => error!("[{}] Gateway thread panicked", self.shard),
            Err(e) => error!("[{}] Failed to join gateway thread: {}", self.shard, e),
        }
        self.ready.cancel();
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}
