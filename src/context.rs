use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::{
    common::errors::{ConfigError, VoiceError},
    configs::DaveMode,
    task::GatewayThreads,
    voice::{
        codec::{AudiopusCodecFactory, OpusCodecFactory},
        dave::{DaveSessionFactory, MlsDaveSessionFactory, PassthroughDaveSessionFactory},
    },
};

struct ContextInner {
    /// `Err` carries why the native codec could not be loaded.
    codecs: Result<Arc<dyn OpusCodecFactory>, String>,
    dave: Arc<dyn DaveSessionFactory>,
    threads: Arc<GatewayThreads>,
    runtime: Handle,
}

/// Process-wide state shared by every shard and voice connection.
///
/// Cheap to clone. Built once, before the first client starts.
#[derive(Clone)]
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("audio_supported", &self.inner.codecs.is_ok())
            .finish_non_exhaustive()
    }
}

impl ClientContext {
    pub fn builder() -> ClientContextBuilder {
        ClientContextBuilder::default()
    }

    /// The Opus codecs, or why audio is unavailable on this host.
    pub fn codecs(&self) -> Result<Arc<dyn OpusCodecFactory>, VoiceError> {
        self.inner
            .codecs
            .as_ref()
            .map(Arc::clone)
            .map_err(|reason| VoiceError::Unsupported(reason.clone()))
    }

    pub fn is_audio_supported(&self) -> bool {
        self.inner.codecs.is_ok()
    }

    pub fn dave_factory(&self) -> Arc<dyn DaveSessionFactory> {
        Arc::clone(&self.inner.dave)
    }

    pub fn gateway_threads(&self) -> Arc<GatewayThreads> {
        Arc::clone(&self.inner.threads)
    }

    /// Runtime for voice transports, timers and task callbacks.
    pub fn runtime_handle(&self) -> Handle {
        self.inner.runtime.clone()
    }
}

#[derive(Default)]
pub struct ClientContextBuilder {
    codecs: Option<Result<Arc<dyn OpusCodecFactory>, String>>,
    dave: Option<Arc<dyn DaveSessionFactory>>,
    dave_mode: DaveMode,
    runtime: Option<Handle>,
}

impl ClientContextBuilder {
    /// Replaces the libopus codecs. Skips the native probe.
    pub fn codec_factory(mut self, factory: Arc<dyn OpusCodecFactory>) -> Self {
        self.codecs = Some(Ok(factory));
        self
    }

    /// Builds without audio. Voice joins then fail with
    /// [`VoiceError::Unsupported`] carrying `reason`.
    pub fn disable_audio(mut self, reason: impl Into<String>) -> Self {
        self.codecs = Some(Err(reason.into()));
        self
    }

    /// Installs a custom DAVE implementation. Overrides [`Self::dave_mode`].
    pub fn dave_factory(mut self, factory: Arc<dyn DaveSessionFactory>) -> Self {
        self.dave = Some(factory);
        self
    }

    pub fn dave_mode(mut self, mode: DaveMode) -> Self {
        self.dave_mode = mode;
        self
    }

    /// Defaults to the runtime `build` is called from.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<ClientContext, ConfigError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| ConfigError::NoRuntime(e.to_string()))?,
        };

        let codecs = match self.codecs {
            Some(codecs) => codecs,
            None => match AudiopusCodecFactory::probe() {
                Ok(factory) => Ok(Arc::new(factory) as Arc<dyn OpusCodecFactory>),
                Err(e) => {
                    warn!("Audio disabled: {}", e);
                    Err(e.to_string())
                }
            },
        };

        let dave = self.dave.unwrap_or_else(|| match self.dave_mode {
            DaveMode::Passthrough => Arc::new(PassthroughDaveSessionFactory::new()),
            DaveMode::Mls => {
                info!("DAVE end-to-end encryption enabled");
                Arc::new(MlsDaveSessionFactory)
            }
        });

        Ok(ClientContext {
            inner: Arc::new(ContextInner {
                codecs,
                dave,
                threads: Arc::new(GatewayThreads::default()),
                runtime,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_needs_a_runtime() {
        assert!(matches!(
            ClientContext::builder().build(),
            Err(ConfigError::NoRuntime(_))
        ));
    }

    #[test]
    fn explicit_runtime_is_used_outside_one() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let ctx = ClientContext::builder()
            .runtime(runtime.handle().clone())
            .build();
        assert!(ctx.is_ok());
    }

    #[tokio::test]
    async fn disabled_audio_reports_the_reason() {
        let ctx = ClientContext::builder()
            .disable_audio("libopus missing")
            .build()
            .unwrap();
        assert!(!ctx.is_audio_supported());
        assert!(matches!(
            ctx.codecs(),
            Err(VoiceError::Unsupported(reason)) if reason == "libopus missing"
        ));
    }
}
