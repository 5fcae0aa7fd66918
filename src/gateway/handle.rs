use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{payload::GatewayPayload, session::SessionStatus};

#[derive(Debug)]
pub enum GatewayCommand {
    Send(GatewayPayload),
    /// Drop the socket and resume on a new one.
    Reconnect,
    Shutdown,
}

/// Read-only view of a shard's session, published by its gateway thread.
#[derive(Debug)]
pub(crate) struct SessionView {
    status: RwLock<SessionStatus>,
    /// Heartbeat round trip in ms; `u64::MAX` until the first ack.
    ping_ms: AtomicU64,
}

impl SessionView {
    pub(crate) fn publish_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn publish_ping(&self, latency: Duration) {
        self.ping_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            status: RwLock::new(SessionStatus::Connecting),
            ping_ms: AtomicU64::new(u64::MAX),
        }
    }
}

/// Cloneable sender into a running shard.
///
/// All methods are non-blocking and may be called from any thread.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<GatewayCommand>,
    view: Arc<SessionView>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    /// Creates a handle together with the command stream it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GatewayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                view: Arc::new(SessionView::default()),
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    pub(crate) fn view(&self) -> Arc<SessionView> {
        Arc::clone(&self.view)
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queues a payload. Returns `false` once the shard has stopped.
    pub fn send(&self, payload: GatewayPayload) -> bool {
        self.tx.send(GatewayCommand::Send(payload)).is_ok()
    }

    pub fn reconnect(&self) -> bool {
        self.tx.send(GatewayCommand::Reconnect).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(GatewayCommand::Shutdown);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }

    pub fn status(&self) -> SessionStatus {
        *self.view.status.read()
    }

    pub fn ping(&self) -> Option<Duration> {
        match self.view.ping_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
