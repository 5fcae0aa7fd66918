use std::{
    sync::{
        Arc,
        atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    crypto::EncryptionMode,
    receive::{AudioReceiveHandler, ReceiveHandlerSlot},
    send::{AudioSendHandler, SendHandlerSlot},
};
use crate::{
    common::{
        guarded,
        types::{ChannelId, GuildId, UserId},
    },
    context::ClientContext,
    task::{Completer, Task, TaskError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    NotConnected,
    /// Waiting for the voice server details.
    Queued,
    /// Voice gateway handshake in progress.
    Connecting,
    Ready,
    /// Transport lost; reconnecting.
    Disconnected,
    Closed,
}

/// A voice channel to join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceChannel {
    pub guild_id: GuildId,
    pub id: ChannelId,
}

impl VoiceChannel {
    pub fn new(guild_id: GuildId, id: ChannelId) -> Self {
        Self { guild_id, id }
    }
}

/// Observer of one voice connection. Every method has a no-op default.
pub trait ConnectionListener: Send + Sync {
    fn on_status_change(&self, _old: ConnectionStatus, _new: ConnectionStatus) {}

    fn on_ping(&self, _latency: Duration) {}

    fn on_user_speaking(&self, _user_id: UserId, _ssrc: u32, _speaking: bool) {}

    /// The voice server ended the session outside an explicit close.
    fn on_disconnect(&self, _code: Option<u16>, _reason: &str) {}
}

struct ReadySignal {
    task: Task<()>,
    completer: Option<Completer<()>>,
}

/// The audio connection of one guild.
///
/// Survives channel moves, region changes and transport reconnects; only
/// an explicit close or a removed guild ends it.
pub struct VoiceConnection {
    guild_id: GuildId,
    channel_id: RwLock<ChannelId>,
    status: RwLock<ConnectionStatus>,
    ssrc: AtomicU32,
    mode: RwLock<Option<EncryptionMode>>,
    /// `u64::MAX` until the first heartbeat ack.
    ping_ms: AtomicU64,
    dave_version: AtomicU16,
    send_handler: SendHandlerSlot,
    receive_handler: ReceiveHandlerSlot,
    listener: RwLock<Option<Arc<dyn ConnectionListener>>>,
    ready: Mutex<ReadySignal>,
    attempt: AtomicU64,
    transport: Mutex<Option<CancellationToken>>,
    ctx: ClientContext,
}

impl std::fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConnection")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id())
            .field("status", &self.status())
            .finish()
    }
}

impl VoiceConnection {
    pub(crate) fn new(channel: VoiceChannel, ctx: ClientContext) -> Arc<Self> {
        let (task, completer) = Task::pending(ctx.runtime_handle(), ctx.gateway_threads());
        Arc::new(Self {
            guild_id: channel.guild_id,
            channel_id: RwLock::new(channel.id),
            status: RwLock::new(ConnectionStatus::NotConnected),
            ssrc: AtomicU32::new(0),
            mode: RwLock::new(None),
            ping_ms: AtomicU64::new(u64::MAX),
            dave_version: AtomicU16::new(0),
            send_handler: Arc::new(Mutex::new(None)),
            receive_handler: Arc::new(Mutex::new(None)),
            listener: RwLock::new(None),
            ready: Mutex::new(ReadySignal {
                task,
                completer: Some(completer),
            }),
            attempt: AtomicU64::new(0),
            transport: Mutex::new(None),
            ctx,
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        *self.channel_id.read()
    }

    pub fn channel(&self) -> VoiceChannel {
        VoiceChannel::new(self.guild_id, self.channel_id())
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ConnectionStatus::Ready
    }

    /// Our SSRC on the current transport.
    pub fn ssrc(&self) -> Option<u32> {
        match self.ssrc.load(Ordering::Relaxed) {
            0 => None,
            ssrc => Some(ssrc),
        }
    }

    pub fn encryption_mode(&self) -> Option<EncryptionMode> {
        *self.mode.read()
    }

    /// Voice heartbeat round trip.
    pub fn ping(&self) -> Option<Duration> {
        match self.ping_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// `0` when media is only transport-encrypted.
    pub fn dave_protocol_version(&self) -> u16 {
        self.dave_version.load(Ordering::Relaxed)
    }

    /// Resolves when the current connect cycle reaches [`ConnectionStatus::Ready`].
    pub fn ready(&self) -> Task<()> {
        self.ready.lock().task.clone()
    }

    pub fn set_send_handler(&self, handler: impl AudioSendHandler + 'static) {
        *self.send_handler.lock() = Some(Box::new(handler));
    }

    pub fn clear_send_handler(&self) {
        *self.send_handler.lock() = None;
    }

    pub fn set_receive_handler(&self, handler: impl AudioReceiveHandler + 'static) {
        *self.receive_handler.lock() = Some(Box::new(handler));
    }

    pub fn clear_receive_handler(&self) {
        *self.receive_handler.lock() = None;
    }

    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self.listener.write() = Some(listener);
    }

    pub(crate) fn send_slot(&self) -> SendHandlerSlot {
        Arc::clone(&self.send_handler)
    }

    pub(crate) fn receive_slot(&self) -> ReceiveHandlerSlot {
        Arc::clone(&self.receive_handler)
    }

    pub(crate) fn set_channel(&self, channel_id: ChannelId) {
        *self.channel_id.write() = channel_id;
    }

    pub(crate) fn set_status(&self, next: ConnectionStatus) {
        let old = std::mem::replace(&mut *self.status.write(), next);
        if old == next {
            return;
        }
        debug!("[{}] Voice status {:?} -> {:?}", self.guild_id, old, next);
        self.notify("voice.on_status_change", |l| l.on_status_change(old, next));
    }

    /// Starts a new connect cycle and returns its id. Watchers compare ids
    /// so a stale timer never touches a newer attempt.
    ///
    /// Also returns the ready task when the previous one had resolved and a
    /// fresh one was created for this cycle.
    pub(crate) fn begin_attempt(&self) -> (u64, Option<Task<()>>) {
        let mut ready = self.ready.lock();
        let renewed = if ready.completer.is_none() {
            let (task, completer) =
                Task::pending(self.ctx.runtime_handle(), self.ctx.gateway_threads());
            *ready = ReadySignal {
                task: task.clone(),
                completer: Some(completer),
            };
            Some(task)
        } else {
            None
        };
        (self.attempt.fetch_add(1, Ordering::AcqRel) + 1, renewed)
    }

    pub(crate) fn attempt(&self) -> u64 {
        self.attempt.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self, ssrc: u32, mode: EncryptionMode, dave_version: u16) {
        self.ssrc.store(ssrc, Ordering::Relaxed);
        *self.mode.write() = Some(mode);
        self.dave_version.store(dave_version, Ordering::Relaxed);
        self.set_status(ConnectionStatus::Ready);
        if let Some(completer) = self.ready.lock().completer.take() {
            completer.complete(Ok(()));
        }
    }

    pub(crate) fn fail_ready(&self, error: TaskError) {
        if let Some(completer) = self.ready.lock().completer.take() {
            completer.complete(Err(error));
        }
    }

    pub(crate) fn set_dave_version(&self, version: u16) {
        self.dave_version.store(version, Ordering::Relaxed);
    }

    pub(crate) fn set_ping(&self, latency: Duration) {
        self.ping_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
        self.notify("voice.on_ping", |l| l.on_ping(latency));
    }

    pub(crate) fn user_speaking(&self, user_id: UserId, ssrc: u32, speaking: bool) {
        self.notify("voice.on_user_speaking", |l| {
            l.on_user_speaking(user_id, ssrc, speaking)
        });
    }

    pub(crate) fn notify_disconnect(&self, code: Option<u16>, reason: &str) {
        self.notify("voice.on_disconnect", |l| l.on_disconnect(code, reason));
    }

    /// Installs the cancel token of a freshly started transport, stopping
    /// any previous one.
    pub(crate) fn install_transport(&self, cancel: CancellationToken) {
        if let Some(previous) = self.transport.lock().replace(cancel) {
            previous.cancel();
        }
    }

    /// Returns `true` if a transport was running.
    pub(crate) fn stop_transport(&self) -> bool {
        let stopped = self.transport.lock().take().map(|t| t.cancel()).is_some();
        self.ssrc.store(0, Ordering::Relaxed);
        *self.mode.write() = None;
        stopped
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    fn notify(&self, label: &str, f: impl FnOnce(&dyn ConnectionListener)) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            guarded(label, || f(listener.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Statuses(Mutex<Vec<(ConnectionStatus, ConnectionStatus)>>);

    impl ConnectionListener for Statuses {
        fn on_status_change(&self, old: ConnectionStatus, new: ConnectionStatus) {
            self.0.lock().push((old, new));
        }
    }

    fn connection() -> Arc<VoiceConnection> {
        let ctx = ClientContext::builder().build().unwrap();
        VoiceConnection::new(VoiceChannel::new(GuildId(1), ChannelId(2)), ctx)
    }

    #[tokio::test]
    async fn status_changes_reach_the_listener_once() {
        let conn = connection();
        let listener = Arc::new(Statuses::default());
        conn.set_listener(listener.clone());

        conn.set_status(ConnectionStatus::Queued);
        conn.set_status(ConnectionStatus::Queued);
        conn.set_status(ConnectionStatus::Connecting);
        assert_eq!(
            *listener.0.lock(),
            vec![
                (ConnectionStatus::NotConnected, ConnectionStatus::Queued),
                (ConnectionStatus::Queued, ConnectionStatus::Connecting),
            ]
        );
    }

    #[tokio::test]
    async fn ready_task_resolves_and_renews_per_cycle() {
        let conn = connection();
        let first = conn.ready();
        let (attempt, renewed) = conn.begin_attempt();
        assert!(renewed.is_none());
        conn.mark_ready(42, EncryptionMode::AeadAes256GcmRtpSize, 0);
        assert!(first.is_done());
        assert_eq!(conn.ssrc(), Some(42));

        let (next_attempt, renewed) = conn.begin_attempt();
        assert!(next_attempt > attempt);
        assert!(renewed.is_some());
        let second = conn.ready();
        assert!(!second.is_done());
        conn.fail_ready(TaskError::TimedOut);
        assert!(second.is_done());
    }

    #[tokio::test]
    async fn stopping_cancels_the_transport() {
        let conn = connection();
        let token = CancellationToken::new();
        conn.install_transport(token.clone());
        assert!(conn.has_transport());
        assert!(conn.stop_transport());
        assert!(token.is_cancelled());
        assert!(!conn.stop_transport());
    }
}
