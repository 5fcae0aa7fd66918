use std::sync::Arc;

use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    connection::{ConnectionStatus, VoiceChannel, VoiceConnection},
    gateway::{TransportEnd, VoiceCredentials, VoiceGateway},
};
use crate::{
    common::{
        errors::VoiceError,
        types::{ChannelId, GuildId, UserId, now_millis},
    },
    configs::VoiceSettings,
    context::ClientContext,
    gateway::{
        events::{VoiceServer, VoiceState},
        handle::GatewayHandle,
        payload::GatewayPayload,
    },
    task::{Task, TaskError},
};

/// Voice close code sent when we were disconnected, moved or the channel
/// was deleted. A following VOICE_STATE_UPDATE tells which.
const CLOSE_DISCONNECTED: u16 = 4014;

/// A disconnect the voice server initiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRecord {
    pub channel_id: ChannelId,
    pub code: Option<u16>,
    pub reason: String,
    /// Unix time in milliseconds.
    pub at: u64,
}

struct ManagerInner {
    ctx: ClientContext,
    gateway: GatewayHandle,
    settings: VoiceSettings,
    user_id: RwLock<Option<UserId>>,
    connections: DashMap<GuildId, Arc<VoiceConnection>>,
    /// Our voice session id per guild, from VOICE_STATE_UPDATE.
    sessions: DashMap<GuildId, String>,
    /// Server details not yet consumed by a transport.
    pending_servers: DashMap<GuildId, VoiceServer>,
    unavailable: DashSet<GuildId>,
    last_disconnect: DashMap<GuildId, DisconnectRecord>,
    shutdown: CancellationToken,
}

/// Owns the voice connections of one shard.
///
/// Joining is a handshake through the main gateway: we send a voice state
/// update, the server answers with our voice session (VOICE_STATE_UPDATE)
/// and the voice server to use (VOICE_SERVER_UPDATE). Once both are known a
/// transport is started on the context's runtime.
#[derive(Clone)]
pub struct AudioManager {
    inner: Arc<ManagerInner>,
}

impl AudioManager {
    pub fn new(ctx: ClientContext, gateway: GatewayHandle, settings: VoiceSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                ctx,
                gateway,
                settings,
                user_id: RwLock::new(None),
                connections: DashMap::new(),
                sessions: DashMap::new(),
                pending_servers: DashMap::new(),
                unavailable: DashSet::new(),
                last_disconnect: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Requests to join `channel`. Preconditions are checked synchronously;
    /// the returned connection's [`VoiceConnection::ready`] task resolves once
    /// audio can flow.
    pub fn open_audio_connection(
        &self,
        channel: VoiceChannel,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        let inner = &self.inner;
        inner.ctx.codecs()?;
        if inner.gateway.is_closed() || inner.shutdown.is_cancelled() {
            return Err(VoiceError::GatewayClosed);
        }
        let guild_id = channel.guild_id;
        if inner.unavailable.contains(&guild_id) {
            return Err(VoiceError::GuildUnavailable(guild_id));
        }

        let conn = match inner.connections.entry(guild_id) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                let channel_id = existing.channel_id();
                return Err(if existing.is_ready() {
                    VoiceError::AlreadyConnected {
                        guild_id,
                        channel_id,
                    }
                } else {
                    VoiceError::AlreadyConnecting {
                        guild_id,
                        channel_id,
                    }
                });
            }
            Entry::Vacant(slot) => {
                let conn = VoiceConnection::new(channel, inner.ctx.clone());
                slot.insert(Arc::clone(&conn));
                conn
            }
        };
        self.watch_ready(&conn, conn.ready());

        info!("[{}] Opening audio connection to {}", guild_id, channel.id);
        self.request_join(&conn);
        Ok(conn)
    }

    /// Moves the guild's connection to another channel of the same guild.
    /// The connection object is kept.
    pub fn move_audio_connection(
        &self,
        guild_id: GuildId,
        channel: VoiceChannel,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        if channel.guild_id != guild_id {
            return Err(VoiceError::CrossGuildMove {
                from: guild_id,
                to: channel.guild_id,
            });
        }
        if self.inner.gateway.is_closed() {
            return Err(VoiceError::GatewayClosed);
        }
        let conn = self
            .connection(guild_id)
            .ok_or(VoiceError::NotConnected(guild_id))?;

        info!(
            "[{}] Moving audio connection {} -> {}",
            guild_id,
            conn.channel_id(),
            channel.id
        );
        conn.set_channel(channel.id);
        self.send_voice_state(guild_id, Some(channel.id));
        Ok(conn)
    }

    /// Leaves the voice channel. Returns `false` if there was no connection.
    pub fn close_audio_connection(&self, guild_id: GuildId) -> bool {
        let closed = self.close_connection(guild_id, TaskError::Cancelled, true);
        if closed {
            info!("[{}] Audio connection closed", guild_id);
        }
        closed
    }

    pub fn connection(&self, guild_id: GuildId) -> Option<Arc<VoiceConnection>> {
        self.inner
            .connections
            .get(&guild_id)
            .map(|c| Arc::clone(c.value()))
    }

    pub fn connections(&self) -> Vec<Arc<VoiceConnection>> {
        self.inner
            .connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    /// The most recent server-initiated disconnect in `guild_id`.
    pub fn last_disconnect(&self, guild_id: GuildId) -> Option<DisconnectRecord> {
        self.inner
            .last_disconnect
            .get(&guild_id)
            .map(|r| r.value().clone())
    }

    /// Closes every connection without leaving the channels. Used when the
    /// gateway stops for good.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let guilds: Vec<GuildId> = self.inner.connections.iter().map(|c| *c.key()).collect();
        for guild_id in guilds {
            self.close_connection(guild_id, TaskError::Cancelled, false);
        }
    }

    fn close_connection(&self, guild_id: GuildId, error: TaskError, leave: bool) -> bool {
        let inner = &self.inner;
        let Some((_, conn)) = inner.connections.remove(&guild_id) else {
            return false;
        };
        inner.pending_servers.remove(&guild_id);
        inner.sessions.remove(&guild_id);
        conn.stop_transport();
        conn.fail_ready(error);
        conn.set_status(ConnectionStatus::Closed);
        if leave {
            self.send_voice_state(guild_id, None);
        }
        true
    }

    fn is_current(&self, conn: &Arc<VoiceConnection>) -> bool {
        self.inner
            .connections
            .get(&conn.guild_id())
            .is_some_and(|c| Arc::ptr_eq(c.value(), conn))
    }

    fn send_voice_state(&self, guild_id: GuildId, channel_id: Option<ChannelId>) {
        let settings = &self.inner.settings;
        let payload = GatewayPayload::voice_state_update(
            guild_id,
            channel_id,
            settings.self_mute,
            settings.self_deaf,
        );
        if !self.inner.gateway.send(payload) {
            debug!("[{}] Gateway gone; voice state update dropped", guild_id);
        }
    }

    /// Asks the gateway for voice server details and waits for them.
    fn request_join(&self, conn: &Arc<VoiceConnection>) {
        conn.stop_transport();
        let attempt = self.begin_attempt(&conn);
        conn.set_status(ConnectionStatus::Queued);
        self.send_voice_state(conn.guild_id(), Some(conn.channel_id()));
        self.arm_queue_timeout(conn, attempt);
    }

    fn begin_attempt(&self, conn: &Arc<VoiceConnection>) -> u64 {
        let (attempt, renewed) = conn.begin_attempt();
        if let Some(ready) = renewed {
            self.watch_ready(conn, ready);
        }
        attempt
    }

    /// Abandons the join when the caller cancels a ready task or lets its
    /// own timeout fire. Failures raised by the manager itself have already
    /// removed the connection by the time the task settles.
    fn watch_ready(&self, conn: &Arc<VoiceConnection>, ready: Task<()>) {
        let manager = self.clone();
        let conn = Arc::clone(conn);
        let shutdown = self.inner.shutdown.clone();
        self.inner.ctx.runtime_handle().spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ready.finished() => {}
            }
            if matches!(ready.error(), Some(TaskError::Cancelled | TaskError::TimedOut))
                && manager.is_current(&conn)
            {
                info!(
                    "[{}] Ready task abandoned; closing audio connection",
                    conn.guild_id()
                );
                manager.close_connection(conn.guild_id(), TaskError::Cancelled, true);
            }
        });
    }

    fn arm_queue_timeout(&self, conn: &Arc<VoiceConnection>, attempt: u64) {
        let manager = self.clone();
        let conn = Arc::clone(conn);
        let timeout = self.inner.settings.queue_timeout();
        let shutdown = self.inner.shutdown.clone();
        self.inner.ctx.runtime_handle().spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if conn.attempt() == attempt
                && conn.status() == ConnectionStatus::Queued
                && manager.is_current(&conn)
            {
                warn!(
                    "[{}] No voice server details within {:?}; giving up",
                    conn.guild_id(),
                    timeout
                );
                manager.close_connection(conn.guild_id(), TaskError::TimedOut, true);
            }
        });
    }

    fn arm_ready_timeout(&self, conn: &Arc<VoiceConnection>, attempt: u64) {
        let manager = self.clone();
        let conn = Arc::clone(conn);
        let timeout = self.inner.settings.ready_timeout();
        let shutdown = self.inner.shutdown.clone();
        self.inner.ctx.runtime_handle().spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if conn.attempt() == attempt
                && conn.status() == ConnectionStatus::Connecting
                && manager.is_current(&conn)
            {
                warn!(
                    "[{}] Voice transport not ready within {:?}; closing",
                    conn.guild_id(),
                    timeout
                );
                manager.close_connection(conn.guild_id(), TaskError::TimedOut, true);
            }
        });
    }

    /// Starts a transport once both our voice session and fresh server
    /// details are known.
    fn try_start(&self, guild_id: GuildId) {
        let inner = &self.inner;
        let Some(conn) = self.connection(guild_id) else {
            return;
        };
        let Some(user_id) = *inner.user_id.read() else {
            return;
        };
        let Some(session_id) = inner.sessions.get(&guild_id).map(|s| s.value().clone()) else {
            return;
        };
        let server = match inner.pending_servers.entry(guild_id) {
            Entry::Occupied(e) if e.get().endpoint.is_some() => e.remove(),
            _ => return,
        };
        let Some(endpoint) = server.endpoint else {
            return;
        };
        let codecs = match inner.ctx.codecs() {
            Ok(codecs) => codecs,
            Err(e) => {
                warn!("[{}] {}", guild_id, e);
                return;
            }
        };

        let creds = VoiceCredentials {
            guild_id,
            channel_id: conn.channel_id(),
            user_id,
            session_id,
            token: server.token,
            endpoint,
        };
        debug!("[{}] Starting voice transport: {:?}", guild_id, creds);

        let cancel = CancellationToken::new();
        conn.install_transport(cancel.clone());
        let attempt = self.begin_attempt(&conn);
        conn.set_status(ConnectionStatus::Connecting);

        let gateway = VoiceGateway::new(
            creds,
            Arc::clone(&conn),
            codecs,
            inner.ctx.dave_factory(),
            cancel,
        );
        let manager = self.clone();
        let task_conn = Arc::clone(&conn);
        inner.ctx.runtime_handle().spawn(async move {
            let end = gateway.run().await;
            manager.on_transport_end(&task_conn, attempt, end);
        });
        self.arm_ready_timeout(&conn, attempt);
    }

    fn on_transport_end(&self, conn: &Arc<VoiceConnection>, attempt: u64, end: TransportEnd) {
        let guild_id = conn.guild_id();
        if end == TransportEnd::Cancelled
            || conn.attempt() != attempt
            || !self.is_current(conn)
            || self.inner.shutdown.is_cancelled()
        {
            debug!("[{}] Voice transport stopped: {:?}", guild_id, end);
            return;
        }

        let (code, reason) = match end {
            TransportEnd::Closed { code, reason } => (Some(code), reason),
            TransportEnd::Failed(reason) => (None, reason),
            TransportEnd::Cancelled => return,
        };
        warn!(
            "[{}] Voice transport ended: code={:?}, reason='{}'",
            guild_id, code, reason
        );
        self.inner.last_disconnect.insert(
            guild_id,
            DisconnectRecord {
                channel_id: conn.channel_id(),
                code,
                reason: reason.clone(),
                at: now_millis(),
            },
        );
        conn.stop_transport();
        conn.set_status(ConnectionStatus::Disconnected);
        conn.notify_disconnect(code, &reason);

        if code == Some(CLOSE_DISCONNECTED) {
            // Moved or kicked; the next voice state update decides.
            let attempt = self.begin_attempt(&conn);
            conn.set_status(ConnectionStatus::Queued);
            self.arm_queue_timeout(conn, attempt);
        } else if self.inner.settings.auto_reconnect {
            info!("[{}] Re-requesting voice channel {}", guild_id, conn.channel_id());
            self.request_join(conn);
        } else {
            self.close_connection(guild_id, TaskError::Failed(reason), true);
        }
    }

    pub(crate) fn on_ready(&self, user_id: UserId, unavailable: &[GuildId]) {
        *self.inner.user_id.write() = Some(user_id);
        self.inner.unavailable.clear();
        for guild_id in unavailable {
            self.inner.unavailable.insert(*guild_id);
        }
    }

    /// A new gateway session invalidated every voice session.
    pub(crate) fn on_session_recreated(&self) {
        for conn in self.connections() {
            info!("[{}] Session recreated; rejoining voice", conn.guild_id());
            self.inner.sessions.remove(&conn.guild_id());
            self.inner.pending_servers.remove(&conn.guild_id());
            self.request_join(&conn);
        }
    }

    pub(crate) fn on_voice_state_update(&self, state: &VoiceState) {
        if *self.inner.user_id.read() != Some(state.user_id) {
            return;
        }
        let Some(guild_id) = state.guild_id else {
            return;
        };
        let Some(conn) = self.connection(guild_id) else {
            return;
        };

        match state.channel_id {
            None => {
                info!("[{}] Disconnected from voice by the server", guild_id);
                self.inner.last_disconnect.insert(
                    guild_id,
                    DisconnectRecord {
                        channel_id: conn.channel_id(),
                        code: None,
                        reason: "removed from the voice channel".into(),
                        at: now_millis(),
                    },
                );
                conn.notify_disconnect(None, "removed from the voice channel");
                self.close_connection(guild_id, TaskError::Failed("disconnected".into()), false);
            }
            Some(channel_id) => {
                if channel_id != conn.channel_id() {
                    debug!("[{}] Server moved us to channel {}", guild_id, channel_id);
                    conn.set_channel(channel_id);
                }
                self.inner
                    .sessions
                    .insert(guild_id, state.session_id.clone());
                self.try_start(guild_id);
            }
        }
    }

    pub(crate) fn on_voice_server_update(&self, server: &VoiceServer) {
        let guild_id = server.guild_id;
        let Some(conn) = self.connection(guild_id) else {
            return;
        };

        if server.endpoint.is_none() {
            // The voice server is being reallocated.
            info!("[{}] Voice region change in progress", guild_id);
            conn.stop_transport();
            let attempt = self.begin_attempt(&conn);
            conn.set_status(ConnectionStatus::Queued);
            self.inner
                .pending_servers
                .insert(guild_id, server.clone());
            self.arm_queue_timeout(&conn, attempt);
            return;
        }

        if conn.stop_transport() {
            info!("[{}] New voice server; reconnecting transport", guild_id);
        }
        self.inner
            .pending_servers
            .insert(guild_id, server.clone());
        self.try_start(guild_id);
    }

    pub(crate) fn on_guild_available(&self, guild_id: GuildId) {
        if self.inner.unavailable.remove(&guild_id).is_none() {
            return;
        }
        if let Some(conn) = self.connection(guild_id) {
            if !conn.has_transport() {
                info!("[{}] Guild available again; rejoining voice", guild_id);
                self.request_join(&conn);
            }
        }
    }

    pub(crate) fn on_guild_unavailable(&self, guild_id: GuildId) {
        self.inner.unavailable.insert(guild_id);
        if let Some(conn) = self.connection(guild_id) {
            warn!("[{}] Guild unavailable; suspending voice", guild_id);
            conn.stop_transport();
            self.begin_attempt(&conn);
            conn.set_status(ConnectionStatus::Disconnected);
        }
    }

    pub(crate) fn on_guild_removed(&self, guild_id: GuildId) {
        self.inner.unavailable.remove(&guild_id);
        if self.close_connection(guild_id, TaskError::Failed("guild removed".into()), false) {
            info!("[{}] Guild removed; audio connection closed", guild_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        gateway::handle::GatewayCommand,
        voice::codec::{CodecError, OpusCodecFactory, OpusDecoder, OpusEncoder},
    };

    struct NullCodecs;

    impl OpusCodecFactory for NullCodecs {
        fn create_encoder(&self) -> Result<Box<dyn OpusEncoder>, CodecError> {
            Err(CodecError::Init("test".into()))
        }
        fn create_decoder(&self) -> Result<Box<dyn OpusDecoder>, CodecError> {
            Err(CodecError::Init("test".into()))
        }
    }

    fn manager() -> (AudioManager, mpsc::UnboundedReceiver<GatewayCommand>) {
        let ctx = ClientContext::builder()
            .codec_factory(Arc::new(NullCodecs))
            .build()
            .unwrap();
        let (handle, rx) = GatewayHandle::channel();
        let manager = AudioManager::new(ctx, handle, VoiceSettings::default());
        manager.on_ready(UserId(10), &[GuildId(99)]);
        (manager, rx)
    }

    fn sent_channel(rx: &mut mpsc::UnboundedReceiver<GatewayCommand>) -> Option<Option<u64>> {
        match rx.try_recv().ok()? {
            GatewayCommand::Send(payload) => Some(
                payload.d["channel_id"]
                    .as_str()
                    .and_then(|s| s.parse().ok()),
            ),
            _ => None,
        }
    }

    #[tokio::test]
    async fn open_sends_a_voice_state_update() {
        let (manager, mut rx) = manager();
        let conn = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Queued);
        assert_eq!(sent_channel(&mut rx), Some(Some(2)));
    }

    #[tokio::test]
    async fn second_open_is_rejected_and_leaves_the_first_untouched() {
        let (manager, _rx) = manager();
        let first = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();

        let err = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(3)))
            .unwrap_err();
        assert_eq!(
            err,
            VoiceError::AlreadyConnecting {
                guild_id: GuildId(1),
                channel_id: ChannelId(2)
            }
        );
        let current = manager.connection(GuildId(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(current.channel_id(), ChannelId(2));
    }

    #[tokio::test]
    async fn move_keeps_the_same_connection() {
        let (manager, mut rx) = manager();
        let conn = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        sent_channel(&mut rx);

        let moved = manager
            .move_audio_connection(GuildId(1), VoiceChannel::new(GuildId(1), ChannelId(5)))
            .unwrap();
        assert!(Arc::ptr_eq(&conn, &moved));
        assert_eq!(moved.channel_id(), ChannelId(5));
        assert_eq!(sent_channel(&mut rx), Some(Some(5)));

        let err = manager
            .move_audio_connection(GuildId(1), VoiceChannel::new(GuildId(7), ChannelId(8)))
            .unwrap_err();
        assert!(matches!(err, VoiceError::CrossGuildMove { .. }));
    }

    #[tokio::test]
    async fn unavailable_guilds_and_closed_gateways_are_rejected() {
        let (manager, _rx) = manager();
        assert_eq!(
            manager
                .open_audio_connection(VoiceChannel::new(GuildId(99), ChannelId(1)))
                .unwrap_err(),
            VoiceError::GuildUnavailable(GuildId(99))
        );

        manager.inner.gateway.shutdown();
        assert_eq!(
            manager
                .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(1)))
                .unwrap_err(),
            VoiceError::GatewayClosed
        );
    }

    #[tokio::test]
    async fn close_leaves_the_channel_and_cancels_ready() {
        let (manager, mut rx) = manager();
        let conn = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        sent_channel(&mut rx);

        assert!(manager.close_audio_connection(GuildId(1)));
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        assert_eq!(conn.ready().get_timeout(std::time::Duration::from_secs(1)), Err(TaskError::Cancelled));
        assert_eq!(sent_channel(&mut rx), Some(None));
        assert!(!manager.close_audio_connection(GuildId(1)));
    }

    #[tokio::test]
    async fn server_side_disconnect_is_recorded() {
        let (manager, _rx) = manager();
        manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        manager.on_voice_state_update(&VoiceState {
            guild_id: Some(GuildId(1)),
            channel_id: None,
            user_id: UserId(10),
            session_id: "s".into(),
            self_mute: false,
            self_deaf: false,
        });

        assert!(manager.connection(GuildId(1)).is_none());
        let record = manager.last_disconnect(GuildId(1)).unwrap();
        assert_eq!(record.channel_id, ChannelId(2));
    }

    #[tokio::test]
    async fn other_users_voice_states_are_ignored() {
        let (manager, _rx) = manager();
        manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        manager.on_voice_state_update(&VoiceState {
            guild_id: Some(GuildId(1)),
            channel_id: None,
            user_id: UserId(11),
            session_id: "s".into(),
            self_mute: false,
            self_deaf: false,
        });
        assert!(manager.connection(GuildId(1)).is_some());
    }

    #[tokio::test]
    async fn open_fails_when_audio_is_unsupported() {
        let ctx = ClientContext::builder()
            .disable_audio("no libopus")
            .build()
            .unwrap();
        let (handle, mut rx) = GatewayHandle::channel();
        let manager = AudioManager::new(ctx, handle, VoiceSettings::default());
        manager.on_ready(UserId(10), &[]);

        let err = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap_err();
        assert_eq!(err, VoiceError::Unsupported("no libopus".into()));
        assert!(manager.connection(GuildId(1)).is_none());
        assert!(manager.connections().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_ready_stops_the_attempt() {
        let (manager, mut rx) = manager();
        let conn = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        sent_channel(&mut rx);
        let transport = CancellationToken::new();
        conn.install_transport(transport.clone());

        assert!(conn.ready().cancel());
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        assert!(transport.is_cancelled());
        assert!(manager.connection(GuildId(1)).is_none());
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        assert_eq!(sent_channel(&mut rx), Some(None));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_timeout_set_by_the_caller_abandons_the_join() {
        let (manager, _rx) = manager();
        let conn = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        conn.ready().set_timeout(std::time::Duration::from_millis(50));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(conn.ready().error(), Some(TaskError::TimedOut));
        assert!(manager.connection(GuildId(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_fails_the_ready_task() {
        let (manager, _rx) = manager();
        let conn = manager
            .open_audio_connection(VoiceChannel::new(GuildId(1), ChannelId(2)))
            .unwrap();
        let ready = conn.ready();

        tokio::time::sleep(VoiceSettings::default().queue_timeout() * 2).await;
        assert!(ready.is_done());
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        assert!(manager.connection(GuildId(1)).is_none());
    }
}
