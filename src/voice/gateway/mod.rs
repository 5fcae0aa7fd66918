//! Voice websocket of one guild, plus the UDP media session it negotiates.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    codec::OpusCodecFactory,
    connection::{ConnectionStatus, VoiceConnection},
    constants::{
        BACKOFF_BASE_MS, BACKOFF_MAX_MS, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_FRESH_MS,
        VOICE_GATEWAY_VERSION, WRITE_TASK_SHUTDOWN_MS,
    },
    crypto::{EncryptionMode, PacketCipher},
    dave::{DaveCallbacks, DaveSession, DaveSessionFactory},
    receive::{ReceivePipeline, receive_loop},
    send::{SendPipeline, speak_loop},
    udp::{PacketSink, RtpPacketizer, UdpSink, discover_ip},
};
use crate::{
    common::{
        errors::map_boxed_err,
        types::{AnyResult, ChannelId, GuildId, Shared, UserId},
    },
    configs::BackoffConfig,
    gateway::session::{HeartbeatTracker, backoff::Backoff, heartbeat::spawn_heartbeat},
};

pub mod handler;
pub mod types;

pub use types::{SessionOutcome, TransportEnd, VoiceGatewayMessage};

use self::types::{close_outcome, op};

/// Everything needed to open a voice session, gathered from
/// VOICE_STATE_UPDATE and VOICE_SERVER_UPDATE.
#[derive(Clone, PartialEq, Eq)]
pub struct VoiceCredentials {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl std::fmt::Debug for VoiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceCredentials")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

pub fn voice_gateway_url(endpoint: &str) -> String {
    let host = endpoint
        .trim_start_matches("wss://")
        .trim_end_matches('/');
    format!("wss://{}/?v={}", host, VOICE_GATEWAY_VERSION)
}

fn voice_backoff() -> BackoffConfig {
    BackoffConfig {
        base_ms: BACKOFF_BASE_MS,
        max_ms: BACKOFF_MAX_MS,
        max_attempts: Some(MAX_RECONNECT_ATTEMPTS),
    }
}

/// Sender into whichever websocket is currently open.
///
/// DAVE callbacks and the speak loop outlive single sockets, so they write
/// through this instead of holding a socket's queue.
#[derive(Default)]
pub struct Outbound {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Outbound {
    fn attach(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.tx.lock() = Some(tx);
    }

    fn detach(&self) {
        *self.tx.lock() = None;
    }

    fn send(&self, message: Message) -> bool {
        match &*self.tx.lock() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn send_json(&self, op: u8, d: Value) -> bool {
        match serde_json::to_string(&VoiceGatewayMessage::new(op, d)) {
            Ok(json) => self.send(Message::Text(json.into())),
            Err(e) => {
                warn!("Failed to encode voice op {}: {}", op, e);
                false
            }
        }
    }

    pub fn send_binary(&self, op: u8, payload: &[u8]) -> bool {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(op);
        out.extend_from_slice(payload);
        self.send(Message::Binary(out.into()))
    }

    fn close(&self, code: u16, reason: &str) {
        self.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        })));
    }
}

impl DaveCallbacks for Outbound {
    fn send_key_package(&self, key_package: Vec<u8>) {
        debug!("Sending DAVE key package (op 26)");
        self.send_binary(op::DAVE_MLS_KEY_PACKAGE, &key_package);
    }

    fn send_ready_for_transition(&self, transition_id: u16) {
        self.send_json(
            op::DAVE_TRANSITION_READY,
            json!({ "transition_id": transition_id }),
        );
    }

    fn send_commit_welcome(&self, commit_welcome: Vec<u8>) {
        self.send_binary(op::DAVE_MLS_COMMIT_WELCOME, &commit_welcome);
    }

    fn send_invalid_commit_welcome(&self, transition_id: u16) {
        self.send_json(
            op::DAVE_MLS_INVALID_COMMIT_WELCOME,
            json!({ "transition_id": transition_id }),
        );
    }
}

/// UDP endpoint learned from READY, waiting for its key.
struct PendingUdp {
    socket: Arc<UdpSocket>,
    address: SocketAddr,
    ssrc: u32,
    mode: EncryptionMode,
}

/// Running send and receive loops. Kept across resumes; dropping it stops
/// both loops.
struct MediaSession {
    ssrc: u32,
    receive: Shared<ReceivePipeline>,
    cancel: CancellationToken,
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// IP discovery outcome for a READY, handed back to the socket loop.
struct Discovered {
    udp: PendingUdp,
    result: AnyResult<(String, u16)>,
}

/// Runs IP discovery off the socket loop so heartbeats and cancellation are
/// served while the voice server answers. Nothing is sent once `cancel`
/// fires.
fn spawn_discovery(
    udp: PendingUdp,
    tx: mpsc::UnboundedSender<Discovered>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = discover_ip(&udp.socket, udp.address, udp.ssrc) => result,
        };
        let _ = tx.send(Discovered { udp, result });
    })
}

/// State of one websocket.
struct Socket {
    beat_tx: mpsc::UnboundedSender<()>,
    heartbeat: Option<JoinHandle<()>>,
    discovered_tx: mpsc::UnboundedSender<Discovered>,
    cancel: CancellationToken,
    pending_udp: Option<PendingUdp>,
}

impl Socket {
    fn start_heartbeat(&mut self, interval: Duration) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
        self.heartbeat = Some(spawn_heartbeat(
            interval,
            self.beat_tx.clone(),
            self.cancel.clone(),
        ));
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}

pub(crate) struct VoiceGateway {
    creds: VoiceCredentials,
    connection: Arc<VoiceConnection>,
    codecs: Arc<dyn OpusCodecFactory>,
    dave_factory: Arc<dyn DaveSessionFactory>,
    dave: Shared<Box<dyn DaveSession>>,
    outbound: Arc<Outbound>,
    cancel: CancellationToken,
    backoff: Backoff,
    heartbeat: HeartbeatTracker,
    seq_ack: Option<u64>,
    media: Option<MediaSession>,
}

impl VoiceGateway {
    pub(crate) fn new(
        creds: VoiceCredentials,
        connection: Arc<VoiceConnection>,
        codecs: Arc<dyn OpusCodecFactory>,
        dave_factory: Arc<dyn DaveSessionFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let outbound = Arc::new(Outbound::default());
        let dave = Self::create_dave(&creds, dave_factory.as_ref(), &outbound);
        Self {
            creds,
            connection,
            codecs,
            dave_factory,
            dave: Arc::new(Mutex::new(dave)),
            outbound,
            cancel,
            backoff: Backoff::new(&voice_backoff()),
            heartbeat: HeartbeatTracker::default(),
            seq_ack: None,
            media: None,
        }
    }

    fn create_dave(
        creds: &VoiceCredentials,
        factory: &dyn DaveSessionFactory,
        outbound: &Arc<Outbound>,
    ) -> Box<dyn DaveSession> {
        let mut dave = factory.create(creds.user_id, creds.channel_id);
        let callbacks: Arc<dyn DaveCallbacks> = outbound.clone();
        dave.initialize(callbacks);
        dave
    }

    pub(crate) async fn run(mut self) -> TransportEnd {
        let guild = self.creds.guild_id;
        let mut resume = false;

        let end = loop {
            if self.cancel.is_cancelled() {
                break TransportEnd::Cancelled;
            }

            let outcome = self.connect(resume).await;
            let fresh_delay = match outcome {
                Ok(SessionOutcome::Shutdown(end)) => break end,
                Ok(SessionOutcome::Resume) => {
                    resume = self.media.is_some();
                    None
                }
                Ok(SessionOutcome::Identify) => {
                    resume = false;
                    Some(Duration::from_millis(RECONNECT_DELAY_FRESH_MS))
                }
                Err(e) => {
                    warn!("[{}] Voice connection error: {}", guild, e);
                    resume = self.media.is_some();
                    None
                }
            };
            if !resume {
                self.reset_session();
            }
            if self.connection.is_ready() {
                self.connection.set_status(ConnectionStatus::Disconnected);
            }

            if self.backoff.is_exhausted() {
                warn!("[{}] Max voice reconnect attempts reached", guild);
                break TransportEnd::Failed("reconnect attempts exhausted".into());
            }
            let backoff_delay = self.backoff.next();
            let delay = fresh_delay.unwrap_or(backoff_delay);
            debug!(
                "[{}] Reconnecting voice in {:?} (resume={})",
                guild, delay, resume
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.media = None;
        self.dave.lock().destroy();
        end
    }

    /// Drops media and DAVE state so the next socket identifies from scratch.
    fn reset_session(&mut self) {
        self.media = None;
        self.seq_ack = None;
        let fresh = Self::create_dave(&self.creds, self.dave_factory.as_ref(), &self.outbound);
        let mut dave = self.dave.lock();
        dave.destroy();
        *dave = fresh;
    }

    async fn connect(&mut self, resume: bool) -> AnyResult<SessionOutcome> {
        let guild = self.creds.guild_id;
        let url = voice_gateway_url(&self.creds.endpoint);
        debug!("[{}] Connecting to voice gateway: {}", guild, url);

        let cancel = self.cancel.clone();
        let ws_stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionOutcome::Shutdown(TransportEnd::Cancelled)),
            result = tokio_tungstenite::connect_async(&url) => result.map_err(map_boxed_err)?.0,
        };
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("[{}] Voice WS write error: {}", guild, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });
        self.outbound.attach(tx);

        let (kind, hello) = if resume {
            ("resume", self.resume_payload())
        } else {
            ("identify", self.identify_payload())
        };
        debug!("[{}] Sending voice {}", guild, kind);
        let opcode = if resume { op::RESUME } else { op::IDENTIFY };
        self.outbound.send_json(opcode, hello);

        let (beat_tx, mut beat_rx) = mpsc::unbounded_channel::<()>();
        let (discovered_tx, mut discovered_rx) = mpsc::unbounded_channel::<Discovered>();
        let mut socket = Socket {
            beat_tx,
            heartbeat: None,
            discovered_tx,
            cancel: cancel.child_token(),
            pending_udp: None,
        };
        self.heartbeat.reset();

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.outbound.close(1000, "voice connection closed");
                    break SessionOutcome::Shutdown(TransportEnd::Cancelled);
                }
                Some(()) = beat_rx.recv() => {
                    if let Some(outcome) = self.handle_beat() {
                        break outcome;
                    }
                }
                Some(found) = discovered_rx.recv() => {
                    if let Some(outcome) = self.on_discovered(&mut socket, found) {
                        break outcome;
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("[{}] Voice WS read error: {}", guild, e);
                            break SessionOutcome::Resume;
                        }
                        None => {
                            debug!("[{}] Voice WS stream ended", guild);
                            break SessionOutcome::Resume;
                        }
                    };

                    match msg {
                        Message::Text(text) => {
                            if let Some(outcome) = self.handle_text(&mut socket, text.as_str()).await {
                                break outcome;
                            }
                        }
                        Message::Binary(bin) => self.handle_binary(&bin),
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                                .unwrap_or((1000, String::new()));
                            info!(
                                "[{}] Voice WS closed: code={}, reason='{}'",
                                guild, code, reason
                            );
                            break close_outcome(code, reason);
                        }
                        _ => {}
                    }
                }
            }
        };

        drop(socket);
        self.outbound.detach();
        if tokio::time::timeout(
            Duration::from_millis(WRITE_TASK_SHUTDOWN_MS),
            &mut write_task,
        )
        .await
        .is_err()
        {
            write_task.abort();
        }

        Ok(outcome)
    }

    fn identify_payload(&self) -> Value {
        json!({
            "server_id": self.creds.guild_id,
            "user_id": self.creds.user_id,
            "session_id": self.creds.session_id,
            "token": self.creds.token,
            "max_dave_protocol_version": self.dave.lock().max_protocol_version(),
        })
    }

    fn resume_payload(&self) -> Value {
        json!({
            "server_id": self.creds.guild_id,
            "session_id": self.creds.session_id,
            "token": self.creds.token,
            "seq_ack": self.seq_ack.map_or(-1, |s| s as i64),
        })
    }

    /// Starts the send and receive loops on the negotiated transport.
    fn start_media(&mut self, udp: PendingUdp, key: &[u8; 32]) {
        let cancel = self.cancel.child_token();
        let PendingUdp {
            socket,
            address,
            ssrc,
            mode,
        } = udp;

        let packetizer = RtpPacketizer::new(ssrc, PacketCipher::new(mode, key));
        let send = SendPipeline::new(Arc::clone(&self.codecs), Arc::clone(&self.dave), packetizer);
        let receive = Arc::new(Mutex::new(ReceivePipeline::new(
            PacketCipher::new(mode, key),
            Arc::clone(&self.codecs),
            Arc::clone(&self.dave),
        )));
        let sink: Arc<dyn PacketSink> = Arc::new(UdpSink::new(Arc::clone(&socket), address));

        let outbound = Arc::clone(&self.outbound);
        let on_speaking = move |speaking: bool| {
            outbound.send_json(
                op::SPEAKING,
                json!({ "speaking": u8::from(speaking), "delay": 0, "ssrc": ssrc }),
            );
        };

        tokio::spawn(speak_loop(
            send,
            self.connection.send_slot(),
            sink,
            on_speaking,
            cancel.clone(),
        ));
        tokio::spawn(receive_loop(
            socket,
            Arc::clone(&receive),
            self.connection.receive_slot(),
            cancel.clone(),
        ));

        debug!(
            "[{}] Media started: SSRC {}, mode {}",
            self.creds.guild_id, ssrc, mode
        );
        self.media = Some(MediaSession {
            ssrc,
            receive,
            cancel,
        });
    }

    fn fail(&self, reason: &str) -> SessionOutcome {
        error!("[{}] {}", self.creds.guild_id, reason);
        SessionOutcome::Shutdown(TransportEnd::Failed(reason.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_strips_scheme_and_adds_version() {
        assert_eq!(
            voice_gateway_url("us-east1234.discord.media:443"),
            "wss://us-east1234.discord.media:443/?v=8"
        );
        assert_eq!(
            voice_gateway_url("wss://c-ams.discord.media/"),
            "wss://c-ams.discord.media/?v=8"
        );
    }

    #[tokio::test]
    async fn outbound_frames_binary_ops() {
        let outbound = Outbound::default();
        assert!(!outbound.send_binary(op::DAVE_MLS_KEY_PACKAGE, &[1, 2]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbound.attach(tx);
        outbound.send_key_package(vec![1, 2]);
        outbound.send_ready_for_transition(0xBEEF);

        let Some(Message::Binary(bin)) = rx.recv().await else {
            panic!("expected a binary frame");
        };
        assert_eq!(&bin[..], &[26, 1, 2]);

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let msg: VoiceGatewayMessage = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(msg.op, op::DAVE_TRANSITION_READY);
        assert_eq!(msg.d["transition_id"], 0xBEEF);

        outbound.detach();
        assert!(!outbound.send_json(op::HEARTBEAT, json!(1)));
    }

    async fn pending_udp(server: SocketAddr) -> PendingUdp {
        PendingUdp {
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            address: server,
            ssrc: 42,
            mode: EncryptionMode::AeadAes256GcmRtpSize,
        }
    }

    #[tokio::test]
    async fn discovery_reports_back_to_the_socket_loop() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 74];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut response = [0u8; 74];
            response[0..2].copy_from_slice(&2u16.to_be_bytes());
            response[8..17].copy_from_slice(b"127.0.0.1");
            response[72..74].copy_from_slice(&from.port().to_be_bytes());
            server.send_to(&response, from).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_discovery(pending_udp(server_addr).await, tx, CancellationToken::new());

        let found = rx.recv().await.unwrap();
        assert_eq!(found.udp.ssrc, 42);
        let (ip, _) = found.result.unwrap();
        assert_eq!(ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn cancelled_discovery_stops_at_once() {
        // Never answers.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_discovery(
            pending_udp(server.local_addr().unwrap()).await,
            tx,
            cancel.clone(),
        );

        tokio::task::yield_now().await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("discovery ignored cancellation")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
