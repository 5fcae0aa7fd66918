use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    common::{
        errors::map_boxed_err,
        guarded,
        types::{AnyResult, SecretToken, ShardInfo},
    },
    configs::{BackoffConfig, GatewayConfig},
    gateway::{
        close::{CloseAction, CloseCodeTable},
        codec::EncodedFrame,
        constants::{
            CLOSE_CODE_NORMAL, CLOSE_CODE_RESUMABLE, GATEWAY_VERSION, INVALID_SESSION_DELAY_MS,
            WRITE_TASK_SHUTDOWN_MS,
        },
        events::{EventListener, GatewayEvent},
        handle::{GatewayCommand, SessionView},
        payload::GatewayPayload,
        reader::{MessageReader, ReadError},
    },
    task::{Completer, TaskError},
    voice::AudioManager,
};

pub mod backoff;
pub mod handler;
pub mod heartbeat;
pub mod state;

pub use heartbeat::{Beat, HeartbeatTracker};
pub use state::{IllegalTransition, SessionState, SessionStatus};

use self::{backoff::Backoff, heartbeat::spawn_heartbeat};

/// Outcome of a single socket's lifetime; tells the outer loop what to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionOutcome {
    /// Reconnect and RESUME.
    Resume,
    /// Reconnect and IDENTIFY. `invalidated` adds the random wait required
    /// after INVALID_SESSION.
    Reidentify { invalidated: bool },
    Shutdown { code: Option<u16>, reason: String },
}

pub(crate) struct SessionSettings {
    pub url: String,
    pub config: GatewayConfig,
    pub intents: u64,
    pub large_threshold: u8,
    pub close_codes: CloseCodeTable,
    pub backoff: BackoffConfig,
}

pub(crate) fn gateway_url(base: &str, config: &GatewayConfig) -> String {
    let mut url = format!(
        "{}/?v={}&encoding={}",
        base.trim_end_matches('/'),
        GATEWAY_VERSION,
        config.encoding().as_str()
    );
    if let Some(compress) = config.compression().query_value() {
        url.push_str("&compress=");
        url.push_str(compress);
    }
    url
}

/// One live socket: its outbound queue, inflate state and heartbeat ticker.
pub(crate) struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    reader: MessageReader,
    beat_tx: mpsc::UnboundedSender<()>,
    heartbeat: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn send(&self, payload: &GatewayPayload) -> bool {
        let message = match self.reader.encode(payload) {
            Ok(EncodedFrame::Text(text)) => Message::Text(text.into()),
            Ok(EncodedFrame::Binary(bytes)) => Message::Binary(bytes.into()),
            Err(e) => {
                warn!("Failed to encode op {} payload: {}", payload.op, e);
                return false;
            }
        };
        self.tx.send(message).is_ok()
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        })));
    }

    pub(crate) fn start_heartbeat(&mut self, interval: Duration) {
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

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}

/// The control-plane state machine of one shard.
///
/// Runs on the shard's gateway thread for its whole life; nothing in here is
/// shared with other threads except through [`SessionView`] and the command
/// channel.
pub(crate) struct ShardSession {
    state: SessionState,
    settings: SessionSettings,
    listeners: Arc<[Arc<dyn EventListener>]>,
    audio: Option<Arc<AudioManager>>,
    commands: mpsc::UnboundedReceiver<GatewayCommand>,
    view: Arc<SessionView>,
    cancel: CancellationToken,
    backoff: Backoff,
    ready: Option<Completer<ShardInfo>>,
    /// Payloads queued while no session is established.
    outbox: VecDeque<GatewayPayload>,
}

impl ShardSession {
    pub(crate) fn new(
        token: SecretToken,
        shard: ShardInfo,
        settings: SessionSettings,
        listeners: Arc<[Arc<dyn EventListener>]>,
        audio: Option<Arc<AudioManager>>,
        commands: mpsc::UnboundedReceiver<GatewayCommand>,
        view: Arc<SessionView>,
        cancel: CancellationToken,
        ready: Completer<ShardInfo>,
    ) -> Self {
        let backoff = Backoff::new(&settings.backoff);
        Self {
            state: SessionState::new(token, shard),
            settings,
            listeners,
            audio,
            commands,
            view,
            cancel,
            backoff,
            ready: Some(ready),
            outbox: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let shard = self.state.shard();
        info!("[{}] Starting gateway session", shard);

        loop {
            let outcome = if self.cancel.is_cancelled() {
                Ok(SessionOutcome::Shutdown {
                    code: None,
                    reason: "client shutdown".into(),
                })
            } else {
                self.connect().await
            };

            let mut invalid_wait = None;
            match outcome {
                Ok(SessionOutcome::Shutdown { code, reason }) => {
                    self.finish(code, reason);
                    return;
                }
                Ok(SessionOutcome::Resume) => {
                    debug!("[{}] Will resume (can_resume={})", shard, self.state.can_resume());
                }
                Ok(SessionOutcome::Reidentify { invalidated }) => {
                    self.state.invalidate();
                    if invalidated {
                        let (lo, hi) = INVALID_SESSION_DELAY_MS;
                        invalid_wait = Some(Duration::from_millis(
                            rand::thread_rng().gen_range(lo..=hi),
                        ));
                    }
                }
                Err(e) => {
                    warn!("[{}] Gateway connection error: {}", shard, e);
                    self.mark_disconnected();
                }
            }

            if self.backoff.is_exhausted() {
                self.finish(None, "reconnect attempts exhausted".into());
                return;
            }
            let backoff_delay = self.backoff.next();
            let delay = invalid_wait.unwrap_or(backoff_delay);
            debug!(
                "[{}] Reconnecting in {:?} (attempt {})",
                shard,
                delay,
                self.backoff.attempt()
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect(&mut self) -> AnyResult<SessionOutcome> {
        let shard = self.state.shard();
        let base = match self.state.resume_url() {
            Some(resume) if self.state.can_resume() => resume.to_owned(),
            _ => self.settings.url.clone(),
        };
        let url = gateway_url(&base, &self.settings.config);
        debug!("[{}] Connecting to gateway: {}", shard, url);

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(map_boxed_err)?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let mut write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("[{}] WS write error: {}", shard, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let (beat_tx, mut beat_rx) = mpsc::unbounded_channel::<()>();
        let mut conn = Connection {
            tx,
            reader: MessageReader::new(&self.settings.config),
            beat_tx,
            heartbeat: None,
            cancel: self.cancel.child_token(),
        };
        self.state.heartbeat.reset();

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    conn.close(CLOSE_CODE_NORMAL, "client shutdown");
                    break SessionOutcome::Shutdown {
                        code: None,
                        reason: "client shutdown".into(),
                    };
                }
                Some(command) = self.commands.recv() => {
                    if let Some(outcome) = self.handle_command(&conn, command) {
                        break outcome;
                    }
                }
                Some(()) = beat_rx.recv() => {
                    if let Some(outcome) = self.handle_beat(&conn) {
                        break outcome;
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("[{}] WS read error: {}", shard, e);
                            break self.on_close(None, format!("IO error: {e}"));
                        }
                        None => {
                            debug!("[{}] WS stream ended", shard);
                            break self.on_close(None, "stream ended".into());
                        }
                    };

                    let read_result = match msg {
                        Message::Text(text) => conn.reader.read_text(text.as_str()).map(Some),
                        Message::Binary(bin) => conn.reader.read(&bin),
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|cf| (Some(u16::from(cf.code)), cf.reason.to_string()))
                                .unwrap_or((None, String::new()));
                            break self.on_close(code, reason);
                        }
                        _ => continue,
                    };

                    match read_result {
                        Ok(Some(payload)) => {
                            if let Some(outcome) = self.handle_payload(&mut conn, payload) {
                                break outcome;
                            }
                        }
                        Ok(None) => {}
                        Err(ReadError::Decompression(e)) => {
                            error!("[{}] Compressed stream corrupt, re-identifying: {}", shard, e);
                            self.mark_disconnected();
                            conn.close(CLOSE_CODE_NORMAL, "decompression failure");
                            break SessionOutcome::Reidentify { invalidated: false };
                        }
                        Err(ReadError::Decode(e)) => {
                            warn!("[{}] Skipping malformed payload: {}", shard, e);
                        }
                    }
                }
            }
        };

        if !matches!(outcome, SessionOutcome::Shutdown { .. }) {
            self.mark_disconnected();
        }

        conn.reader.shutdown();
        drop(conn);
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

    fn handle_command(&mut self, conn: &Connection, command: GatewayCommand) -> Option<SessionOutcome> {
        match command {
            GatewayCommand::Send(payload) => {
                if self.state.status().is_connected() {
                    conn.send(&payload);
                } else {
                    self.outbox.push_back(payload);
                }
                None
            }
            GatewayCommand::Reconnect => {
                info!("[{}] Reconnect requested", self.state.shard());
                self.mark_disconnected();
                conn.close(CLOSE_CODE_RESUMABLE, "reconnect requested");
                Some(SessionOutcome::Resume)
            }
            GatewayCommand::Shutdown => {
                conn.close(CLOSE_CODE_NORMAL, "client shutdown");
                Some(SessionOutcome::Shutdown {
                    code: None,
                    reason: "client shutdown".into(),
                })
            }
        }
    }

    fn handle_beat(&mut self, conn: &Connection) -> Option<SessionOutcome> {
        match self.state.heartbeat.on_tick(tokio::time::Instant::now()) {
            Beat::Send => {
                conn.send(&GatewayPayload::heartbeat(self.state.seq()));
                None
            }
            Beat::Zombie => {
                warn!(
                    "[{}] Heartbeat not acknowledged within {:?}; treating connection as zombie",
                    self.state.shard(),
                    self.state.heartbeat_interval().unwrap_or_default()
                );
                self.mark_disconnected();
                self.emit(GatewayEvent::Disconnected {
                    code: None,
                    reason: "heartbeat not acknowledged".into(),
                    by_remote: false,
                });
                conn.close(CLOSE_CODE_RESUMABLE, "zombie connection");
                Some(SessionOutcome::Resume)
            }
        }
    }

    fn on_close(&mut self, code: Option<u16>, reason: String) -> SessionOutcome {
        let shard = self.state.shard();
        info!(
            "[{}] Gateway closed: code={:?}, reason='{}'",
            shard, code, reason
        );
        self.mark_disconnected();
        self.emit(GatewayEvent::Disconnected {
            code,
            reason: reason.clone(),
            by_remote: true,
        });

        match self
            .settings
            .close_codes
            .decide(code, self.state.can_resume())
        {
            CloseAction::Resume => SessionOutcome::Resume,
            CloseAction::Reidentify => {
                SessionOutcome::Reidentify { invalidated: false }
            }
            CloseAction::Shutdown => {
                let reason = match code {
                    Some(code) if reason.is_empty() => CloseCodeTable::reason(code).to_string(),
                    _ => reason,
                };
                SessionOutcome::Shutdown { code, reason }
            }
        }
    }

    pub(crate) fn mark_disconnected(&mut self) {
        if self.state.status().is_connected() {
            self.set_status(SessionStatus::Disconnected);
        }
    }

    pub(crate) fn set_status(&mut self, next: SessionStatus) {
        match self.state.transition(next) {
            Ok(old) => {
                self.view.publish_status(next);
                self.emit(GatewayEvent::StatusChange { old, new: next });
            }
            Err(e) => debug!("[{}] {}", self.state.shard(), e),
        }
    }

    pub(crate) fn emit(&self, event: GatewayEvent) {
        for listener in self.listeners.iter() {
            guarded("gateway.listener", || listener.on_event(&event));
        }
    }

    fn finish(&mut self, code: Option<u16>, reason: String) {
        let shard = self.state.shard();
        if code.is_some() {
            error!("[{}] Gateway shut down: {} (code {:?})", shard, reason, code);
        } else {
            info!("[{}] Gateway shut down: {}", shard, reason);
        }

        self.set_status(SessionStatus::Shutdown);
        self.cancel.cancel();
        self.commands.close();
        if let Some(audio) = &self.audio {
            audio.shutdown();
        }
        if let Some(ready) = self.ready.take() {
            ready.complete(Err(TaskError::Failed(reason.clone())));
        }
        self.emit(GatewayEvent::Shutdown { code, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{Compression, Encoding};

    #[test]
    fn url_carries_version_encoding_and_compression() {
        let config = GatewayConfig::new(Compression::Buffered, Encoding::Json, 1024).unwrap();
        assert_eq!(
            gateway_url("wss://gateway.discord.gg/", &config),
            "wss://gateway.discord.gg/?v=10&encoding=json&compress=zlib-stream"
        );

        let plain = GatewayConfig::new(Compression::None, Encoding::Etf, 1024).unwrap();
        assert_eq!(
            gateway_url("wss://resume.example", &plain),
            "wss://resume.example/?v=10&encoding=etf"
        );
    }
}
