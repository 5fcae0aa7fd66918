use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Connection, SessionOutcome, SessionStatus, ShardSession};
use crate::{
    common::types::GuildId,
    gateway::{
        constants::{CLOSE_CODE_NORMAL, CLOSE_CODE_RESUMABLE},
        events::{DispatchEvent, GatewayEvent, ReadyEvent},
        payload::{GatewayPayload, OpCode},
    },
};

/// Used when HELLO omits the interval.
const FALLBACK_HEARTBEAT_INTERVAL_MS: u64 = 41_250;

impl ShardSession {
    pub(crate) fn handle_payload(
        &mut self,
        conn: &mut Connection,
        payload: GatewayPayload,
    ) -> Option<SessionOutcome> {
        if let Some(seq) = payload.s {
            self.state.record_seq(seq);
        }

        match payload.opcode() {
            Some(OpCode::Hello) => {
                self.on_hello(conn, &payload.d);
                None
            }
            Some(OpCode::HeartbeatAck) => {
                self.on_heartbeat_ack();
                None
            }
            Some(OpCode::Heartbeat) => {
                self.state.heartbeat.force_send(Instant::now());
                conn.send(&GatewayPayload::heartbeat(self.state.seq()));
                None
            }
            Some(OpCode::Reconnect) => {
                info!("[{}] Server requested reconnect", self.state.shard());
                self.mark_disconnected();
                conn.close(CLOSE_CODE_RESUMABLE, "reconnect requested by server");
                Some(SessionOutcome::Resume)
            }
            Some(OpCode::InvalidSession) => {
                Some(self.on_invalid_session(conn, payload.d.as_bool().unwrap_or(false)))
            }
            Some(OpCode::Dispatch) => {
                self.on_dispatch(conn, payload);
                None
            }
            _ => {
                debug!(
                    "[{}] Ignoring gateway op {}",
                    self.state.shard(),
                    payload.op
                );
                None
            }
        }
    }

    fn on_hello(&mut self, conn: &mut Connection, d: &Value) {
        let interval = Duration::from_millis(
            d["heartbeat_interval"]
                .as_u64()
                .unwrap_or(FALLBACK_HEARTBEAT_INTERVAL_MS),
        );
        debug!(
            "[{}] Heartbeat interval set to {:?}",
            self.state.shard(),
            interval
        );
        self.state.set_heartbeat_interval(interval);
        conn.start_heartbeat(interval);

        let handshake = match (self.state.session_id(), self.state.seq()) {
            (Some(session_id), Some(seq)) => {
                debug!(
                    "[{}] Resuming session {} at seq {}",
                    self.state.shard(),
                    session_id,
                    seq
                );
                GatewayPayload::resume(self.state.token(), session_id, seq)
            }
            _ => {
                debug!("[{}] Identifying", self.state.shard());
                GatewayPayload::identify(
                    self.state.token(),
                    self.state.shard(),
                    self.settings.intents,
                    self.settings.large_threshold,
                )
            }
        };
        conn.send(&handshake);
    }

    fn on_heartbeat_ack(&mut self) {
        if let Some(latency) = self.state.heartbeat.on_ack(Instant::now()) {
            self.view.publish_ping(latency);
            self.emit(GatewayEvent::Ping { latency });
        }
    }

    fn on_invalid_session(&mut self, conn: &Connection, resumable: bool) -> SessionOutcome {
        warn!(
            "[{}] Session invalidated (resumable={})",
            self.state.shard(),
            resumable
        );
        self.emit(GatewayEvent::Invalidated { resumable });
        self.mark_disconnected();

        if resumable && self.state.can_resume() {
            conn.close(CLOSE_CODE_RESUMABLE, "resuming invalidated session");
            return SessionOutcome::Resume;
        }

        self.set_status(SessionStatus::Invalidated);
        self.state.invalidate();
        conn.close(CLOSE_CODE_NORMAL, "session invalidated");
        SessionOutcome::Reidentify { invalidated: true }
    }

    fn on_dispatch(&mut self, conn: &Connection, payload: GatewayPayload) {
        let Some(name) = payload.t else {
            return;
        };
        let seq = payload.s.unwrap_or_default();
        let event = match DispatchEvent::parse(&name, payload.d) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "[{}] Skipping malformed {} dispatch: {}",
                    self.state.shard(),
                    name,
                    e
                );
                return;
            }
        };

        match &event {
            DispatchEvent::Ready(ready) => self.on_ready(conn, ready),
            DispatchEvent::Resumed => {
                info!("[{}] Session resumed", self.state.shard());
                self.set_status(SessionStatus::Resumed);
                self.backoff.reset();
                self.flush_outbox(conn);
                self.emit(GatewayEvent::Resumed);
            }
            DispatchEvent::GuildCreate(guild) => {
                if let Some(audio) = &self.audio {
                    audio.on_guild_available(guild.id);
                }
            }
            DispatchEvent::GuildDelete(guild) => {
                if let Some(audio) = &self.audio {
                    if guild.unavailable {
                        audio.on_guild_unavailable(guild.id);
                    } else {
                        audio.on_guild_removed(guild.id);
                    }
                }
            }
            DispatchEvent::VoiceStateUpdate(state) => {
                if let Some(audio) = &self.audio {
                    audio.on_voice_state_update(state);
                }
            }
            DispatchEvent::VoiceServerUpdate(server) => {
                if let Some(audio) = &self.audio {
                    audio.on_voice_server_update(server);
                }
            }
            DispatchEvent::Unknown { .. } => {}
        }

        self.emit(GatewayEvent::Dispatch {
            seq,
            event: Arc::new(event),
        });
    }

    fn on_ready(&mut self, conn: &Connection, ready: &ReadyEvent) {
        let shard = self.state.shard();
        let recreated = self
            .state
            .on_ready(ready.session_id.clone(), ready.resume_gateway_url.clone());
        self.backoff.reset();
        info!(
            "[{}] Session {} ready as user {} ({} guilds)",
            shard,
            ready.session_id,
            ready.user.id,
            ready.guilds.len()
        );

        if let Some(audio) = &self.audio {
            let unavailable: Vec<GuildId> = ready
                .guilds
                .iter()
                .filter(|g| g.unavailable)
                .map(|g| g.id)
                .collect();
            audio.on_ready(ready.user.id, &unavailable);
        }

        if recreated {
            self.set_status(SessionStatus::Recreated);
            self.emit(GatewayEvent::Recreated {
                shard,
                session_id: ready.session_id.clone(),
            });
            if let Some(audio) = &self.audio {
                audio.on_session_recreated();
            }
        } else {
            self.set_status(SessionStatus::Ready);
            self.emit(GatewayEvent::Ready {
                shard,
                session_id: ready.session_id.clone(),
                user_id: ready.user.id,
            });
            if let Some(completer) = self.ready.take() {
                completer.complete(Ok(shard));
            }
        }
        self.flush_outbox(conn);
    }

    fn flush_outbox(&mut self, conn: &Connection) {
        if !self.outbox.is_empty() {
            debug!(
                "[{}] Flushing {} queued payloads",
                self.state.shard(),
                self.outbox.len()
            );
        }
        while let Some(payload) = self.outbox.pop_front() {
            conn.send(&payload);
        }
    }
}
