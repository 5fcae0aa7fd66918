use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    Discovered, PendingUdp, Socket, VoiceGateway, spawn_discovery,
    types::{SessionOutcome, VoiceGatewayMessage, op},
};
use crate::{
    common::types::{UserId, now_millis},
    gateway::session::Beat,
    voice::{
        connection::ConnectionStatus,
        constants::DEFAULT_HEARTBEAT_INTERVAL_MS,
        crypto::EncryptionMode,
        dave::{MediaCodec, split_transition_id},
        udp::bind_socket,
    },
};

/// Reads a snowflake sent either as a string or as a number.
fn snowflake(value: &Value) -> Option<u64> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value.as_u64())
}

fn u16_field(d: &Value, key: &str) -> u16 {
    d[key].as_u64().unwrap_or(0) as u16
}

fn secret_key(d: &Value) -> Option<[u8; 32]> {
    let bytes = d["secret_key"].as_array()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut key = [0u8; 32];
    for (slot, value) in key.iter_mut().zip(bytes) {
        *slot = u8::try_from(value.as_u64()?).ok()?;
    }
    Some(key)
}

impl VoiceGateway {
    pub(super) async fn handle_text(
        &mut self,
        socket: &mut Socket,
        text: &str,
    ) -> Option<SessionOutcome> {
        let msg: VoiceGatewayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "[{}] Failed to parse voice gateway message: {}",
                    self.creds.guild_id, e
                );
                return None;
            }
        };
        if let Some(seq) = msg.seq {
            self.seq_ack = Some(seq);
        }

        let d = msg.d;
        match msg.op {
            op::HELLO => self.on_hello(socket, &d),
            op::READY => return self.on_ready(socket, &d).await,
            op::SESSION_DESCRIPTION => return self.on_session_description(socket, &d),
            op::HEARTBEAT_ACK => self.on_heartbeat_ack(),
            op::RESUMED => self.on_resumed(),
            op::SPEAKING => self.on_speaking(&d),
            op::CLIENTS_CONNECT => self.on_clients_connect(&d),
            op::CLIENT_DISCONNECT => self.on_client_disconnect(&d),
            op::DAVE_PREPARE_TRANSITION => {
                self.dave.lock().on_prepare_transition(
                    u16_field(&d, "transition_id"),
                    u16_field(&d, "protocol_version"),
                );
                self.sync_dave_version();
            }
            op::DAVE_EXECUTE_TRANSITION => {
                self.dave
                    .lock()
                    .on_execute_transition(u16_field(&d, "transition_id"));
                self.sync_dave_version();
            }
            op::DAVE_PREPARE_EPOCH => {
                self.dave.lock().on_prepare_epoch(
                    d["epoch"].as_u64().unwrap_or(0),
                    u16_field(&d, "protocol_version"),
                );
            }
            other => debug!(
                "[{}] Received voice op {}: {:?}",
                self.creds.guild_id, other, d
            ),
        }
        None
    }

    fn on_hello(&mut self, socket: &mut Socket, d: &Value) {
        // v8 sends the interval as a float.
        let interval = d["heartbeat_interval"]
            .as_f64()
            .filter(|ms| *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS));
        debug!(
            "[{}] Voice heartbeat interval {:?}",
            self.creds.guild_id, interval
        );
        self.heartbeat.set_interval(interval);
        socket.start_heartbeat(interval);
    }

    async fn on_ready(&mut self, socket: &mut Socket, d: &Value) -> Option<SessionOutcome> {
        let guild = self.creds.guild_id;
        let ssrc = d["ssrc"].as_u64().unwrap_or(0) as u32;
        let port = d["port"].as_u64().unwrap_or(0) as u16;
        let Some(ip) = d["ip"].as_str().and_then(|ip| ip.parse::<IpAddr>().ok()) else {
            return Some(self.fail("voice READY carried no usable address"));
        };
        let address = SocketAddr::new(ip, port);

        let offered = d["modes"].as_array().map(Vec::as_slice).unwrap_or_default();
        let Some(mode) = EncryptionMode::negotiate(offered.iter().filter_map(Value::as_str)) else {
            return Some(self.fail("voice server offers no supported encryption mode"));
        };
        debug!(
            "[{}] Voice ready: {}, SSRC {}, mode {}",
            guild, address, ssrc, mode
        );

        let udp = match bind_socket().await {
            Ok(udp) => Arc::new(udp),
            Err(e) => {
                warn!("[{}] Failed to bind voice UDP socket: {}", guild, e);
                return Some(SessionOutcome::Identify);
            }
        };
        spawn_discovery(
            PendingUdp {
                socket: udp,
                address,
                ssrc,
                mode,
            },
            socket.discovered_tx.clone(),
            socket.cancel.clone(),
        );
        None
    }

    pub(super) fn on_discovered(
        &mut self,
        socket: &mut Socket,
        found: Discovered,
    ) -> Option<SessionOutcome> {
        let guild = self.creds.guild_id;
        let (my_ip, my_port) = match found.result {
            Ok(address) => address,
            Err(e) => {
                warn!("[{}] IP discovery failed: {}", guild, e);
                return Some(SessionOutcome::Identify);
            }
        };
        debug!("[{}] Discovered external address {}:{}", guild, my_ip, my_port);

        let mode = found.udp.mode;
        self.outbound.send_json(
            op::SELECT_PROTOCOL,
            json!({
                "protocol": "udp",
                "data": { "address": my_ip, "port": my_port, "mode": mode.as_str() }
            }),
        );
        socket.pending_udp = Some(found.udp);
        None
    }

    fn on_session_description(&mut self, socket: &mut Socket, d: &Value) -> Option<SessionOutcome> {
        let guild = self.creds.guild_id;
        let Some(key) = secret_key(d) else {
            return Some(self.fail("session description without a valid secret key"));
        };
        let Some(mut udp) = socket.pending_udp.take() else {
            warn!("[{}] Session description before READY; ignoring", guild);
            return None;
        };
        if let Some(mode) = d["mode"].as_str().and_then(EncryptionMode::from_name) {
            udp.mode = mode;
        }
        let dave_version = u16_field(d, "dave_protocol_version");
        let (ssrc, mode) = (udp.ssrc, udp.mode);

        self.dave.lock().on_select_protocol_ack(dave_version);
        self.start_media(udp, &key);
        self.backoff.reset();
        info!(
            "[{}] Voice connected (SSRC {}, {}, DAVE v{})",
            guild, ssrc, mode, dave_version
        );
        self.connection.mark_ready(ssrc, mode, dave_version);
        None
    }

    fn on_heartbeat_ack(&mut self) {
        if let Some(latency) = self.heartbeat.on_ack(Instant::now()) {
            self.connection.set_ping(latency);
        }
    }

    fn on_resumed(&mut self) {
        info!("[{}] Voice session resumed", self.creds.guild_id);
        self.backoff.reset();
        if self.media.is_some() {
            self.connection.set_status(ConnectionStatus::Ready);
        }
    }

    fn on_speaking(&mut self, d: &Value) {
        let (Some(user), Some(ssrc)) = (snowflake(&d["user_id"]), d["ssrc"].as_u64()) else {
            return;
        };
        let (user, ssrc) = (UserId(user), ssrc as u32);
        let speaking = d["speaking"].as_u64().unwrap_or(0) != 0;

        if let Some(media) = &self.media {
            if media.ssrc == ssrc {
                return;
            }
            media.receive.lock().map_ssrc(ssrc, user);
        }
        self.dave.lock().assign_ssrc_to_codec(ssrc, MediaCodec::Opus);
        self.connection.user_speaking(user, ssrc, speaking);
    }

    fn on_clients_connect(&mut self, d: &Value) {
        let Some(ids) = d["user_ids"].as_array() else {
            return;
        };
        let mut dave = self.dave.lock();
        for user in ids.iter().filter_map(snowflake) {
            dave.add_user(UserId(user));
        }
    }

    fn on_client_disconnect(&mut self, d: &Value) {
        let Some(user) = snowflake(&d["user_id"]).map(UserId) else {
            return;
        };
        debug!("[{}] User {} left the call", self.creds.guild_id, user);
        self.dave.lock().remove_user(user);
        if let Some(media) = &self.media {
            media.receive.lock().remove_user(user);
        }
    }

    fn sync_dave_version(&self) {
        let version = self.dave.lock().protocol_version();
        self.connection.set_dave_version(version);
    }

    /// Binary frames: `seq(u16 BE) | op(u8) | payload`.
    pub(super) fn handle_binary(&mut self, bin: &[u8]) {
        if bin.len() < 3 {
            return;
        }
        let seq = u16::from_be_bytes([bin[0], bin[1]]);
        let opcode = bin[2];
        let payload = &bin[3..];
        self.seq_ack = Some(u64::from(seq));

        let mut dave = self.dave.lock();
        match opcode {
            op::DAVE_MLS_EXTERNAL_SENDER => dave.on_external_sender(payload),
            op::DAVE_MLS_PROPOSALS => dave.on_proposals(payload),
            op::DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION | op::DAVE_MLS_WELCOME => {
                let Some((transition_id, body)) = split_transition_id(payload) else {
                    warn!(
                        "[{}] Truncated DAVE op {} payload",
                        self.creds.guild_id, opcode
                    );
                    return;
                };
                if opcode == op::DAVE_MLS_WELCOME {
                    dave.on_welcome(transition_id, body);
                } else {
                    dave.on_commit(transition_id, body);
                }
            }
            other => debug!(
                "[{}] Received unknown binary op {} (seq {})",
                self.creds.guild_id, other, seq
            ),
        }
    }

    pub(super) fn handle_beat(&mut self) -> Option<SessionOutcome> {
        match self.heartbeat.on_tick(Instant::now()) {
            Beat::Send => {
                self.outbound.send_json(
                    op::HEARTBEAT,
                    json!({
                        "t": now_millis(),
                        "seq_ack": self.seq_ack.map_or(-1, |s| s as i64),
                    }),
                );
                None
            }
            Beat::Zombie => {
                warn!(
                    "[{}] Voice heartbeat not acknowledged; reconnecting",
                    self.creds.guild_id
                );
                self.outbound.close(4000, "zombie connection");
                Some(SessionOutcome::Resume)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflakes_parse_from_strings_or_numbers() {
        assert_eq!(snowflake(&json!("80351110224678912")), Some(80351110224678912));
        assert_eq!(snowflake(&json!(42)), Some(42));
        assert_eq!(snowflake(&json!(null)), None);
    }

    #[test]
    fn secret_key_must_be_32_bytes() {
        let key: Vec<u8> = (0..32).collect();
        assert_eq!(
            secret_key(&json!({ "secret_key": key })).map(|k| k[31]),
            Some(31)
        );
        assert_eq!(secret_key(&json!({ "secret_key": [1, 2, 3] })), None);
        assert_eq!(secret_key(&json!({ "secret_key": vec![300; 32] })), None);
    }
}
