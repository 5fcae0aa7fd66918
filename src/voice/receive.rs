use std::{collections::HashMap, io, sync::Arc};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    codec::{OpusCodecFactory, OpusDecoder},
    constants::{CHANNELS, MAX_DECODED_LEN, PCM_FRAME_LEN, UDP_PACKET_BUF_CAPACITY},
    crypto::PacketCipher,
    dave::DaveSession,
    rtp::{RtpPacket, SequenceCheck, check_sequence},
};
use crate::common::{
    guarded,
    types::{Shared, UserId},
};

/// Decoded audio of one speaker for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAudio {
    pub user_id: UserId,
    pub ssrc: u32,
    /// Interleaved stereo samples.
    pub pcm: Vec<i16>,
}

/// An inbound Opus frame after both decryption layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusPacket {
    pub ssrc: u32,
    /// `None` until the speaker's SSRC has been announced.
    pub user_id: Option<UserId>,
    pub sequence: u16,
    pub timestamp: u32,
    pub opus: Vec<u8>,
}

/// Consumer of inbound audio. Called on the receive loop; keep it quick.
pub trait AudioReceiveHandler: Send {
    fn wants_opus(&self) -> bool {
        false
    }

    fn wants_user_audio(&self) -> bool {
        true
    }

    fn on_opus(&mut self, _packet: &OpusPacket) {}

    fn on_user_audio(&mut self, _audio: &UserAudio) {}
}

pub type ReceiveHandlerSlot = Arc<Mutex<Option<Box<dyn AudioReceiveHandler>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub packet: OpusPacket,
    /// Concealed frames for lost packets first, then the packet itself.
    pub audio: Vec<UserAudio>,
}

#[derive(Default)]
struct SsrcStream {
    decoder: Option<Box<dyn OpusDecoder>>,
    last_sequence: Option<u16>,
}

pub struct ReceivePipeline {
    cipher: PacketCipher,
    codecs: Arc<dyn OpusCodecFactory>,
    dave: Shared<Box<dyn DaveSession>>,
    users: HashMap<u32, UserId>,
    streams: HashMap<u32, SsrcStream>,
    pcm_buf: Vec<i16>,
}

impl ReceivePipeline {
    pub fn new(
        cipher: PacketCipher,
        codecs: Arc<dyn OpusCodecFactory>,
        dave: Shared<Box<dyn DaveSession>>,
    ) -> Self {
        Self {
            cipher,
            codecs,
            dave,
            users: HashMap::new(),
            streams: HashMap::new(),
            pcm_buf: vec![0; MAX_DECODED_LEN],
        }
    }

    /// Records which user speaks on `ssrc`. A new owner starts a fresh stream.
    pub fn map_ssrc(&mut self, ssrc: u32, user_id: UserId) {
        if let Some(previous) = self.users.insert(ssrc, user_id) {
            if previous != user_id {
                self.streams.remove(&ssrc);
            }
        }
    }

    pub fn user_for(&self, ssrc: u32) -> Option<UserId> {
        self.users.get(&ssrc).copied()
    }

    /// Forgets the user's SSRCs and drops their decoders.
    pub fn remove_user(&mut self, user_id: UserId) {
        let streams = &mut self.streams;
        self.users.retain(|ssrc, owner| {
            if *owner == user_id {
                streams.remove(ssrc);
                false
            } else {
                true
            }
        });
    }

    pub fn replace_cipher(&mut self, cipher: PacketCipher) {
        self.cipher = cipher;
    }

    /// Runs one datagram through the receive path. Anything that is not a
    /// valid, fresh voice packet yields `None`.
    pub fn process(&mut self, datagram: &[u8], decode: bool) -> Option<Received> {
        let rtp = RtpPacket::parse(datagram)?;
        let ssrc = rtp.header.ssrc;
        let sequence = rtp.header.sequence;

        let opus = match self.cipher.open(datagram, &rtp) {
            Ok(opus) => opus,
            Err(e) => {
                trace!("Dropping packet from SSRC {}: {}", ssrc, e);
                return None;
            }
        };

        // Stream state is only kept for announced speakers, so unknown SSRCs
        // cannot grow the map.
        let user_id = self.users.get(&ssrc).copied();
        let lost = match user_id {
            Some(_) => {
                let stream = self.streams.entry(ssrc).or_default();
                let lost = match check_sequence(stream.last_sequence, sequence) {
                    SequenceCheck::InOrder => 0,
                    SequenceCheck::Gap(lost) => lost,
                    SequenceCheck::Stale => {
                        trace!("Stale packet {} from SSRC {}", sequence, ssrc);
                        return None;
                    }
                    SequenceCheck::Resync => {
                        debug!("SSRC {} resynced at sequence {}", ssrc, sequence);
                        stream.decoder = None;
                        0
                    }
                };
                stream.last_sequence = Some(sequence);
                lost
            }
            None => 0,
        };

        let opus = match user_id {
            Some(user) => match self.dave.lock().decrypt(user, &opus) {
                Ok(opus) => opus,
                Err(e) => {
                    debug!("DAVE decrypt failed for user {}: {}", user, e);
                    return None;
                }
            },
            None => opus,
        };

        let audio = match user_id {
            Some(user) if decode => self.decode(ssrc, user, lost, &opus),
            _ => Vec::new(),
        };

        Some(Received {
            packet: OpusPacket {
                ssrc,
                user_id,
                sequence,
                timestamp: rtp.header.timestamp,
                opus,
            },
            audio,
        })
    }

    fn decode(&mut self, ssrc: u32, user_id: UserId, lost: u16, opus: &[u8]) -> Vec<UserAudio> {
        let stream = self.streams.entry(ssrc).or_default();
        if stream.decoder.is_none() {
            match self.codecs.create_decoder() {
                Ok(decoder) => stream.decoder = Some(decoder),
                Err(e) => {
                    warn!("No decoder for SSRC {}: {}", ssrc, e);
                    return Vec::new();
                }
            }
        }
        let Some(decoder) = stream.decoder.as_mut() else {
            return Vec::new();
        };

        let mut audio = Vec::with_capacity(usize::from(lost) + 1);
        for _ in 0..lost {
            match decoder.decode(None, &mut self.pcm_buf[..PCM_FRAME_LEN]) {
                Ok(samples) => audio.push(UserAudio {
                    user_id,
                    ssrc,
                    pcm: self.pcm_buf[..samples * CHANNELS].to_vec(),
                }),
                Err(e) => trace!("Concealment failed for SSRC {}: {}", ssrc, e),
            }
        }

        match decoder.decode(Some(opus), &mut self.pcm_buf) {
            Ok(samples) => audio.push(UserAudio {
                user_id,
                ssrc,
                pcm: self.pcm_buf[..samples * CHANNELS].to_vec(),
            }),
            Err(e) => debug!("Decode failed for SSRC {}: {}", ssrc, e),
        }
        audio
    }
}

/// Reads datagrams until cancelled and hands them to the receive handler.
pub async fn receive_loop(
    socket: Arc<UdpSocket>,
    pipeline: Shared<ReceivePipeline>,
    handler: ReceiveHandlerSlot,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_PACKET_BUF_CAPACITY];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!("Voice UDP receive failed: {}", e);
                    break;
                }
            },
        };

        let wants = handler
            .lock()
            .as_ref()
            .map(|h| (h.wants_opus(), h.wants_user_audio()));
        let Some((wants_opus, wants_audio)) = wants else {
            continue;
        };
        if !wants_opus && !wants_audio {
            continue;
        }

        let Some(received) = pipeline.lock().process(&buf[..len], wants_audio) else {
            continue;
        };

        let mut slot = handler.lock();
        if let Some(handler) = slot.as_mut() {
            guarded("audio.receive_handler", || {
                if wants_opus {
                    handler.on_opus(&received.packet);
                }
                for audio in &received.audio {
                    handler.on_user_audio(audio);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::types::ChannelId,
        voice::{
            codec::{CodecError, OpusEncoder},
            crypto::EncryptionMode,
            dave::PassthroughDaveSession,
            udp::RtpPacketizer,
        },
    };

    const KEY: [u8; 32] = [3; 32];

    /// Decodes to a frame filled with the packet's first byte; concealment
    /// yields `-1`.
    struct MarkerDecoder;

    impl OpusDecoder for MarkerDecoder {
        fn decode(&mut self, packet: Option<&[u8]>, out: &mut [i16]) -> Result<usize, CodecError> {
            let value = packet.map_or(-1, |p| i16::from(p[0]));
            out[..PCM_FRAME_LEN].fill(value);
            Ok(PCM_FRAME_LEN / CHANNELS)
        }
    }

    struct MarkerCodec;

    impl OpusCodecFactory for MarkerCodec {
        fn create_encoder(&self) -> Result<Box<dyn OpusEncoder>, CodecError> {
            Err(CodecError::Init("decode only".into()))
        }
        fn create_decoder(&self) -> Result<Box<dyn OpusDecoder>, CodecError> {
            Ok(Box::new(MarkerDecoder))
        }
    }

    fn receiver() -> ReceivePipeline {
        let dave: Box<dyn DaveSession> =
            Box::new(PassthroughDaveSession::new(UserId(1), ChannelId(2)));
        ReceivePipeline::new(
            PacketCipher::new(EncryptionMode::XSalsa20Poly1305, &KEY),
            Arc::new(MarkerCodec),
            Arc::new(Mutex::new(dave)),
        )
    }

    fn sender(sequence: u16) -> RtpPacketizer {
        let cipher = PacketCipher::new(EncryptionMode::XSalsa20Poly1305, &KEY);
        RtpPacketizer::with_counters(77, cipher, sequence, 0)
    }

    #[test]
    fn unknown_ssrc_is_delivered_without_audio() {
        let mut rx = receiver();
        let mut tx = sender(1);
        let received = rx.process(tx.packetize(&[9]).unwrap(), true).unwrap();
        assert_eq!(received.packet.user_id, None);
        assert_eq!(received.packet.opus, vec![9]);
        assert!(received.audio.is_empty());
    }

    #[test]
    fn unknown_ssrcs_keep_no_stream_state() {
        let mut rx = receiver();
        for ssrc in 1_000..1_050 {
            let cipher = PacketCipher::new(EncryptionMode::XSalsa20Poly1305, &KEY);
            let mut tx = RtpPacketizer::with_counters(ssrc, cipher, 1, 0);
            assert!(rx.process(tx.packetize(&[1]).unwrap(), true).is_some());
        }
        assert!(rx.streams.is_empty());

        rx.map_ssrc(77, UserId(5));
        rx.process(&sender(1).packetize(&[1]).unwrap().to_vec(), true)
            .unwrap();
        assert_eq!(rx.streams.len(), 1);
        rx.remove_user(UserId(5));
        assert!(rx.streams.is_empty());
    }

    #[test]
    fn stale_and_duplicate_packets_are_dropped() {
        let mut rx = receiver();
        rx.map_ssrc(77, UserId(5));
        let first = sender(10).packetize(&[1]).unwrap().to_vec();
        let second = sender(11).packetize(&[2]).unwrap().to_vec();

        assert!(rx.process(&first, true).is_some());
        assert!(rx.process(&second, true).is_some());
        assert!(rx.process(&second, true).is_none());
        assert!(rx.process(&first, true).is_none());
    }

    #[test]
    fn small_gaps_are_concealed() {
        let mut rx = receiver();
        rx.map_ssrc(77, UserId(5));
        let first = sender(10).packetize(&[1]).unwrap().to_vec();
        let after_gap = sender(13).packetize(&[4]).unwrap().to_vec();

        rx.process(&first, true).unwrap();
        let received = rx.process(&after_gap, true).unwrap();
        let markers: Vec<i16> = received.audio.iter().map(|a| a.pcm[0]).collect();
        assert_eq!(markers, vec![-1, -1, 4]);
        assert!(received.audio.iter().all(|a| a.user_id == UserId(5)));
    }

    #[test]
    fn large_jumps_resync_without_concealment() {
        let mut rx = receiver();
        rx.map_ssrc(77, UserId(5));
        rx.process(&sender(10).packetize(&[1]).unwrap().to_vec(), true)
            .unwrap();
        let received = rx
            .process(&sender(5_000).packetize(&[2]).unwrap().to_vec(), true)
            .unwrap();
        assert_eq!(received.audio.len(), 1);
    }

    #[test]
    fn tampered_packets_are_dropped() {
        let mut rx = receiver();
        let mut packet = sender(1).packetize(&[1, 2, 3]).unwrap().to_vec();
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(rx.process(&packet, true).is_none());
    }

    #[test]
    fn removed_users_lose_their_ssrcs() {
        let mut rx = receiver();
        rx.map_ssrc(77, UserId(5));
        rx.map_ssrc(78, UserId(6));
        rx.remove_user(UserId(5));
        assert_eq!(rx.user_for(77), None);
        assert_eq!(rx.user_for(78), Some(UserId(6)));
    }
}
