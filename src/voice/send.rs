use std::{borrow::Cow, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    codec::{OpusCodecFactory, OpusEncoder},
    constants::{
        FRAME_DURATION_MS, MAX_OPUS_FRAME_SIZE, MAX_PACING_LAG_FRAMES, PCM_FRAME_LEN,
        SILENCE_FRAME, SILENCE_FRAME_COUNT,
    },
    dave::DaveSession,
    udp::{PacketSink, RtpPacketizer},
};
use crate::common::{guarded, types::Shared};

/// One 20 ms window of outbound audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFrame {
    /// 960 interleaved stereo samples per channel at 48 kHz.
    Pcm(Vec<i16>),
    /// An already encoded Opus frame, sent as is.
    Opus(Vec<u8>),
}

/// Source of outbound audio, polled once per frame on the send loop.
pub trait AudioSendHandler: Send {
    fn can_provide(&mut self) -> bool;
    fn provide_frame(&mut self) -> Option<AudioFrame>;
}

pub type SendHandlerSlot = Arc<Mutex<Option<Box<dyn AudioSendHandler>>>>;

/// What one tick produced.
#[derive(Debug, Default)]
pub struct TickOutcome<'a> {
    pub packet: Option<&'a [u8]>,
    pub speaking_changed: Option<bool>,
}

/// Turns frames into encrypted RTP packets.
///
/// Owns the per-connection encoder and packet counters; the DAVE session is
/// shared with the voice gateway that drives its transitions.
pub struct SendPipeline {
    codecs: Arc<dyn OpusCodecFactory>,
    encoder: Option<Box<dyn OpusEncoder>>,
    dave: Shared<Box<dyn DaveSession>>,
    packetizer: RtpPacketizer,
    pcm_buf: Vec<i16>,
    opus_buf: Vec<u8>,
    speaking: bool,
    silence_left: usize,
}

impl SendPipeline {
    pub fn new(
        codecs: Arc<dyn OpusCodecFactory>,
        dave: Shared<Box<dyn DaveSession>>,
        packetizer: RtpPacketizer,
    ) -> Self {
        Self {
            codecs,
            encoder: None,
            dave,
            packetizer,
            pcm_buf: vec![0; PCM_FRAME_LEN],
            opus_buf: vec![0; MAX_OPUS_FRAME_SIZE],
            speaking: false,
            silence_left: 0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn packetizer(&self) -> &RtpPacketizer {
        &self.packetizer
    }

    pub fn tick(&mut self, frame: Option<AudioFrame>) -> TickOutcome<'_> {
        match frame {
            Some(frame) => self.send_audio(frame),
            None => self.send_silence(),
        }
    }

    fn send_audio(&mut self, frame: AudioFrame) -> TickOutcome<'_> {
        let opus = match frame {
            AudioFrame::Opus(opus) => Cow::Owned(opus),
            AudioFrame::Pcm(pcm) => match self.encode(&pcm) {
                Some(len) => Cow::Borrowed(&self.opus_buf[..len]),
                None => return TickOutcome::default(),
            },
        };
        if opus.is_empty() {
            return TickOutcome::default();
        }

        let ssrc = self.packetizer.ssrc();
        let sealed = self.dave.lock().encrypt(ssrc, &opus);
        let payload = match sealed {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping frame for SSRC {}: {}", ssrc, e);
                return TickOutcome::default();
            }
        };

        let speaking_changed = (!self.speaking).then_some(true);
        self.speaking = true;
        self.silence_left = SILENCE_FRAME_COUNT;

        match self.packetizer.packetize(&payload) {
            Ok(packet) => TickOutcome {
                packet: Some(packet),
                speaking_changed,
            },
            Err(e) => {
                warn!("Failed to seal voice packet: {}", e);
                TickOutcome {
                    packet: None,
                    speaking_changed,
                }
            }
        }
    }

    /// Silence frames are never DAVE-encrypted.
    fn send_silence(&mut self) -> TickOutcome<'_> {
        if self.silence_left == 0 {
            return TickOutcome::default();
        }
        self.silence_left -= 1;
        let speaking_changed = if self.silence_left == 0 {
            self.speaking = false;
            Some(false)
        } else {
            None
        };

        match self.packetizer.packetize(&SILENCE_FRAME) {
            Ok(packet) => TickOutcome {
                packet: Some(packet),
                speaking_changed,
            },
            Err(e) => {
                warn!("Failed to seal silence packet: {}", e);
                TickOutcome {
                    packet: None,
                    speaking_changed,
                }
            }
        }
    }

    fn encode(&mut self, pcm: &[i16]) -> Option<usize> {
        if self.encoder.is_none() {
            match self.codecs.create_encoder() {
                Ok(encoder) => self.encoder = Some(encoder),
                Err(e) => {
                    warn!("Cannot encode outbound audio: {}", e);
                    return None;
                }
            }
        }
        let encoder = self.encoder.as_mut()?;

        if pcm.len() != PCM_FRAME_LEN {
            trace!("PCM frame of {} samples padded to {}", pcm.len(), PCM_FRAME_LEN);
        }
        let n = pcm.len().min(PCM_FRAME_LEN);
        self.pcm_buf[..n].copy_from_slice(&pcm[..n]);
        self.pcm_buf[n..].fill(0);

        match encoder.encode(&self.pcm_buf, &mut self.opus_buf) {
            Ok(len) => Some(len),
            Err(e) => {
                warn!("Encoding failure: {}", e);
                None
            }
        }
    }
}

fn poll_handler(slot: &SendHandlerSlot) -> Option<AudioFrame> {
    let mut slot = slot.lock();
    let handler = slot.as_mut()?;
    guarded("audio.send_handler", || {
        if handler.can_provide() {
            handler.provide_frame()
        } else {
            None
        }
    })
    .flatten()
}

/// Sends one packet per 20 ms until cancelled.
///
/// Deadlines are absolute, so a late wakeup shortens the next wait instead
/// of pushing every later frame back. If the loop falls too far behind it
/// starts over from the current instant.
pub async fn speak_loop(
    mut pipeline: SendPipeline,
    handler: SendHandlerSlot,
    sink: Arc<dyn PacketSink>,
    mut on_speaking: impl FnMut(bool) + Send,
    cancel: CancellationToken,
) {
    let frame_len = Duration::from_millis(FRAME_DURATION_MS);
    let max_lag = frame_len * MAX_PACING_LAG_FRAMES;
    let mut next = Instant::now() + frame_len;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(next) => {}
        }

        let frame = poll_handler(&handler);
        let outcome = pipeline.tick(frame);
        if let Some(speaking) = outcome.speaking_changed {
            on_speaking(speaking);
        }
        if let Some(packet) = outcome.packet {
            if let Err(e) = sink.send_packet(packet).await {
                debug!("Voice packet send failed: {}", e);
            }
        }

        next += frame_len;
        let now = Instant::now();
        if now > next + max_lag {
            debug!("Send loop fell behind by {:?}; resetting clock", now - next);
            next = now;
        }
    }

    if pipeline.is_speaking() {
        on_speaking(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::types::{ChannelId, UserId},
        voice::{
            codec::{CodecError, OpusDecoder},
            crypto::{EncryptionMode, PacketCipher},
            dave::PassthroughDaveSession,
            rtp::RtpPacket,
        },
    };

    const KEY: [u8; 32] = [7; 32];

    struct FirstSampleCodec;

    struct FirstSampleEncoder;

    impl OpusEncoder for FirstSampleEncoder {
        fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, CodecError> {
            out[..2].copy_from_slice(&pcm[0].to_le_bytes());
            Ok(2)
        }
    }

    impl OpusCodecFactory for FirstSampleCodec {
        fn create_encoder(&self) -> Result<Box<dyn OpusEncoder>, CodecError> {
            Ok(Box::new(FirstSampleEncoder))
        }
        fn create_decoder(&self) -> Result<Box<dyn OpusDecoder>, CodecError> {
            Err(CodecError::Init("encode only".into()))
        }
    }

    fn pipeline() -> SendPipeline {
        let dave: Box<dyn DaveSession> =
            Box::new(PassthroughDaveSession::new(UserId(1), ChannelId(2)));
        let cipher = PacketCipher::new(EncryptionMode::AeadAes256GcmRtpSize, &KEY);
        SendPipeline::new(
            Arc::new(FirstSampleCodec),
            Arc::new(Mutex::new(dave)),
            RtpPacketizer::with_counters(5, cipher, 100, 1_000),
        )
    }

    fn open(packet: &[u8]) -> Vec<u8> {
        let rtp = RtpPacket::parse(packet).unwrap();
        PacketCipher::new(EncryptionMode::AeadAes256GcmRtpSize, &KEY)
            .open(packet, &rtp)
            .unwrap()
    }

    #[test]
    fn opus_frames_pass_through_and_start_speaking() {
        let mut pipeline = pipeline();
        let outcome = pipeline.tick(Some(AudioFrame::Opus(vec![0xFC, 1, 2])));
        assert_eq!(outcome.speaking_changed, Some(true));
        assert_eq!(open(outcome.packet.unwrap()), vec![0xFC, 1, 2]);

        let outcome = pipeline.tick(Some(AudioFrame::Opus(vec![0xFC, 3])));
        assert_eq!(outcome.speaking_changed, None);
    }

    #[test]
    fn pcm_frames_go_through_the_encoder() {
        let mut pipeline = pipeline();
        let mut pcm = vec![0i16; PCM_FRAME_LEN];
        pcm[0] = 0x0102;
        let packet = pipeline.tick(Some(AudioFrame::Pcm(pcm))).packet.unwrap().to_vec();
        assert_eq!(open(&packet), vec![0x02, 0x01]);
    }

    #[test]
    fn five_silence_frames_follow_audio() {
        let mut pipeline = pipeline();
        pipeline.tick(Some(AudioFrame::Opus(vec![0xFC])));

        for i in 0..SILENCE_FRAME_COUNT {
            let outcome = pipeline.tick(None);
            let packet = outcome.packet.unwrap().to_vec();
            let last = i == SILENCE_FRAME_COUNT - 1;
            assert_eq!(outcome.speaking_changed, last.then_some(false));
            assert_eq!(open(&packet), SILENCE_FRAME);
        }

        let idle = pipeline.tick(None);
        assert!(idle.packet.is_none());
        assert!(!pipeline.is_speaking());
    }

    #[test]
    fn sequence_and_timestamp_advance_per_packet() {
        let mut pipeline = pipeline();
        let first = RtpPacket::parse(pipeline.tick(Some(AudioFrame::Opus(vec![1]))).packet.unwrap())
            .unwrap();
        let second =
            RtpPacket::parse(pipeline.tick(Some(AudioFrame::Opus(vec![2]))).packet.unwrap())
                .unwrap();
        assert_eq!(second.header.sequence, first.header.sequence + 1);
        assert_eq!(second.header.timestamp, first.header.timestamp + 960);
    }

    #[test]
    fn panicking_handler_yields_no_frame() {
        struct Broken;
        impl AudioSendHandler for Broken {
            fn can_provide(&mut self) -> bool {
                panic!("handler bug")
            }
            fn provide_frame(&mut self) -> Option<AudioFrame> {
                None
            }
        }
        let slot: SendHandlerSlot = Arc::new(Mutex::new(Some(Box::new(Broken))));
        assert_eq!(poll_handler(&slot), None);
    }
}
