//! Opus codec boundary. The pipelines only see these traits; the native
//! library sits behind [`AudiopusCodecFactory`].

use audiopus::{
    Application, Channels, MutSignals, SampleRate,
    coder::{Decoder, Encoder},
    packet::Packet,
};
use thiserror::Error;

use super::constants::PCM_FRAME_LEN;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("opus codec unavailable: {0}")]
    Init(String),
    #[error("opus encode failed: {0}")]
    Encode(String),
    #[error("opus decode failed: {0}")]
    Decode(String),
}

pub trait OpusEncoder: Send {
    /// Encodes one interleaved 20 ms stereo frame into `out`, returning the
    /// number of bytes written.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, CodecError>;
}

pub trait OpusDecoder: Send {
    /// Decodes `packet` into interleaved samples. `None` asks the decoder to
    /// conceal a lost frame exactly as long as `out`. Returns samples per
    /// channel.
    fn decode(&mut self, packet: Option<&[u8]>, out: &mut [i16]) -> Result<usize, CodecError>;
}

pub trait OpusCodecFactory: Send + Sync {
    fn create_encoder(&self) -> Result<Box<dyn OpusEncoder>, CodecError>;
    fn create_decoder(&self) -> Result<Box<dyn OpusDecoder>, CodecError>;
}

/// 48 kHz stereo codecs backed by libopus.
#[derive(Debug, Default, Clone, Copy)]
pub struct AudiopusCodecFactory;

impl AudiopusCodecFactory {
    /// Verifies the native library works by building and exercising an
    /// encoder once.
    pub fn probe() -> Result<Self, CodecError> {
        let factory = Self;
        let mut encoder = factory.create_encoder()?;
        let mut out = [0u8; 256];
        encoder.encode(&[0i16; PCM_FRAME_LEN], &mut out)?;
        Ok(factory)
    }
}

impl OpusCodecFactory for AudiopusCodecFactory {
    fn create_encoder(&self) -> Result<Box<dyn OpusEncoder>, CodecError> {
        let encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Box::new(AudiopusEncoder { encoder }))
    }

    fn create_decoder(&self) -> Result<Box<dyn OpusDecoder>, CodecError> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Box::new(AudiopusDecoder { decoder }))
    }
}

struct AudiopusEncoder {
    encoder: Encoder,
}

impl OpusEncoder for AudiopusEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, CodecError> {
        self.encoder
            .encode(pcm, out)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

struct AudiopusDecoder {
    decoder: Decoder,
}

impl OpusDecoder for AudiopusDecoder {
    fn decode(&mut self, packet: Option<&[u8]>, out: &mut [i16]) -> Result<usize, CodecError> {
        let packet = match packet {
            Some(bytes) => {
                Some(Packet::try_from(bytes).map_err(|e| CodecError::Decode(e.to_string()))?)
            }
            None => None,
        };
        let signals = MutSignals::try_from(out).map_err(|e| CodecError::Decode(e.to_string()))?;
        self.decoder
            .decode(packet, signals, false)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::constants::{FRAME_SAMPLES, MAX_DECODED_LEN, MAX_OPUS_FRAME_SIZE};

    #[test]
    fn silence_encodes_and_decodes_to_one_frame() {
        let factory = AudiopusCodecFactory::probe().unwrap();
        let mut encoder = factory.create_encoder().unwrap();
        let mut decoder = factory.create_decoder().unwrap();

        let mut opus = [0u8; MAX_OPUS_FRAME_SIZE];
        let len = encoder.encode(&[0i16; PCM_FRAME_LEN], &mut opus).unwrap();
        assert!(len > 0);

        let mut pcm = vec![0i16; MAX_DECODED_LEN];
        let samples = decoder.decode(Some(&opus[..len]), &mut pcm).unwrap();
        assert_eq!(samples, FRAME_SAMPLES);

        let concealed = decoder.decode(None, &mut pcm[..PCM_FRAME_LEN]).unwrap();
        assert_eq!(concealed, FRAME_SAMPLES);
    }
}
