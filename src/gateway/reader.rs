use std::{error::Error as StdError, io};

use thiserror::Error;

use super::{
    codec::{self, CodecError, EncodedFrame, PayloadCodec},
    compression::{self, Decompressed, DecompressionError, Decompressor},
    payload::GatewayPayload,
};
use crate::configs::GatewayConfig;

#[derive(Debug, Error)]
pub enum ReadError {
    /// The compressed stream is corrupt. Nothing after this point can be
    /// trusted; the connection must be rebuilt.
    #[error(transparent)]
    Decompression(#[from] DecompressionError),
    /// A single payload was malformed. Skip it and carry on.
    #[error(transparent)]
    Decode(CodecError),
}

impl ReadError {
    pub fn is_decompression(&self) -> bool {
        matches!(self, Self::Decompression(_))
    }
}

impl From<CodecError> for ReadError {
    fn from(err: CodecError) -> Self {
        match find_decompression_fault(&err) {
            Some(fault) => Self::Decompression(fault),
            None => Self::Decode(err),
        }
    }
}

fn find_decompression_fault(err: &CodecError) -> Option<DecompressionError> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(fault) = e.downcast_ref::<DecompressionError>() {
            return Some(fault.clone());
        }
        // io::Error::source skips the wrapped error itself.
        if let Some(fault) = e
            .downcast_ref::<io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<DecompressionError>())
        {
            return Some(fault.clone());
        }
        current = e.source();
    }
    None
}

/// Turns raw socket frames into [`GatewayPayload`]s.
///
/// Owns the connection's inflate state; create a new reader per socket.
pub struct MessageReader {
    decompressor: Box<dyn Decompressor>,
    codec: Box<dyn PayloadCodec>,
}

impl MessageReader {
    pub fn new(config: &GatewayConfig) -> Self {
        Self::from_parts(compression::create(config), codec::create(config.encoding()))
    }

    pub fn from_parts(decompressor: Box<dyn Decompressor>, codec: Box<dyn PayloadCodec>) -> Self {
        Self {
            decompressor,
            codec,
        }
    }

    /// Returns `Ok(None)` while a fragmented message is incomplete.
    pub fn read(&mut self, frame: &[u8]) -> Result<Option<GatewayPayload>, ReadError> {
        let Some(message) = self.decompressor.decompress(frame)? else {
            return Ok(None);
        };

        let payload = match message {
            Decompressed::Buffer(bytes) => self.codec.decode_slice(bytes)?,
            Decompressed::Stream(mut reader) => match self.codec.decode_reader(&mut reader) {
                Ok(payload) => payload,
                Err(err) => {
                    if let Some(fault) = reader.take_fault() {
                        return Err(ReadError::Decompression(fault));
                    }
                    return Err(err.into());
                }
            },
        };
        Ok(Some(payload))
    }

    /// Text frames are never compressed at the transport level.
    pub fn read_text(&mut self, text: &str) -> Result<GatewayPayload, ReadError> {
        Ok(self.codec.decode_slice(text.as_bytes())?)
    }

    pub fn encode(&self, payload: &GatewayPayload) -> Result<EncodedFrame, CodecError> {
        self.codec.encode(payload)
    }

    pub fn reset(&mut self) {
        self.decompressor.reset();
    }

    pub fn shutdown(&mut self) {
        self.decompressor.shutdown();
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        self.decompressor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use flate2::{Compress, Compression as Level, FlushCompress};

    use super::*;
    use crate::configs::{Compression, Encoding};

    fn compress(message: &[u8]) -> Vec<u8> {
        let mut c = Compress::new(Level::default(), true);
        let mut out = Vec::with_capacity(message.len() + 128);
        c.compress_vec(message, &mut out, FlushCompress::Sync)
            .unwrap();
        out
    }

    fn reader(compression: Compression) -> MessageReader {
        MessageReader::new(&GatewayConfig::new(compression, Encoding::Json, 1024).unwrap())
    }

    #[test]
    fn reads_fragmented_messages_in_both_modes() {
        let frame = compress(br#"{"op":0,"s":42,"t":"RESUMED","d":{}}"#);
        for mode in [Compression::Buffered, Compression::Streamed] {
            let mut r = reader(mode);
            assert!(r.read(&frame[..5]).unwrap().is_none());
            let payload = r.read(&frame[5..]).unwrap().unwrap();
            assert_eq!(payload.s, Some(42));
            assert_eq!(payload.t.as_deref(), Some("RESUMED"));
        }
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let frame = compress(br#"{"op":"#);
        for mode in [Compression::Buffered, Compression::Streamed] {
            let err = reader(mode).read(&frame).unwrap_err();
            assert!(matches!(err, ReadError::Decode(_)), "{mode:?}: {err}");
        }
    }

    #[test]
    fn corrupt_stream_is_a_decompression_error_in_both_modes() {
        let garbage = [0x78, 0x9c, 0xFF, 0xFF, 0xFF, 0x13, 0x00, 0x00, 0xFF, 0xFF];
        for mode in [Compression::Buffered, Compression::Streamed] {
            let err = reader(mode).read(&garbage).unwrap_err();
            assert!(err.is_decompression(), "{mode:?}: {err}");
        }
    }

    #[test]
    fn io_wrapped_faults_are_recognised() {
        let io = io::Error::new(
            io::ErrorKind::InvalidData,
            DecompressionError::Inflate("bad block".into()),
        );
        let err = ReadError::from(CodecError::Io(io));
        assert!(err.is_decompression());
    }

    #[test]
    fn uncompressed_text_frames() {
        let mut r = reader(Compression::None);
        let payload = r.read_text(r#"{"op":11}"#).unwrap();
        assert_eq!(payload.op, 11);
    }
}
