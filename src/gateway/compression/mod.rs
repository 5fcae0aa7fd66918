//! Transport decompression for gateway frames.
//!
//! A [`Decompressor`] turns raw binary frames into complete messages. It
//! returns `Ok(None)` while a message is still arriving in fragments.

use thiserror::Error;

use crate::configs::{Compression, GatewayConfig};

pub mod zlib;

pub use zlib::{InflateReader, ZlibDecompressor};

/// Z_SYNC_FLUSH marker terminating every complete zlib-stream message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompressionError {
    #[error("inflate failed: {0}")]
    Inflate(String),
    #[error("decompressor has been shut down")]
    ShutDown,
}

/// A complete decompressed message.
pub enum Decompressed<'a> {
    /// Fully inflated bytes.
    Buffer(&'a [u8]),
    /// Lazily inflated bytes; read it to the end or drop it before the next
    /// frame.
    Stream(InflateReader<'a>),
}

pub trait Decompressor: Send {
    fn kind(&self) -> Compression;

    fn decompress<'a>(
        &'a mut self,
        frame: &'a [u8],
    ) -> Result<Option<Decompressed<'a>>, DecompressionError>;

    /// Discards buffered fragments and starts a fresh inflate window.
    fn reset(&mut self);

    /// Releases inflate state and buffers. Safe to call repeatedly.
    fn shutdown(&mut self);
}

/// Used when compression is disabled: every frame is a complete message.
#[derive(Debug, Default)]
pub struct NoopDecompressor {
    shut_down: bool,
}

impl Decompressor for NoopDecompressor {
    fn kind(&self) -> Compression {
        Compression::None
    }

    fn decompress<'a>(
        &'a mut self,
        frame: &'a [u8],
    ) -> Result<Option<Decompressed<'a>>, DecompressionError> {
        if self.shut_down {
            return Err(DecompressionError::ShutDown);
        }
        Ok(Some(Decompressed::Buffer(frame)))
    }

    fn reset(&mut self) {}

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}

pub fn create(config: &GatewayConfig) -> Box<dyn Decompressor> {
    match config.compression() {
        Compression::None => Box::new(NoopDecompressor::default()),
        Compression::Buffered => Box::new(ZlibDecompressor::buffered(
            config.buffer_shrink_threshold(),
        )),
        Compression::Streamed => Box::new(ZlibDecompressor::streamed(
            config.buffer_shrink_threshold(),
        )),
    }
}

pub fn is_complete(frame: &[u8]) -> bool {
    frame.len() >= ZLIB_SUFFIX.len() && frame[frame.len() - ZLIB_SUFFIX.len()..] == ZLIB_SUFFIX
}
