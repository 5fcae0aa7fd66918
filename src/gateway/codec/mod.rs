//! Wire encodings of gateway control frames.

use std::io::Read;

use thiserror::Error;

use super::payload::GatewayPayload;
use crate::configs::Encoding;

pub mod etf;
pub mod json;

pub use etf::{EtfCodec, EtfError};
pub use json::JsonCodec;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid ETF payload: {0}")]
    Etf(#[from] EtfError),
    #[error("failed to read payload: {0}")]
    Io(#[from] std::io::Error),
}

/// An encoded outbound frame, ready for the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Vec<u8>),
}

pub trait PayloadCodec: Send + Sync {
    fn encoding(&self) -> Encoding;

    fn decode_slice(&self, bytes: &[u8]) -> Result<GatewayPayload, CodecError>;

    /// Decodes from a lazily produced byte stream.
    fn decode_reader(&self, reader: &mut dyn Read) -> Result<GatewayPayload, CodecError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.decode_slice(&bytes)
    }

    fn encode(&self, payload: &GatewayPayload) -> Result<EncodedFrame, CodecError>;
}

pub fn create(encoding: Encoding) -> Box<dyn PayloadCodec> {
    match encoding {
        Encoding::Json => Box::new(JsonCodec),
        Encoding::Etf => Box::new(EtfCodec),
    }
}
