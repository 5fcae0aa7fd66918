use std::io::Read;

use super::{CodecError, EncodedFrame, PayloadCodec};
use crate::{configs::Encoding, gateway::payload::GatewayPayload};

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Json
    }

    fn decode_slice(&self, bytes: &[u8]) -> Result<GatewayPayload, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn decode_reader(&self, reader: &mut dyn Read) -> Result<GatewayPayload, CodecError> {
        Ok(serde_json::from_reader(reader)?)
    }

    fn encode(&self, payload: &GatewayPayload) -> Result<EncodedFrame, CodecError> {
        Ok(EncodedFrame::Text(serde_json::to_string(payload)?))
    }
}
