//! Audio plane: per-guild voice transports and the media pipelines that run
//! on them.
//!
//! ```text
//! AudioSendHandler -> SendPipeline (opus, DAVE, RTP, transport crypto) -> UDP
//! UDP -> ReceivePipeline (transport crypto, sequence check, DAVE, opus) -> AudioReceiveHandler
//! ```
//!
//! [`AudioManager`] owns the connections of one shard and drives the join
//! handshake through the main gateway; [`gateway::VoiceGateway`] runs one
//! voice websocket session and its media loops.

pub mod codec;
pub mod connection;
pub mod constants;
pub mod crypto;
pub mod dave;
pub mod gateway;
pub mod manager;
pub mod receive;
pub mod rtp;
pub mod send;
pub mod udp;

pub use codec::{AudiopusCodecFactory, CodecError, OpusCodecFactory, OpusDecoder, OpusEncoder};
pub use connection::{ConnectionListener, ConnectionStatus, VoiceChannel, VoiceConnection};
pub use crypto::EncryptionMode;
pub use manager::{AudioManager, DisconnectRecord};
pub use receive::{AudioReceiveHandler, OpusPacket, UserAudio};
pub use send::{AudioFrame, AudioSendHandler};
