//! Control plane: one resumable, compressed session per shard.
//!
//! Inbound frames flow `compression -> codec -> session`; the session owns
//! all mutable state and runs on the shard's dedicated thread (see
//! [`client::GatewayClient`]). Everything else talks to it through a
//! [`GatewayHandle`].

pub mod client;
pub mod close;
pub mod codec;
pub mod compression;
pub mod constants;
pub mod events;
pub mod handle;
pub mod payload;
pub mod reader;
pub mod session;

pub use client::{GatewayClient, GatewayClientBuilder};
pub use close::{CloseAction, CloseCodeTable};
pub use codec::{CodecError, EncodedFrame, PayloadCodec};
pub use compression::{Decompressed, DecompressionError, Decompressor};
pub use events::{DispatchEvent, EventListener, GatewayEvent, VoiceServer, VoiceState};
pub use handle::{GatewayCommand, GatewayHandle};
pub use payload::{GatewayPayload, OpCode};
pub use reader::{MessageReader, ReadError};
pub use session::{IllegalTransition, SessionStatus};
