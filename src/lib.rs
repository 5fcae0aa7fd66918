//! Resumable gateway session and per-guild voice transport.
//!
//! The crate is organised around two planes:
//!
//! | Plane | Entry point | Runs on |
//! |---|---|---|
//! | control / events | [`gateway::GatewayClient`] | one dedicated thread per shard |
//! | audio | [`voice::AudioManager`] | the context's multi-thread runtime |
//!
//! Process-wide state (codec availability, DAVE factory, runtime handle and
//! the set of gateway threads) lives in [`context::ClientContext`].

pub mod common;
pub mod configs;
pub mod context;
pub mod gateway;
pub mod rest;
pub mod task;
pub mod voice;

pub use context::ClientContext;
pub use gateway::{GatewayClient, GatewayEvent};
pub use task::{Task, TaskError};
pub use voice::{AudioManager, VoiceConnection};
