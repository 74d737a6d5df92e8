//! # Realtime Service Integration
//!
//! Everything that speaks the remote service's WebSocket protocol.
//!
//! ## Components:
//! - **messages**: serde types for client and server events
//! - **client**: [`SessionClient`], the connection and its state machine
//! - **assembler**: [`ResponseAssembler`], fragments in, whole utterances out

pub mod assembler;
pub mod client;
pub mod messages;

#[cfg(test)]
pub mod testing;

pub use assembler::ResponseAssembler;
pub use client::{ProtocolState, SessionClient};
