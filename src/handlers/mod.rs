//! # HTTP Handlers
//!
//! The operator surface: every voice command arrives here as a REST call
//! and is forwarded to the [`SessionController`](crate::session::SessionController).

pub mod config;
pub mod loopback;
pub mod sessions;

pub use config::*;
pub use loopback::*;
pub use sessions::*;
