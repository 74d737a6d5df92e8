//! # Voice Sessions
//!
//! One session per guild, owned by the [`SessionController`].
//!
//! ## Lifecycle:
//! ```text
//! Idle ──join──▶ Joined ──start_conversation──▶ Active ──stop_conversation──▶ Joined ──leave──▶ Idle
//! ```
//!
//! An Active session runs three tasks that share one cancellation token:
//! - **listen**: realtime events → [`ResponseAssembler`](crate::realtime::ResponseAssembler) → playback queue
//! - **playback**: playback queue → voice transport
//! - **uplink**: outbound queue (filled by the capture sink) → realtime service

pub mod controller;
pub mod state;
pub mod stats;

use std::time::Duration;

pub use crate::voice::{ChannelId, GuildId, SpeakerId};
pub use controller::SessionController;
pub use state::{ConversationRequest, SessionPhase, SessionSummary};

/// Receive timeout of the listen loop.
pub const LISTEN_RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// How long playback waits on its queue before checking for cancellation.
pub const PLAYBACK_QUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// How often playback asks the transport whether it is still playing.
pub const PLAYBACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after stopping a source before starting the next one.
pub const PLAYBACK_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Bound on opening the connection and on each handshake reply.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop_conversation` waits for a task before aborting it.
pub const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Every wait the pipeline performs, resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimings {
    pub listen_timeout: Duration,
    pub queue_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            listen_timeout: LISTEN_RECV_TIMEOUT,
            queue_timeout: PLAYBACK_QUEUE_TIMEOUT,
            poll_interval: PLAYBACK_POLL_INTERVAL,
            settle_delay: PLAYBACK_SETTLE_DELAY,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            shutdown_grace: TASK_SHUTDOWN_GRACE,
        }
    }
}
