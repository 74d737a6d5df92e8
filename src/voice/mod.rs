//! # Voice Transport Interfaces
//!
//! The bridge never talks to a concrete voice platform. It talks to these
//! traits, and whatever owns the real voice connection implements them.
//!
//! ## Threading Contract:
//! - **AudioSource::read** is called by the transport at a fixed 20ms cadence
//!   on a thread it owns. It must return immediately.
//! - **AudioSink::on_audio** is called on a transport thread for every captured
//!   frame. It must never block on I/O.
//! - **VoiceHandle** methods are cheap and synchronous except `disconnect`.
//!
//! ## Key Rust Concepts:
//! - **Trait objects**: `Arc<dyn VoiceHandle>` lets sessions hold any transport
//! - **async_trait**: async methods in object-safe traits
//! - **Newtypes**: `GuildId(u64)` stops a channel id being passed as a guild id

pub mod loopback;

use crate::error::VoiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use loopback::{LoopbackConnector, LoopbackVoice};

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

snowflake_id!(
    /// A server (guild). Sessions are keyed by this.
    GuildId
);
snowflake_id!(
    /// A voice channel inside a guild.
    ChannelId
);
snowflake_id!(
    /// A user whose audio arrives through the capture sink.
    SpeakerId
);

/// Pull-based audio producer consumed by the transport.
pub trait AudioSource: Send {
    /// Next frame of 48kHz stereo PCM. An empty buffer means end of stream.
    fn read(&mut self) -> Vec<u8>;

    /// Raw PCM sources return `false`; the transport encodes them itself.
    fn is_compressed(&self) -> bool {
        false
    }

    /// Release buffers once the transport is done with the source.
    fn cleanup(&mut self) {}
}

/// Push-based receiver of captured audio.
pub trait AudioSink: Send + Sync {
    /// One captured frame of 48kHz stereo PCM from `speaker`.
    fn on_audio(&self, speaker: SpeakerId, pcm: &[u8]);

    /// A speaker started or stopped talking.
    fn on_speaking_state_changed(&self, speaker: SpeakerId, speaking: bool);

    /// Called when the sink is detached from the transport.
    fn cleanup(&self) {}
}

/// A live connection to one voice channel.
#[async_trait]
pub trait VoiceHandle: Send + Sync {
    /// Start pulling frames from `source`. Fails if something is already playing.
    fn play(&self, source: Box<dyn AudioSource>) -> Result<(), VoiceError>;

    /// Stop the current source, if any.
    fn stop(&self);

    fn is_playing(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Install the capture sink. Replaces any previous sink.
    fn listen(&self, sink: Arc<dyn AudioSink>) -> Result<(), VoiceError>;

    /// Detach the capture sink. Safe to call when none is installed.
    fn stop_listening(&self);

    /// Leave the channel and release the connection.
    async fn disconnect(&self) -> Result<(), VoiceError>;
}

/// Acquires voice handles.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceHandle>, VoiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_numbers() {
        let json = serde_json::to_string(&GuildId(42)).unwrap();
        assert_eq!(json, "42");

        let speaker: SpeakerId = serde_json::from_str("9001").unwrap();
        assert_eq!(speaker, SpeakerId(9001));
        assert_eq!(speaker.to_string(), "9001");
    }
}
