//! Session records held by the controller.

use crate::audio::capture::CaptureSink;
use crate::realtime::{ProtocolState, SessionClient};
use crate::session::stats::{ConversationStats, StatsSnapshot};
use crate::voice::{ChannelId, GuildId, SpeakerId, VoiceHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Options for starting a conversation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationRequest {
    /// Only this speaker's audio is forwarded; `None` forwards everyone
    #[serde(default)]
    pub listen_to: Option<SpeakerId>,

    /// Display name used in the instructions
    #[serde(default)]
    pub listen_to_name: Option<String>,
}

/// A guild's voice session. Exists from `join` until `leave`.
pub struct GuildSession {
    pub session_id: Uuid,
    pub guild: GuildId,
    pub channel: ChannelId,
    pub voice: Arc<dyn VoiceHandle>,
    pub joined_at: DateTime<Utc>,
    pub conversation: Option<ActiveConversation>,
}

/// Everything that exists only while a conversation is running.
///
/// The three tasks, both queues (through their endpoints) and the remote
/// client are created together in `start_conversation` and torn down together
/// in `stop_conversation`.
pub struct ActiveConversation {
    pub client: Arc<SessionClient>,
    pub sink: Arc<CaptureSink>,
    pub cancel: CancellationToken,
    pub tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub degraded: Arc<AtomicBool>,
    pub target_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stats: Arc<ConversationStats>,
}

impl ActiveConversation {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Joined,
    Active,
    /// The connection died; the conversation must be stopped explicitly
    Degraded,
}

/// Serializable view of a [`GuildSession`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub phase: SessionPhase,
    pub joined_at: DateTime<Utc>,
    pub voice_connected: bool,
    pub playing: bool,
    pub conversation: Option<ConversationSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub started_at: DateTime<Utc>,
    pub target_speaker: Option<SpeakerId>,
    pub target_name: Option<String>,
    pub speaking: Vec<SpeakerId>,
    pub protocol_state: ProtocolState,
    pub stats: StatsSnapshot,
}

impl GuildSession {
    pub fn phase(&self) -> SessionPhase {
        match &self.conversation {
            None => SessionPhase::Joined,
            Some(conversation) if conversation.is_degraded() => SessionPhase::Degraded,
            Some(_) => SessionPhase::Active,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            guild_id: self.guild,
            channel_id: self.channel,
            phase: self.phase(),
            joined_at: self.joined_at,
            voice_connected: self.voice.is_connected(),
            playing: self.voice.is_playing(),
            conversation: self.conversation.as_ref().map(|c| ConversationSummary {
                started_at: c.started_at,
                target_speaker: c.sink.target(),
                target_name: c.target_name.clone(),
                speaking: c.sink.speaking(),
                protocol_state: c.client.state(),
                stats: c.stats.snapshot(),
            }),
        }
    }
}

/// Configured instructions, plus a sentence naming the selected listener.
pub fn build_instructions(base: &str, listener: Option<&str>) -> String {
    match listener.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("{} You're currently listening to {}.", base, name),
        None => base.to_string(),
    }
}
