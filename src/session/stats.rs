//! Per-conversation counters.
//!
//! Every task of a conversation holds the same `Arc<ConversationStats>`. The
//! capture sink writes from a transport thread, so all counters are atomics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConversationStats {
    frames_forwarded: AtomicU64,
    frames_filtered: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    fragments_rejected: AtomicU64,
    utterances_assembled: AtomicU64,
    utterances_played: AtomicU64,
}

/// Point-in-time copy of [`ConversationStats`] for API responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_forwarded: u64,
    pub frames_filtered: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub fragments_rejected: u64,
    pub utterances_assembled: u64,
    pub utterances_played: u64,
}

impl ConversationStats {
    pub fn frame_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Captured frame from someone other than the target speaker.
    pub fn frame_filtered(&self) {
        self.frames_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Captured frame that converted to nothing or found the queue closed.
    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn fragment_rejected(&self) {
        self.fragments_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn utterance_assembled(&self) {
        self.utterances_assembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn utterance_played(&self) {
        self.utterances_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_filtered: self.frames_filtered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            fragments_rejected: self.fragments_rejected.load(Ordering::Relaxed),
            utterances_assembled: self.utterances_assembled.load(Ordering::Relaxed),
            utterances_played: self.utterances_played.load(Ordering::Relaxed),
        }
    }
}
