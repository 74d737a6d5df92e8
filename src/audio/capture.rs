//! # Capture Sink
//!
//! Receives captured audio on a transport-owned thread and hands it to the
//! async side of the session.
//!
//! ## Per-frame Work:
//! 1. Drop the frame if a target speaker is set and this is someone else
//! 2. Convert 48kHz stereo to 24kHz mono
//! 3. `UnboundedSender::send`, which never blocks and never awaits
//!
//! The uplink task on the other end of the channel does the network I/O.
//! Speaking-state changes from accepted speakers are tracked so the session
//! summary can show who is talking right now.

use crate::audio::codec;
use crate::session::stats::ConversationStats;
use crate::voice::{AudioSink, SpeakerId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub struct CaptureSink {
    target: Option<SpeakerId>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    stats: Arc<ConversationStats>,
    closed: AtomicBool,
    speaking: Mutex<BTreeSet<SpeakerId>>,
}

impl CaptureSink {
    pub fn new(
        target: Option<SpeakerId>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        stats: Arc<ConversationStats>,
    ) -> Self {
        Self {
            target,
            outbound,
            stats,
            closed: AtomicBool::new(false),
            speaking: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn target(&self) -> Option<SpeakerId> {
        self.target
    }

    /// Accepted speakers currently talking, in id order.
    pub fn speaking(&self) -> Vec<SpeakerId> {
        self.speaking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// No target means everyone is accepted.
    fn accepts(&self, speaker: SpeakerId) -> bool {
        self.target.map_or(true, |target| target == speaker)
    }
}

impl AudioSink for CaptureSink {
    fn on_audio(&self, speaker: SpeakerId, pcm: &[u8]) {
        if !self.accepts(speaker) {
            self.stats.frame_filtered();
            return;
        }

        let converted = codec::transport_to_service(pcm);
        if converted.is_empty() {
            self.stats.frame_dropped();
            return;
        }

        if self.outbound.send(converted).is_err() {
            // Receiver is gone; the conversation is shutting down
            self.stats.frame_dropped();
            if !self.closed.swap(true, Ordering::Relaxed) {
                debug!(speaker_id = %speaker, "Outbound queue closed, dropping capture");
            }
            return;
        }

        self.stats.frame_forwarded();
    }

    fn on_speaking_state_changed(&self, speaker: SpeakerId, speaking: bool) {
        if !self.accepts(speaker) {
            return;
        }

        let mut current = self.speaking.lock().unwrap_or_else(PoisonError::into_inner);
        if speaking {
            if current.insert(speaker) {
                debug!(speaker_id = %speaker, "Speaker started talking");
            }
        } else if current.remove(&speaker) {
            debug!(speaker_id = %speaker, "Speaker stopped talking");
        }
    }

    fn cleanup(&self) {
        self.speaking.lock().unwrap_or_else(PoisonError::into_inner).clear();
        trace!(target_speaker = ?self.target, "Capture sink detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::TRANSPORT_FRAME_BYTES;

    fn sink(target: Option<SpeakerId>) -> (CaptureSink, mpsc::UnboundedReceiver<Vec<u8>>, Arc<ConversationStats>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(ConversationStats::default());
        (CaptureSink::new(target, tx, stats.clone()), rx, stats)
    }

    #[test]
    fn test_non_matching_speaker_is_discarded() {
        let (sink, mut rx, stats) = sink(Some(SpeakerId(1)));
        sink.on_audio(SpeakerId(2), &[0u8; TRANSPORT_FRAME_BYTES]);

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().frames_filtered, 1);
        assert_eq!(stats.snapshot().frames_forwarded, 0);
    }

    #[test]
    fn test_matching_speaker_is_converted_and_queued() {
        let (sink, mut rx, stats) = sink(Some(SpeakerId(1)));
        sink.on_audio(SpeakerId(1), &[0u8; TRANSPORT_FRAME_BYTES]);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), 960);
        assert_eq!(stats.snapshot().frames_forwarded, 1);
    }

    #[test]
    fn test_no_target_accepts_everyone() {
        let (sink, mut rx, _) = sink(None);
        sink.on_audio(SpeakerId(7), &[0u8; TRANSPORT_FRAME_BYTES]);
        sink.on_audio(SpeakerId(8), &[0u8; TRANSPORT_FRAME_BYTES]);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_speaking_state_only_tracks_target() {
        let (sink, _rx, _) = sink(Some(SpeakerId(1)));

        sink.on_speaking_state_changed(SpeakerId(2), true);
        assert!(sink.speaking().is_empty());

        sink.on_speaking_state_changed(SpeakerId(1), true);
        sink.on_speaking_state_changed(SpeakerId(1), true);
        assert_eq!(sink.speaking(), vec![SpeakerId(1)]);

        // A stop from someone else leaves the target's state alone
        sink.on_speaking_state_changed(SpeakerId(2), false);
        assert_eq!(sink.speaking(), vec![SpeakerId(1)]);

        sink.on_speaking_state_changed(SpeakerId(1), false);
        assert!(sink.speaking().is_empty());
    }

    #[test]
    fn test_speaking_state_without_target_and_cleanup() {
        let (sink, _rx, _) = sink(None);
        sink.on_speaking_state_changed(SpeakerId(9), true);
        sink.on_speaking_state_changed(SpeakerId(3), true);
        assert_eq!(sink.speaking(), vec![SpeakerId(3), SpeakerId(9)]);

        sink.cleanup();
        assert!(sink.speaking().is_empty());
    }

    #[test]
    fn test_closed_queue_drops_without_panicking() {
        let (sink, rx, stats) = sink(None);
        drop(rx);
        sink.on_audio(SpeakerId(7), &[0u8; TRANSPORT_FRAME_BYTES]);
        sink.on_audio(SpeakerId(7), &[0u8; TRANSPORT_FRAME_BYTES]);
        assert_eq!(stats.snapshot().frames_dropped, 2);
    }

    #[test]
    fn test_undecodable_frame_is_dropped() {
        let (sink, mut rx, stats) = sink(None);
        sink.on_audio(SpeakerId(7), &[1]);
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().frames_dropped, 1);
    }
}
