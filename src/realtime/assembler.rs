//! # Response Assembler
//!
//! Collects the streamed audio fragments of one remote response and publishes
//! them as a single [`Utterance`] when the response is done.
//!
//! ## Guarantees:
//! - Fragments are concatenated in arrival order
//! - Playback only ever sees whole utterances
//! - Every `done` produces exactly one `EndOfResponse`, even with no audio

use crate::audio::playback::{PlaybackItem, Utterance};
use crate::error::VoiceError;
use crate::session::stats::ConversationStats;
use base64::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ResponseAssembler {
    playback: mpsc::UnboundedSender<PlaybackItem>,
    fragments: Vec<Vec<u8>>,
    next_sequence: u64,
    stats: Arc<ConversationStats>,
}

impl ResponseAssembler {
    pub fn new(playback: mpsc::UnboundedSender<PlaybackItem>, stats: Arc<ConversationStats>) -> Self {
        Self {
            playback,
            fragments: Vec::new(),
            next_sequence: 1,
            stats,
        }
    }

    /// Decode one base64 fragment and buffer it. An empty delta is ignored.
    ///
    /// A decode failure drops only this fragment; the caller logs it.
    pub fn push_delta(&mut self, delta: &str) -> Result<(), VoiceError> {
        if delta.is_empty() {
            return Ok(());
        }

        match BASE64_STANDARD.decode(delta) {
            Ok(bytes) => {
                self.fragments.push(bytes);
                Ok(())
            }
            Err(e) => {
                self.stats.fragment_rejected();
                Err(e.into())
            }
        }
    }

    /// Bytes buffered for the response in flight.
    pub fn pending_bytes(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    /// Close the response: publish the utterance (if any) and the sentinel.
    ///
    /// Returns the size of the published utterance. A closed queue is not an
    /// error here; it only means playback has already stopped.
    pub fn finish(&mut self) -> usize {
        let fragments = std::mem::take(&mut self.fragments);
        let pcm = fragments.concat();
        let size = pcm.len();

        if !pcm.is_empty() {
            let utterance = Utterance {
                sequence: self.next_sequence,
                pcm,
            };
            self.next_sequence += 1;
            self.stats.utterance_assembled();
            let _ = self.playback.send(PlaybackItem::Utterance(utterance));
        }

        let _ = self.playback.send(PlaybackItem::EndOfResponse);
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> (ResponseAssembler, mpsc::UnboundedReceiver<PlaybackItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ResponseAssembler::new(tx, Arc::new(ConversationStats::default())), rx)
    }

    #[test]
    fn test_fragments_concatenate_in_order() {
        let (mut assembler, mut rx) = assembler();
        for fragment in [&[1u8, 2][..], &[3], &[4, 5, 6]] {
            assembler.push_delta(&BASE64_STANDARD.encode(fragment)).unwrap();
        }
        assert_eq!(assembler.pending_bytes(), 6);
        assert_eq!(assembler.finish(), 6);

        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackItem::Utterance(Utterance { sequence: 1, pcm: vec![1, 2, 3, 4, 5, 6] })
        );
        assert_eq!(rx.try_recv().unwrap(), PlaybackItem::EndOfResponse);
        assert!(rx.try_recv().is_err());
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn test_two_deltas_make_one_utterance_and_one_sentinel() {
        let (mut assembler, mut rx) = assembler();
        assembler.push_delta(&BASE64_STANDARD.encode(vec![0u8; 100])).unwrap();
        assembler.push_delta(&BASE64_STANDARD.encode(vec![0u8; 150])).unwrap();
        assembler.finish();

        match rx.try_recv().unwrap() {
            PlaybackItem::Utterance(utterance) => assert_eq!(utterance.pcm.len(), 250),
            other => panic!("expected utterance, got {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap(), PlaybackItem::EndOfResponse);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_response_sends_only_sentinel() {
        let (mut assembler, mut rx) = assembler();
        assembler.push_delta("").unwrap();
        assert_eq!(assembler.finish(), 0);

        assert_eq!(rx.try_recv().unwrap(), PlaybackItem::EndOfResponse);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bad_fragment_is_skipped() {
        let (mut assembler, mut rx) = assembler();
        assembler.push_delta(&BASE64_STANDARD.encode([9u8, 9])).unwrap();
        assert!(assembler.push_delta("%%% not base64").is_err());
        assembler.push_delta(&BASE64_STANDARD.encode([8u8])).unwrap();
        assembler.finish();

        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackItem::Utterance(Utterance { sequence: 1, pcm: vec![9, 9, 8] })
        );
        assert_eq!(assembler.stats.snapshot().fragments_rejected, 1);
    }

    #[test]
    fn test_sequences_increase_per_utterance() {
        let (mut assembler, mut rx) = assembler();
        assembler.push_delta(&BASE64_STANDARD.encode([1u8])).unwrap();
        assembler.finish();
        assembler.finish();
        assembler.push_delta(&BASE64_STANDARD.encode([2u8])).unwrap();
        assembler.finish();

        let sequences: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|item| match item {
                PlaybackItem::Utterance(u) => Some(u.sequence),
                PlaybackItem::EndOfResponse => None,
            })
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }
}
