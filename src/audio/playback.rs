//! # Playback Scheduler
//!
//! Drains a conversation's playback queue and plays one utterance at a time
//! through the voice transport.
//!
//! ## Loop:
//! 1. Wait on the queue for at most `queue_timeout`
//! 2. `EndOfResponse` on its own: nothing to do
//! 3. `Utterance`: upsample to 48kHz stereo, stop anything still playing,
//!    wait `settle_delay`, hand a [`BufferedSource`] to the transport
//! 4. Poll `is_playing` every `poll_interval` until the transport is done
//!
//! Step 4 is what keeps utterances from overlapping: the next queue item is
//! not even looked at until the current one has finished.

use crate::audio::codec;
use crate::audio::frame::TRANSPORT_FRAME_BYTES;
use crate::session::stats::ConversationStats;
use crate::session::PipelineTimings;
use crate::voice::{AudioSource, GuildId, VoiceHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One complete spoken response, 24kHz mono PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Position in the conversation, starting at 1
    pub sequence: u64,
    pub pcm: Vec<u8>,
}

/// What travels over the playback queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackItem {
    Utterance(Utterance),
    /// Marks the end of one remote response
    EndOfResponse,
}

/// Pre-buffered pull source handing out fixed 20ms frames.
///
/// ## Pull Contract:
/// - Every non-empty `read()` is exactly 3840 bytes; the last one is zero padded
/// - Once the buffer is exhausted `read()` returns an empty `Vec`
/// - Never blocks: everything is already in memory
pub struct BufferedSource {
    pcm: Vec<u8>,
    position: usize,
}

impl BufferedSource {
    pub fn new(pcm: Vec<u8>) -> Self {
        Self { pcm, position: 0 }
    }

    /// Frames still to be read, counting a partial trailing frame as one.
    pub fn remaining_frames(&self) -> usize {
        self.pcm.len().saturating_sub(self.position).div_ceil(TRANSPORT_FRAME_BYTES)
    }
}

impl AudioSource for BufferedSource {
    fn read(&mut self) -> Vec<u8> {
        if self.position >= self.pcm.len() {
            return Vec::new();
        }

        let end = (self.position + TRANSPORT_FRAME_BYTES).min(self.pcm.len());
        let mut frame = Vec::with_capacity(TRANSPORT_FRAME_BYTES);
        frame.extend_from_slice(&self.pcm[self.position..end]);
        frame.resize(TRANSPORT_FRAME_BYTES, 0);
        self.position = end;
        frame
    }

    fn is_compressed(&self) -> bool {
        false
    }

    fn cleanup(&mut self) {
        self.pcm = Vec::new();
        self.position = 0;
    }
}

/// Run the playback loop until `cancel` fires or the queue closes.
pub async fn run_playback(
    guild: GuildId,
    voice: Arc<dyn VoiceHandle>,
    mut queue: mpsc::UnboundedReceiver<PlaybackItem>,
    cancel: CancellationToken,
    timings: PipelineTimings,
    stats: Arc<ConversationStats>,
) {
    info!(guild_id = %guild, "Playback task started");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(timings.queue_timeout, queue.recv()) => next,
        };

        let utterance = match next {
            Err(_) => continue,
            Ok(None) => {
                debug!(guild_id = %guild, "Playback queue closed");
                break;
            }
            Ok(Some(PlaybackItem::EndOfResponse)) => continue,
            Ok(Some(PlaybackItem::Utterance(utterance))) => utterance,
        };

        let pcm = codec::service_to_transport(&utterance.pcm);
        if pcm.is_empty() {
            warn!(guild_id = %guild, sequence = utterance.sequence, "Utterance converted to no audio, skipping");
            continue;
        }

        if voice.is_playing() {
            voice.stop();
            sleep(timings.settle_delay).await;
        }

        let source = BufferedSource::new(pcm);
        let frames = source.remaining_frames();
        if let Err(e) = voice.play(Box::new(source)) {
            warn!(guild_id = %guild, sequence = utterance.sequence, error = %e, "Failed to start playback");
            continue;
        }
        debug!(guild_id = %guild, sequence = utterance.sequence, frames, "Playing utterance");

        if !wait_for_playback(voice.as_ref(), &cancel, &timings).await {
            voice.stop();
            break;
        }
        stats.utterance_played();
    }

    info!(guild_id = %guild, "Playback task stopped");
}

/// Returns `false` if cancelled before the transport finished.
async fn wait_for_playback(
    voice: &dyn VoiceHandle,
    cancel: &CancellationToken,
    timings: &PipelineTimings,
) -> bool {
    while voice.is_playing() {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = sleep(timings.poll_interval) => {}
        }
    }
    true
}
