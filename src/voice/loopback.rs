//! # Loopback Voice Transport
//!
//! An in-process implementation of the voice traits. Nothing leaves the
//! machine: played audio lands in a [`PcmRecorder`], and captured audio is
//! whatever gets injected through [`LoopbackVoice::deliver_capture`].
//!
//! ## Playback Thread:
//! `play` spawns a plain OS thread that calls `read()` once per frame interval,
//! just as a real transport's encoder thread would. A zero interval means
//! "as fast as possible", which tests rely on.
//!
//! ## Capture:
//! Injected PCM is cut into 20ms frames and handed to the installed sink on
//! the calling thread, so a capture sink sees exactly the same call pattern it
//! would get from a real transport.

use crate::audio::buffer::PcmRecorder;
use crate::audio::frame::{TRANSPORT_FORMAT, TRANSPORT_FRAME_BYTES};
use crate::error::VoiceError;
use crate::voice::{AudioSink, AudioSource, ChannelId, GuildId, SpeakerId, VoiceConnector, VoiceHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared between a voice handle and one playback thread.
struct PlaybackThread {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

/// Loopback voice connection for one guild.
pub struct LoopbackVoice {
    guild: GuildId,
    channel: ChannelId,
    frame_interval: Duration,
    recorder: Arc<PcmRecorder>,
    sink: Mutex<Option<Arc<dyn AudioSink>>>,
    playback: Mutex<Option<PlaybackThread>>,
    connected: AtomicBool,
    frames_played: Arc<AtomicU64>,
}

impl LoopbackVoice {
    pub fn new(
        guild: GuildId,
        channel: ChannelId,
        frame_interval: Duration,
        recording_seconds: u32,
    ) -> Self {
        Self {
            guild,
            channel,
            frame_interval,
            recorder: Arc::new(PcmRecorder::new(TRANSPORT_FORMAT, recording_seconds)),
            sink: Mutex::new(None),
            playback: Mutex::new(None),
            connected: AtomicBool::new(true),
            frames_played: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Everything played recently, in transport format.
    pub fn recorder(&self) -> &PcmRecorder {
        &self.recorder
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Feed captured 48kHz stereo PCM from `speaker` to the installed sink.
    ///
    /// Returns the number of frames delivered; zero when no sink is listening.
    pub fn deliver_capture(&self, speaker: SpeakerId, pcm: &[u8]) -> usize {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(sink) = sink else {
            debug!(guild_id = %self.guild, "Capture dropped, no sink installed");
            return 0;
        };

        let mut delivered = 0;
        for frame in pcm.chunks(TRANSPORT_FRAME_BYTES) {
            sink.on_audio(speaker, frame);
            delivered += 1;
        }
        delivered
    }

    /// Report a speaking-state change to the installed sink.
    pub fn set_speaking(&self, speaker: SpeakerId, speaking: bool) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(sink) = sink {
            sink.on_speaking_state_changed(speaker, speaking);
        }
    }
}

#[async_trait]
impl VoiceHandle for LoopbackVoice {
    fn play(&self, mut source: Box<dyn AudioSource>) -> Result<(), VoiceError> {
        if !self.is_connected() {
            return Err(VoiceError::Transport("Not connected to voice".to_string()));
        }
        if source.is_compressed() {
            return Err(VoiceError::Transport("Loopback only plays raw PCM".to_string()));
        }

        let mut playback = self.playback.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = playback.as_ref() {
            if !current.finished.load(Ordering::Acquire) {
                return Err(VoiceError::Transport("Already playing audio".to_string()));
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        *playback = Some(PlaybackThread {
            stop: stop.clone(),
            finished: finished.clone(),
        });
        drop(playback);

        let recorder = self.recorder.clone();
        let frames_played = self.frames_played.clone();
        let interval = self.frame_interval;
        let guild = self.guild;

        thread::Builder::new()
            .name(format!("loopback-play-{}", guild))
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let frame = source.read();
                    if frame.is_empty() {
                        break;
                    }
                    if frame.len() != TRANSPORT_FRAME_BYTES {
                        warn!(guild_id = %guild, len = frame.len(), "Source produced a short frame");
                    }
                    recorder.append_pcm_data(&frame);
                    frames_played.fetch_add(1, Ordering::Relaxed);

                    if interval.is_zero() {
                        thread::yield_now();
                    } else {
                        thread::sleep(interval);
                    }
                }
                source.cleanup();
                finished.store(true, Ordering::Release);
            })
            .map_err(|e| VoiceError::Transport(format!("Failed to spawn playback thread: {}", e)))?;

        Ok(())
    }

    fn stop(&self) {
        if let Some(current) = self.playback.lock().unwrap_or_else(PoisonError::into_inner).take() {
            current.stop.store(true, Ordering::Release);
        }
    }

    fn is_playing(&self) -> bool {
        self.playback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|current| !current.finished.load(Ordering::Acquire))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn listen(&self, sink: Arc<dyn AudioSink>) -> Result<(), VoiceError> {
        if !self.is_connected() {
            return Err(VoiceError::Transport("Not connected to voice".to_string()));
        }
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn stop_listening(&self) {
        let previous = self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sink) = previous {
            sink.cleanup();
        }
    }

    async fn disconnect(&self) -> Result<(), VoiceError> {
        self.stop();
        self.stop_listening();
        self.connected.store(false, Ordering::Release);
        info!(guild_id = %self.guild, channel_id = %self.channel, "Loopback voice disconnected");
        Ok(())
    }
}

/// Hands out [`LoopbackVoice`] connections and remembers one per guild.
///
/// A guild's tracked voice is only replaced once it has disconnected, so a
/// connection that loses a join race never shadows the live one.
pub struct LoopbackConnector {
    frame_interval: Duration,
    recording_seconds: u32,
    voices: Mutex<HashMap<GuildId, Arc<LoopbackVoice>>>,
}

impl LoopbackConnector {
    pub fn new(frame_interval: Duration, recording_seconds: u32) -> Self {
        Self {
            frame_interval,
            recording_seconds,
            voices: Mutex::new(HashMap::new()),
        }
    }

    /// The guild's live connection, or the last one if it has disconnected.
    pub fn voice(&self, guild: GuildId) -> Option<Arc<LoopbackVoice>> {
        self.voices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&guild)
            .cloned()
    }
}

#[async_trait]
impl VoiceConnector for LoopbackConnector {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<Arc<dyn VoiceHandle>, VoiceError> {
        let voice = Arc::new(LoopbackVoice::new(
            guild,
            channel,
            self.frame_interval,
            self.recording_seconds,
        ));

        {
            let mut voices = self.voices.lock().unwrap_or_else(PoisonError::into_inner);
            match voices.get(&guild) {
                Some(current) if current.is_connected() => {
                    debug!(guild_id = %guild, "Guild already has a live loopback voice, not tracking the new one");
                }
                _ => {
                    voices.insert(guild, voice.clone());
                }
            }
        }

        info!(guild_id = %guild, channel_id = %channel, "Loopback voice connected");
        Ok(voice as Arc<dyn VoiceHandle>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct CountdownSource {
        frames: usize,
    }

    impl AudioSource for CountdownSource {
        fn read(&mut self) -> Vec<u8> {
            if self.frames == 0 {
                return Vec::new();
            }
            self.frames -= 1;
            vec![1u8; TRANSPORT_FRAME_BYTES]
        }
    }

    struct EncodedSource;

    impl AudioSource for EncodedSource {
        fn read(&mut self) -> Vec<u8> {
            vec![0xF8, 0xFF, 0xFE]
        }

        fn is_compressed(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<(SpeakerId, usize)>>,
    }

    impl AudioSink for RecordingSink {
        fn on_audio(&self, speaker: SpeakerId, pcm: &[u8]) {
            self.frames.lock().unwrap().push((speaker, pcm.len()));
        }

        fn on_speaking_state_changed(&self, _speaker: SpeakerId, _speaking: bool) {}
    }

    fn wait_until_idle(voice: &LoopbackVoice) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while voice.is_playing() {
            assert!(Instant::now() < deadline, "playback never finished");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_play_drains_source_into_recorder() {
        let voice = LoopbackVoice::new(GuildId(1), ChannelId(2), Duration::ZERO, 5);
        voice.play(Box::new(CountdownSource { frames: 3 })).unwrap();
        wait_until_idle(&voice);

        assert_eq!(voice.frames_played(), 3);
        // 3 frames × 1920 interleaved samples
        assert_eq!(voice.recorder().snapshot().len(), 3 * 1920);
    }

    #[test]
    fn test_play_rejected_while_playing() {
        let voice = LoopbackVoice::new(GuildId(1), ChannelId(2), Duration::from_millis(20), 5);
        voice.play(Box::new(CountdownSource { frames: 100 })).unwrap();
        assert!(voice.is_playing());
        assert!(voice.play(Box::new(CountdownSource { frames: 1 })).is_err());

        voice.stop();
        assert!(!voice.is_playing());
        voice.play(Box::new(CountdownSource { frames: 1 })).unwrap();
        wait_until_idle(&voice);
    }

    #[test]
    fn test_compressed_source_is_rejected() {
        let voice = LoopbackVoice::new(GuildId(1), ChannelId(2), Duration::ZERO, 1);
        assert!(matches!(voice.play(Box::new(EncodedSource)), Err(VoiceError::Transport(_))));
        assert!(!voice.is_playing());
        assert_eq!(voice.frames_played(), 0);
    }

    #[test]
    fn test_capture_is_cut_into_frames() {
        let voice = LoopbackVoice::new(GuildId(1), ChannelId(2), Duration::ZERO, 1);
        assert_eq!(voice.deliver_capture(SpeakerId(5), &[0u8; 100]), 0);

        let sink = Arc::new(RecordingSink::default());
        voice.listen(sink.clone()).unwrap();
        let delivered = voice.deliver_capture(SpeakerId(5), &vec![0u8; TRANSPORT_FRAME_BYTES * 2 + 4]);
        assert_eq!(delivered, 3);

        let frames = sink.frames.lock().unwrap().clone();
        assert_eq!(
            frames,
            vec![
                (SpeakerId(5), TRANSPORT_FRAME_BYTES),
                (SpeakerId(5), TRANSPORT_FRAME_BYTES),
                (SpeakerId(5), 4)
            ]
        );

        voice.stop_listening();
        assert!(!voice.has_sink());
    }

    #[tokio::test]
    async fn test_connector_remembers_voice_after_disconnect() {
        let connector = LoopbackConnector::new(Duration::ZERO, 1);
        let handle = connector.connect(GuildId(9), ChannelId(10)).await.unwrap();
        assert!(handle.is_connected());

        handle.disconnect().await.unwrap();
        let voice = connector.voice(GuildId(9)).unwrap();
        assert!(!voice.is_connected());
        assert_eq!(voice.channel(), ChannelId(10));
        assert!(voice.play(Box::new(CountdownSource { frames: 1 })).is_err());
    }

    #[tokio::test]
    async fn test_second_connection_does_not_shadow_live_voice() {
        let connector = LoopbackConnector::new(Duration::ZERO, 1);
        let first = connector.connect(GuildId(4), ChannelId(40)).await.unwrap();
        let second = connector.connect(GuildId(4), ChannelId(41)).await.unwrap();

        // The losing connection is released; the tracked one stays live
        second.disconnect().await.unwrap();
        let tracked = connector.voice(GuildId(4)).unwrap();
        assert!(tracked.is_connected());
        assert_eq!(tracked.channel(), ChannelId(40));

        // Once the live one is gone, a fresh connection takes its place
        first.disconnect().await.unwrap();
        connector.connect(GuildId(4), ChannelId(42)).await.unwrap();
        assert_eq!(connector.voice(GuildId(4)).unwrap().channel(), ChannelId(42));
    }
}
