//! # Playback Recording Buffer
//!
//! A circular PCM buffer that keeps the most recent stretch of audio handed
//! to the voice transport. The loopback transport writes every played frame
//! here so operators can download what the remote service said as a WAV file.
//!
//! ## Key Features:
//! - **Circular buffer**: Oldest samples are discarded once the window is full
//! - **Thread safety**: Written from the transport's playback thread, read from HTTP handlers
//! - **WAV export**: Snapshot encoded with the `wav` crate

use crate::audio::frame::AudioFormat;
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Mutex, PoisonError};

/// Bounded window of recent PCM samples in one fixed format.
///
/// ## Thread Safety:
/// Uses `Mutex<VecDeque<i16>>` so the playback thread can append while an
/// HTTP request takes a snapshot.
pub struct PcmRecorder {
    /// Interleaved samples, oldest first
    samples: Mutex<VecDeque<i16>>,

    /// Layout of the recorded audio
    format: AudioFormat,

    /// Maximum number of interleaved samples to keep
    max_samples: usize,
}

impl PcmRecorder {
    /// Create a recorder holding at most `window_seconds` of audio.
    ///
    /// ## Example:
    /// 30 seconds of 48kHz stereo: 30 × 48000 × 2 = 2,880,000 samples
    pub fn new(format: AudioFormat, window_seconds: u32) -> Self {
        let max_samples =
            window_seconds as usize * format.sample_rate as usize * format.channels as usize;

        Self {
            samples: Mutex::new(VecDeque::with_capacity(max_samples.min(1 << 20))),
            format,
            max_samples,
        }
    }

    /// Append raw little-endian PCM, evicting the oldest samples past the window.
    ///
    /// A trailing odd byte is ignored.
    pub fn append_pcm_data(&self, data: &[u8]) {
        if self.max_samples == 0 {
            return;
        }

        let mut cursor = Cursor::new(data);
        let mut buffer = self.samples.lock().unwrap_or_else(PoisonError::into_inner);

        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            buffer.push_back(sample);
            if buffer.len() > self.max_samples {
                buffer.pop_front();
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Seconds of audio currently held.
    pub fn duration_seconds(&self) -> f64 {
        let per_second = self.format.sample_rate as f64 * self.format.channels as f64;
        if per_second == 0.0 {
            return 0.0;
        }
        self.len() as f64 / per_second
    }

    /// Copy of the recorded samples, oldest first.
    pub fn snapshot(&self) -> Vec<i16> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Encode the current window as a 16-bit PCM WAV file.
    pub fn to_wav(&self) -> std::io::Result<Vec<u8>> {
        let header = wav::Header::new(
            wav::WAV_FORMAT_PCM,
            self.format.channels,
            self.format.sample_rate,
            self.format.bit_depth,
        );
        let track = wav::BitDepth::Sixteen(self.snapshot());

        let mut out = Cursor::new(Vec::new());
        wav::write(header, &track, &mut out)?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::TRANSPORT_FORMAT;

    #[test]
    fn test_window_evicts_oldest() {
        // 1 second of 2Hz mono = 2 samples kept
        let recorder = PcmRecorder::new(AudioFormat::new(2, 1, 16), 1);
        recorder.append_pcm_data(&[1, 0, 2, 0, 3, 0]);
        assert_eq!(recorder.snapshot(), vec![2, 3]);
    }

    #[test]
    fn test_zero_window_records_nothing() {
        let recorder = PcmRecorder::new(TRANSPORT_FORMAT, 0);
        recorder.append_pcm_data(&[0u8; 3840]);
        assert!(recorder.snapshot().is_empty());
        assert_eq!(recorder.duration_seconds(), 0.0);
    }

    #[test]
    fn test_wav_export_has_riff_header() {
        let recorder = PcmRecorder::new(TRANSPORT_FORMAT, 1);
        recorder.append_pcm_data(&[0u8; 3840]);
        assert!((recorder.duration_seconds() - 0.02).abs() < 1e-9);

        let wav = recorder.to_wav().unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > 3840);
    }
}
