//! # Audio Frame Formats
//!
//! Describes the two PCM layouts that meet inside the bridge:
//! - **Transport frames**: 48kHz, stereo, 16-bit, always 20ms (3840 bytes)
//! - **Service frames**: 24kHz, mono, 16-bit, any length the remote service produces
//!
//! All samples are little-endian signed 16-bit integers.

/// Sample rate used by the voice transport (Hz).
pub const TRANSPORT_SAMPLE_RATE: u32 = 48_000;

/// Channel count used by the voice transport.
pub const TRANSPORT_CHANNELS: u16 = 2;

/// Sample rate expected and produced by the remote service (Hz).
pub const SERVICE_SAMPLE_RATE: u32 = 24_000;

/// Channel count expected and produced by the remote service.
pub const SERVICE_CHANNELS: u16 = 1;

/// Bytes per 16-bit PCM sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples per channel in one 20ms transport frame.
pub const FRAME_SAMPLES_PER_CHANNEL: usize = 960;

/// Size of one transport frame in bytes.
///
/// ## Calculation:
/// 960 samples × 2 channels × 2 bytes = 3840 bytes
pub const TRANSPORT_FRAME_BYTES: usize =
    FRAME_SAMPLES_PER_CHANNEL * TRANSPORT_CHANNELS as usize * BYTES_PER_SAMPLE;

/// Linear PCM layout of a buffer.
///
/// ## Rust Concepts:
/// - **Copy**: The struct is three small integers, so it is passed by value
/// - **const fn**: Lets the canonical formats below be compile-time constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// Number of bytes needed to hold one sample for every channel.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }
}

/// 48kHz stereo 16-bit, as delivered and consumed by the voice transport.
pub const TRANSPORT_FORMAT: AudioFormat =
    AudioFormat::new(TRANSPORT_SAMPLE_RATE, TRANSPORT_CHANNELS, 16);

/// 24kHz mono 16-bit, as spoken by the remote service.
pub const SERVICE_FORMAT: AudioFormat = AudioFormat::new(SERVICE_SAMPLE_RATE, SERVICE_CHANNELS, 16);
