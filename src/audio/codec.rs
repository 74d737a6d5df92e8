//! # Frame Codec
//!
//! Stateless PCM conversions between the voice transport layout and the
//! remote service layout. Every function is pure: bytes in, bytes out.
//!
//! ## Conversions:
//! - **Capture path**: 48kHz stereo → 24kHz mono (`downsample`)
//! - **Playback path**: 24kHz mono → 48kHz stereo (`upsample`)
//!
//! ## Failure Model:
//! There is none beyond "no output". Empty input, a buffer without a single
//! whole sample, or a ratio that produces zero samples all return an empty
//! `Vec`, and the caller drops the frame.

use crate::audio::frame::{
    BYTES_PER_SAMPLE, SERVICE_CHANNELS, SERVICE_SAMPLE_RATE, TRANSPORT_CHANNELS,
    TRANSPORT_SAMPLE_RATE,
};
use byteorder::{ByteOrder, LittleEndian};

/// Convert multi-channel PCM to fewer channels, then resample.
///
/// ## Process:
/// 1. **Channel fold**: each output channel is the average of an equal-sized
///    group of interleaved input channels (stereo → mono averages L and R)
/// 2. **Linear interpolation**: the folded stream is resampled onto
///    `floor(len * to_rate / from_rate)` points evenly spaced across the
///    original sample indices
///
/// Averages and interpolated values truncate toward zero.
///
/// ## Parameters:
/// - **pcm**: little-endian 16-bit interleaved samples
/// - **from_channels / to_channels**: `from_channels` must be a multiple of `to_channels`
pub fn downsample(
    pcm: &[u8],
    from_rate: u32,
    to_rate: u32,
    from_channels: u16,
    to_channels: u16,
) -> Vec<u8> {
    if pcm.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }
    if to_channels == 0 || from_channels < to_channels || from_channels % to_channels != 0 {
        return Vec::new();
    }

    let samples = read_samples(pcm);
    let folded = fold_channels(&samples, from_channels as usize, to_channels as usize);
    let resampled = interpolate(&folded, to_channels as usize, from_rate, to_rate);

    write_samples(&resampled)
}

/// Resample by integer-ratio repetition, then duplicate mono into stereo.
///
/// Each input sample is repeated `to_rate / from_rate` times and every
/// repeated sample is written to both the left and right channel.
pub fn upsample(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if pcm.is_empty() || from_rate == 0 {
        return Vec::new();
    }

    let ratio = (to_rate / from_rate) as usize;
    if ratio == 0 {
        return Vec::new();
    }

    let samples = read_samples(pcm);
    let mut stereo = Vec::with_capacity(samples.len() * ratio * 2);
    for sample in samples {
        for _ in 0..ratio {
            stereo.push(sample);
            stereo.push(sample);
        }
    }

    write_samples(&stereo)
}

/// Capture conversion: transport layout → service layout.
pub fn transport_to_service(pcm: &[u8]) -> Vec<u8> {
    downsample(
        pcm,
        TRANSPORT_SAMPLE_RATE,
        SERVICE_SAMPLE_RATE,
        TRANSPORT_CHANNELS,
        SERVICE_CHANNELS,
    )
}

/// Playback conversion: service layout → transport layout.
pub fn service_to_transport(pcm: &[u8]) -> Vec<u8> {
    upsample(pcm, SERVICE_SAMPLE_RATE, TRANSPORT_SAMPLE_RATE)
}

/// Decode whole little-endian samples; a trailing odd byte is ignored.
fn read_samples(pcm: &[u8]) -> Vec<i16> {
    let whole = pcm.len() - pcm.len() % BYTES_PER_SAMPLE;
    let mut samples = vec![0i16; whole / BYTES_PER_SAMPLE];
    LittleEndian::read_i16_into(&pcm[..whole], &mut samples);
    samples
}

fn write_samples(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * BYTES_PER_SAMPLE];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Average groups of interleaved channels. A partial trailing frame is dropped.
fn fold_channels(samples: &[i16], from_channels: usize, to_channels: usize) -> Vec<i16> {
    if from_channels == to_channels {
        return samples.to_vec();
    }

    let group = from_channels / to_channels;
    let frames = samples.len() / from_channels;
    let mut folded = Vec::with_capacity(frames * to_channels);

    for frame in samples.chunks_exact(from_channels) {
        for members in frame.chunks_exact(group) {
            let sum: i32 = members.iter().map(|&s| s as i32).sum();
            folded.push((sum / group as i32) as i16);
        }
    }

    folded
}

/// Linear interpolation of each channel onto the new sample grid.
fn interpolate(samples: &[i16], channels: usize, from_rate: u32, to_rate: u32) -> Vec<i16> {
    let frames = samples.len() / channels;
    if frames == 0 {
        return Vec::new();
    }

    let new_frames = (frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    if new_frames == 0 {
        return Vec::new();
    }

    let step = if new_frames > 1 {
        (frames - 1) as f64 / (new_frames - 1) as f64
    } else {
        0.0
    };

    let mut out = Vec::with_capacity(new_frames * channels);
    for i in 0..new_frames {
        let position = i as f64 * step;
        let lo = (position.floor() as usize).min(frames - 1);
        let hi = (lo + 1).min(frames - 1);
        let fraction = position - lo as f64;

        for channel in 0..channels {
            let a = samples[lo * channels + channel] as f64;
            let b = samples[hi * channels + channel] as f64;
            // `as i16` truncates toward zero and saturates at the type bounds
            out.push((a + (b - a) * fraction) as i16);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::{SERVICE_FORMAT, TRANSPORT_FORMAT, TRANSPORT_FRAME_BYTES};

    fn pcm(samples: &[i16]) -> Vec<u8> {
        write_samples(samples)
    }

    #[test]
    fn test_empty_input_produces_empty_output() {
        assert!(downsample(&[], 48_000, 24_000, 2, 1).is_empty());
        assert!(upsample(&[], 24_000, 48_000).is_empty());
        // A single byte is not a whole sample
        assert!(transport_to_service(&[7]).is_empty());
    }

    #[test]
    fn test_silence_round_trip() {
        let capture = vec![0u8; TRANSPORT_FRAME_BYTES];

        let service = transport_to_service(&capture);
        assert_eq!(service.len(), 960);
        assert!(service.iter().all(|&b| b == 0));

        let playback = service_to_transport(&service);
        assert_eq!(playback.len(), TRANSPORT_FRAME_BYTES);
        assert!(playback.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_round_trip_preserves_duration_and_channels() {
        // 100ms of a ramp, stereo at 48kHz
        let mut samples = Vec::new();
        for i in 0..4800i32 {
            let v = ((i % 200) * 100 - 10_000) as i16;
            samples.push(v);
            samples.push(v);
        }
        let input = pcm(&samples);

        let service = transport_to_service(&input);
        let output = service_to_transport(&service);

        // Samples per channel at 48kHz, one frame of tolerance
        let original = input.len() / TRANSPORT_FORMAT.bytes_per_frame();
        let round_trip = output.len() / TRANSPORT_FORMAT.bytes_per_frame();
        assert!(original.abs_diff(round_trip) <= TRANSPORT_FRAME_BYTES / TRANSPORT_FORMAT.bytes_per_frame());
        assert_eq!(output.len() % TRANSPORT_FORMAT.bytes_per_frame(), 0);
        assert_eq!(service.len() % SERVICE_FORMAT.bytes_per_frame(), 0);
    }

    #[test]
    fn test_stereo_fold_averages_channels() {
        let input = pcm(&[100, 300, -100, -301, 5, 6]);
        let mono = downsample(&input, 24_000, 24_000, 2, 1);
        let mut samples = vec![0i16; mono.len() / 2];
        LittleEndian::read_i16_into(&mono, &mut samples);
        // -401 / 2 truncates toward zero
        assert_eq!(samples, vec![200, -200, 5]);
    }

    #[test]
    fn test_linear_interpolation_endpoints() {
        let input = pcm(&[0, 1000, 2000, 3000]);
        let half = downsample(&input, 48_000, 24_000, 1, 1);
        let mut samples = vec![0i16; half.len() / 2];
        LittleEndian::read_i16_into(&half, &mut samples);
        // Two points spanning indices 0..=3
        assert_eq!(samples, vec![0, 3000]);
    }

    #[test]
    fn test_upsample_repeats_and_duplicates() {
        let output = upsample(&pcm(&[1, -2]), 24_000, 48_000);
        let mut samples = vec![0i16; output.len() / 2];
        LittleEndian::read_i16_into(&output, &mut samples);
        assert_eq!(samples, vec![1, 1, 1, 1, -2, -2, -2, -2]);
    }

    #[test]
    fn test_invalid_ratios_produce_no_output() {
        assert!(upsample(&pcm(&[1, 2]), 48_000, 24_000).is_empty());
        assert!(downsample(&pcm(&[1, 2, 3]), 48_000, 24_000, 3, 2).is_empty());
        assert!(downsample(&pcm(&[1]), 48_000, 1_000, 1, 1).is_empty());
    }
}
