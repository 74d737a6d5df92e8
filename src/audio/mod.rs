//! # Audio Pipeline Module
//!
//! Everything that touches PCM between the voice transport and the
//! realtime service.
//!
//! ## Key Components:
//! - **Frame**: Format constants shared by both sides
//! - **Codec**: 48kHz stereo ⇄ 24kHz mono conversion
//! - **Capture**: The sink the transport pushes speaker audio into
//! - **Playback**: The pull source handed to the transport and the task that feeds it
//! - **Buffer**: A bounded recorder of played audio, exportable as WAV
//!
//! ## Audio Formats:
//! - **Transport**: 48kHz, 16-bit, stereo, 20 ms frames of 3840 bytes
//! - **Service**: 24kHz, 16-bit, mono
//! - **Encoding**: Little-endian signed integers on both sides

pub mod buffer;   // Windowed PCM recorder
pub mod capture;  // Transport → outbound queue
pub mod codec;    // Sample-rate and channel conversion
pub mod frame;    // Formats and frame constants
pub mod playback; // Playback queue → transport
