//! # Audio Input
//!
//! Host-side marshalling of uploaded audio into the sample buffers the
//! transcription core consumes.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz), not checked
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian 32-bit float (`f32le`) or signed 16-bit PCM (`s16le`)

pub mod processor;    // Body decoding and PCM conversion

pub use processor::{AudioProcessor, SampleFormat};
