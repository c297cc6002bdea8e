//! # whisper-pool-backend
//!
//! A fixed pool of Whisper inference contexts driven by a single-flight
//! background worker, plus the actix-web host that exposes it over HTTP.
//!
//! ## Layout:
//! - **transcription**: pool, job builder, worker, result streamer and the
//!   candle engine backend, composed by [`transcription::TranscriptionService`]
//! - **audio**: request body decoding into f32 samples
//! - **device**: compute device selection
//! - **config**, **state**, **error**: host process plumbing
//! - **handlers**, **health**, **middleware**: HTTP surface

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod state;
pub mod transcription;
