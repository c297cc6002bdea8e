//! # Transcription Module
//!
//! A fixed-capacity pool of loaded Whisper contexts and a single-flight
//! background worker that runs one transcription job at a time.
//!
//! ## Key Components:
//! - **Engine contract** (`engine`): the narrow interface to the inference engine
//! - **Candle backend** (`model`): Whisper on Candle-rs, the production engine
//! - **Context pool** (`pool`): slots, generation-tagged handles
//! - **Job builder** (`job`): thread and language policy
//! - **Worker coordinator** (`worker`): at most one job in flight, joined before
//!   any pool state is touched
//! - **Result streamer** (`streamer`): `!START` / segment lines / `!DONE`
//! - **Service** (`service`): the only entry point, composing all of the above
//!
//! ## Call Flow:
//! ```text
//! acquire / release / dispatch
//!   └─ join outstanding job ─ pool ─ job builder ─ worker thread
//!                                                   ├─ engine run
//!                                                   └─ result streamer
//! ```

pub mod engine;      // Engine contract and parameter records
pub mod model;       // Candle-backed Whisper engine
pub mod pool;        // Context pool and handles
pub mod job;         // Job construction policy
pub mod worker;      // Single-flight worker coordinator
pub mod streamer;    // Output protocol
pub mod service;     // Transcription service

#[cfg(test)]
pub mod testing;     // Scripted engine for tests

pub use engine::{ContextParams, InferenceContext, InferenceEngine};
pub use job::JobRequest;
pub use model::CandleEngine;
pub use pool::ContextHandle;
pub use service::{PoolSnapshot, ServiceMetrics, TranscriptionBackend, TranscriptionService};
pub use streamer::ResultStreamer;
