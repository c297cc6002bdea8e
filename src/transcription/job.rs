//! # Job Builder
//!
//! Turns a client request into a self-contained [`Job`]: resolved thread count,
//! resolved language, fixed policy flags and the audio buffer itself.
//!
//! ## Resolution Rules:
//! - **Threads**: `min(requested, 16, largest power of two <= hardware concurrency)`,
//!   never below 1
//! - **Language**: forced to English unless the context is multilingual, in
//!   which case the caller's tag is passed through untouched
//! - **Policy flags**: token timestamps on, word-boundary splitting, one-unit
//!   maximum segment length, no engine-side printing
//!
//! The audio is moved into the job and never inspected: sample rate and channel
//! layout are the caller's contract.

use crate::transcription::engine::{InferenceContext, InferenceParams, DEFAULT_LANGUAGE, SAMPLE_RATE};
use crate::transcription::pool::ContextHandle;

/// Upper bound on engine threads regardless of hardware.
pub const MAX_THREADS: usize = 16;

/// Largest power of two that is `<= n` (0 for 0).
pub fn largest_power_of_two(n: usize) -> usize {
    match n {
        0 => 0,
        n => 1 << (usize::BITS - 1 - n.leading_zeros()),
    }
}

/// Detected hardware concurrency (1 when it cannot be determined).
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Apply the thread policy to a requested count.
pub fn resolve_threads(requested: i32, hardware_concurrency: usize) -> usize {
    let requested = usize::try_from(requested).unwrap_or(0);
    requested
        .min(MAX_THREADS)
        .min(largest_power_of_two(hardware_concurrency))
        .max(1)
}

/// What the client asked for.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Mono 16 kHz f32 samples
    pub audio: Vec<f32>,
    pub language: String,
    pub n_threads: i32,
    pub translate: bool,
}

/// Everything one background run needs, owned.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: ContextHandle,
    pub audio: Vec<f32>,
    pub params: InferenceParams,
}

impl Job {
    pub fn audio_duration_secs(&self) -> f64 {
        self.audio.len() as f64 / SAMPLE_RATE as f64
    }
}

/// Builds jobs against a fixed view of the hardware.
#[derive(Debug, Clone, Copy)]
pub struct JobBuilder {
    hardware_concurrency: usize,
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::with_hardware_concurrency(hardware_concurrency())
    }

    pub fn with_hardware_concurrency(hardware_concurrency: usize) -> Self {
        Self { hardware_concurrency }
    }

    pub fn hardware_concurrency(&self) -> usize {
        self.hardware_concurrency
    }

    /// Resolve `request` against the context it will run on.
    pub fn build<C: InferenceContext + ?Sized>(&self, handle: ContextHandle, context: &C, request: JobRequest) -> Job {
        let language = if context.is_multilingual() {
            request.language
        } else {
            DEFAULT_LANGUAGE.to_string()
        };

        let params = InferenceParams {
            n_threads: resolve_threads(request.n_threads, self.hardware_concurrency),
            translate: request.translate,
            language,
            offset_ms: 0,
            token_timestamps: true,
            max_len: 1,
            split_on_word: true,
            print_realtime: false,
            print_progress: false,
            print_timestamps: true,
            print_special: false,
        };

        tracing::debug!(
            handle = %handle,
            threads = params.n_threads,
            language = %params.language,
            translate = params.translate,
            samples = request.audio.len(),
            "Built transcription job"
        );

        Job {
            handle,
            audio: request.audio,
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::testing::ScriptedEngine;
    use crate::transcription::engine::{ContextParams, InferenceEngine};

    fn request(language: &str, n_threads: i32) -> JobRequest {
        JobRequest {
            audio: vec![0.0; 16000],
            language: language.to_string(),
            n_threads,
            translate: false,
        }
    }

    #[test]
    fn test_largest_power_of_two() {
        assert_eq!(largest_power_of_two(0), 0);
        assert_eq!(largest_power_of_two(1), 1);
        assert_eq!(largest_power_of_two(12), 8);
        assert_eq!(largest_power_of_two(16), 16);
        assert_eq!(largest_power_of_two(31), 16);
    }

    #[test]
    fn test_thread_resolution() {
        assert_eq!(resolve_threads(20, 12), 8);
        assert_eq!(resolve_threads(4, 12), 4);
        assert_eq!(resolve_threads(64, 128), 16);
        assert_eq!(resolve_threads(3, 2), 2);
        assert_eq!(resolve_threads(0, 8), 1);
        assert_eq!(resolve_threads(-5, 8), 1);
        assert_eq!(resolve_threads(8, 0), 1);
    }

    #[test]
    fn test_english_only_context_forces_english() {
        let engine = ScriptedEngine::new();
        let context = engine.load_context("model.bin", &ContextParams::default()).unwrap();
        let builder = JobBuilder::with_hardware_concurrency(12);

        let job = builder.build(ContextHandle::from_raw(1), &context, request("de", 20));
        assert_eq!(job.params.language, "en");
        assert_eq!(job.params.n_threads, 8);
    }

    #[test]
    fn test_multilingual_context_passes_language_through() {
        let engine = ScriptedEngine::new().multilingual();
        let context = engine.load_context("model.bin", &ContextParams::default()).unwrap();
        let builder = JobBuilder::with_hardware_concurrency(4);

        let job = builder.build(ContextHandle::from_raw(1), &context, request("xx-unknown", 2));
        assert_eq!(job.params.language, "xx-unknown");
    }

    #[test]
    fn test_fixed_policy_flags() {
        let engine = ScriptedEngine::new();
        let context = engine.load_context("model.bin", &ContextParams::default()).unwrap();
        let mut req = request("en", 4);
        req.translate = true;

        let job = JobBuilder::with_hardware_concurrency(8).build(ContextHandle::from_raw(2), &context, req);

        assert!(job.params.translate);
        assert!(job.params.token_timestamps);
        assert!(job.params.split_on_word);
        assert_eq!(job.params.max_len, 1);
        assert_eq!(job.params.offset_ms, 0);
        assert!(!job.params.print_progress);
        assert!(!job.params.print_realtime);
        assert!(!job.params.print_special);
        assert_eq!(job.audio.len(), 16000);
        assert!((job.audio_duration_secs() - 1.0).abs() < 1e-9);
    }
}
