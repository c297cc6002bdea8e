//! # Inference Engine Contract
//!
//! The narrow call contract between the transcription core and the speech-to-text
//! engine that does the heavy lifting. Everything the pool, the job builder and the
//! result streamer need from the engine goes through the two traits defined here.
//!
//! ## Contract:
//! - **construct-context**: [`InferenceEngine::load_context`]
//! - **reset-timings**: [`InferenceContext::reset_timings`]
//! - **run-inference**: [`InferenceContext::run`]
//! - **enumerate-segment-count**: [`InferenceContext::n_segments`]
//! - **per-segment accessors**: [`InferenceContext::segment`]
//! - **destroy-context**: dropping the context value
//!
//! ## Time Units:
//! Segment boundaries are expressed in engine-native ticks of 10 ms.

use anyhow::{anyhow, Result};
use std::fmt;

/// Sample rate every context expects (mono, f32 samples in [-1.0, 1.0]).
pub const SAMPLE_RATE: usize = 16_000;

/// Language used whenever a context cannot honour the caller's choice.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Samples per engine tick (10 ms at 16 kHz).
pub const SAMPLES_PER_TICK: usize = SAMPLE_RATE / 100;

/// Named sets of cross-attention heads used for token-level timestamp alignment.
///
/// Each Whisper model family aligns text to audio best with a specific subset of
/// its attention heads. The preset is chosen once, when a context is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlignmentHeadsPreset {
    None,
    TinyEn,
    Tiny,
    BaseEn,
    Base,
    SmallEn,
    Small,
    MediumEn,
    Medium,
    LargeV1,
    LargeV2,
    LargeV3,
}

impl AlignmentHeadsPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignmentHeadsPreset::None => "none",
            AlignmentHeadsPreset::TinyEn => "tiny.en",
            AlignmentHeadsPreset::Tiny => "tiny",
            AlignmentHeadsPreset::BaseEn => "base.en",
            AlignmentHeadsPreset::Base => "base",
            AlignmentHeadsPreset::SmallEn => "small.en",
            AlignmentHeadsPreset::Small => "small",
            AlignmentHeadsPreset::MediumEn => "medium.en",
            AlignmentHeadsPreset::Medium => "medium",
            AlignmentHeadsPreset::LargeV1 => "large-v1",
            AlignmentHeadsPreset::LargeV2 => "large-v2",
            AlignmentHeadsPreset::LargeV3 => "large-v3",
        }
    }
}

impl std::str::FromStr for AlignmentHeadsPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(AlignmentHeadsPreset::None),
            "tiny.en" => Ok(AlignmentHeadsPreset::TinyEn),
            "tiny" => Ok(AlignmentHeadsPreset::Tiny),
            "base.en" => Ok(AlignmentHeadsPreset::BaseEn),
            "base" => Ok(AlignmentHeadsPreset::Base),
            "small.en" => Ok(AlignmentHeadsPreset::SmallEn),
            "small" => Ok(AlignmentHeadsPreset::Small),
            "medium.en" => Ok(AlignmentHeadsPreset::MediumEn),
            "medium" => Ok(AlignmentHeadsPreset::Medium),
            "large-v1" => Ok(AlignmentHeadsPreset::LargeV1),
            "large-v2" => Ok(AlignmentHeadsPreset::LargeV2),
            "large-v3" => Ok(AlignmentHeadsPreset::LargeV3),
            _ => Err(anyhow!("Unknown alignment heads preset: {}", s)),
        }
    }
}

impl fmt::Display for AlignmentHeadsPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration applied when a context is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    /// Compute token-level timestamps by aligning attention weights
    pub dtw_token_timestamps: bool,

    /// Attention heads used for the alignment
    pub aheads_preset: AlignmentHeadsPreset,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            dtw_token_timestamps: true,
            aheads_preset: AlignmentHeadsPreset::BaseEn,
        }
    }
}

/// Parameters for one inference run (greedy decoding).
///
/// ## Defaults:
/// The `Default` impl mirrors the engine's own greedy defaults. The job builder
/// overrides the fields it has a policy for, so a context never sees a half
/// configured request.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    /// Worker threads the engine may use for this run
    pub n_threads: usize,

    /// Translate to English instead of transcribing
    pub translate: bool,

    /// Language tag passed to the engine as-is ("en", "de", ...)
    pub language: String,

    /// Start offset into the audio (milliseconds)
    pub offset_ms: u32,

    /// Attach timestamps to every decoded token
    pub token_timestamps: bool,

    /// Maximum segment length (0 = no limit)
    pub max_len: usize,

    /// Split segments on word boundaries rather than sub-word tokens
    pub split_on_word: bool,

    pub print_realtime: bool,
    pub print_progress: bool,
    pub print_timestamps: bool,
    pub print_special: bool,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            n_threads: 4,
            translate: false,
            language: DEFAULT_LANGUAGE.to_string(),
            offset_ms: 0,
            token_timestamps: false,
            max_len: 0,
            split_on_word: false,
            print_realtime: false,
            print_progress: true,
            print_timestamps: true,
            print_special: false,
        }
    }
}

/// One unit of recognized output.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Start time in ticks (10 ms)
    pub t0: i64,

    /// End time in ticks (10 ms)
    pub t1: i64,

    /// Recognized text, including any leading space the engine produced
    pub text: String,

    /// Log-probability of every token that makes up this segment
    pub token_logprobs: Vec<f32>,
}

/// A loaded model, ready to run transcriptions.
///
/// ## Ownership:
/// A context is exclusively owned by one pool slot. While a job runs, the slot
/// lends it to the background execution unit by value and gets it back on join,
/// so implementations only need to be `Send`, never `Sync`.
pub trait InferenceContext: Send + 'static {
    /// Whether the model can transcribe languages other than English.
    fn is_multilingual(&self) -> bool;

    /// Clear the accumulated timing statistics.
    fn reset_timings(&mut self);

    /// Run a full transcription over `samples`, replacing any previous segments.
    fn run(&mut self, params: &InferenceParams, samples: &[f32]) -> Result<()>;

    /// Number of segments produced by the last run.
    fn n_segments(&self) -> usize;

    /// Segment `index` of the last run, in temporal order.
    fn segment(&self, index: usize) -> Option<&Segment>;
}

/// Factory for contexts: the "construct-context" half of the engine contract.
pub trait InferenceEngine: Send + Sync + 'static {
    type Context: InferenceContext;

    /// Load the model at `model_path` into a fresh context.
    fn load_context(&self, model_path: &str, params: &ContextParams) -> Result<Self::Context>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_params_default() {
        let params = ContextParams::default();
        assert!(params.dtw_token_timestamps);
        assert_eq!(params.aheads_preset, AlignmentHeadsPreset::BaseEn);
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("base.en".parse::<AlignmentHeadsPreset>().unwrap(), AlignmentHeadsPreset::BaseEn);
        assert_eq!("LARGE-V3".parse::<AlignmentHeadsPreset>().unwrap(), AlignmentHeadsPreset::LargeV3);
        assert!("huge".parse::<AlignmentHeadsPreset>().is_err());
        assert_eq!(AlignmentHeadsPreset::MediumEn.to_string(), "medium.en");
    }

    #[test]
    fn test_inference_params_default() {
        let params = InferenceParams::default();
        assert_eq!(params.language, "en");
        assert_eq!(params.max_len, 0);
        assert!(!params.token_timestamps);
        assert!(params.print_progress);
    }
}
