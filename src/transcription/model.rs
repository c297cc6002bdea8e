//! # Whisper Model Backend
//!
//! The production [`InferenceEngine`]: Whisper checkpoints loaded with Candle-rs.
//!
//! ## Model Paths:
//! - **Directory**: must contain `config.json`, `tokenizer.json` and `model.safetensors`
//! - **`*.safetensors` file**: config and tokenizer are read from the same directory
//! - **`hf:<repo>`**: files are fetched from the HuggingFace Hub (cached locally)
//!
//! ## Decoding Pipeline:
//! 1. Log-mel spectrogram over the whole input (Slaney filterbank, padded by 30 s)
//! 2. 30 second windows, each encoded once
//! 3. Greedy decoding with timestamp tokens, which delimit segments
//! 4. Optional splitting of segments into word or token sized pieces, with times
//!    interpolated across the segment
//!
//! Each run executes inside a dedicated rayon pool sized to the job's thread count,
//! so Candle's CPU kernels never use more threads than the job was granted.

use crate::transcription::engine::{
    ContextParams, InferenceContext, InferenceEngine, InferenceParams, Segment, SAMPLE_RATE,
};
use anyhow::{anyhow, Context as _, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokenizers::Tokenizer;

/// Vocabulary size from which a checkpoint is multilingual.
const MULTILINGUAL_VOCAB_SIZE: usize = 51865;

/// Engine ticks (10 ms) per timestamp token step (20 ms).
const TICKS_PER_TIMESTAMP: i64 = 2;

/// Latest timestamp allowed as the first token of a window (1 s).
const MAX_INITIAL_TIMESTAMP: u32 = 50;

const HF_PREFIX: &str = "hf:";

/// Loads Whisper checkpoints onto one Candle device.
#[derive(Debug, Clone)]
pub struct CandleEngine {
    device: Device,
}

impl CandleEngine {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl InferenceEngine for CandleEngine {
    type Context = WhisperModel;

    fn load_context(&self, model_path: &str, params: &ContextParams) -> Result<WhisperModel> {
        WhisperModel::load(model_path, params, self.device.clone())
    }
}

/// Files making up one checkpoint.
#[derive(Debug, Clone, PartialEq)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    fn in_dir(dir: &Path, weights: PathBuf) -> Self {
        Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights,
        }
    }

    /// Resolve a model path to concrete files on disk.
    fn resolve(model_path: &str) -> Result<Self> {
        if let Some(repo) = model_path.strip_prefix(HF_PREFIX) {
            return Self::fetch(repo);
        }

        let path = Path::new(model_path);
        let files = if path.is_dir() {
            Self::in_dir(path, path.join("model.safetensors"))
        } else if path.extension().map_or(false, |ext| ext == "safetensors") {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            Self::in_dir(dir, path.to_path_buf())
        } else if path.exists() {
            return Err(anyhow!("Unsupported model format (expected safetensors): {}", model_path));
        } else {
            return Err(anyhow!("Model path does not exist: {}", model_path));
        };

        for file in [&files.config, &files.tokenizer, &files.weights] {
            if !file.is_file() {
                return Err(anyhow!("Missing model file: {}", file.display()));
            }
        }
        Ok(files)
    }

    /// Download (or reuse cached) checkpoint files from the HuggingFace Hub.
    fn fetch(repo_name: &str) -> Result<Self> {
        use hf_hub::api::sync::ApiBuilder;

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            tracing::debug!("Setting HF token (length: {})", token.len());
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        let api = builder.build().context("Failed to create HuggingFace API client")?;
        let repo = api.model(repo_name.to_string());
        tracing::info!("Fetching model files from {}", repo_name);

        let get = |file: &str| {
            repo.get(file)
                .with_context(|| format!("Failed to download {} from {}", file, repo_name))
        };
        Ok(Self {
            config: get("config.json")?,
            tokenizer: get("tokenizer.json")?,
            weights: get("model.safetensors")?,
        })
    }
}

/// Ids of the special tokens the decoder needs.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    translate: u32,
    no_timestamps: u32,
    /// First timestamp token (`<|0.00|>`)
    timestamp_begin: u32,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", token))
        };
        let no_timestamps = id(m::NO_TIMESTAMPS_TOKEN)?;
        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            translate: id(m::TRANSLATE_TOKEN)?,
            no_timestamps,
            timestamp_begin: no_timestamps + 1,
        })
    }

    fn is_timestamp(&self, token: u32) -> bool {
        token >= self.timestamp_begin
    }

    /// Language tokens sit between the start-of-transcript and translate tokens.
    fn language_range(&self) -> std::ops::Range<u32> {
        self.sot + 1..self.translate
    }
}

/// Accumulated time spent per decoding stage since the last reset.
#[derive(Debug, Clone, Copy, Default)]
struct Timings {
    mel: Duration,
    encode: Duration,
    decode: Duration,
    windows: usize,
}

/// A loaded Whisper checkpoint plus the segments of its last run.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    /// Tokens the checkpoint never wants sampled, indexed by token id
    suppress: Vec<bool>,
    timings: Timings,
    segments: Vec<Segment>,
}

impl WhisperModel {
    /// Load a checkpoint from `model_path` onto `device`.
    pub fn load(model_path: &str, params: &ContextParams, device: Device) -> Result<Self> {
        let started = Instant::now();
        let files = ModelFiles::resolve(model_path)?;
        tracing::debug!("Resolved model files: {:?}", files);

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("Failed to open {}", files.config.display()))?,
        )
        .context("Invalid model config")?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let mut suppress = vec![false; config.vocab_size];
        for &token in &config.suppress_tokens {
            if let Some(flag) = suppress.get_mut(token as usize) {
                *flag = true;
            }
        }

        let mel_filters = mel_filterbank(config.num_mel_bins, m::N_FFT, SAMPLE_RATE as f32);

        if params.dtw_token_timestamps {
            tracing::debug!(
                "Token timestamps interpolated from timestamp tokens (alignment preset {})",
                params.aheads_preset
            );
        }
        tracing::info!(
            "Whisper model loaded from {} in {:.2}s (vocab {}, {} mel bins, multilingual: {})",
            model_path,
            started.elapsed().as_secs_f64(),
            config.vocab_size,
            config.num_mel_bins,
            config.vocab_size >= MULTILINGUAL_VOCAB_SIZE
        );

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            tokens,
            mel_filters,
            suppress,
            timings: Timings::default(),
            segments: Vec::new(),
        })
    }

    /// Decoder prompt: start of transcript, language and task.
    fn prompt(&mut self, params: &InferenceParams, features: &Tensor) -> Result<Vec<u32>> {
        let mut prompt = vec![self.tokens.sot];
        if !self.is_multilingual() {
            if params.translate {
                tracing::warn!("Model is English-only; translate request ignored");
            }
            prompt.push(self.tokens.transcribe);
            return Ok(prompt);
        }

        let language = match self.tokenizer.token_to_id(&format!("<|{}|>", params.language)) {
            Some(token) if self.tokens.language_range().contains(&token) => token,
            _ => {
                let detected = self.detect_language(features)?;
                tracing::warn!(
                    "Unknown language '{}', using detected language {}",
                    params.language,
                    self.tokenizer.id_to_token(detected).unwrap_or_default()
                );
                detected
            }
        };
        prompt.push(language);
        prompt.push(if params.translate { self.tokens.translate } else { self.tokens.transcribe });
        Ok(prompt)
    }

    /// Most likely language token for the encoded window.
    fn detect_language(&mut self, features: &Tensor) -> Result<u32> {
        let logits = self.next_logits(&[self.tokens.sot], features, true)?;
        let range = self.tokens.language_range();
        let best = range
            .clone()
            .filter(|&token| (token as usize) < logits.len())
            .max_by(|&a, &b| logits[a as usize].total_cmp(&logits[b as usize]))
            .unwrap_or(range.start);
        Ok(best)
    }

    /// Logits for the token following `tokens`.
    fn next_logits(&mut self, tokens: &[u32], features: &Tensor, flush: bool) -> Result<Vec<f32>> {
        let tokens_t = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let ys = self.model.decoder.forward(&tokens_t, features, flush)?;
        let (_, seq_len, _) = ys.dims3()?;
        let logits = self
            .model
            .decoder
            .final_linear(&ys.i((..1, seq_len - 1..))?)?
            .i(0)?
            .i(0)?;
        Ok(logits.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }

    /// Greedy decode of one encoded window. Returns sampled tokens with their log-probabilities.
    fn decode_window(&mut self, prompt: &[u32], features: &Tensor) -> Result<Vec<(u32, f32)>> {
        let mut tokens = prompt.to_vec();
        let mut sampled: Vec<(u32, f32)> = Vec::new();
        let sample_len = self.config.max_target_positions / 2;

        for i in 0..sample_len {
            let mut logits = self.next_logits(&tokens, features, i == 0)?;
            for (logit, &suppressed) in logits.iter_mut().zip(&self.suppress) {
                if suppressed {
                    *logit = f32::NEG_INFINITY;
                }
            }
            let history: Vec<u32> = sampled.iter().map(|(token, _)| *token).collect();
            apply_token_rules(&mut logits, &history, &self.tokens);

            let logprobs = log_softmax(&logits);
            let next = argmax(&logits);
            if next == self.tokens.eot {
                break;
            }
            if is_repetitive(&history, next) {
                tracing::debug!("Stopping repetitive decode after {} tokens", history.len());
                break;
            }

            tokens.push(next);
            sampled.push((next, logprobs[next as usize]));
        }
        Ok(sampled)
    }

    /// Turn raw segments into output segments, splitting them when asked to.
    fn finish_segments(&self, raw: Vec<RawSegment>, params: &InferenceParams) -> Result<Vec<Segment>> {
        let mut segments = Vec::with_capacity(raw.len());
        for segment in raw {
            if params.max_len > 0 {
                let pieces = segment
                    .tokens
                    .iter()
                    .map(|&(token, logprob)| -> Result<(String, f32)> {
                        let text = self
                            .tokenizer
                            .decode(&[token], false)
                            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
                        Ok((text, logprob))
                    })
                    .collect::<Result<Vec<_>>>()?;
                segments.extend(split_segment(segment.t0, segment.t1, pieces, params.max_len, params.split_on_word));
            } else {
                let ids: Vec<u32> = segment.tokens.iter().map(|(token, _)| *token).collect();
                let text = self
                    .tokenizer
                    .decode(&ids, false)
                    .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
                segments.push(Segment {
                    t0: segment.t0,
                    t1: segment.t1,
                    text,
                    token_logprobs: segment.tokens.iter().map(|(_, logprob)| *logprob).collect(),
                });
            }
        }
        Ok(segments)
    }

    fn transcribe(&mut self, params: &InferenceParams, samples: &[f32]) -> Result<Vec<Segment>> {
        let content_frames = samples.len() / m::HOP_LENGTH;
        let mut seek = (params.offset_ms as usize / 10).min(content_frames);
        if seek >= content_frames {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let mut padded = Vec::with_capacity(samples.len() + m::N_SAMPLES);
        padded.extend_from_slice(samples);
        padded.resize(samples.len() + m::N_SAMPLES, 0.0);
        let mel = m::audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let mel_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_frames), &self.device)?;
        self.timings.mel += started.elapsed();

        let mut prompt: Option<Vec<u32>> = None;
        let mut segments = Vec::new();

        while seek < content_frames {
            let window_frames = m::N_FRAMES.min(mel_frames - seek);
            let window = mel.narrow(2, seek, window_frames)?;

            let encode_started = Instant::now();
            let features = self.model.encoder.forward(&window, true)?;
            self.timings.encode += encode_started.elapsed();

            let decode_started = Instant::now();
            let window_prompt = match prompt.take() {
                Some(prompt) => prompt,
                None => self.prompt(params, &features)?,
            };
            let sampled = self.decode_window(&window_prompt, &features)?;
            prompt = Some(window_prompt);

            let window_end = seek + window_frames.min(content_frames - seek);
            let raw = assemble_segments(&sampled, &self.tokens, seek as i64, window_end as i64);
            let finished = self.finish_segments(raw, params)?;
            self.timings.decode += decode_started.elapsed();
            self.timings.windows += 1;

            if params.print_realtime {
                for segment in &finished {
                    tracing::info!("[{} -> {}] {}", segment.t0, segment.t1, segment.text);
                }
            }
            segments.extend(finished);

            seek += window_frames;
            if params.print_progress {
                tracing::debug!("Transcription progress: {}%", (seek.min(content_frames) * 100) / content_frames);
            }
        }

        Ok(segments)
    }
}

impl InferenceContext for WhisperModel {
    fn is_multilingual(&self) -> bool {
        self.config.vocab_size >= MULTILINGUAL_VOCAB_SIZE
    }

    fn reset_timings(&mut self) {
        self.timings = Timings::default();
    }

    fn run(&mut self, params: &InferenceParams, samples: &[f32]) -> Result<()> {
        self.segments.clear();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.n_threads.max(1))
            .thread_name(|i| format!("whisper-compute-{}", i))
            .build()
            .context("Failed to create inference thread pool")?;

        let segments = pool.install(|| self.transcribe(params, samples))?;
        self.segments = segments;

        let t = self.timings;
        tracing::debug!(
            "Timings: mel {:.1}ms, encode {:.1}ms, decode {:.1}ms over {} window(s)",
            t.mel.as_secs_f64() * 1000.0,
            t.encode.as_secs_f64() * 1000.0,
            t.decode.as_secs_f64() * 1000.0,
            t.windows
        );
        Ok(())
    }

    fn n_segments(&self) -> usize {
        self.segments.len()
    }

    fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }
}

/// Segment delimited by timestamp tokens, before text decoding.
#[derive(Debug, Clone, PartialEq)]
struct RawSegment {
    t0: i64,
    t1: i64,
    tokens: Vec<(u32, f32)>,
}

/// Group sampled tokens into segments using the timestamp tokens between them.
///
/// Times are in ticks, offset by `seek`. Text left open at the end of the window
/// is closed at `window_end`.
fn assemble_segments(sampled: &[(u32, f32)], tokens: &SpecialTokens, seek: i64, window_end: i64) -> Vec<RawSegment> {
    let mut segments = Vec::new();
    let mut start: Option<i64> = None;
    let mut last_time = seek;
    let mut text: Vec<(u32, f32)> = Vec::new();

    for &(token, logprob) in sampled {
        if tokens.is_timestamp(token) {
            let time = seek + (token - tokens.timestamp_begin) as i64 * TICKS_PER_TIMESTAMP;
            if text.is_empty() {
                start = Some(time);
            } else {
                segments.push(RawSegment {
                    t0: start.unwrap_or(last_time),
                    t1: time,
                    tokens: std::mem::take(&mut text),
                });
                start = None;
            }
            last_time = time;
        } else if token < tokens.eot {
            text.push((token, logprob));
        }
    }

    if !text.is_empty() {
        segments.push(RawSegment {
            t0: start.unwrap_or(last_time),
            t1: window_end.max(last_time),
            tokens: text,
        });
    }
    segments
}

/// Split one segment into pieces of at most `max_len` characters.
///
/// With `split_on_word` a piece boundary only falls before a token starting with
/// a space; otherwise any token boundary will do. A piece longer than `max_len`
/// on its own is kept whole. Times are interpolated by token position.
fn split_segment(t0: i64, t1: i64, tokens: Vec<(String, f32)>, max_len: usize, split_on_word: bool) -> Vec<Segment> {
    let n_tokens = tokens.len() as i64;
    let time_at = |index: usize| {
        if n_tokens == 0 {
            t0
        } else {
            t0 + (t1 - t0) * index as i64 / n_tokens
        }
    };

    // Units are (first token index, text, logprobs): words or single tokens.
    let mut units: Vec<(usize, String, Vec<f32>)> = Vec::new();
    for (index, (text, logprob)) in tokens.into_iter().enumerate() {
        let starts_unit = !split_on_word || text.starts_with(' ') || units.is_empty();
        match units.last_mut() {
            Some((_, unit_text, logprobs)) if !starts_unit => {
                unit_text.push_str(&text);
                logprobs.push(logprob);
            }
            _ => units.push((index, text, vec![logprob])),
        }
    }

    let mut pieces: Vec<Segment> = Vec::new();
    for (first_token, text, logprobs) in &units {
        let fits = pieces
            .last()
            .map_or(false, |piece| piece.text.chars().count() + text.chars().count() <= max_len);
        if fits {
            if let Some(piece) = pieces.last_mut() {
                piece.text.push_str(text);
                piece.token_logprobs.extend(logprobs);
            }
        } else {
            if let Some(piece) = pieces.last_mut() {
                piece.t1 = time_at(*first_token);
            }
            pieces.push(Segment {
                t0: time_at(*first_token),
                t1,
                text: text.clone(),
                token_logprobs: logprobs.clone(),
            });
        }
    }
    pieces
}

/// Timestamp grammar for greedy decoding.
///
/// - the first sampled token is a timestamp no later than one second
/// - timestamps come in pairs, so after a closing timestamp text must follow,
///   and after text plus one timestamp another timestamp (or the end) must follow
/// - timestamps never go backwards
/// - control tokens from start-of-transcript to no-timestamps are never sampled
fn apply_token_rules(logits: &mut [f32], history: &[u32], tokens: &SpecialTokens) {
    let ts_begin = tokens.timestamp_begin as usize;

    mask(logits, tokens.sot as usize..tokens.no_timestamps as usize + 1);

    if history.is_empty() {
        mask(logits, 0..ts_begin);
        mask(logits, ts_begin + MAX_INITIAL_TIMESTAMP as usize + 1..logits.len());
        return;
    }

    let last_is_ts = history.last().map_or(false, |&t| tokens.is_timestamp(t));
    let penultimate_is_ts = history.len() < 2 || tokens.is_timestamp(history[history.len() - 2]);
    if last_is_ts {
        if penultimate_is_ts {
            mask(logits, ts_begin..logits.len());
        } else {
            mask(logits, 0..tokens.eot as usize);
        }
    }

    if let Some(&last_ts) = history.iter().rev().find(|&&t| tokens.is_timestamp(t)) {
        mask(logits, ts_begin..last_ts as usize);
    }
}

fn mask(logits: &mut [f32], range: std::ops::Range<usize>) {
    let end = range.end.min(logits.len());
    for logit in &mut logits[range.start.min(end)..end] {
        *logit = f32::NEG_INFINITY;
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    let log_sum = max + sum.ln();
    logits.iter().map(|&l| l - log_sum).collect()
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map_or(0, |(index, _)| index as u32)
}

/// Check if token sequence is repetitive.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() < 6 {
        return false;
    }

    if tokens[tokens.len() - 3..] == [new_token, new_token, new_token] {
        return true;
    }

    let last_3 = &tokens[tokens.len() - 3..];
    let prev_3 = &tokens[tokens.len() - 6..tokens.len() - 3];
    last_3 == prev_3
}

fn hertz_to_mel(hz: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f32.ln() / 27.0;

    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hertz(mel: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f32.ln() / 27.0;

    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-normalized mel filterbank, laid out as `[n_mels][n_fft / 2 + 1]`.
fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: f32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..n_freqs).map(|i| i as f32 * sample_rate / n_fft as f32).collect();

    let mel_max = hertz_to_mel(sample_rate / 2.0);
    let filter_freqs: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hertz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel_idx in 0..n_mels {
        let lower = filter_freqs[mel_idx];
        let center = filter_freqs[mel_idx + 1];
        let upper = filter_freqs[mel_idx + 2];
        let norm = 2.0 / (upper - lower);

        for (freq_idx, &freq) in fft_freqs.iter().enumerate() {
            let down = (freq - lower) / (center - lower);
            let up = (upper - freq) / (upper - center);
            filters[mel_idx * n_freqs + freq_idx] = down.min(up).max(0.0) * norm;
        }
    }
    filters
}
