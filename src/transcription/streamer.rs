//! # Result Streamer
//!
//! Writes the segments of a finished job to the output stream. The stream is the
//! only place a caller can observe that a job completed and what it produced.
//!
//! ## Output Protocol:
//! ```text
//! !START
//! [00:00:00.000->00:00:01.200]  Hello there.
//! [00:00:01.200->00:00:02.000]  General Kenobi.
//! !DONE
//! ```
//!
//! One line per segment, bracketed by the start and end markers, flushed before
//! the job's execution unit finishes. Segment text is written exactly as the
//! engine produced it.

use crate::transcription::engine::{InferenceContext, Segment};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

pub const START_MARKER: &str = "!START";
pub const DONE_MARKER: &str = "!DONE";

/// Format engine ticks (10 ms) as `HH:MM:SS.mmm`, or `HH:MM:SS,mmm` with `comma`.
pub fn to_timestamp(ticks: i64, comma: bool) -> String {
    let mut msec = ticks * 10;
    let hr = msec / (1000 * 60 * 60);
    msec -= hr * (1000 * 60 * 60);
    let min = msec / (1000 * 60);
    msec -= min * (1000 * 60);
    let sec = msec / 1000;
    msec -= sec * 1000;

    format!(
        "{:02}:{:02}:{:02}{}{:03}",
        hr,
        min,
        sec,
        if comma { "," } else { "." },
        msec
    )
}

/// Token log-probability bookkeeping for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfidenceStats {
    pub n_segments: usize,
    pub n_tokens: usize,
    /// Lowest token log-probability (0.0 when no tokens were produced)
    pub logprob_min: f32,
    /// Mean token log-probability (0.0 when no tokens were produced)
    pub logprob_avg: f32,
}

impl ConfidenceStats {
    fn from_segments<'a>(segments: impl IntoIterator<Item = &'a Segment>) -> Self {
        let mut stats = ConfidenceStats::default();
        let mut logprob_sum = 0.0f32;

        for segment in segments {
            stats.n_segments += 1;
            for &logprob in &segment.token_logprobs {
                stats.logprob_min = if stats.n_tokens == 0 { logprob } else { stats.logprob_min.min(logprob) };
                logprob_sum += logprob;
                stats.n_tokens += 1;
            }
        }

        if stats.n_tokens > 0 {
            stats.logprob_avg = logprob_sum / stats.n_tokens as f32;
        }
        stats
    }
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Handle to the shared output stream.
///
/// Cheap to clone; every clone writes to the same sink. The sink lock is held
/// for a whole job block so two blocks can never interleave.
#[derive(Clone)]
pub struct ResultStreamer {
    sink: Sink,
}

impl ResultStreamer {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Streamer writing to the process' standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write every segment of the context's last run.
    pub fn stream<C: InferenceContext + ?Sized>(&self, context: &C) -> io::Result<ConfidenceStats> {
        let segments = (0..context.n_segments()).filter_map(|i| context.segment(i));
        self.stream_segments(segments)
    }

    /// Write an output block for the given segments, in the order given.
    pub fn stream_segments<'a, I>(&self, segments: I) -> io::Result<ConfidenceStats>
    where
        I: IntoIterator<Item = &'a Segment>,
    {
        let segments: Vec<&Segment> = segments.into_iter().collect();

        // A panic while holding the lock cannot leave the sink half-configured,
        // so a poisoned lock is still usable.
        let mut sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        writeln!(sink, "{}", START_MARKER)?;
        for segment in &segments {
            writeln!(
                sink,
                "[{}->{}] {}",
                to_timestamp(segment.t0, false),
                to_timestamp(segment.t1, false),
                segment.text
            )?;
        }
        writeln!(sink, "{}", DONE_MARKER)?;
        sink.flush()?;

        Ok(ConfidenceStats::from_segments(segments))
    }
}
