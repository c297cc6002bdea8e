//! # Worker Coordinator
//!
//! Owns the single background execution unit. At most one unit exists at a
//! time, and every operation that touches pool state joins it first.
//!
//! ## State Machine:
//! ```text
//! Idle --start()--> Running --join()--> Idle
//! ```
//! There is no cancelling state: a started job always runs to completion, and
//! `join` only waits for it.
//!
//! ## Context Ownership:
//! The unit receives its context by value and hands it back as the thread's
//! return value. While the job runs, nothing else can reach that context.

use crate::transcription::engine::InferenceContext;
use crate::transcription::job::Job;
use crate::transcription::pool::ContextHandle;
use crate::transcription::streamer::ResultStreamer;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
}

/// What the unit gives back when it is joined.
struct UnitReturn<C> {
    context: C,
    /// False when the engine panicked; such a context is not reused
    healthy: bool,
}

struct Outstanding<C> {
    handle: ContextHandle,
    unit: JoinHandle<UnitReturn<C>>,
}

/// Result of joining the outstanding unit.
pub enum JoinOutcome<C> {
    /// The job finished and its context can go back to the pool
    Returned { handle: ContextHandle, context: C },
    /// The engine or the unit panicked; the context is gone
    Lost { handle: ContextHandle },
}

pub struct WorkerCoordinator<C> {
    outstanding: Option<Outstanding<C>>,
}

impl<C> Default for WorkerCoordinator<C> {
    fn default() -> Self {
        Self { outstanding: None }
    }
}

impl<C: InferenceContext> WorkerCoordinator<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Running` until the unit has been joined, even if it already finished.
    pub fn state(&self) -> WorkerState {
        match self.outstanding {
            Some(_) => WorkerState::Running,
            None => WorkerState::Idle,
        }
    }

    /// Handle of the context the outstanding unit is working on.
    pub fn running_handle(&self) -> Option<ContextHandle> {
        self.outstanding.as_ref().map(|outstanding| outstanding.handle)
    }

    /// Block until the outstanding unit (if any) finishes.
    pub fn join(&mut self) -> Option<JoinOutcome<C>> {
        let Outstanding { handle, unit } = self.outstanding.take()?;

        debug!(handle = %handle, "Waiting for transcription worker");
        match unit.join() {
            Ok(UnitReturn { context, healthy: true }) => Some(JoinOutcome::Returned { handle, context }),
            Ok(UnitReturn { context, healthy: false }) => {
                drop(context);
                Some(JoinOutcome::Lost { handle })
            }
            Err(_) => {
                error!(handle = %handle, "Transcription worker panicked");
                Some(JoinOutcome::Lost { handle })
            }
        }
    }

    /// Start a unit running `job` on `context`.
    ///
    /// The coordinator must be idle. If the thread cannot be spawned the context
    /// is dropped along with the closure that owned it.
    pub fn start(&mut self, context: C, job: Job, streamer: ResultStreamer) -> std::io::Result<()> {
        debug_assert!(self.outstanding.is_none(), "worker started while a job is outstanding");

        let handle = job.handle;
        let unit = std::thread::Builder::new()
            .name(format!("transcribe-{}", handle))
            .spawn(move || run_unit(context, job, &streamer))?;

        self.outstanding = Some(Outstanding { handle, unit });
        Ok(())
    }
}

/// Body of the background unit: engine run, then result streaming.
fn run_unit<C: InferenceContext>(mut context: C, job: Job, streamer: &ResultStreamer) -> UnitReturn<C> {
    let started = Instant::now();
    let handle = job.handle;

    context.reset_timings();
    let run = panic::catch_unwind(AssertUnwindSafe(|| context.run(&job.params, &job.audio)));

    let healthy = match run {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(handle = %handle, error = %e, "Inference failed");
            true
        }
        Err(_) => {
            error!(handle = %handle, "Inference engine panicked; context will be discarded");
            false
        }
    };

    let streamed = if healthy {
        streamer.stream(&context)
    } else {
        streamer.stream_segments(std::iter::empty())
    };

    match streamed {
        Ok(stats) => {
            info!(
                handle = %handle,
                audio_secs = job.audio_duration_secs(),
                segments = stats.n_segments,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Transcription job finished"
            );
            debug!(
                handle = %handle,
                tokens = stats.n_tokens,
                logprob_min = stats.logprob_min,
                logprob_avg = stats.logprob_avg,
                "Transcription confidence"
            );
        }
        Err(e) => warn!(handle = %handle, error = %e, "Failed to write transcription output"),
    }

    UnitReturn { context, healthy }
}
