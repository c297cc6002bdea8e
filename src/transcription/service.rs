//! # Transcription Service
//!
//! The single entry point for clients. Composes the context pool, the job
//! builder, the worker coordinator and the result streamer, and enforces the
//! rule the whole design rests on:
//!
//! > Before any operation touches pool state, the previous job is joined.
//!
//! ## Operations:
//! - **acquire**: load a model into the first empty slot
//! - **release**: destroy the context behind a handle
//! - **dispatch**: start one background job and return immediately
//! - **shutdown**: drain the worker and destroy every context (also run on drop)
//!
//! Each operation comes in two flavours: a typed one (`acquire`, `release`,
//! `dispatch`) and one speaking the plain integer protocol (`acquire_raw`,
//! `release_raw`, `dispatch_raw`) where failures collapse to sentinels.

use crate::error::{AcquireError, DispatchError};
use crate::transcription::engine::{ContextParams, InferenceEngine};
use crate::transcription::job::{JobBuilder, JobRequest};
use crate::transcription::pool::{ContextHandle, ContextPool};
use crate::transcription::streamer::ResultStreamer;
use crate::transcription::worker::{JoinOutcome, WorkerCoordinator, WorkerState};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Point-in-time view of the pool, for health and status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub occupied: usize,
    pub handles: Vec<ContextHandle>,
    pub worker: WorkerState,
    pub running_handle: Option<ContextHandle>,
    pub hardware_concurrency: usize,
}

/// Counters kept across the service's lifetime.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServiceMetrics {
    pub contexts_loaded: u64,
    pub load_failures: u64,
    pub pool_full_rejections: u64,
    pub contexts_released: u64,
    pub jobs_dispatched: u64,
    pub jobs_rejected: u64,
    pub contexts_lost: u64,
}

pub struct TranscriptionService<E: InferenceEngine> {
    engine: E,
    context_params: ContextParams,
    pool: ContextPool<E::Context>,
    worker: WorkerCoordinator<E::Context>,
    builder: JobBuilder,
    streamer: ResultStreamer,
    metrics: ServiceMetrics,
}

impl<E: InferenceEngine> TranscriptionService<E> {
    /// Create a service with `capacity` empty slots.
    ///
    /// ## Parameters:
    /// - **engine**: Factory for inference contexts
    /// - **capacity**: Number of pool slots, fixed for the service's lifetime
    /// - **context_params**: Configuration every context is constructed with
    /// - **streamer**: Where job output is written
    pub fn new(engine: E, capacity: usize, context_params: ContextParams, streamer: ResultStreamer) -> Self {
        info!(capacity, preset = %context_params.aheads_preset, "Transcription service created");
        Self {
            engine,
            context_params,
            pool: ContextPool::new(capacity),
            worker: WorkerCoordinator::new(),
            builder: JobBuilder::new(),
            streamer,
            metrics: ServiceMetrics::default(),
        }
    }

    /// Replace the job builder (fixes the hardware concurrency the thread policy sees).
    pub fn with_job_builder(mut self, builder: JobBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Join the outstanding job and settle its context back into the pool.
    fn drain_worker(&mut self) {
        match self.worker.join() {
            Some(JoinOutcome::Returned { handle, context }) => {
                if let Some(orphan) = self.pool.restore(handle, context) {
                    warn!(handle = %handle, "Slot no longer expects its context; destroying it");
                    drop(orphan);
                }
            }
            Some(JoinOutcome::Lost { handle }) => {
                self.metrics.contexts_lost += 1;
                self.pool.forfeit(handle);
                warn!(handle = %handle, "Context lost with its job; slot is empty again");
            }
            None => {}
        }
    }

    /// Load `model_path` into the first empty slot.
    pub fn acquire(&mut self, model_path: &str) -> Result<ContextHandle, AcquireError> {
        self.drain_worker();

        let started = Instant::now();
        let engine = &self.engine;
        let params = &self.context_params;
        let result = self.pool.acquire_with(|| engine.load_context(model_path, params));

        match &result {
            Ok(handle) => {
                self.metrics.contexts_loaded += 1;
                info!(
                    handle = %handle,
                    model = model_path,
                    load_ms = started.elapsed().as_millis() as u64,
                    "Context acquired"
                );
            }
            Err(AcquireError::PoolFull) => {
                self.metrics.pool_full_rejections += 1;
                warn!(model = model_path, capacity = self.pool.capacity(), "Context pool is full");
            }
            Err(AcquireError::LoadFailed(reason)) => {
                self.metrics.load_failures += 1;
                error!(model = model_path, reason = %reason, "Failed to construct context");
            }
        }
        result
    }

    /// Destroy the context behind `handle`. Invalid and stale handles are ignored.
    pub fn release(&mut self, handle: ContextHandle) {
        self.drain_worker();

        match self.pool.release(handle) {
            Some(context) => {
                drop(context);
                self.metrics.contexts_released += 1;
                info!(handle = %handle, "Context released");
            }
            None => debug!(handle = %handle, "Release ignored: handle does not refer to a live context"),
        }
    }

    /// Start a transcription job on `handle` and return without waiting for it.
    pub fn dispatch(&mut self, handle: ContextHandle, request: JobRequest) -> Result<(), DispatchError> {
        self.drain_worker();

        let job = match self.pool.resolve(handle) {
            Ok(context) => self.builder.build(handle, context, request),
            Err(e) => {
                self.metrics.jobs_rejected += 1;
                debug!(handle = %handle, error = %e, "Dispatch rejected");
                return Err(e);
            }
        };

        let context = self.pool.lend(handle)?;
        if let Err(e) = self.worker.start(context, job, self.streamer.clone()) {
            self.pool.forfeit(handle);
            self.metrics.contexts_lost += 1;
            error!(handle = %handle, error = %e, "Failed to start transcription worker");
            return Err(DispatchError::SpawnFailed(e.to_string()));
        }

        self.metrics.jobs_dispatched += 1;
        Ok(())
    }

    /// Join any running job and destroy every live context.
    pub fn shutdown(&mut self) {
        self.drain_worker();

        let contexts = self.pool.drain();
        if !contexts.is_empty() {
            info!(count = contexts.len(), "Destroying live contexts");
        }
        self.metrics.contexts_released += contexts.len() as u64;
        drop(contexts);
    }

    pub fn acquire_raw(&mut self, model_path: &str) -> u64 {
        self.acquire(model_path).map(|handle| handle.raw()).unwrap_or(0)
    }

    pub fn release_raw(&mut self, handle: u64) {
        self.release(ContextHandle::from_raw(handle))
    }

    pub fn dispatch_raw(&mut self, handle: u64, audio: Vec<f32>, language: &str, n_threads: i32, translate: bool) -> i32 {
        let request = JobRequest {
            audio,
            language: language.to_string(),
            n_threads,
            translate,
        };
        match self.dispatch(ContextHandle::from_raw(handle), request) {
            Ok(()) => 0,
            Err(e) => e.status_code(),
        }
    }

    /// Read-only view; does not wait for the running job.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            capacity: self.pool.capacity(),
            occupied: self.pool.occupied(),
            handles: self.pool.handles(),
            worker: self.worker.state(),
            running_handle: self.worker.running_handle(),
            hardware_concurrency: self.builder.hardware_concurrency(),
        }
    }

    pub fn metrics(&self) -> ServiceMetrics {
        self.metrics
    }
}

/// Engine-independent view of a [`TranscriptionService`], for callers that hold
/// the service behind a trait object.
pub trait TranscriptionBackend: Send {
    fn acquire(&mut self, model_path: &str) -> Result<ContextHandle, AcquireError>;
    fn release(&mut self, handle: ContextHandle);
    fn dispatch(&mut self, handle: ContextHandle, request: JobRequest) -> Result<(), DispatchError>;
    fn shutdown(&mut self);
    fn snapshot(&self) -> PoolSnapshot;
    fn metrics(&self) -> ServiceMetrics;
}

impl<E: InferenceEngine> TranscriptionBackend for TranscriptionService<E> {
    fn acquire(&mut self, model_path: &str) -> Result<ContextHandle, AcquireError> {
        TranscriptionService::acquire(self, model_path)
    }

    fn release(&mut self, handle: ContextHandle) {
        TranscriptionService::release(self, handle)
    }

    fn dispatch(&mut self, handle: ContextHandle, request: JobRequest) -> Result<(), DispatchError> {
        TranscriptionService::dispatch(self, handle, request)
    }

    fn shutdown(&mut self) {
        TranscriptionService::shutdown(self)
    }

    fn snapshot(&self) -> PoolSnapshot {
        TranscriptionService::snapshot(self)
    }

    fn metrics(&self) -> ServiceMetrics {
        TranscriptionService::metrics(self)
    }
}

impl<E: InferenceEngine> Drop for TranscriptionService<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
