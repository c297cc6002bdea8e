//! # Application State Management
//!
//! Shared state handed to every HTTP request handler.
//!
//! ## Locking:
//! - **config**, **metrics**: `Arc<RwLock<T>>`, many readers or one writer
//! - **service**: `Arc<Mutex<..>>`. The transcription service is single-caller by
//!   construction (`&mut self`), so handlers take turns. Handlers lock it from a
//!   blocking thread because acquire and release wait for the running job.
//! - **status**: `Arc<RwLock<ServiceStatus>>`, the pool view published after every
//!   service call. Read-only endpoints use it and never queue on the service lock.
//!
//! A poisoned lock is recovered rather than propagated: every value behind these
//! locks stays consistent between statements.

use crate::config::AppConfig;
use crate::device::DeviceSummary;
use crate::error::{AppError, AppResult};
use crate::transcription::{PoolSnapshot, ServiceMetrics, TranscriptionBackend};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::Instant;

pub type SharedService = Arc<Mutex<Box<dyn TranscriptionBackend>>>;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (runtime-mutable keys only, see `AppConfig::update_from_json`)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// The transcription service behind the `/contexts` endpoints
    pub service: SharedService,

    /// Last published view of the service
    pub status: Arc<RwLock<ServiceStatus>>,

    /// Compute device contexts are loaded onto
    pub device: DeviceSummary,

    pub start_time: Instant,
}

/// Pool snapshot and counters as of the last service call.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub pool: PoolSnapshot,
    pub metrics: ServiceMetrics,
    /// A call holding the service (possibly waiting for a job) was in progress
    /// when this view was read, so it may lag behind by that call
    pub busy: bool,
}

impl ServiceStatus {
    fn of(service: &dyn TranscriptionBackend) -> Self {
        Self {
            pool: service.snapshot(),
            metrics: service.metrics(),
            busy: false,
        }
    }
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, service: Box<dyn TranscriptionBackend>, device: DeviceSummary) -> Self {
        let status = ServiceStatus::of(service.as_ref());
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            service: Arc::new(Mutex::new(service)),
            status: Arc::new(RwLock::new(status)),
            device,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply a partial JSON update to the runtime-mutable configuration keys.
    pub fn update_config(&self, json_str: &str) -> AppResult<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config
            .update_from_json(json_str)
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        Ok(config.clone())
    }

    /// Run `f` with exclusive access to the transcription service.
    ///
    /// Blocks until the service is free; call from a blocking context.
    pub fn with_service<R>(&self, f: impl FnOnce(&mut dyn TranscriptionBackend) -> R) -> R {
        let mut service = self.service.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(service.as_mut());
        self.publish(service.as_ref());
        result
    }

    fn publish(&self, service: &dyn TranscriptionBackend) -> ServiceStatus {
        let status = ServiceStatus::of(service);
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status.clone();
        status
    }

    /// Current pool view without blocking.
    ///
    /// Reads the service directly when it is free; otherwise returns the last
    /// published view marked `busy`.
    pub fn service_status(&self) -> ServiceStatus {
        let service = match self.service.try_lock() {
            Ok(service) => service,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let mut status = self.status.read().unwrap_or_else(PoisonError::into_inner).clone();
                status.busy = true;
                return status;
            }
        };
        self.publish(service.as_ref())
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health", "POST /api/v1/contexts")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
