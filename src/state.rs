//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and every call socket.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers and sockets hold a reference)
//! - **RwLock**: Many readers OR one writer
//! - **T**: The actual data being protected
//!
//! ### Cheap Clone
//! `AppState` is cloned into every socket actor and pipeline task. Every field
//! is either an `Arc` or a handle that is itself reference counted, so a clone
//! never copies the data.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration
//! - **metrics**: request, endpoint and call counters
//! - **audio_cache**: synthesized replies, bounded and TTL-evicted
//! - **speech**: the collaborator adapters shared by all calls

use crate::audio::cache::AudioCache;
use crate::config::AppConfig;
use crate::speech::SpeechServices;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance and call metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Synthesized audio kept for `GET /api/v1/audio/{id}`
    pub audio_cache: AudioCache,

    /// Transcription, response and synthesis collaborators
    pub speech: SpeechServices,
}

/// Metrics collected across all requests and calls.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Media stream sockets currently open
    pub active_sessions: u32,

    /// Media stream sockets opened since server start
    pub total_calls: u64,

    /// Segments that produced non-empty text
    pub segments_transcribed: u64,

    /// Replies synthesized and played back
    pub responses_spoken: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create state from configuration and the already-built collaborators.
    pub fn new(config: AppConfig, speech: SpeechServices) -> Self {
        let audio_cache = AudioCache::new(
            config.cache.max_entries,
            Duration::from_secs(config.cache.ttl_secs),
        );

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            audio_cache,
            speech,
        }
    }

    // A writer that panicked mid-update can only have left plain counters or
    // an already validated config behind, so a poisoned lock is still usable.
    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record timing for one request to `endpoint` (e.g. "GET /health").
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a session slot. Fails when `max_concurrent_sessions` are open.
    ///
    /// Claiming a slot is not a call yet: the upgrade may still be refused.
    pub fn try_start_session(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.write_metrics();

        if metrics.active_sessions as usize >= limit {
            return false;
        }

        metrics.active_sessions += 1;
        true
    }

    /// Count a call whose WebSocket upgrade succeeded.
    pub fn record_call_started(&self) {
        self.write_metrics().total_calls += 1;
    }

    /// Release a session slot. Never underflows.
    pub fn end_session(&self) {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn increment_segments_transcribed(&self) {
        self.write_metrics().segments_transcribed += 1;
    }

    pub fn increment_responses_spoken(&self) {
        self.write_metrics().responses_spoken += 1;
    }

    /// Copy of the current metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.read_metrics();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            total_calls: metrics.total_calls,
            segments_transcribed: metrics.segments_transcribed,
            responses_spoken: metrics.responses_spoken,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
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

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
