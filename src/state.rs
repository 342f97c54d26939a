//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Concepts:
//!
//! ### Arc<RwLock<T>> for configuration and metrics
//! - many requests read the config at once, a `PUT /config` writes it
//! - every request updates the metrics through the middleware
//! - `parking_lot` locks do not poison, so a panicking handler cannot wedge
//!   the server
//!
//! ### Arc<SessionManager>
//! - the session registry is built once here and shared by the HTTP API,
//!   the WebSocket actors and the idle cleanup task
//! - it does its own locking (see `session::manager`)
//!
//! ### Arc<DownstreamPipeline>
//! - stateless; cloned into each spawned turn task

use crate::config::AppConfig;
use crate::downstream::DownstreamPipeline;
use crate::session::SessionManager;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP and connection metrics, updated by middleware and actors
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Registry of live conversations
    pub sessions: Arc<SessionManager>,

    /// STT → response → TTS collaborators
    pub pipeline: Arc<DownstreamPipeline>,
}

/// Metrics collected across all HTTP requests and WebSocket connections.
///
/// ## Why these metrics matter:
/// - **request_count** / **error_count**: load and reliability
/// - **active_connections**: open conversation sockets
/// - **endpoint_metrics**: per-route latency, keyed by route pattern so
///   session ids in paths do not create one entry per session
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_connections: u32,
    pub total_connections: u64,
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
    /// Build state with the loopback downstream collaborators.
    pub fn new(config: AppConfig) -> Self {
        let pipeline = DownstreamPipeline::loopback(config.audio.sample_rate);
        Self::with_pipeline(config, pipeline)
    }

    pub fn with_pipeline(config: AppConfig, pipeline: DownstreamPipeline) -> Self {
        let sessions = SessionManager::new(
            config.performance.max_concurrent_sessions,
            config.realtime_config(),
        );
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions: Arc::new(sessions),
            pipeline: Arc::new(pipeline),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Session tuning is pushed to the registry, so only sessions created
    /// afterwards see the new values. The session limit is fixed at startup.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.sessions.set_default_config(new_config.realtime_config());
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: method plus route pattern (e.g. "GET /api/v1/sessions/{session_id}")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Called when a conversation socket opens.
    pub fn connection_opened(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_connections += 1;
        metrics.total_connections += 1;
    }

    /// Called when a conversation socket closes. Never underflows.
    pub fn connection_closed(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
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

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
