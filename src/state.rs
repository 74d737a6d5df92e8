//! # Application State Management
//!
//! Shared state handed to every HTTP request handler.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many HTTP handlers and the session
//!   controller hold a reference to the same config)
//! - **RwLock**: Many readers or one writer
//! - **T**: The actual data being protected
//!
//! ### Cheap clones
//! `AppState` is cloned into every actix worker. Every field is either an
//! `Arc`, a handle that wraps one, or `Copy`, so a clone is a few pointer bumps.

use crate::config::AppConfig;
use crate::session::SessionController;
use crate::voice::LoopbackConnector;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime). The session
    /// controller reads the same lock, so updates apply to the next session.
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP metrics, updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Owner of every guild's voice session
    pub controller: SessionController,

    /// The in-process voice transport, for capture injection and playback export
    pub loopback: Arc<LoopbackConnector>,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Key: "METHOD /route/{pattern}"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        controller: SessionController,
        loopback: Arc<LoopbackConnector>,
    ) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            controller,
            loopback,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
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
    /// ## HashMap operations:
    /// The first time we see an endpoint, `.entry().or_default()` creates a
    /// zeroed EndpointMetric; later requests update it in place.
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
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SharedConfigProvider;
    use std::time::Duration;
    use tokio::runtime::Handle;

    /// State wired to the loopback transport on the current runtime.
    pub(crate) fn test_state(config: AppConfig) -> AppState {
        let config = Arc::new(RwLock::new(config));
        let loopback = Arc::new(LoopbackConnector::new(Duration::ZERO, 5));
        let controller = SessionController::new(
            Handle::current(),
            loopback.clone(),
            Arc::new(SharedConfigProvider::new(config.clone())),
        );
        AppState::new(config, controller, loopback)
    }

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let state = test_state(AppConfig::default());
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert!((metrics.error_rate() - 0.5).abs() < f64::EPSILON);

        let health = &metrics.endpoint_metrics["GET /health"];
        assert!((health.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((health.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_config_update_is_rejected() {
        let state = test_state(AppConfig::default());
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 0;

        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 10);
    }
}
