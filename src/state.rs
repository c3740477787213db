//! # Application State Management
//!
//! Shared state for the relay process. Per-connection Pairing state lives in
//! each connection's actor and is never shared; the only cross-connection
//! mutable state is the aggregate counters kept here, guarded by
//! `Arc<RwLock<...>>` so request handlers and WebSocket actors can update
//! them concurrently.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all HTTP request handlers and relay connections.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (runtime tunables can be updated)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay counters, updated by middleware and connection actors
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// When the process started; never changes, so no lock needed
    pub start_time: Instant,
}

/// Counters describing relay activity since process start.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total HTTP requests processed
    pub request_count: u64,

    /// Total HTTP errors returned
    pub error_count: u64,

    /// Inbound WebSocket connections currently open
    pub active_connections: u32,

    /// Pairings that reached the forwarding state
    pub pairings_opened: u64,

    /// Outbound connections that failed to open or dropped with an error
    pub upstream_failures: u64,

    /// Per-endpoint request statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration. Cloning releases the lock
    /// immediately; AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record a completed request against its endpoint's statistics.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// An inbound WebSocket connection was accepted.
    pub fn connection_opened(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_connections += 1;
    }

    /// An inbound WebSocket connection closed. Guarded against underflow so
    /// unbalanced teardown paths cannot panic the counter.
    pub fn connection_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    /// A Pairing reached the forwarding state.
    pub fn pairing_opened(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.pairings_opened += 1;
    }

    /// An upstream connection failed to open or dropped with an error.
    pub fn upstream_failure(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.upstream_failures += 1;
    }

    /// Consistent copy of the counters for the metrics endpoint.
    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        let metrics = self.metrics.read().unwrap();
        RelayMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_connections: metrics.active_connections,
            pairings_opened: metrics.pairings_opened,
            upstream_failures: metrics.upstream_failures,
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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let state = AppState::new(AppConfig::default());

        state.connection_opened();
        state.connection_opened();
        state.connection_closed();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn test_connection_close_never_underflows() {
        let state = AppState::new(AppConfig::default());

        state.connection_closed();
        state.connection_closed();

        assert_eq!(state.get_metrics_snapshot().active_connections, 0);
    }

    #[test]
    fn test_pairing_and_failure_counters() {
        let state = AppState::new(AppConfig::default());

        state.pairing_opened();
        state.upstream_failure();
        state.pairing_opened();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.pairings_opened, 2);
        assert_eq!(snapshot.upstream_failures, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());

        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = snapshot.endpoint_metrics.get("GET /health").unwrap();
        assert_eq!(metric.request_count, 2);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = AppState::new(AppConfig::default());

        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());

        // Existing config untouched
        assert_eq!(state.get_config().server.port, 3001);
    }
}
