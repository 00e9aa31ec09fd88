//! Operator self-health for the kestrel broker operator
//!
//! The operator implements [`HealthMonitor`]; [`routes::monitoring_routes`]
//! serves it as liveness, readiness, a detailed check report and reconcile
//! counters in Prometheus text format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
}

impl HealthStatus {
    /// Degraded still serves traffic
    pub fn is_serving(&self) -> bool {
        !matches!(self, HealthStatus::Down)
    }
}

/// Outcome of one named self-check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Reconcile loop counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorMetrics {
    pub timestamp: DateTime<Utc>,
    pub reconciliations_total: u64,
    pub reconciliations_failed: u64,
    pub conflicts_total: u64,
    pub last_reconcile_duration_ms: u64,
    pub watched_brokers: u64,
    pub uptime_seconds: u64,
}

impl OperatorMetrics {
    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let samples: [(&str, &str, &str, u64); 6] = [
            ("kestrel_reconciliations_total", "counter", "Broker reconcile passes", self.reconciliations_total),
            ("kestrel_reconciliations_failed_total", "counter", "Broker reconcile passes that returned an error", self.reconciliations_failed),
            ("kestrel_conflicts_total", "counter", "Optimistic concurrency conflicts", self.conflicts_total),
            ("kestrel_last_reconcile_duration_ms", "gauge", "Duration of the most recent pass", self.last_reconcile_duration_ms),
            ("kestrel_watched_brokers", "gauge", "Broker resources visible to the operator", self.watched_brokers),
            ("kestrel_uptime_seconds", "gauge", "Seconds since the operator started", self.uptime_seconds),
        ];
        let mut out = String::new();
        for (name, kind, help, value) in samples {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}

#[async_trait::async_trait]
pub trait HealthMonitor: Send + Sync + 'static {
    async fn get_overall_health(&self) -> HealthStatus;
    async fn run_health_checks(&self) -> Vec<HealthCheck>;
    async fn get_metrics(&self) -> OperatorMetrics;

    /// Readiness; defaults to overall health
    async fn is_ready(&self) -> bool {
        self.get_overall_health().await.is_serving()
    }
}

/// Down wins over Degraded, Degraded wins over Up
pub fn overall_status(checks: &[HealthCheck]) -> HealthStatus {
    checks.iter().fold(HealthStatus::Up, |acc, check| match (acc, check.status) {
        (HealthStatus::Down, _) | (_, HealthStatus::Down) => HealthStatus::Down,
        (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
        _ => HealthStatus::Up,
    })
}

/// Body of `/health/detailed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        Self {
            status: overall_status(&checks),
            checks,
        }
    }
}

pub mod routes {
    use super::*;
    use axum::extract::State;
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Json};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;

    type Monitor = State<Arc<dyn HealthMonitor>>;

    pub fn monitoring_routes(monitor: Arc<dyn HealthMonitor>) -> Router {
        Router::new()
            .route("/health", get(liveness))
            .route("/ready", get(readiness))
            .route("/health/detailed", get(report))
            .route("/metrics", get(prometheus))
            .with_state(monitor)
    }

    fn status_code(serving: bool) -> StatusCode {
        if serving {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }

    async fn liveness(State(monitor): Monitor) -> impl IntoResponse {
        let status = monitor.get_overall_health().await;
        (status_code(status.is_serving()), Json(status))
    }

    async fn readiness(State(monitor): Monitor) -> impl IntoResponse {
        status_code(monitor.is_ready().await)
    }

    async fn report(State(monitor): Monitor) -> impl IntoResponse {
        let report = HealthReport::from_checks(monitor.run_health_checks().await);
        (status_code(report.status.is_serving()), Json(report))
    }

    async fn prometheus(State(monitor): Monitor) -> impl IntoResponse {
        let metrics = monitor.get_metrics().await;
        (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.to_prometheus(),
        )
    }
}
