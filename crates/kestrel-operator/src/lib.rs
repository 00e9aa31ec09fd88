//! # Kestrel Kubernetes Operator
//!
//! Control loop for clustered ActiveMQ Artemis brokers. Converges `Broker`
//! resources into StatefulSets, Services and Secrets, drains condemned
//! instances before a scale-down and reports progress through conditions.

pub mod client;
pub mod conditions;
pub mod controller;
pub mod crds;
pub mod error;
pub mod health;
pub mod manager;
pub mod names;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod scaledown;
pub mod security;
pub mod status;
pub mod sync;
pub mod template;
pub mod validation;

pub use crds::*;
pub use error::{Error, Result};
pub use manager::*;
pub use reconciler::BrokerReconciler;

use kestrel_jolokia::JolokiaConfig;
use tokio::time::Duration;
use tracing::warn;

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub resync_period: Duration,
    /// None watches every namespace
    pub watch_namespace: Option<String>,
    pub health_addr: String,
    pub jolokia: JolokiaConfig,
    pub install_crds: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            watch_namespace: None,
            health_addr: "0.0.0.0:8081".to_string(),
            jolokia: JolokiaConfig::default(),
            install_crds: false,
        }
    }
}

impl OperatorConfig {
    /// Defaults overridden by `RECONCILE_RESYNC_PERIOD` and `WATCH_NAMESPACE`
    pub fn from_env() -> Self {
        Self {
            resync_period: resync_period(),
            ..Self::from_vars(None, std::env::var("WATCH_NAMESPACE").ok().as_deref())
        }
    }

    fn from_vars(resync: Option<&str>, namespace: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = resync {
            config.resync_period = resync_period_or_default(raw);
        }
        config.watch_namespace = namespace.map(str::trim).filter(|ns| !ns.is_empty()).map(str::to_string);
        config
    }
}

/// Resync period from `RECONCILE_RESYNC_PERIOD`, 30s when unset or invalid
pub fn resync_period() -> Duration {
    std::env::var("RECONCILE_RESYNC_PERIOD")
        .map(|raw| resync_period_or_default(&raw))
        .unwrap_or(DEFAULT_RESYNC_PERIOD)
}

/// Parse `500ms`, `30s`, `2m`, `1h` or bare seconds
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "" | "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(value.checked_mul(3600)?)),
        _ => None,
    }
}

/// Zero and unparsable periods fall back to the default
pub fn resync_period_or_default(raw: &str) -> Duration {
    match parse_duration(raw) {
        Some(period) if !period.is_zero() => period,
        _ => {
            warn!(value = raw, default_secs = DEFAULT_RESYNC_PERIOD.as_secs(), "invalid resync period, using default");
            DEFAULT_RESYNC_PERIOD
        }
    }
}
