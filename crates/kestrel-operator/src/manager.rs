//! # Kubernetes Operator Manager
//!
//! Process lifecycle: CRD installation, the self-health server, both
//! controllers and signal handling.

use crate::controller::{self, Context};
use crate::crds::Broker;
use crate::error::Result;
use crate::OperatorConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use kestrel_jolokia::JolokiaConfig;
use kestrel_observability::routes::monitoring_routes;
use kestrel_observability::{overall_status, HealthCheck, HealthMonitor, HealthStatus, OperatorMetrics};
use kube::api::{Api, ListParams};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// How long controllers get to finish in-flight passes after a signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Operator self-health backed by the shared controller context
pub struct OperatorMonitor {
    ctx: Arc<Context>,
    namespace: Option<String>,
    started: Instant,
}

impl OperatorMonitor {
    pub fn new(ctx: Arc<Context>, namespace: Option<String>) -> Self {
        Self {
            ctx,
            namespace,
            started: Instant::now(),
        }
    }

    async fn api_server_check(&self) -> HealthCheck {
        let start = Instant::now();
        let (status, message) = match self.ctx.client.apiserver_version().await {
            Ok(info) => (HealthStatus::Up, Some(format!("{}.{}", info.major, info.minor))),
            Err(err) => (HealthStatus::Down, Some(err.to_string())),
        };
        HealthCheck {
            name: "kubernetes-api".to_string(),
            status,
            timestamp: Utc::now(),
            duration_ms: elapsed_ms(start),
            message,
            details: None,
        }
    }

    fn reconcile_check(&self) -> HealthCheck {
        let total = self.ctx.metrics.reconciliations_total.load(Ordering::Relaxed);
        let failed = self.ctx.metrics.reconciliations_failed.load(Ordering::Relaxed);
        HealthCheck {
            name: "reconciler".to_string(),
            status: reconcile_health(total, failed),
            timestamp: Utc::now(),
            duration_ms: 0,
            message: None,
            details: Some(serde_json::json!({
                "reconciliations": total,
                "failed": failed,
                "probeTargets": self.ctx.reconciler.health().len(),
            })),
        }
    }

    async fn watched_brokers(&self) -> u64 {
        let api: Api<Broker> = match &self.namespace {
            Some(ns) => Api::namespaced(self.ctx.client.clone(), ns),
            None => Api::all(self.ctx.client.clone()),
        };
        match api.list(&ListParams::default()).await {
            Ok(list) => list.items.len() as u64,
            Err(err) => {
                warn!(error = %err, "unable to count brokers");
                0
            }
        }
    }
}

/// Degraded once more than half of all passes have failed
pub fn reconcile_health(total: u64, failed: u64) -> HealthStatus {
    if total > 0 && failed.saturating_mul(2) > total {
        HealthStatus::Degraded
    } else {
        HealthStatus::Up
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl HealthMonitor for OperatorMonitor {
    async fn get_overall_health(&self) -> HealthStatus {
        overall_status(&self.run_health_checks().await)
    }

    async fn run_health_checks(&self) -> Vec<HealthCheck> {
        vec![self.api_server_check().await, self.reconcile_check()]
    }

    async fn get_metrics(&self) -> OperatorMetrics {
        let metrics = &self.ctx.metrics;
        OperatorMetrics {
            timestamp: Utc::now(),
            reconciliations_total: metrics.reconciliations_total.load(Ordering::Relaxed),
            reconciliations_failed: metrics.reconciliations_failed.load(Ordering::Relaxed),
            conflicts_total: metrics.conflicts_total.load(Ordering::Relaxed),
            last_reconcile_duration_ms: metrics.last_duration_ms.load(Ordering::Relaxed),
            watched_brokers: self.watched_brokers().await,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

/// Main operator manager
pub struct OperatorManager {
    config: OperatorConfig,
    client: Client,
    ctx: Arc<Context>,
    trigger: mpsc::UnboundedReceiver<()>,
}

impl OperatorManager {
    /// Connect using the in-cluster or kubeconfig credentials
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: OperatorConfig) -> Self {
        let (ctx, trigger) = Context::new(client.clone(), &config);
        Self {
            config,
            client,
            ctx,
            trigger,
        }
    }

    /// Run until SIGINT/SIGTERM or until the controllers stop
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            client,
            ctx,
            trigger,
        } = self;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            namespace = config.watch_namespace.as_deref().unwrap_or("all"),
            resync_secs = config.resync_period.as_secs(),
            "starting kestrel operator"
        );

        if config.install_crds {
            controller::install_crds(&client).await?;
        }

        let listener = tokio::net::TcpListener::bind(&config.health_addr).await?;
        info!(addr = %config.health_addr, "health server listening");
        let monitor = Arc::new(OperatorMonitor::new(Arc::clone(&ctx), config.watch_namespace.clone()));
        let health = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, monitoring_routes(monitor)).await {
                error!(error = %err, "health server failed");
            }
        });

        let mut controllers = tokio::spawn(controller::run(ctx, trigger, config.watch_namespace.clone()));

        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received, stopping controllers");
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut controllers).await.is_err() {
                    warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "controllers did not stop in time");
                    controllers.abort();
                }
            }
            result = &mut controllers => {
                if let Err(err) = result {
                    error!(error = %err, "controller task failed");
                }
            }
        }

        health.abort();
        info!("kestrel operator stopped");
        Ok(())
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Operator builder for fluent configuration
pub struct OperatorBuilder {
    config: OperatorConfig,
}

impl OperatorBuilder {
    pub fn new() -> Self {
        Self {
            config: OperatorConfig::default(),
        }
    }

    pub fn from_config(config: OperatorConfig) -> Self {
        Self { config }
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.config.resync_period = period;
        self
    }

    pub fn watch_namespace(mut self, namespace: Option<String>) -> Self {
        self.config.watch_namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub fn health_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.health_addr = addr.into();
        self
    }

    pub fn jolokia(mut self, jolokia: JolokiaConfig) -> Self {
        self.config.jolokia = jolokia;
        self
    }

    pub fn install_crds(mut self, install: bool) -> Self {
        self.config.install_crds = install;
        self
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub async fn build(self) -> Result<OperatorManager> {
        OperatorManager::new(self.config).await
    }
}

impl Default for OperatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
