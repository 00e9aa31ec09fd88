//! # Kubernetes Controller
//!
//! kube-runtime wiring for the `Broker` and `BrokerSecurity` controllers,
//! the shared operator context and the error policy.

use crate::client::{ClusterApi, KubeClusterApi};
use crate::crds::{Broker, BrokerSecurity};
use crate::error::{Error, Result};
use crate::health::{BrokerProbe, HealthCache, JolokiaProbe};
use crate::reconciler::BrokerReconciler;
use crate::registry::SecurityRegistry;
use crate::security;
use crate::OperatorConfig;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use kube::{Client, CustomResourceExt, Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Lets a deleted broker drop its cached health before it goes
pub const BROKER_FINALIZER: &str = "broker.kestrel.io/health-finalizer";

/// Requeue delay after an optimistic-concurrency conflict
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// First error requeue delay; doubles per consecutive failure
pub const ERROR_REQUEUE_BASE: Duration = Duration::from_secs(5);

pub const ERROR_REQUEUE_MAX: Duration = Duration::from_secs(300);

/// Reconcile counters exposed through the health endpoints
#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    pub reconciliations_total: AtomicU64,
    pub reconciliations_failed: AtomicU64,
    pub conflicts_total: AtomicU64,
    pub last_duration_ms: AtomicU64,
}

impl ReconcileMetrics {
    fn record(&self, elapsed: Duration) {
        self.reconciliations_total.fetch_add(1, Ordering::Relaxed);
        self.last_duration_ms
            .store(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

/// Exponential backoff for `retries` consecutive failures
pub fn backoff_delay(retries: u32) -> Duration {
    let exponent = retries.saturating_sub(1).min(16);
    ERROR_REQUEUE_BASE
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(ERROR_REQUEUE_MAX)
}

/// Consecutive failure counts per object
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    retries: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    /// Count one more failure and return the delay before the next attempt
    pub fn next(&self, key: &str) -> Duration {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        let count = retries.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        backoff_delay(*count)
    }

    pub fn reset(&self, key: &str) {
        self.retries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// State shared by both controllers
pub struct Context {
    pub client: Client,
    pub reconciler: BrokerReconciler,
    pub registry: Arc<SecurityRegistry>,
    pub metrics: ReconcileMetrics,
    pub backoff: ErrorBackoff,
    broker_trigger: mpsc::UnboundedSender<()>,
}

impl Context {
    /// Context for a live cluster, plus the stream that re-reconciles every
    /// broker when the security registry changes
    pub fn new(client: Client, config: &OperatorConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));
        let probe: Arc<dyn BrokerProbe> = Arc::new(JolokiaProbe::new(config.jolokia.clone()));
        let registry = Arc::new(SecurityRegistry::new());
        let reconciler = BrokerReconciler::new(
            cluster,
            Arc::new(HealthCache::new(probe)),
            Arc::clone(&registry),
            config.resync_period,
        );
        let (broker_trigger, trigger_rx) = mpsc::unbounded();

        let context = Arc::new(Self {
            client,
            reconciler,
            registry,
            metrics: ReconcileMetrics::default(),
            backoff: ErrorBackoff::default(),
            broker_trigger,
        });
        (context, trigger_rx)
    }

    /// Ask the broker controller to reconcile every broker
    pub fn trigger_brokers(&self) {
        if self.broker_trigger.unbounded_send(()).is_err() {
            debug!("broker controller is not running");
        }
    }
}

fn object_key<K: Resource>(object: &K) -> String {
    format!(
        "{}/{}",
        object.meta().namespace.as_deref().unwrap_or_default(),
        object.meta().name.as_deref().unwrap_or_default()
    )
}

async fn reconcile_broker(broker: Arc<Broker>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let namespace = broker.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<Broker> = Api::namespaced(ctx.client.clone(), &namespace);
    let reconciler = &ctx.reconciler;
    let result = finalizer(&api, BROKER_FINALIZER, Arc::clone(&broker), move |event| async move {
        match event {
            FinalizerEvent::Apply(broker) => reconciler.reconcile(&broker).await,
            FinalizerEvent::Cleanup(broker) => Ok(reconciler.cleanup(&broker)),
        }
    })
    .await
    .map_err(Error::from);
    ctx.metrics.record(start.elapsed());
    if result.is_ok() {
        ctx.backoff.reset(&object_key(broker.as_ref()));
    }
    result
}

fn broker_error_policy(broker: Arc<Broker>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(broker.as_ref());
    if error.is_conflict() {
        ctx.metrics.conflicts_total.fetch_add(1, Ordering::Relaxed);
        debug!(broker = %key, "conflict, requeueing");
        return Action::requeue(CONFLICT_REQUEUE);
    }
    ctx.metrics.reconciliations_failed.fetch_add(1, Ordering::Relaxed);
    let delay = ctx.backoff.next(&key);
    warn!(broker = %key, error = %error, delay_secs = delay.as_secs(), "reconcile failed, will retry");
    Action::requeue(delay)
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Create both CRDs when they are missing
pub async fn install_crds(client: &Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in [Broker::crd(), BrokerSecurity::crd()] {
        let name = crd.name_any();
        match crds.get_opt(&name).await? {
            Some(_) => info!(crd = %name, "CRD already installed"),
            None => {
                info!(crd = %name, "installing CRD");
                crds.create(&PostParams::default(), &crd).await?;
            }
        }
    }
    Ok(())
}

/// Run both controllers until the watch streams end
pub async fn run(ctx: Arc<Context>, trigger: mpsc::UnboundedReceiver<()>, namespace: Option<String>) {
    let client = ctx.client.clone();
    let ns = namespace.as_deref();
    info!(namespace = ns.unwrap_or("all"), "starting controllers");

    let brokers = Controller::new(api_for::<Broker>(&client, ns), watcher::Config::default())
        .owns(api_for::<StatefulSet>(&client, ns), watcher::Config::default())
        .owns(api_for::<Service>(&client, ns), watcher::Config::default())
        .owns(api_for::<Secret>(&client, ns), watcher::Config::default())
        .reconcile_all_on(trigger)
        .shutdown_on_signal()
        .run(reconcile_broker, broker_error_policy, Arc::clone(&ctx))
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => debug!(broker = %object.name, ?action, "reconciled"),
                Err(err) => error!(error = %err, "broker controller error"),
            }
        });

    let securities = Controller::new(api_for::<BrokerSecurity>(&client, ns), watcher::Config::default())
        .shutdown_on_signal()
        .run(security::reconcile, security::error_policy, Arc::clone(&ctx))
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(security = %object.name, "reconciled"),
                Err(err) => error!(error = %err, "security controller error"),
            }
        });

    tokio::join!(brokers, securities);
    info!("controllers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(7), ERROR_REQUEUE_MAX);
        assert_eq!(backoff_delay(u32::MAX), ERROR_REQUEUE_MAX);
    }

    #[test]
    fn backoff_is_per_object_and_resets() {
        let backoff = ErrorBackoff::default();
        assert_eq!(backoff.next("ns/a"), Duration::from_secs(5));
        assert_eq!(backoff.next("ns/a"), Duration::from_secs(10));
        assert_eq!(backoff.next("ns/b"), Duration::from_secs(5));
        backoff.reset("ns/a");
        assert_eq!(backoff.next("ns/a"), Duration::from_secs(5));
    }

    #[test]
    fn object_keys() {
        let mut broker = Broker::new("ex", Default::default());
        broker.metadata.namespace = Some("ns".to_string());
        assert_eq!(object_key(&broker), "ns/ex");
    }
}
