//! Broker health probing and the per-generation health cache
//!
//! A probe result is kept until the generation marker of its target changes,
//! except an unreachable endpoint, which is probed again on the next pass.
//! Concurrent callers for the same `(target, marker)` share one in-flight
//! probe, so a burst of reconciles never multiplies management calls.

use crate::error::Result;
use crate::names::Namer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_jolokia::artemis::{ArtemisBroker, DEFAULT_BROKER_NAME};
use kestrel_jolokia::{JolokiaClient, JolokiaConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// One broker instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeTarget {
    pub namespace: String,
    pub broker: String,
    pub ordinal: i32,
}

impl ProbeTarget {
    pub fn new(namespace: &str, broker: &str, ordinal: i32) -> Self {
        Self {
            namespace: namespace.to_string(),
            broker: broker.to_string(),
            ordinal,
        }
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}-{}", self.namespace, self.broker, self.ordinal)
    }
}

/// Changes exactly when a cached health result may no longer hold
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationMarker {
    generation: i64,
    deployment_plan_size: i32,
    pod_resource_version: String,
}

impl GenerationMarker {
    pub fn new(generation: i64, deployment_plan_size: i32, pod_resource_version: &str) -> Self {
        Self {
            generation,
            deployment_plan_size,
            pod_resource_version: pod_resource_version.to_string(),
        }
    }
}

/// What a started broker reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerHealth {
    pub state: String,
    /// Properties file name to reported Adler-32 checksum
    pub applied_checksums: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy(BrokerHealth),
    /// The broker answered but is not serving yet; retry later
    NotReady(String),
    /// No usable answer from the management endpoint
    Unreachable(String),
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy(_))
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProbeResult::Unreachable(_))
    }

    pub fn health(&self) -> Option<&BrokerHealth> {
        match self {
            ProbeResult::Healthy(health) => Some(health),
            _ => None,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ProbeResult::Healthy(health) => &health.state,
            ProbeResult::NotReady(detail) | ProbeResult::Unreachable(detail) => detail,
        }
    }
}

/// Remote health probe seam
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerProbe: Send + Sync {
    /// Status of one instance; management failures map onto the result
    async fn check_status(&self, target: &ProbeTarget) -> ProbeResult;

    /// Messages still held by one instance. Never cached.
    async fn pending_messages(&self, target: &ProbeTarget) -> Result<u64>;
}

/// [`BrokerProbe`] over the Jolokia agent of each instance
pub struct JolokiaProbe {
    config: JolokiaConfig,
    http: reqwest::Client,
}

impl JolokiaProbe {
    pub fn new(config: JolokiaConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn broker(&self, target: &ProbeTarget) -> ArtemisBroker {
        let host = Namer::new(&target.broker, &target.namespace).pod_fqdn(target.ordinal);
        let client = JolokiaClient::with_client(self.config.clone(), self.http.clone(), self.config.endpoint_for(&host));
        ArtemisBroker::new(Arc::new(client), DEFAULT_BROKER_NAME)
    }
}

#[async_trait]
impl BrokerProbe for JolokiaProbe {
    async fn check_status(&self, target: &ProbeTarget) -> ProbeResult {
        match self.broker(target).status().await {
            Ok(status) if status.is_started() => ProbeResult::Healthy(BrokerHealth {
                state: status.server.state.clone(),
                applied_checksums: status.applied_checksums(),
            }),
            Ok(status) => ProbeResult::NotReady(format!(
                "Waiting for broker to start, state is {}",
                status.server.state
            )),
            Err(err) if err.is_not_ready() => {
                debug!(%target, error = %err, "broker not ready");
                ProbeResult::NotReady(format!("Waiting for broker status: {err}"))
            }
            Err(err) => ProbeResult::Unreachable(err.to_string()),
        }
    }

    async fn pending_messages(&self, target: &ProbeTarget) -> Result<u64> {
        Ok(self.broker(target).total_message_count().await?)
    }
}

/// Cached probe outcome
#[derive(Debug, Clone, PartialEq)]
pub struct CachedHealth {
    pub result: ProbeResult,
    pub probed_at: DateTime<Utc>,
}

struct Slot {
    marker: GenerationMarker,
    cell: OnceCell<CachedHealth>,
}

/// Probe results keyed by target, valid for one generation marker each
pub struct HealthCache {
    probe: Arc<dyn BrokerProbe>,
    slots: Mutex<HashMap<ProbeTarget, Arc<Slot>>>,
}

impl HealthCache {
    pub fn new(probe: Arc<dyn BrokerProbe>) -> Self {
        Self {
            probe,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn probe(&self) -> &dyn BrokerProbe {
        self.probe.as_ref()
    }

    fn slot(&self, target: &ProbeTarget, marker: &GenerationMarker) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(target) {
            Some(slot) if slot.marker == *marker => Arc::clone(slot),
            _ => {
                let slot = Arc::new(Slot {
                    marker: marker.clone(),
                    cell: OnceCell::new(),
                });
                slots.insert(target.clone(), Arc::clone(&slot));
                slot
            }
        }
    }

    /// Result for `(target, marker)`, probing at most once per marker.
    /// Transport failures are not kept, so the next call probes again.
    pub async fn get_or_probe(&self, target: &ProbeTarget, marker: &GenerationMarker) -> CachedHealth {
        let slot = self.slot(target, marker);
        let cached = slot
            .cell
            .get_or_init(|| async {
                let result = self.probe.check_status(target).await;
                info!(%target, healthy = result.is_healthy(), detail = result.detail(), "probed broker");
                CachedHealth {
                    result,
                    probed_at: Utc::now(),
                }
            })
            .await
            .clone();
        if cached.result.is_unreachable() {
            self.evict(target, &slot);
        }
        cached
    }

    fn evict(&self, target: &ProbeTarget, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(target).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(target);
        }
    }

    /// Drop every entry of a deleted broker
    pub fn forget(&self, namespace: &str, broker: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|target, _| !(target.namespace == namespace && target.broker == broker));
    }

    /// Drop entries for ordinals the workload no longer runs
    pub fn retain_ordinals(&self, namespace: &str, broker: &str, replicas: i32) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|target, _| target.namespace != namespace || target.broker != broker || target.ordinal < replicas);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn target() -> ProbeTarget {
        ProbeTarget::new("ns", "broker", 0)
    }

    fn healthy() -> ProbeResult {
        ProbeResult::Healthy(BrokerHealth {
            state: "STARTED".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn same_marker_probes_once() {
        let mut probe = MockBrokerProbe::new();
        probe.expect_check_status().times(1).returning(|_| healthy());
        let cache = HealthCache::new(Arc::new(probe));
        let marker = GenerationMarker::new(1, 1, "100");

        let first = cache.get_or_probe(&target(), &marker).await;
        let second = cache.get_or_probe(&target(), &marker).await;
        assert!(first.result.is_healthy());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn not_ready_result_is_cached_too() {
        let mut probe = MockBrokerProbe::new();
        probe
            .expect_check_status()
            .times(1)
            .returning(|_| ProbeResult::NotReady("Waiting for broker status: AttributeNotFoundException".into()));
        let cache = HealthCache::new(Arc::new(probe));
        let marker = GenerationMarker::new(1, 1, "100");

        let first = cache.get_or_probe(&target(), &marker).await;
        let second = cache.get_or_probe(&target(), &marker).await;
        assert!(matches!(first.result, ProbeResult::NotReady(_)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_one_marker() {
        let mut probe = MockBrokerProbe::new();
        let mut seq = mockall::Sequence::new();
        probe
            .expect_check_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ProbeResult::Unreachable("connection reset".into()));
        probe
            .expect_check_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| healthy());
        let cache = HealthCache::new(Arc::new(probe));
        let marker = GenerationMarker::new(1, 1, "100");

        assert!(!cache.get_or_probe(&target(), &marker).await.result.is_healthy());
        assert!(cache.get_or_probe(&target(), &marker).await.result.is_healthy());
        // healthy answer is now kept
        assert!(cache.get_or_probe(&target(), &marker).await.result.is_healthy());
    }

    #[tokio::test]
    async fn removed_ordinals_are_pruned() {
        let mut probe = MockBrokerProbe::new();
        probe.expect_check_status().times(4).returning(|_| healthy());
        let cache = HealthCache::new(Arc::new(probe));
        let marker = GenerationMarker::new(1, 3, "100");

        for ordinal in 0..3 {
            cache.get_or_probe(&ProbeTarget::new("ns", "broker", ordinal), &marker).await;
        }
        cache.get_or_probe(&ProbeTarget::new("ns", "other", 2), &marker).await;

        cache.retain_ordinals("ns", "broker", 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn new_marker_probes_again() {
        let mut probe = MockBrokerProbe::new();
        probe.expect_check_status().times(2).returning(|_| healthy());
        let cache = HealthCache::new(Arc::new(probe));

        cache.get_or_probe(&target(), &GenerationMarker::new(1, 1, "100")).await;
        cache.get_or_probe(&target(), &GenerationMarker::new(1, 1, "101")).await;
        cache.get_or_probe(&target(), &GenerationMarker::new(1, 1, "101")).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn targets_are_independent() {
        let mut probe = MockBrokerProbe::new();
        probe.expect_check_status().times(2).returning(|_| healthy());
        let cache = HealthCache::new(Arc::new(probe));
        let marker = GenerationMarker::new(1, 2, "100");

        cache.get_or_probe(&ProbeTarget::new("ns", "broker", 0), &marker).await;
        cache.get_or_probe(&ProbeTarget::new("ns", "broker", 1), &marker).await;
        cache.forget("ns", "broker");
        assert!(cache.is_empty());
    }

    struct SlowProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BrokerProbe for SlowProbe {
        async fn check_status(&self, _: &ProbeTarget) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            healthy()
        }

        async fn pending_messages(&self, _: &ProbeTarget) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_probe() {
        let probe = Arc::new(SlowProbe { calls: AtomicUsize::new(0) });
        let cache = Arc::new(HealthCache::new(probe.clone()));
        let marker = GenerationMarker::new(3, 1, "7");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let marker = marker.clone();
                tokio::spawn(async move { cache.get_or_probe(&target(), &marker).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().result.is_healthy());
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
