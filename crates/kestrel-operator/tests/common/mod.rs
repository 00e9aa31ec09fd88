//! In-memory cluster and scripted broker probe for reconciler tests

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kestrel_operator::client::{ClusterApi, ResourceKind};
use kestrel_operator::crds::{Broker, BrokerSpec, BrokerStatus, DeploymentPlan};
use kestrel_operator::error::{Error, Result};
use kestrel_operator::health::{BrokerHealth, BrokerProbe, HealthCache, ProbeResult, ProbeTarget};
use kestrel_operator::names::Namer;
use kestrel_operator::registry::SecurityRegistry;
use kestrel_operator::resources::PROPERTIES_KEY;
use kestrel_operator::BrokerReconciler;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub const NAMESPACE: &str = "ns";
pub const NAME: &str = "ex";
pub const RESYNC: Duration = Duration::from_secs(30);

type Key = (ResourceKind, String, String);

/// Which write a scripted failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Replace,
    Status,
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("scripted {reason}"),
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashMap<Key, Value>>,
    pods: Mutex<Vec<Pod>>,
    status: Mutex<Option<BrokerStatus>>,
    failures: Mutex<Vec<(WriteOp, u16)>>,
    next_version: AtomicUsize,
    writes: AtomicUsize,
    status_patches: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(kind: ResourceKind, namespace: &str, name: &str) -> Key {
        (kind, namespace.to_string(), name.to_string())
    }

    fn stamp(&self, object: &mut Value) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        object["metadata"]["resourceVersion"] = json!(version.to_string());
    }

    fn scripted_failure(&self, op: WriteOp) -> Result<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|(o, _)| *o == op) {
            Some(index) => {
                let (_, code) = failures.remove(index);
                Err(api_error(code, "Scripted"))
            }
            None => Ok(()),
        }
    }

    /// The next write of this kind fails once with `code`
    pub fn fail_next(&self, op: WriteOp, code: u16) {
        self.failures.lock().unwrap().push((op, code));
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::key(kind, NAMESPACE, name))
            .cloned()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.objects.lock().unwrap().keys().filter(|(k, _, _)| *k == kind).count()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn status_patches(&self) -> usize {
        self.status_patches.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Option<BrokerStatus> {
        self.status.lock().unwrap().clone()
    }

    pub fn replicas(&self) -> Option<i64> {
        self.object(ResourceKind::StatefulSet, "ex-ss")
            .and_then(|ss| ss.pointer("/spec/replicas").and_then(Value::as_i64))
    }

    /// Replace the pod list with ready pods at these ordinals
    pub fn set_ready_pods(&self, ordinals: &[i32]) {
        let namer = Namer::new(NAME, NAMESPACE);
        *self.pods.lock().unwrap() = ordinals.iter().map(|o| ready_pod(&namer, *o)).collect();
    }
}

pub fn ready_pod(namer: &Namer, ordinal: i32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(namer.pod(ordinal)),
            namespace: Some(namer.namespace().to_string()),
            labels: Some(namer.selector_labels()),
            resource_version: Some(format!("pod-{ordinal}")),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>> {
        Ok(self.objects.lock().unwrap().get(&Self::key(kind, namespace, name)).cloned())
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, object: &Value) -> Result<()> {
        self.scripted_failure(WriteOp::Create)?;
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let key = Self::key(kind, namespace, &name);
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut stored = object.clone();
        self.stamp(&mut stored);
        self.objects.lock().unwrap().insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(&self, kind: ResourceKind, namespace: &str, name: &str, object: &Value) -> Result<()> {
        self.scripted_failure(WriteOp::Replace)?;
        let key = Self::key(kind, namespace, name);
        let mut objects = self.objects.lock().unwrap();
        let current = objects.get(&key).ok_or_else(|| api_error(404, "NotFound"))?;
        let sent = object.pointer("/metadata/resourceVersion");
        if sent.is_some() && sent != current.pointer("/metadata/resourceVersion") {
            return Err(api_error(409, "Conflict"));
        }
        let mut stored = object.clone();
        self.stamp(&mut stored);
        objects.insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, label_selector: &str) -> Result<Vec<Value>> {
        let wanted: Vec<(&str, &str)> = label_selector.split(',').filter_map(|kv| kv.split_once('=')).collect();
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, object)| {
                wanted
                    .iter()
                    .all(|(key, value)| object["metadata"]["labels"][*key].as_str() == Some(*value))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        if self.objects.lock().unwrap().remove(&Self::key(kind, namespace, name)).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn patch_broker_status(&self, _namespace: &str, _name: &str, status: &BrokerStatus) -> Result<()> {
        self.scripted_failure(WriteOp::Status)?;
        *self.status.lock().unwrap() = Some(status.clone());
        self.status_patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Started brokers reporting a fixed properties checksum
#[derive(Default)]
pub struct FakeProbe {
    checksum: Mutex<String>,
    messages: Mutex<BTreeMap<i32, u64>>,
    unreachable: AtomicUsize,
    status_calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_applied_checksum(&self, checksum: &str) {
        *self.checksum.lock().unwrap() = checksum.to_string();
    }

    pub fn set_messages(&self, ordinal: i32, count: u64) {
        self.messages.lock().unwrap().insert(ordinal, count);
    }

    /// The next `calls` status checks fail as unreachable
    pub fn set_unreachable_for(&self, calls: usize) {
        self.unreachable.store(calls, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerProbe for FakeProbe {
    async fn check_status(&self, _target: &ProbeTarget) -> ProbeResult {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .unreachable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return ProbeResult::Unreachable("connection refused".to_string());
        }
        ProbeResult::Healthy(BrokerHealth {
            state: "STARTED".to_string(),
            applied_checksums: BTreeMap::from([(PROPERTIES_KEY.to_string(), self.checksum.lock().unwrap().clone())]),
        })
    }

    async fn pending_messages(&self, target: &ProbeTarget) -> Result<u64> {
        Ok(self.messages.lock().unwrap().get(&target.ordinal).copied().unwrap_or(0))
    }
}

pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub probe: Arc<FakeProbe>,
    pub registry: Arc<SecurityRegistry>,
    pub reconciler: BrokerReconciler,
}

impl Harness {
    pub fn new() -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let probe = Arc::new(FakeProbe::new());
        let registry = Arc::new(SecurityRegistry::new());
        let reconciler = BrokerReconciler::new(
            Arc::clone(&cluster) as Arc<dyn ClusterApi>,
            Arc::new(HealthCache::new(Arc::clone(&probe) as Arc<dyn BrokerProbe>)),
            Arc::clone(&registry),
            RESYNC,
        );
        Self {
            cluster,
            probe,
            registry,
            reconciler,
        }
    }

    /// Applied checksum matching the broker's own properties
    pub fn report_applied(&self, broker: &Broker) {
        let content = kestrel_operator::resources::properties_content(broker, &[]);
        self.probe
            .set_applied_checksum(&kestrel_operator::resources::properties_checksum(&content));
    }

    /// One pass, then copy the persisted status back the way a watch would
    pub async fn pass(&self, broker: &mut Broker) -> Result<kube::runtime::controller::Action> {
        let action = self.reconciler.reconcile(broker).await?;
        broker.status = self.cluster.status();
        Ok(action)
    }
}

pub fn broker(size: i32) -> Broker {
    let mut broker = Broker::new(
        NAME,
        BrokerSpec {
            deployment_plan: DeploymentPlan {
                size: Some(size),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    broker.metadata.namespace = Some(NAMESPACE.to_string());
    broker.metadata.uid = Some("uid-1".to_string());
    broker.metadata.generation = Some(1);
    broker
}
