//! Resource synchronizer
//!
//! The workload is rebuilt from its observed copy by a fixed sequence of
//! sub-syncs, each idempotent and each reporting whether it changed
//! anything. Resource templates are applied after all of them, once the
//! fields they changed on the previous pass have been put back. A write is
//! issued only when the result differs from what the cluster already holds.

use crate::client::{ClusterApi, ResourceKind};
use crate::crds::{Broker, JournalType};
use crate::error::Result;
use crate::names::Namer;
use crate::resources;
use crate::template::{apply_recorded, is_subset, record_of, revert_recorded, strip_server_fields};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PersistentVolumeClaim, SecretKeySelector, SecretVolumeSource, Volume,
    VolumeMount,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Workload annotation listing the user env var names last applied
pub const USER_ENV_ANNOTATION: &str = "broker.kestrel.io/user-env";

/// Pod template annotation carrying the properties checksum
pub const PROPERTIES_CHECKSUM_ANNOTATION: &str = "broker.kestrel.io/properties-checksum";

/// Which dimensions of the workload a pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatefulSetChanges {
    pub created: bool,
    pub replicas: bool,
    pub image: bool,
    pub clustering: bool,
    pub common: bool,
    pub tls: bool,
    pub persistence: bool,
    pub journal: bool,
    pub env: bool,
    pub properties_hash: bool,
    /// Resource templates altered the generated object
    pub template: bool,
}

impl StatefulSetChanges {
    /// Any generated dimension changed. Templates alone do not count since
    /// they re-apply on every pass.
    pub fn any(&self) -> bool {
        self.created
            || self.replicas
            || self.image
            || self.clustering
            || self.common
            || self.tls
            || self.persistence
            || self.journal
            || self.env
            || self.properties_hash
    }
}

/// Inputs the reconciler decides before syncing
#[derive(Debug, Clone)]
pub struct SyncPlan {
    /// Replica count authorized for this pass
    pub replicas: i32,
    /// Full `broker.properties` content
    pub properties: String,
    /// Ordinals that receive the drain property
    pub draining: Vec<i32>,
}

/// Outcome of one synchronizer pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub statefulset: StatefulSetChanges,
    /// `Kind/name` of every object created or replaced
    pub written: Vec<String>,
    pub properties_checksum: String,
}

impl SyncReport {
    pub fn writes(&self) -> usize {
        self.written.len()
    }
}

// Env helpers

fn upsert_env(env: &mut Vec<EnvVar>, var: EnvVar) -> bool {
    match env.iter_mut().find(|e| e.name == var.name) {
        Some(existing) if *existing == var => false,
        Some(existing) => {
            *existing = var;
            true
        }
        None => {
            env.push(var);
            true
        }
    }
}

fn remove_env(env: &mut Vec<EnvVar>, name: &str) -> bool {
    let before = env.len();
    env.retain(|e| e.name != name);
    before != env.len()
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn upsert_mount(mounts: &mut Vec<VolumeMount>, mount: VolumeMount) -> bool {
    match mounts.iter_mut().find(|m| m.name == mount.name) {
        Some(existing) if *existing == mount => false,
        Some(existing) => {
            *existing = mount;
            true
        }
        None => {
            mounts.push(mount);
            true
        }
    }
}

/// Secret volumes compare by secret name only; the server fills in `defaultMode`
fn upsert_secret_volume(volumes: &mut Vec<Volume>, name: &str, secret: &str) -> bool {
    let source = |v: &Volume| v.secret.as_ref().and_then(|s| s.secret_name.clone());
    match volumes.iter_mut().find(|v| v.name == name) {
        Some(existing) if source(existing).as_deref() == Some(secret) => false,
        Some(existing) => {
            existing.secret = Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            });
            true
        }
        None => {
            volumes.push(Volume {
                name: name.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            true
        }
    }
}

fn broker_container<'a>(ss: &'a mut StatefulSet, namer: &Namer) -> Option<&'a mut Container> {
    let name = namer.container();
    ss.spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .iter_mut()
        .find(|c| c.name == name)
}

fn with_env(ss: &mut StatefulSet, namer: &Namer, f: impl FnOnce(&mut Vec<EnvVar>) -> bool) -> bool {
    match broker_container(ss, namer) {
        Some(container) => f(container.env.get_or_insert_with(Vec::new)),
        None => false,
    }
}

fn with_mounts(ss: &mut StatefulSet, namer: &Namer, f: impl FnOnce(&mut Vec<VolumeMount>) -> bool) -> bool {
    match broker_container(ss, namer) {
        Some(container) => f(container.volume_mounts.get_or_insert_with(Vec::new)),
        None => false,
    }
}

fn with_volumes(ss: &mut StatefulSet, f: impl FnOnce(&mut Vec<Volume>) -> bool) -> bool {
    match ss.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
        Some(pod) => f(pod.volumes.get_or_insert_with(Vec::new)),
        None => false,
    }
}

// Sub-syncs

pub fn sync_replicas(ss: &mut StatefulSet, replicas: i32) -> bool {
    match ss.spec.as_mut() {
        Some(spec) if spec.replicas != Some(replicas) => {
            spec.replicas = Some(replicas);
            true
        }
        _ => false,
    }
}

pub fn sync_image(ss: &mut StatefulSet, image: &str) -> bool {
    let Some(pod) = ss.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
        return false;
    };
    let mut changed = false;
    for container in pod.containers.iter_mut() {
        if container.image.as_deref() != Some(image) {
            container.image = Some(image.to_string());
            changed = true;
        }
    }
    changed
}

pub fn sync_clustering(ss: &mut StatefulSet, broker: &Broker, namer: &Namer) -> bool {
    let clustered = broker.is_clustered();
    let secret = namer.credentials_secret();
    with_env(ss, namer, |env| {
        if clustered {
            let a = upsert_env(env, value_env("AMQ_CLUSTERED", "true"));
            let b = upsert_env(env, secret_env("AMQ_CLUSTER_USER", &secret, "AMQ_CLUSTER_USER"));
            let c = upsert_env(env, secret_env("AMQ_CLUSTER_PASSWORD", &secret, "AMQ_CLUSTER_PASSWORD"));
            a | b | c
        } else {
            let a = upsert_env(env, value_env("AMQ_CLUSTERED", "false"));
            let b = remove_env(env, "AMQ_CLUSTER_USER");
            let c = remove_env(env, "AMQ_CLUSTER_PASSWORD");
            a | b | c
        }
    })
}

/// Admin credentials, the properties mount and pod labels
pub fn sync_common(ss: &mut StatefulSet, broker: &Broker, namer: &Namer) -> bool {
    let secret = namer.credentials_secret();
    let mut changed = with_env(ss, namer, |env| {
        let a = upsert_env(env, value_env("AMQ_NAME", resources::AMQ_NAME));
        let b = upsert_env(env, secret_env("AMQ_USER", &secret, "AMQ_USER"));
        let c = upsert_env(env, secret_env("AMQ_PASSWORD", &secret, "AMQ_PASSWORD"));
        a | b | c
    });

    let volume_name = resources::properties_volume_name(namer);
    changed |= with_volumes(ss, |volumes| upsert_secret_volume(volumes, &volume_name, &namer.properties_secret()));
    changed |= with_mounts(ss, namer, |mounts| {
        upsert_mount(
            mounts,
            VolumeMount {
                name: volume_name.clone(),
                mount_path: format!("{}/{}", resources::PROPERTIES_MOUNT_ROOT, namer.properties_secret()),
                read_only: Some(true),
                ..Default::default()
            },
        )
    });

    if let Some(spec) = ss.spec.as_mut() {
        let labels = spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new);
        for (key, value) in resources::pod_labels(broker, namer) {
            if labels.get(&key) != Some(&value) {
                labels.insert(key, value);
                changed = true;
            }
        }
    }
    changed
}

fn tls_volume_name(secret: &str) -> String {
    format!("{secret}-volume")
}

fn tls_mount_path(secret: &str) -> String {
    format!("/etc/{secret}-volume")
}

fn is_tls_mount(mount: &VolumeMount) -> bool {
    mount.mount_path.starts_with("/etc/") && mount.mount_path.ends_with("-volume") && mount.read_only == Some(true)
}

/// One read-only secret volume per distinct TLS secret
pub fn sync_tls(ss: &mut StatefulSet, broker: &Broker, namer: &Namer) -> bool {
    let secrets = broker.ssl_secrets();
    let wanted: Vec<String> = secrets.iter().map(|s| tls_volume_name(s)).collect();

    let mut stale = Vec::new();
    let mut changed = with_mounts(ss, namer, |mounts| {
        let mut changed = false;
        mounts.retain(|m| {
            let keep = !is_tls_mount(m) || wanted.contains(&m.name);
            if !keep {
                stale.push(m.name.clone());
                changed = true;
            }
            keep
        });
        for secret in &secrets {
            changed |= upsert_mount(
                mounts,
                VolumeMount {
                    name: tls_volume_name(secret),
                    mount_path: tls_mount_path(secret),
                    read_only: Some(true),
                    ..Default::default()
                },
            );
        }
        changed
    });

    changed |= with_volumes(ss, |volumes| {
        let before = volumes.len();
        volumes.retain(|v| !stale.contains(&v.name));
        let mut changed = before != volumes.len();
        for secret in &secrets {
            changed |= upsert_secret_volume(volumes, &tls_volume_name(secret), secret);
        }
        changed
    });

    changed |= with_env(ss, namer, |env| match secrets.first() {
        Some(first) => upsert_env(env, value_env("AMQ_KEYSTORE_TRUSTSTORE_DIR", &tls_mount_path(first))),
        None => remove_env(env, "AMQ_KEYSTORE_TRUSTSTORE_DIR"),
    });
    changed
}

fn data_dir(namer: &Namer) -> String {
    format!("/opt/{}/data", namer.name())
}

fn volume_claim(broker: &Broker, namer: &Namer) -> Result<PersistentVolumeClaim> {
    let storage = &broker.spec.deployment_plan.storage;
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": {"requests": {"storage": storage.size}},
    });
    if let Some(class) = &storage.storage_class_name {
        spec["storageClassName"] = Value::String(class.clone());
    }
    Ok(serde_json::from_value(json!({
        "metadata": {"name": namer.data_volume()},
        "spec": spec,
    }))?)
}

/// Only the fields we generate are compared; the server defaults the rest
fn merge_claim_spec(existing: &mut PersistentVolumeClaim, claim: PersistentVolumeClaim) -> bool {
    let (Some(current), Some(wanted)) = (existing.spec.as_mut(), claim.spec) else {
        return false;
    };
    let mut changed = false;
    if current.access_modes != wanted.access_modes {
        current.access_modes = wanted.access_modes;
        changed = true;
    }
    if current.resources != wanted.resources {
        current.resources = wanted.resources;
        changed = true;
    }
    if wanted.storage_class_name.is_some() && current.storage_class_name != wanted.storage_class_name {
        current.storage_class_name = wanted.storage_class_name;
        changed = true;
    }
    changed
}

/// Data directory env, mount and volume claim template
pub fn sync_persistence(ss: &mut StatefulSet, broker: &Broker, namer: &Namer) -> Result<bool> {
    let dir = data_dir(namer);
    let volume = namer.data_volume();

    if !broker.spec.deployment_plan.persistence_enabled {
        let mut changed = with_env(ss, namer, |env| {
            remove_env(env, "AMQ_DATA_DIR") | remove_env(env, "AMQ_DATA_DIR_LOGGING")
        });
        changed |= with_mounts(ss, namer, |mounts| {
            let before = mounts.len();
            mounts.retain(|m| m.name != volume);
            before != mounts.len()
        });
        if let Some(spec) = ss.spec.as_mut() {
            if spec.volume_claim_templates.take().is_some_and(|t| !t.is_empty()) {
                changed = true;
            }
        }
        return Ok(changed);
    }

    let mut changed = with_env(ss, namer, |env| {
        upsert_env(env, value_env("AMQ_DATA_DIR", &dir)) | upsert_env(env, value_env("AMQ_DATA_DIR_LOGGING", "true"))
    });
    changed |= with_mounts(ss, namer, |mounts| {
        upsert_mount(
            mounts,
            VolumeMount {
                name: volume.clone(),
                mount_path: dir.clone(),
                ..Default::default()
            },
        )
    });

    let claim = volume_claim(broker, namer)?;
    if let Some(spec) = ss.spec.as_mut() {
        let templates = spec.volume_claim_templates.get_or_insert_with(Vec::new);
        match templates.iter_mut().find(|t| t.metadata.name.as_deref() == Some(volume.as_str())) {
            Some(existing) => changed |= merge_claim_spec(existing, claim),
            None => {
                templates.push(claim);
                changed = true;
            }
        }
    }
    Ok(changed)
}

fn extra_args(current: Option<&str>, journal: JournalType) -> String {
    let mut args: Vec<&str> = current
        .unwrap_or_default()
        .split_whitespace()
        .filter(|a| *a != "--aio" && *a != "--nio")
        .collect();
    let flag = match journal {
        JournalType::Aio => "--aio",
        JournalType::Nio => "--nio",
    };
    args.push(flag);
    args.join(" ")
}

/// Journal type env and the matching `--aio`/`--nio` start argument
pub fn sync_journal(ss: &mut StatefulSet, namer: &Namer, journal: JournalType) -> bool {
    with_env(ss, namer, |env| {
        let current = env
            .iter()
            .find(|e| e.name == "AMQ_EXTRA_ARGS")
            .and_then(|e| e.value.clone());
        let a = upsert_env(env, value_env("AMQ_JOURNAL_TYPE", journal.as_str()));
        let b = upsert_env(env, value_env("AMQ_EXTRA_ARGS", &extra_args(current.as_deref(), journal)));
        a | b
    })
}

/// User env vars; names dropped from the spec since the last pass are removed
pub fn sync_env(ss: &mut StatefulSet, namer: &Namer, user_env: &[EnvVar]) -> bool {
    let previous: Vec<String> = ss
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(USER_ENV_ANNOTATION))
        .map(|names| names.split(',').filter(|n| !n.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    let current: Vec<String> = user_env.iter().map(|e| e.name.clone()).collect();

    let mut changed = with_env(ss, namer, |env| {
        let mut changed = false;
        for name in previous.iter().filter(|n| !current.contains(n)) {
            changed |= remove_env(env, name);
        }
        for var in user_env {
            changed |= upsert_env(env, var.clone());
        }
        changed
    });

    let joined = current.join(",");
    let annotations = ss.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if current.is_empty() {
        changed |= annotations.remove(USER_ENV_ANNOTATION).is_some();
    } else if annotations.get(USER_ENV_ANNOTATION) != Some(&joined) {
        annotations.insert(USER_ENV_ANNOTATION.to_string(), joined);
        changed = true;
    }
    if annotations.is_empty() {
        ss.metadata.annotations = None;
    }
    changed
}

/// A properties change rolls the pods through this annotation
pub fn sync_properties_hash(ss: &mut StatefulSet, checksum: &str) -> bool {
    let Some(spec) = ss.spec.as_mut() else {
        return false;
    };
    let annotations = spec
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new);
    if annotations.get(PROPERTIES_CHECKSUM_ANNOTATION).map(String::as_str) == Some(checksum) {
        return false;
    }
    annotations.insert(PROPERTIES_CHECKSUM_ANNOTATION.to_string(), checksum.to_string());
    true
}

/// Run every sub-sync against `ss` in order
pub fn sync_statefulset(
    ss: &mut StatefulSet,
    broker: &Broker,
    namer: &Namer,
    replicas: i32,
    checksum: &str,
) -> Result<StatefulSetChanges> {
    Ok(StatefulSetChanges {
        replicas: sync_replicas(ss, replicas),
        image: sync_image(ss, broker.image()),
        clustering: sync_clustering(ss, broker, namer),
        common: sync_common(ss, broker, namer),
        tls: sync_tls(ss, broker, namer),
        persistence: sync_persistence(ss, broker, namer)?,
        journal: sync_journal(ss, namer, broker.spec.deployment_plan.journal_type),
        env: sync_env(ss, namer, &broker.spec.env),
        properties_hash: sync_properties_hash(ss, checksum),
        ..Default::default()
    })
}

/// Whether `desired` differs from what the cluster holds. A changed template
/// record means template-owned fields may linger on the observed copy.
fn drifted(kind: ResourceKind, desired: &Value, observed: &Value) -> bool {
    if !is_subset(desired, observed) || record_of(desired) != record_of(observed) {
        return true;
    }
    kind == ResourceKind::Secret && desired.get("data") != observed.get("data")
}

/// Desired object carrying the fields a replace must preserve
fn replacement(kind: ResourceKind, desired: &Value, observed: &Value) -> Value {
    let mut object = desired.clone();
    if let (Some(version), Some(metadata)) = (
        observed.pointer("/metadata/resourceVersion"),
        object.get_mut("metadata").and_then(Value::as_object_mut),
    ) {
        metadata.insert("resourceVersion".to_string(), version.clone());
    }
    if kind == ResourceKind::Service {
        if let (Some(observed_spec), Some(spec)) = (
            observed.get("spec").and_then(Value::as_object),
            object.get_mut("spec").and_then(Value::as_object_mut),
        ) {
            for field in ["clusterIP", "clusterIPs", "ipFamilies", "ipFamilyPolicy"] {
                if let Some(value) = observed_spec.get(field) {
                    spec.entry(field).or_insert_with(|| value.clone());
                }
            }
        }
    }
    object
}

fn object_name(value: &Value) -> &str {
    value.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default()
}

/// Converges the generated resources of one broker
pub struct ResourceSynchronizer<'a> {
    cluster: &'a dyn ClusterApi,
    broker: &'a Broker,
    namer: &'a Namer,
}

impl<'a> ResourceSynchronizer<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, broker: &'a Broker, namer: &'a Namer) -> Self {
        Self { cluster, broker, namer }
    }

    /// Sync everything; the first failed write aborts the pass
    #[instrument(skip(self, plan), fields(broker = %self.namer.name(), namespace = %self.namer.namespace()))]
    pub async fn sync(&self, plan: &SyncPlan) -> Result<SyncReport> {
        let mut report = SyncReport {
            properties_checksum: resources::properties_checksum(&plan.properties),
            ..Default::default()
        };

        let secret = resources::properties_secret(self.broker, self.namer, &plan.properties, &plan.draining);
        self.sync_object(ResourceKind::Secret, serde_json::to_value(secret)?, &mut report)
            .await?;

        let mut services = vec![
            resources::headless_service(self.broker, self.namer),
            resources::ping_service(self.broker, self.namer),
        ];
        let exposures = resources::exposure_services(self.broker, self.namer, self.broker.desired_size());
        let exposed: Vec<String> = exposures.iter().filter_map(|s| s.metadata.name.clone()).collect();
        services.extend(exposures);
        for service in services {
            self.sync_object(ResourceKind::Service, serde_json::to_value(service)?, &mut report)
                .await?;
        }
        self.prune_exposures(&exposed, &mut report).await?;

        report.statefulset = self.sync_workload(plan, &report.properties_checksum, &mut report.written).await?;

        if report.written.is_empty() {
            debug!("resources in sync");
        }
        Ok(report)
    }

    async fn sync_object(&self, kind: ResourceKind, mut desired: Value, report: &mut SyncReport) -> Result<()> {
        let name = object_name(&desired).to_string();
        apply_recorded(&self.broker.spec.resource_templates, kind, &name, &mut desired)?;

        let namespace = self.namer.namespace();
        match self.cluster.get(kind, namespace, &name).await? {
            None => {
                info!(%kind, %name, "creating");
                self.cluster.create(kind, namespace, &desired).await?;
            }
            Some(observed) if drifted(kind, &desired, &observed) => {
                info!(%kind, %name, "replacing drifted object");
                self.cluster
                    .replace(kind, namespace, &name, &replacement(kind, &desired, &observed))
                    .await?;
            }
            Some(_) => return Ok(()),
        }
        report.written.push(format!("{kind}/{name}"));
        Ok(())
    }

    /// Delete exposure services for instances or acceptors no longer wanted
    async fn prune_exposures(&self, wanted: &[String], report: &mut SyncReport) -> Result<()> {
        let kind = ResourceKind::Service;
        let namespace = self.namer.namespace();
        for service in self.cluster.list(kind, namespace, &self.namer.exposure_selector()).await? {
            let name = object_name(&service);
            if name.is_empty() || wanted.iter().any(|w| w == name) {
                continue;
            }
            info!(%kind, %name, "deleting stale exposure service");
            self.cluster.delete(kind, namespace, name).await?;
            report.written.push(format!("{kind}/{name}"));
        }
        Ok(())
    }

    async fn sync_workload(&self, plan: &SyncPlan, checksum: &str, written: &mut Vec<String>) -> Result<StatefulSetChanges> {
        let kind = ResourceKind::StatefulSet;
        let name = self.namer.statefulset();
        let namespace = self.namer.namespace();
        let observed = self.cluster.get(kind, namespace, &name).await?;

        let mut ss = match &observed {
            Some(value) => {
                let mut base = value.clone();
                if revert_recorded(&mut base)? {
                    debug!(%name, "reverted previous template changes");
                }
                serde_json::from_value::<StatefulSet>(base)?
            }
            None => resources::statefulset(self.broker, self.namer),
        };
        let mut changes = sync_statefulset(&mut ss, self.broker, self.namer, plan.replicas, checksum)?;
        changes.created = observed.is_none();

        let mut desired = serde_json::to_value(&ss)?;
        changes.template = apply_recorded(&self.broker.spec.resource_templates, kind, &name, &mut desired)?;
        let desired = strip_server_fields(desired);

        match observed {
            None => {
                info!(%name, replicas = plan.replicas, "creating workload");
                self.cluster.create(kind, namespace, &desired).await?;
            }
            Some(value) => {
                let current = strip_server_fields(serde_json::to_value(serde_json::from_value::<StatefulSet>(value)?)?);
                if current == desired {
                    return Ok(changes);
                }
                info!(%name, ?changes, "updating workload");
                self.cluster.replace(kind, namespace, &name, &desired).await?;
            }
        }
        written.push(format!("{kind}/{name}"));
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{Acceptor, BrokerSpec, DeploymentPlan};

    fn broker() -> Broker {
        let mut broker = Broker::new(
            "ex",
            BrokerSpec {
                deployment_plan: DeploymentPlan {
                    size: Some(2),
                    persistence_enabled: true,
                    journal_type: JournalType::Aio,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        broker.metadata.namespace = Some("ns".to_string());
        broker
    }

    fn env_of(ss: &StatefulSet) -> Vec<EnvVar> {
        ss.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .clone()
            .unwrap_or_default()
    }

    fn env_value(ss: &StatefulSet, name: &str) -> Option<String> {
        env_of(ss).into_iter().find(|e| e.name == name).and_then(|e| e.value)
    }

    #[test]
    fn sub_syncs_are_idempotent() {
        let broker = broker();
        let namer = Namer::new("ex", "ns");
        let mut ss = resources::statefulset(&broker, &namer);

        let first = sync_statefulset(&mut ss, &broker, &namer, 2, "123").unwrap();
        assert!(first.any());
        assert!(first.persistence && first.journal && first.clustering);

        let second = sync_statefulset(&mut ss, &broker, &namer, 2, "123").unwrap();
        assert_eq!(second, StatefulSetChanges::default());
    }

    #[test]
    fn journal_swaps_start_argument() {
        let broker = broker();
        let namer = Namer::new("ex", "ns");
        let mut ss = resources::statefulset(&broker, &namer);
        with_env(&mut ss, &namer, |env| upsert_env(env, value_env("AMQ_EXTRA_ARGS", "--no-autotune --nio")));

        assert!(sync_journal(&mut ss, &namer, JournalType::Aio));
        assert_eq!(env_value(&ss, "AMQ_EXTRA_ARGS").as_deref(), Some("--no-autotune --aio"));
        assert_eq!(env_value(&ss, "AMQ_JOURNAL_TYPE").as_deref(), Some("aio"));
        assert!(!sync_journal(&mut ss, &namer, JournalType::Aio));
    }

    #[test]
    fn disabling_persistence_removes_everything() {
        let mut broker = broker();
        let namer = Namer::new("ex", "ns");
        let mut ss = resources::statefulset(&broker, &namer);
        assert!(sync_persistence(&mut ss, &broker, &namer).unwrap());
        assert_eq!(env_value(&ss, "AMQ_DATA_DIR").as_deref(), Some("/opt/ex/data"));
        assert_eq!(ss.spec.as_ref().unwrap().volume_claim_templates.as_ref().unwrap().len(), 1);

        broker.spec.deployment_plan.persistence_enabled = false;
        assert!(sync_persistence(&mut ss, &broker, &namer).unwrap());
        assert!(env_value(&ss, "AMQ_DATA_DIR").is_none());
        assert!(ss.spec.as_ref().unwrap().volume_claim_templates.is_none());
        assert!(!sync_persistence(&mut ss, &broker, &namer).unwrap());
    }

    #[test]
    fn tls_volumes_follow_secrets() {
        let mut broker = broker();
        broker.spec.acceptors = vec![Acceptor {
            name: "amqps".into(),
            ssl_enabled: true,
            ..Default::default()
        }];
        let namer = Namer::new("ex", "ns");
        let mut ss = resources::statefulset(&broker, &namer);

        assert!(sync_tls(&mut ss, &broker, &namer));
        assert_eq!(
            env_value(&ss, "AMQ_KEYSTORE_TRUSTSTORE_DIR").as_deref(),
            Some("/etc/ex-amqps-secret-volume")
        );

        broker.spec.acceptors[0].ssl_enabled = false;
        assert!(sync_tls(&mut ss, &broker, &namer));
        let pod = ss.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod.volumes.as_ref().unwrap().iter().all(|v| v.name != "ex-amqps-secret-volume"));
        assert!(env_value(&ss, "AMQ_KEYSTORE_TRUSTSTORE_DIR").is_none());
        // the properties mount is not a tls mount
        assert_eq!(pod.containers[0].volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn removed_user_env_is_dropped() {
        let mut broker = broker();
        broker.spec.env = vec![value_env("A", "1"), value_env("B", "2")];
        let namer = Namer::new("ex", "ns");
        let mut ss = resources::statefulset(&broker, &namer);

        assert!(sync_env(&mut ss, &namer, &broker.spec.env));
        broker.spec.env = vec![value_env("B", "3")];
        assert!(sync_env(&mut ss, &namer, &broker.spec.env));
        assert!(env_value(&ss, "A").is_none());
        assert_eq!(env_value(&ss, "B").as_deref(), Some("3"));
        assert!(!sync_env(&mut ss, &namer, &broker.spec.env));
    }

    #[test]
    fn clustering_off_removes_credentials() {
        let mut broker = broker();
        let namer = Namer::new("ex", "ns");
        let mut ss = resources::statefulset(&broker, &namer);
        sync_clustering(&mut ss, &broker, &namer);
        assert!(env_of(&ss).iter().any(|e| e.name == "AMQ_CLUSTER_USER" && e.value_from.is_some()));

        broker.spec.deployment_plan.clustered = Some(false);
        assert!(sync_clustering(&mut ss, &broker, &namer));
        assert!(env_of(&ss).iter().all(|e| e.name != "AMQ_CLUSTER_USER"));
        assert_eq!(env_value(&ss, "AMQ_CLUSTERED").as_deref(), Some("false"));
    }

    #[test]
    fn service_replace_keeps_cluster_ip() {
        let desired = json!({"metadata": {"name": "s"}, "spec": {"ports": [{"port": 1}]}});
        let observed = json!({
            "metadata": {"name": "s", "resourceVersion": "9"},
            "spec": {"clusterIP": "10.0.0.3", "ports": [{"port": 2}]}
        });
        assert!(drifted(ResourceKind::Service, &desired, &observed));
        let object = replacement(ResourceKind::Service, &desired, &observed);
        assert_eq!(object["spec"]["clusterIP"], "10.0.0.3");
        assert_eq!(object["metadata"]["resourceVersion"], "9");
        assert_eq!(object["spec"]["ports"], json!([{"port": 1}]));
    }

    #[test]
    fn dropped_template_record_is_drift() {
        let observed = json!({
            "metadata": {"name": "s", "labels": {"team": "blue"}, "annotations": {(crate::template::TEMPLATE_RECORD_ANNOTATION): "{}"}},
            "spec": {"ports": [{"port": 1}]}
        });
        let desired = json!({"metadata": {"name": "s"}, "spec": {"ports": [{"port": 1}]}});
        assert!(drifted(ResourceKind::Service, &desired, &observed));
        assert!(!drifted(ResourceKind::Service, &observed, &observed));
    }

    #[test]
    fn secret_data_compares_exactly() {
        let desired = json!({"metadata": {"name": "p"}, "data": {"a": "YQ=="}});
        let observed = json!({"metadata": {"name": "p"}, "data": {"a": "YQ==", "broker-1.broker.properties": "eA=="}});
        assert!(drifted(ResourceKind::Secret, &desired, &observed));
        assert!(!drifted(ResourceKind::Service, &desired, &observed));
    }
}
