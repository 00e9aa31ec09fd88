//! # Broker Reconciler
//!
//! One pass over one `Broker`: honour the block annotation, validate, plan
//! any managed scale-down, sync resources, probe health and publish status.
//! Passes for the same broker never overlap; the controller queue serializes
//! them.

use crate::client::{ClusterApi, ResourceKind};
use crate::conditions::{self, reasons, RECONCILE_BLOCKED};
use crate::crds::{BlockReconcile, Broker, BrokerStatus, Condition, ConditionStatus};
use crate::error::{Error, Result};
use crate::health::{GenerationMarker, HealthCache, ProbeTarget};
use crate::names::Namer;
use crate::registry::SecurityRegistry;
use crate::resources;
use crate::scaledown::ScaleDownCoordinator;
use crate::status::{self, InstanceHealth, Observations};
use crate::sync::{ResourceSynchronizer, SyncPlan};
use crate::validation;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, instrument};

/// Requeue delay after a pass that wrote resources
pub const DRIFT_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue delay while a scale-down waits for migration
pub const SCALE_DOWN_REQUEUE: Duration = Duration::from_secs(5);

/// Reconciler for Broker resources
pub struct BrokerReconciler {
    cluster: Arc<dyn ClusterApi>,
    health: Arc<HealthCache>,
    registry: Arc<SecurityRegistry>,
    resync_period: Duration,
}

impl BrokerReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        health: Arc<HealthCache>,
        registry: Arc<SecurityRegistry>,
        resync_period: Duration,
    ) -> Self {
        Self {
            cluster,
            health,
            registry,
            resync_period,
        }
    }

    pub fn health(&self) -> &HealthCache {
        &self.health
    }

    /// Main reconciliation logic
    #[instrument(skip(self, broker), fields(broker = %broker.name_any(), namespace = ?broker.namespace()))]
    pub async fn reconcile(&self, broker: &Broker) -> Result<Action> {
        let namespace = broker.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let name = broker.name_any();

        if broker.metadata.deletion_timestamp.is_some() {
            return Ok(self.cleanup(broker));
        }

        let namer = Namer::new(&name, &namespace);
        let original = broker.status.clone().unwrap_or_default();
        let mut status = original.clone();

        match broker.block_reconcile() {
            BlockReconcile::Blocked => {
                info!("reconcile blocked by annotation");
                conditions::set_condition(
                    &mut status.conditions,
                    Condition::new(RECONCILE_BLOCKED, ConditionStatus::True, reasons::ANNOTATION_TRUE, ""),
                );
                self.persist(&namer, &original, &status).await?;
                return Ok(Action::requeue(self.resync_period));
            }
            BlockReconcile::Absent | BlockReconcile::Unblocked => {
                if conditions::remove_condition(&mut status.conditions, RECONCILE_BLOCKED) {
                    info!("reconcile unblocked");
                }
            }
        }

        let validation = validation::validate(broker, self.cluster.as_ref(), &mut status.conditions).await;
        if !validation.valid {
            conditions::set_ready_condition(&mut status.conditions);
            self.persist(&namer, &original, &status).await?;
            return Ok(if validation.retryable {
                Action::requeue(self.resync_period)
            } else {
                Action::await_change()
            });
        }

        let observed_replicas = self
            .cluster
            .get(ResourceKind::StatefulSet, &namespace, &namer.statefulset())
            .await?
            .and_then(|ss| ss.pointer("/spec/replicas").and_then(serde_json::Value::as_i64))
            .map(|r| i32::try_from(r).unwrap_or(i32::MAX));
        let pods = self.cluster.list_pods(&namespace, &namer.label_selector()).await?;
        let live: Vec<i32> = pods.iter().filter_map(|p| namer.ordinal_of(&p.name_any())).collect();

        let plan = ScaleDownCoordinator::new(self.health.probe())
            .plan(broker, status.scale_down.clone(), observed_replicas, &live)
            .await;

        let security = self.registry.properties_for(&namespace, &name).await;
        let report = ResourceSynchronizer::new(self.cluster.as_ref(), broker, &namer)
            .sync(&SyncPlan {
                replicas: plan.replicas,
                properties: resources::properties_content(broker, &security),
                draining: plan.draining.clone(),
            })
            .await?;

        self.health.retain_ordinals(&namespace, &name, plan.replicas);
        let generation = broker.metadata.generation.unwrap_or_default();
        let mut health = Vec::new();
        for pod in pods.iter().filter(|p| status::pod_is_ready(p)) {
            let Some(ordinal) = namer.ordinal_of(&pod.name_any()).filter(|o| *o < plan.replicas) else {
                continue;
            };
            let marker = GenerationMarker::new(
                generation,
                plan.replicas,
                pod.metadata.resource_version.as_deref().unwrap_or_default(),
            );
            let cached = self
                .health
                .get_or_probe(&ProbeTarget::new(&namespace, &name, ordinal), &marker)
                .await;
            health.push(InstanceHealth {
                ordinal,
                result: cached.result,
            });
        }

        status::aggregate(
            &mut status,
            &Observations {
                desired: broker.desired_size(),
                replicas: plan.replicas,
                pods: &pods,
                health: &health,
                scale_down: plan.record.as_ref(),
                properties_checksum: &report.properties_checksum,
            },
        );
        self.persist(&namer, &original, &status).await?;

        if report.writes() > 0 {
            debug!(written = ?report.written, "drift corrected");
            Ok(Action::requeue(DRIFT_REQUEUE))
        } else if plan.is_pending() {
            Ok(Action::requeue(SCALE_DOWN_REQUEUE))
        } else {
            Ok(Action::requeue(self.resync_period))
        }
    }

    /// Forget cached state of a deleted broker; owned resources go with it
    pub fn cleanup(&self, broker: &Broker) -> Action {
        let namespace = broker.namespace().unwrap_or_default();
        info!("broker deleted, dropping cached health");
        self.health.forget(&namespace, &broker.name_any());
        Action::await_change()
    }

    async fn persist(&self, namer: &Namer, original: &BrokerStatus, status: &BrokerStatus) -> Result<()> {
        if original == status {
            return Ok(());
        }
        self.cluster
            .patch_broker_status(namer.namespace(), namer.name(), status)
            .await
    }
}
