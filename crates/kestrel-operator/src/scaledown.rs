//! Scale-down coordinator
//!
//! A size decrease on a broker with managed scale-down holds the workload at
//! its current size, injects the drain property into every condemned
//! instance, and only releases the replica reduction once each of them has
//! been confirmed empty.
//!
//! ```text
//! Pending  -> Draining   drain keys written
//! Draining -> Complete   all condemned ordinals empty and workload shrunk
//! any      -> (dropped)  desired size back at or above the original size
//! ```

use crate::crds::{Broker, ScaleDownPhase, ScaleDownRecord};
use crate::health::{BrokerProbe, ProbeTarget};
use kube::ResourceExt;
use tracing::{debug, info};

/// Replica count and drain targets for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDownPlan {
    /// Replica count the synchronizer may apply
    pub replicas: i32,
    /// Ordinals that carry the drain property
    pub draining: Vec<i32>,
    /// Record to persist; `None` once complete or cancelled
    pub record: Option<ScaleDownRecord>,
}

impl ScaleDownPlan {
    fn direct(replicas: i32) -> Self {
        Self {
            replicas,
            draining: Vec::new(),
            record: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.record.is_some()
    }
}

/// Create, retarget or cancel the record for the current desired size
pub fn transition(
    previous: Option<ScaleDownRecord>,
    desired: i32,
    observed_replicas: i32,
    managed: bool,
) -> Option<ScaleDownRecord> {
    match previous {
        Some(record) if desired > record.from_ordinal => {
            info!(from = record.from_ordinal, desired, "scale-down cancelled");
            None
        }
        Some(mut record) if desired != record.to_replicas => {
            info!(from = record.to_replicas, to = desired, "scale-down retargeted");
            record.to_replicas = desired;
            record.phase = ScaleDownPhase::Pending;
            record.migrated.retain(|o| *o >= desired);
            Some(record)
        }
        Some(record) => Some(record),
        None if managed && observed_replicas > desired => {
            info!(from = observed_replicas, to = desired, "scale-down started");
            Some(ScaleDownRecord {
                from_ordinal: observed_replicas - 1,
                to_replicas: desired,
                phase: ScaleDownPhase::Pending,
                migrated: Vec::new(),
            })
        }
        None => None,
    }
}

/// Sequences drain, confirmation and the final replica reduction
pub struct ScaleDownCoordinator<'a> {
    probe: &'a dyn BrokerProbe,
}

impl<'a> ScaleDownCoordinator<'a> {
    pub fn new(probe: &'a dyn BrokerProbe) -> Self {
        Self { probe }
    }

    /// Plan this pass. `observed_replicas` is `None` when no workload exists;
    /// `live_ordinals` are the instances whose pods still exist.
    pub async fn plan(
        &self,
        broker: &Broker,
        previous: Option<ScaleDownRecord>,
        observed_replicas: Option<i32>,
        live_ordinals: &[i32],
    ) -> ScaleDownPlan {
        let desired = broker.desired_size();
        let Some(observed) = observed_replicas else {
            return ScaleDownPlan::direct(desired);
        };

        let Some(mut record) = transition(previous, desired, observed, broker.managed_scale_down()) else {
            return ScaleDownPlan::direct(desired);
        };

        match record.phase {
            ScaleDownPhase::Pending => record.phase = ScaleDownPhase::Draining,
            ScaleDownPhase::Draining | ScaleDownPhase::Complete => {
                self.confirm_migration(broker, &mut record, observed, live_ordinals).await;
            }
        }

        if record.all_migrated() && observed <= record.to_replicas {
            info!(replicas = record.to_replicas, "scale-down complete");
            return ScaleDownPlan::direct(desired);
        }

        let replicas = if record.all_migrated() {
            record.to_replicas
        } else {
            record.from_ordinal + 1
        };
        ScaleDownPlan {
            replicas,
            draining: record.condemned().collect(),
            record: Some(record),
        }
    }

    /// A missing pod only counts as migrated once the workload no longer
    /// includes its ordinal; below that it may just be restarting.
    async fn confirm_migration(
        &self,
        broker: &Broker,
        record: &mut ScaleDownRecord,
        observed_replicas: i32,
        live_ordinals: &[i32],
    ) {
        let namespace = broker.namespace().unwrap_or_default();
        let name = broker.name_any();
        let pending: Vec<i32> = record.condemned().filter(|o| !record.migrated.contains(o)).collect();

        for ordinal in pending {
            if !live_ordinals.contains(&ordinal) {
                if ordinal >= observed_replicas {
                    debug!(ordinal, "condemned instance already removed");
                    record.migrated.push(ordinal);
                } else {
                    debug!(ordinal, "condemned pod missing, waiting for it to return");
                }
                continue;
            }
            let target = ProbeTarget::new(&namespace, &name, ordinal);
            match self.probe.pending_messages(&target).await {
                Ok(0) => {
                    info!(%target, "messages migrated");
                    record.migrated.push(ordinal);
                }
                Ok(count) => debug!(%target, count, "waiting for messages to migrate"),
                Err(err) => debug!(%target, error = %err, "waiting for broker to report messages"),
            }
        }
        record.migrated.sort_unstable();
    }
}
