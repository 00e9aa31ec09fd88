//! Status aggregation
//!
//! Every pass rebuilds the derived conditions from what was observed:
//! pod readiness, cached broker health, the scale-down record and the
//! checksum each broker reports for its loaded properties.

use crate::conditions::{self, reasons, CONFIG_APPLIED, DEPLOYED, SCALE_DOWN_PENDING};
use crate::crds::{BrokerStatus, Condition, ConditionStatus, PodStatusDigest, ScaleDownRecord};
use crate::health::ProbeResult;
use crate::resources::PROPERTIES_KEY;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Health of one observed-ready instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceHealth {
    pub ordinal: i32,
    pub result: ProbeResult,
}

/// Everything one pass learned
#[derive(Debug, Clone)]
pub struct Observations<'a> {
    pub desired: i32,
    pub replicas: i32,
    pub pods: &'a [Pod],
    pub health: &'a [InstanceHealth],
    pub scale_down: Option<&'a ScaleDownRecord>,
    pub properties_checksum: &'a str,
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn pod_is_stopped(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
        || pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Failed" || phase == "Succeeded")
}

/// Sort pod names into ready, starting and stopped
pub fn pod_status_digest(pods: &[Pod]) -> PodStatusDigest {
    let mut digest = PodStatusDigest::default();
    for pod in pods {
        let name = pod.name_any();
        if pod_is_stopped(pod) {
            digest.stopped.push(name);
        } else if pod_is_ready(pod) {
            digest.ready.push(name);
        } else {
            digest.starting.push(name);
        }
    }
    digest.ready.sort();
    digest.starting.sort();
    digest.stopped.sort();
    digest
}

/// `{name: Phase [{Type=Status Reason Message}...]}`, or `{name}` without status
pub fn pod_digest(pod: &Pod) -> String {
    let name = pod.name_any();
    let Some(status) = &pod.status else {
        return format!("{{{name}}}");
    };
    let conditions = status
        .conditions
        .iter()
        .flatten()
        .map(|c| {
            let parts = [
                format!("{}={}", c.type_, c.status),
                c.reason.clone().unwrap_or_default(),
                c.message.clone().unwrap_or_default(),
            ];
            let parts: Vec<&str> = parts.iter().map(String::as_str).filter(|p| !p.is_empty()).collect();
            format!("{{{}}}", parts.join(" "))
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{{{name}: {} [{conditions}]}}",
        status.phase.as_deref().unwrap_or("Unknown")
    )
}

/// `Deployed` counts ready pods and healthy brokers against the desired size
pub fn deployed_condition(desired: i32, digest: &PodStatusDigest, pods: &[Pod], health: &[InstanceHealth]) -> Condition {
    let ready = i32::try_from(digest.ready.len()).unwrap_or(i32::MAX);
    if ready < desired {
        let starting: Vec<String> = pods
            .iter()
            .filter(|p| digest.starting.contains(&p.name_any()))
            .map(pod_digest)
            .collect();
        let mut message = format!("{ready}/{desired} pods ready");
        if !starting.is_empty() {
            message.push(' ');
            message.push_str(&starting.join(" "));
        }
        return Condition::new(DEPLOYED, ConditionStatus::False, reasons::PODS_NOT_READY, message);
    }

    let healthy = i32::try_from(health.iter().filter(|h| h.result.is_healthy()).count()).unwrap_or(i32::MAX);
    if healthy < desired {
        let waiting: Vec<String> = health
            .iter()
            .filter(|h| !h.result.is_healthy())
            .map(|h| format!("{{{}: {}}}", h.ordinal, h.result.detail()))
            .collect();
        return Condition::new(
            DEPLOYED,
            ConditionStatus::False,
            reasons::WAITING_FOR_HEALTHY,
            format!("{healthy}/{desired} brokers healthy {}", waiting.join(" ")).trim_end().to_string(),
        );
    }
    Condition::new(DEPLOYED, ConditionStatus::True, reasons::ALL_PODS_READY, "")
}

/// `ConfigApplied` compares broker-reported checksums with the written properties
pub fn config_applied_condition(health: &[InstanceHealth], checksum: &str) -> Condition {
    let reporting: Vec<(i32, Option<&String>)> = health
        .iter()
        .filter_map(|h| h.result.health().map(|b| (h.ordinal, b.applied_checksums.get(PROPERTIES_KEY))))
        .collect();
    if reporting.is_empty() {
        return Condition::new(
            CONFIG_APPLIED,
            ConditionStatus::Unknown,
            reasons::UNABLE_TO_CHECK,
            "no healthy broker to check",
        );
    }
    let stale: Vec<String> = reporting
        .iter()
        .filter(|(_, reported)| reported.map(String::as_str) != Some(checksum))
        .map(|(ordinal, _)| ordinal.to_string())
        .collect();
    if stale.is_empty() {
        Condition::new(CONFIG_APPLIED, ConditionStatus::True, reasons::APPLIED, "")
    } else {
        Condition::new(
            CONFIG_APPLIED,
            ConditionStatus::False,
            reasons::OUT_OF_SYNC,
            format!("{PROPERTIES_KEY} not yet applied on ordinals {}", stale.join(",")),
        )
    }
}

fn scale_down_condition(record: &ScaleDownRecord) -> Condition {
    let condemned: Vec<String> = record
        .condemned()
        .filter(|o| !record.migrated.contains(o))
        .map(|o| o.to_string())
        .collect();
    Condition::new(
        SCALE_DOWN_PENDING,
        ConditionStatus::True,
        reasons::PENDING_EMPTY,
        format!(
            "waiting for ordinals [{}] to drain before scaling to {}",
            condemned.join(","),
            record.to_replicas
        ),
    )
}

/// Rebuild the derived parts of `status` and recompute `Ready`
pub fn aggregate(status: &mut BrokerStatus, observed: &Observations<'_>) {
    let digest = pod_status_digest(observed.pods);

    conditions::set_condition(
        &mut status.conditions,
        deployed_condition(observed.desired, &digest, observed.pods, observed.health),
    );
    conditions::set_condition(
        &mut status.conditions,
        config_applied_condition(observed.health, observed.properties_checksum),
    );
    match observed.scale_down {
        Some(record) => {
            conditions::set_condition(&mut status.conditions, scale_down_condition(record));
        }
        None => {
            conditions::remove_condition(&mut status.conditions, SCALE_DOWN_PENDING);
        }
    }
    conditions::set_ready_condition(&mut status.conditions);

    status.pod_status = digest;
    status.deployment_plan_size = observed.replicas;
    status.scale_down = observed.scale_down.cloned();
    status.applied_checksum = Some(observed.properties_checksum.to_string());
}
