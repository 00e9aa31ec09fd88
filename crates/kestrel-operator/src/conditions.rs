//! Condition bookkeeping for broker status

use crate::crds::{Condition, ConditionStatus};
use chrono::Utc;

pub const VALID: &str = "Valid";
pub const DEPLOYED: &str = "Deployed";
pub const SCALE_DOWN_PENDING: &str = "ScaleDownPending";
pub const CONFIG_APPLIED: &str = "ConfigApplied";
pub const RECONCILE_BLOCKED: &str = "ReconcileBlocked";
pub const READY: &str = "Ready";

pub const READY_REASON: &str = "Ready";
pub const NOT_READY_REASON: &str = "NotReady";
pub const NOT_READY_MESSAGE: &str =
    "Some conditions are not met, please check other conditions for details";

pub mod reasons {
    pub const VALIDATION_SUCCEEDED: &str = "ValidationSucceeded";
    pub const FAILED_RESERVED_LABEL: &str = "FailedReservedLabel";
    pub const FAILED_DUPLICATE_PROPERTIES_KEY: &str = "FailedDuplicateBrokerPropertiesKey";
    pub const FAILED_DUPLICATE_ACCEPTOR_NAME: &str = "FailedDuplicateAcceptorName";
    pub const FAILED_INVALID_TEMPLATE: &str = "FailedInvalidTemplate";
    pub const FAILED_SECRET_NOT_FOUND: &str = "FailedSecretNotFound";

    pub const ALL_PODS_READY: &str = "AllPodsReady";
    pub const PODS_NOT_READY: &str = "PodsNotReady";
    pub const WAITING_FOR_HEALTHY: &str = "WaitingForHealthy";

    pub const PENDING_EMPTY: &str = "PendingEmpty";

    pub const APPLIED: &str = "Applied";
    pub const OUT_OF_SYNC: &str = "OutOfSync";
    pub const UNABLE_TO_CHECK: &str = "UnableToCheck";

    pub const ANNOTATION_TRUE: &str = "AnnotationTrue";
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

pub fn is_false(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Upsert by type. `lastTransitionTime` moves only when `status` changes.
/// Returns true when anything other than the timestamp changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time = Some(condition.last_transition_time.unwrap_or_else(Utc::now));
                existing.reason = condition.reason;
                existing.message = condition.message;
                existing.observed_generation = condition.observed_generation;
                return true;
            }
            let changed = existing.reason != condition.reason
                || existing.message != condition.message
                || existing.observed_generation != condition.observed_generation;
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
            if existing.last_transition_time.is_none() {
                existing.last_transition_time = Some(Utc::now());
            }
            changed
        }
        None => {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(Utc::now());
            }
            conditions.push(condition);
            true
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    before != conditions.len()
}

/// Present with the same type, status, reason and message
pub fn is_present_and_equal(conditions: &[Condition], other: &Condition) -> bool {
    find(conditions, &other.type_).is_some_and(|c| {
        c.status == other.status && c.reason == other.reason && c.message == other.message
    })
}

/// Present with the same type, status and reason
pub fn is_present_and_equal_ignoring_message(conditions: &[Condition], other: &Condition) -> bool {
    find(conditions, &other.type_)
        .is_some_and(|c| c.status == other.status && c.reason == other.reason)
}

/// Recompute `Ready` as the AND over every other non-Unknown condition
pub fn set_ready_condition(conditions: &mut Vec<Condition>) {
    let all_true = conditions
        .iter()
        .filter(|c| c.type_ != READY && c.status != ConditionStatus::Unknown)
        .all(|c| c.status == ConditionStatus::True);

    let ready = if all_true {
        Condition::new(READY, ConditionStatus::True, READY_REASON, "")
    } else {
        Condition::new(READY, ConditionStatus::False, NOT_READY_REASON, NOT_READY_MESSAGE)
    };
    set_condition(conditions, ready);
}
