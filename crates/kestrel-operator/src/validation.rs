//! Spec validation gate
//!
//! Spec problems are terminal for the current generation and are reported
//! through the `Valid` condition. A failed lookup while validating is the
//! only retryable outcome.

use crate::client::{ClusterApi, ResourceKind};
use crate::conditions::{self, reasons, VALID};
use crate::crds::{Broker, Condition, ConditionStatus};
use crate::names::RESERVED_LABEL_KEYS;
use kube::ResourceExt;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Outcome of one validation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub retryable: bool,
}

impl Validation {
    pub const VALID: Validation = Validation { valid: true, retryable: false };
    pub const INVALID: Validation = Validation { valid: false, retryable: false };
    pub const RETRY: Validation = Validation { valid: false, retryable: true };
}

struct Violation {
    reason: &'static str,
    message: String,
}

/// Key portion of a `key=value` property line.
///
/// The scan stops at the first `=`. When that `=` is escaped the key ends
/// before the backslash, so keys that differ only after an escaped `=` compare
/// equal. Config keys in practice never contain `\=`.
pub fn property_key(line: &str) -> &str {
    let mut previous = None;
    for (index, c) in line.char_indices() {
        if c == '=' {
            if previous == Some('\\') {
                return &line[..index - 1];
            }
            return &line[..index];
        }
        previous = Some(c);
    }
    line
}

/// First repeated key, in line order
pub fn duplicate_property_key(lines: &[String]) -> Option<&str> {
    let mut seen = HashSet::new();
    lines
        .iter()
        .map(|line| property_key(line.trim_start()))
        .find(|key| !seen.insert(*key))
}

fn reserved_labels(broker: &Broker) -> Vec<Violation> {
    let mut found = Vec::new();
    for (index, template) in broker.spec.resource_templates.iter().enumerate() {
        for key in template.labels.keys().filter(|k| RESERVED_LABEL_KEYS.contains(&k.as_str())) {
            found.push(Violation {
                reason: reasons::FAILED_RESERVED_LABEL,
                message: format!("Templates[{index}] has reserved label key {key}"),
            });
        }
    }
    found
}

fn duplicate_properties(broker: &Broker) -> Option<Violation> {
    duplicate_property_key(&broker.spec.broker_properties).map(|key| Violation {
        reason: reasons::FAILED_DUPLICATE_PROPERTIES_KEY,
        message: format!("brokerProperties has a duplicate key {key}"),
    })
}

fn duplicate_names(broker: &Broker) -> Option<Violation> {
    let mut acceptors = HashSet::new();
    if let Some(a) = broker.spec.acceptors.iter().find(|a| !acceptors.insert(a.name.as_str())) {
        return Some(Violation {
            reason: reasons::FAILED_DUPLICATE_ACCEPTOR_NAME,
            message: format!("acceptor name {} is used more than once", a.name),
        });
    }
    let mut connectors = HashSet::new();
    broker
        .spec
        .connectors
        .iter()
        .find(|c| !connectors.insert(c.name.as_str()))
        .map(|c| Violation {
            reason: reasons::FAILED_DUPLICATE_ACCEPTOR_NAME,
            message: format!("connector name {} is used more than once", c.name),
        })
}

fn invalid_templates(broker: &Broker) -> Vec<Violation> {
    broker
        .spec
        .resource_templates
        .iter()
        .enumerate()
        .filter(|(_, t)| t.patch.as_ref().is_some_and(|p| !p.is_object()))
        .map(|(index, _)| Violation {
            reason: reasons::FAILED_INVALID_TEMPLATE,
            message: format!("Templates[{index}].patch must be an object"),
        })
        .collect()
}

/// Check the spec and record the `Valid` condition
pub async fn validate(broker: &Broker, cluster: &dyn ClusterApi, status_conditions: &mut Vec<Condition>) -> Validation {
    let name = broker.name_any();

    let mut violations = reserved_labels(broker);
    violations.extend(duplicate_properties(broker));
    violations.extend(duplicate_names(broker));
    violations.extend(invalid_templates(broker));

    if let Some(first) = violations.first() {
        let message = violations.iter().map(|v| v.message.as_str()).collect::<Vec<_>>().join("; ");
        debug!(broker = %name, reason = first.reason, %message, "spec is invalid");
        conditions::set_condition(
            status_conditions,
            Condition::new(VALID, ConditionStatus::False, first.reason, message),
        );
        return Validation::INVALID;
    }

    let namespace = broker.namespace().unwrap_or_default();
    for secret in broker.ssl_secrets() {
        match cluster.get(ResourceKind::Secret, &namespace, &secret).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                conditions::set_condition(
                    status_conditions,
                    Condition::new(
                        VALID,
                        ConditionStatus::False,
                        reasons::FAILED_SECRET_NOT_FOUND,
                        format!("ssl secret {secret} not found"),
                    ),
                );
                return Validation::RETRY;
            }
            Err(err) => {
                warn!(broker = %name, %secret, error = %err, "could not check ssl secret");
                return Validation::RETRY;
            }
        }
    }

    conditions::set_condition(
        status_conditions,
        Condition::new(VALID, ConditionStatus::True, reasons::VALIDATION_SUCCEEDED, ""),
    );
    Validation::VALID
}
