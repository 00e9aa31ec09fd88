//! Registry of security handlers shared across broker reconciles
//!
//! Owned by the operator context and passed to both controllers. Broker passes
//! read it concurrently; the security controller is the only writer.

use crate::crds::BrokerSecurity;
use kube::ResourceExt;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Namespaced name of a `BrokerSecurity`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Security settings contributed to matching brokers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityHandler {
    pub key: ObjectKey,
    pub apply_to: Vec<String>,
    pub properties: Vec<String>,
}

impl SecurityHandler {
    pub fn from_resource(security: &BrokerSecurity) -> Self {
        Self {
            key: ObjectKey::new(&security.namespace().unwrap_or_default(), &security.name_any()),
            apply_to: security.spec.apply_to_cr_names.clone(),
            properties: security.spec.broker_properties.clone(),
        }
    }

    /// Same namespace, and no name filter or one naming this broker
    pub fn applies_to(&self, namespace: &str, broker: &str) -> bool {
        self.key.namespace == namespace
            && (self.apply_to.is_empty()
                || self
                    .apply_to
                    .iter()
                    .any(|n| n.is_empty() || n == "*" || n == broker))
    }

    pub fn diff(&self, other: &SecurityHandler) -> SecurityHandlerDiff {
        let apply_to = self.apply_to != other.apply_to;
        let properties = self.properties != other.properties;
        SecurityHandlerDiff {
            apply_to,
            properties,
            changed: apply_to || properties,
        }
    }
}

/// Field-level difference between two versions of a handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityHandlerDiff {
    pub apply_to: bool,
    pub properties: bool,
    pub changed: bool,
}

#[derive(Default)]
pub struct SecurityRegistry {
    handlers: RwLock<HashMap<ObjectKey, SecurityHandler>>,
}

impl SecurityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update; returns false when nothing changed
    pub async fn upsert(&self, handler: SecurityHandler) -> bool {
        let mut handlers = self.handlers.write().await;
        let diff = match handlers.get(&handler.key) {
            Some(existing) => existing.diff(&handler),
            None => SecurityHandlerDiff {
                apply_to: true,
                properties: true,
                changed: true,
            },
        };
        if !diff.changed {
            debug!(key = %handler.key, "security handler unchanged");
            return false;
        }
        info!(key = %handler.key, apply_to = diff.apply_to, properties = diff.properties, "security handler updated");
        handlers.insert(handler.key.clone(), handler);
        true
    }

    pub async fn remove(&self, key: &ObjectKey) -> bool {
        let removed = self.handlers.write().await.remove(key).is_some();
        if removed {
            info!(%key, "security handler removed");
        }
        removed
    }

    /// Property lines for one broker, ordered by handler key
    pub async fn properties_for(&self, namespace: &str, broker: &str) -> Vec<String> {
        let handlers = self.handlers.read().await;
        let mut matching: Vec<&SecurityHandler> = handlers.values().filter(|h| h.applies_to(namespace, broker)).collect();
        matching.sort_by(|a, b| a.key.cmp(&b.key));
        matching.into_iter().flat_map(|h| h.properties.iter().cloned()).collect()
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }
}
