//! # Custom Resource Definitions
//!
//! `Broker` describes one clustered Artemis deployment; `BrokerSecurity`
//! contributes security settings to the brokers it applies to.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::EnvVar;
use kube::{CustomResource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group shared by both kinds
pub const API_GROUP: &str = "broker.kestrel.io";

/// Annotation that freezes resource mutation when set to `"true"`
pub const BLOCK_RECONCILE_ANNOTATION: &str = "broker.kestrel.io/block-reconcile";

/// Broker property that opts a deployment into managed scale-down
pub const SCALE_DOWN_TRIGGER: &str = "HAPolicyConfiguration.scaleDownConfiguration.enabled=false";

/// Broker CRD - one clustered broker deployment
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "broker.kestrel.io",
    version = "v1beta1",
    kind = "Broker",
    plural = "brokers",
    derive = "Default",
    namespaced
)]
#[kube(status = "BrokerStatus")]
#[kube(printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Size, image, storage and journal settings
    #[serde(default)]
    pub deployment_plan: DeploymentPlan,

    /// Network acceptors
    #[serde(default)]
    pub acceptors: Vec<Acceptor>,

    /// Outbound connectors
    #[serde(default)]
    pub connectors: Vec<Connector>,

    /// Management console
    #[serde(default)]
    pub console: Console,

    /// Ordered `key=value` broker property lines
    #[serde(default)]
    pub broker_properties: Vec<String>,

    /// Extra container environment variables
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Patches applied on top of generated resources
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplate>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    /// Number of broker instances
    pub size: Option<i32>,

    /// Broker container image
    pub image: Option<String>,

    /// Keep journal data on a persistent volume
    #[serde(default)]
    pub persistence_enabled: bool,

    /// Journal IO mode
    #[serde(default)]
    pub journal_type: JournalType,

    /// Form a broker cluster (default true)
    pub clustered: Option<bool>,

    /// Drain messages off removed instances before shrinking
    pub message_migration: Option<bool>,

    /// Volume claim settings used when persistence is enabled
    #[serde(default)]
    pub storage: Storage,

    /// Additional pod labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JournalType {
    Aio,
    #[default]
    Nio,
}

impl JournalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalType::Aio => "aio",
            JournalType::Nio => "nio",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    #[serde(default = "default_storage_size")]
    pub size: String,
    pub storage_class_name: Option<String>,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
        }
    }
}

fn default_storage_size() -> String {
    "2Gi".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Acceptor {
    pub name: String,
    #[serde(default = "default_acceptor_port")]
    pub port: i32,
    /// Comma separated protocol list, e.g. `CORE,AMQP`
    pub protocols: Option<String>,
    #[serde(default)]
    pub ssl_enabled: bool,
    /// Secret holding keystore and truststore; defaults to `<cr>-<name>-secret`
    pub ssl_secret: Option<String>,
    /// Create a per-instance service for this acceptor
    #[serde(default)]
    pub expose: bool,
}

fn default_acceptor_port() -> i32 {
    61616
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub name: String,
    pub host: String,
    pub port: i32,
    #[serde(default)]
    pub ssl_enabled: bool,
    pub ssl_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Console {
    #[serde(default)]
    pub expose: bool,
    #[serde(default)]
    pub ssl_enabled: bool,
    pub ssl_secret: Option<String>,
}

/// Patch applied to generated resources selected by kind and name
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    #[serde(default)]
    pub selector: TemplateSelector,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Strategic-merge patch document
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub patch: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSelector {
    /// Resource kind, e.g. `StatefulSet`; absent matches every kind
    pub kind: Option<String>,
    /// Resource name; absent matches every name
    pub name: Option<String>,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".to_string(), serde_json::Value::Bool(true));
    schema.extensions.insert("nullable".to_string(), serde_json::Value::Bool(true));
    Schema::Object(schema)
}

/// Broker status
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    /// At most one condition per type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Pod names by readiness
    #[serde(default)]
    pub pod_status: PodStatusDigest,

    /// Replica count last applied to the workload
    #[serde(default)]
    pub deployment_plan_size: i32,

    /// In-flight managed scale-down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down: Option<ScaleDownRecord>,

    /// Checksum of the broker properties last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_checksum: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct PodStatusDigest {
    #[serde(default)]
    pub ready: Vec<String>,
    #[serde(default)]
    pub starting: Vec<String>,
    #[serde(default)]
    pub stopped: Vec<String>,
}

/// Status condition
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Changes only when `status` changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: None,
            observed_generation: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Managed scale-down bookkeeping, persisted across passes
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleDownRecord {
    /// Highest ordinal being removed
    pub from_ordinal: i32,
    /// Replica count once the scale-down completes
    pub to_replicas: i32,
    pub phase: ScaleDownPhase,
    /// Ordinals whose messages have been confirmed migrated
    #[serde(default)]
    pub migrated: Vec<i32>,
}

impl ScaleDownRecord {
    /// Ordinals being removed, lowest first
    pub fn condemned(&self) -> impl Iterator<Item = i32> {
        self.to_replicas..=self.from_ordinal
    }

    pub fn all_migrated(&self) -> bool {
        self.condemned().all(|ordinal| self.migrated.contains(&ordinal))
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ScaleDownPhase {
    Pending,
    Draining,
    Complete,
}

/// Parsed block-reconcile annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReconcile {
    Absent,
    Blocked,
    Unblocked,
}

impl BlockReconcile {
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None => BlockReconcile::Absent,
            Some(v) if v.eq_ignore_ascii_case("true") => BlockReconcile::Blocked,
            Some(_) => BlockReconcile::Unblocked,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockReconcile::Blocked)
    }
}

pub const DEFAULT_IMAGE: &str = "quay.io/arkmq-org/activemq-artemis-broker-kubernetes:latest";

impl Broker {
    pub fn desired_size(&self) -> i32 {
        self.spec.deployment_plan.size.unwrap_or(1).max(0)
    }

    pub fn image(&self) -> &str {
        self.spec
            .deployment_plan
            .image
            .as_deref()
            .filter(|image| !image.is_empty() && *image != "placeholder")
            .unwrap_or(DEFAULT_IMAGE)
    }

    pub fn is_clustered(&self) -> bool {
        self.spec.deployment_plan.clustered.unwrap_or(true)
    }

    pub fn block_reconcile(&self) -> BlockReconcile {
        BlockReconcile::from_annotation(
            self.annotations()
                .get(BLOCK_RECONCILE_ANNOTATION)
                .map(String::as_str),
        )
    }

    /// Scale-down drains messages first when opted in
    pub fn managed_scale_down(&self) -> bool {
        self.spec.deployment_plan.message_migration.unwrap_or(false)
            || self
                .spec
                .broker_properties
                .iter()
                .any(|line| line.trim() == SCALE_DOWN_TRIGGER)
    }

    /// Distinct TLS secret names referenced by acceptors, connectors and console
    pub fn ssl_secrets(&self) -> Vec<String> {
        let name = self.name_any();
        let mut secrets: Vec<String> = Vec::new();
        let mut push = |secret: String| {
            if !secrets.contains(&secret) {
                secrets.push(secret);
            }
        };
        for acceptor in self.spec.acceptors.iter().filter(|a| a.ssl_enabled) {
            push(
                acceptor
                    .ssl_secret
                    .clone()
                    .unwrap_or_else(|| format!("{name}-{}-secret", acceptor.name)),
            );
        }
        for connector in self.spec.connectors.iter().filter(|c| c.ssl_enabled) {
            push(
                connector
                    .ssl_secret
                    .clone()
                    .unwrap_or_else(|| format!("{name}-{}-secret", connector.name)),
            );
        }
        if self.spec.console.ssl_enabled {
            push(
                self.spec
                    .console
                    .ssl_secret
                    .clone()
                    .unwrap_or_else(|| format!("{name}-console-secret")),
            );
        }
        secrets
    }
}

/// BrokerSecurity CRD - security settings shared by brokers in a namespace
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "broker.kestrel.io",
    version = "v1beta1",
    kind = "BrokerSecurity",
    plural = "brokersecurities",
    derive = "Default",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSecuritySpec {
    /// Broker names this applies to; empty, `*` or `""` match every broker
    #[serde(default)]
    pub apply_to_cr_names: Vec<String>,

    /// Property lines appended to each matching broker's properties
    #[serde(default)]
    pub broker_properties: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_broker_spec_serialization() {
        let spec = BrokerSpec {
            deployment_plan: DeploymentPlan {
                size: Some(3),
                persistence_enabled: true,
                journal_type: JournalType::Aio,
                ..Default::default()
            },
            acceptors: vec![Acceptor {
                name: "amqp".to_string(),
                port: 5672,
                protocols: Some("AMQP".to_string()),
                ..Default::default()
            }],
            broker_properties: vec!["globalMaxSize=512m".to_string()],
            ..Default::default()
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["deploymentPlan"]["journalType"], "aio");
        assert_eq!(json["deploymentPlan"]["persistenceEnabled"], true);

        let back: BrokerSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back.deployment_plan.size, Some(3));
        assert_eq!(back.acceptors[0].port, 5672);
    }

    #[test]
    fn test_spec_defaults_from_empty_document() {
        let spec: BrokerSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.deployment_plan.journal_type, JournalType::Nio);
        assert_eq!(spec.deployment_plan.storage.size, "2Gi");
        assert!(spec.resource_templates.is_empty());

        let broker = Broker::new("b", spec);
        assert_eq!(broker.desired_size(), 1);
        assert_eq!(broker.image(), DEFAULT_IMAGE);
        assert!(broker.is_clustered());
        assert!(!broker.managed_scale_down());
    }

    #[test]
    fn test_block_reconcile_tri_state() {
        assert_eq!(BlockReconcile::from_annotation(None), BlockReconcile::Absent);
        assert_eq!(BlockReconcile::from_annotation(Some("true")), BlockReconcile::Blocked);
        assert_eq!(BlockReconcile::from_annotation(Some(" TRUE ")), BlockReconcile::Blocked);
        assert_eq!(BlockReconcile::from_annotation(Some("false")), BlockReconcile::Unblocked);
        assert_eq!(BlockReconcile::from_annotation(Some("")), BlockReconcile::Unblocked);
    }

    #[test]
    fn test_managed_scale_down_trigger() {
        let mut broker = Broker::new("b", BrokerSpec::default());
        broker.spec.broker_properties = vec![SCALE_DOWN_TRIGGER.to_string()];
        assert!(broker.managed_scale_down());

        broker.spec.broker_properties.clear();
        broker.spec.deployment_plan.message_migration = Some(true);
        assert!(broker.managed_scale_down());
    }

    #[test]
    fn test_ssl_secrets_are_distinct() {
        let mut broker = Broker::new("b", BrokerSpec::default());
        broker.spec.acceptors = vec![
            Acceptor { name: "a".into(), ssl_enabled: true, ..Default::default() },
            Acceptor {
                name: "c".into(),
                ssl_enabled: true,
                ssl_secret: Some("b-a-secret".into()),
                ..Default::default()
            },
            Acceptor { name: "plain".into(), ..Default::default() },
        ];
        broker.spec.console.ssl_enabled = true;
        assert_eq!(broker.ssl_secrets(), vec!["b-a-secret", "b-console-secret"]);
    }

    #[test]
    fn test_scale_down_record_condemned() {
        let record = ScaleDownRecord {
            from_ordinal: 2,
            to_replicas: 1,
            phase: ScaleDownPhase::Draining,
            migrated: vec![2],
        };
        assert_eq!(record.condemned().collect::<Vec<_>>(), vec![1, 2]);
        assert!(!record.all_migrated());
    }

    #[test]
    fn test_crd_generation() {
        let crd = Broker::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("brokers.broker.kestrel.io"));
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, "Broker");

        let security = BrokerSecurity::crd();
        assert_eq!(security.spec.names.plural, "brokersecurities");
    }

    #[test]
    fn test_condition_wire_format() {
        let condition = Condition::new("Ready", ConditionStatus::True, "Ready", "");
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_none());
    }
}
