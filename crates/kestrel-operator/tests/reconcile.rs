mod common;

use common::*;
use k8s_openapi::api::core::v1::Secret;
use kestrel_operator::client::ResourceKind;
use kestrel_operator::conditions::{self, READY, RECONCILE_BLOCKED, SCALE_DOWN_PENDING, VALID};
use kestrel_operator::crds::{
    Acceptor, ConditionStatus, ResourceTemplate, ScaleDownPhase, TemplateSelector, BLOCK_RECONCILE_ANNOTATION,
};
use kestrel_operator::reconciler::{DRIFT_REQUEUE, SCALE_DOWN_REQUEUE};
use kestrel_operator::registry::{ObjectKey, SecurityHandler};
use kestrel_operator::resources::{self, ordinal_properties_key, PROPERTIES_KEY};
use kestrel_operator::BrokerReconciler;
use kube::runtime::controller::Action;

fn condition_status(broker: &kestrel_operator::Broker, type_: &str) -> Option<ConditionStatus> {
    let status = broker.status.as_ref()?;
    conditions::find(&status.conditions, type_).map(|c| c.status)
}

fn props_secret(h: &Harness) -> Secret {
    serde_json::from_value(h.cluster.object(ResourceKind::Secret, "ex-props").expect("props secret")).unwrap()
}

fn props_keys(h: &Harness) -> Vec<String> {
    props_secret(h).data.unwrap_or_default().into_keys().collect()
}

#[tokio::test]
async fn first_pass_creates_and_second_pass_writes_nothing() {
    let h = Harness::new();
    let mut broker = broker(2);

    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(DRIFT_REQUEUE));
    assert_eq!(h.cluster.count(ResourceKind::StatefulSet), 1);
    assert!(h.cluster.object(ResourceKind::Service, "ex-hdls-svc").is_some());
    assert!(h.cluster.object(ResourceKind::Service, "ex-ping-svc").is_some());
    assert!(h.cluster.object(ResourceKind::Secret, "ex-props").is_some());
    assert_eq!(h.cluster.replicas(), Some(2));
    assert_eq!(condition_status(&broker, VALID), Some(ConditionStatus::True));
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::False));

    let writes = h.cluster.writes();
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(RESYNC));
    assert_eq!(h.cluster.writes(), writes, "steady state must not write");
}

#[tokio::test]
async fn exposed_acceptors_get_per_ordinal_services() {
    let h = Harness::new();
    let mut broker = broker(2);
    broker.spec.acceptors = vec![Acceptor {
        name: "amqp".to_string(),
        port: 5672,
        expose: true,
        ..Default::default()
    }];

    h.pass(&mut broker).await.unwrap();
    assert!(h.cluster.object(ResourceKind::Service, "ex-amqp-0-svc").is_some());
    assert!(h.cluster.object(ResourceKind::Service, "ex-amqp-1-svc").is_some());

    let writes = h.cluster.writes();
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.cluster.writes(), writes);

    // shrinking the broker or hiding the acceptor removes its services
    broker.spec.deployment_plan.size = Some(1);
    broker.spec.console.expose = true;
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(DRIFT_REQUEUE));
    assert!(h.cluster.object(ResourceKind::Service, "ex-amqp-0-svc").is_some());
    assert!(h.cluster.object(ResourceKind::Service, "ex-amqp-1-svc").is_none());
    assert!(h.cluster.object(ResourceKind::Service, "ex-wconsj-0-svc").is_some());

    broker.spec.acceptors[0].expose = false;
    h.pass(&mut broker).await.unwrap();
    assert!(h.cluster.object(ResourceKind::Service, "ex-amqp-0-svc").is_none());
    assert!(h.cluster.object(ResourceKind::Service, "ex-wconsj-0-svc").is_some());
    assert!(h.cluster.object(ResourceKind::Service, "ex-ping-svc").is_some());
    assert!(h.cluster.object(ResourceKind::Service, "ex-hdls-svc").is_some());

    let writes = h.cluster.writes();
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.cluster.writes(), writes);
}

#[tokio::test]
async fn removed_templates_are_undone() {
    let h = Harness::new();
    let mut broker = broker(1);
    broker.spec.resource_templates = vec![
        ResourceTemplate {
            labels: [("team".to_string(), "blue".to_string())].into(),
            ..Default::default()
        },
        ResourceTemplate {
            selector: TemplateSelector {
                kind: Some("StatefulSet".to_string()),
                name: None,
            },
            patch: Some(serde_json::json!({"spec": {"minReadySeconds": 5}})),
            ..Default::default()
        },
    ];
    let label = |h: &Harness, kind, name| {
        h.cluster
            .object(kind, name)
            .and_then(|o| o.pointer("/metadata/labels/team").cloned())
    };

    h.pass(&mut broker).await.unwrap();
    assert_eq!(label(&h, ResourceKind::StatefulSet, "ex-ss"), Some(serde_json::json!("blue")));
    assert_eq!(label(&h, ResourceKind::Service, "ex-ping-svc"), Some(serde_json::json!("blue")));
    let writes = h.cluster.writes();
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.cluster.writes(), writes, "templated objects are stable");

    broker.spec.resource_templates.clear();
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(DRIFT_REQUEUE));
    assert_eq!(label(&h, ResourceKind::StatefulSet, "ex-ss"), None);
    assert_eq!(label(&h, ResourceKind::Service, "ex-ping-svc"), None);
    assert_eq!(label(&h, ResourceKind::Secret, "ex-props"), None);
    let ss = h.cluster.object(ResourceKind::StatefulSet, "ex-ss").unwrap();
    assert!(ss.pointer("/spec/minReadySeconds").is_none());

    let writes = h.cluster.writes();
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.cluster.writes(), writes);
}

#[tokio::test]
async fn ready_once_every_broker_is_healthy_and_applied() {
    let h = Harness::new();
    let mut broker = broker(2);
    h.probe
        .set_applied_checksum(&resources::properties_checksum(&resources::properties_content(&broker, &[])));

    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0, 1]);

    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(RESYNC));
    assert_eq!(condition_status(&broker, conditions::DEPLOYED), Some(ConditionStatus::True));
    assert_eq!(condition_status(&broker, conditions::CONFIG_APPLIED), Some(ConditionStatus::True));
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::True));
    assert_eq!(broker.status.as_ref().unwrap().pod_status.ready.len(), 2);
    assert_eq!(h.probe.status_calls(), 2);

    // same generation marker: served from the cache
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.probe.status_calls(), 2);
}

#[tokio::test]
async fn unreachable_broker_is_probed_again() {
    let h = Harness::new();
    let mut broker = broker(1);
    h.report_applied(&broker);
    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0]);
    h.probe.set_unreachable_for(1);

    h.pass(&mut broker).await.unwrap();
    assert_eq!(condition_status(&broker, conditions::DEPLOYED), Some(ConditionStatus::False));
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::False));

    // nothing changed on the cluster, the broker answers this time
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.probe.status_calls(), 2);
    assert_eq!(condition_status(&broker, conditions::DEPLOYED), Some(ConditionStatus::True));
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::True));
}

#[tokio::test]
async fn stale_properties_keep_config_unapplied() {
    let h = Harness::new();
    let mut broker = broker(1);
    h.probe.set_applied_checksum("1");

    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0]);
    h.pass(&mut broker).await.unwrap();

    assert_eq!(condition_status(&broker, conditions::CONFIG_APPLIED), Some(ConditionStatus::False));
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::False));
}

#[tokio::test]
async fn managed_scale_down_drains_before_shrinking() {
    let h = Harness::new();
    let mut broker = broker(3);
    broker.spec.deployment_plan.message_migration = Some(true);

    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0, 1, 2]);
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.cluster.replicas(), Some(3));

    broker.spec.deployment_plan.size = Some(1);
    h.probe.set_messages(1, 4);
    h.probe.set_messages(2, 9);

    // drain keys go out, replicas held
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(DRIFT_REQUEUE));
    assert_eq!(h.cluster.replicas(), Some(3));
    let keys = props_keys(&h);
    assert!(keys.contains(&ordinal_properties_key(1)));
    assert!(keys.contains(&ordinal_properties_key(2)));
    let record = broker.status.as_ref().unwrap().scale_down.clone().unwrap();
    assert_eq!((record.from_ordinal, record.to_replicas), (2, 1));
    assert_eq!(record.phase, ScaleDownPhase::Draining);
    assert_eq!(condition_status(&broker, SCALE_DOWN_PENDING), Some(ConditionStatus::True));

    // messages still present
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(SCALE_DOWN_REQUEUE));
    assert_eq!(h.cluster.replicas(), Some(3));

    h.probe.set_messages(1, 0);
    h.probe.set_messages(2, 0);
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(DRIFT_REQUEUE));
    assert_eq!(h.cluster.replicas(), Some(1));

    h.cluster.set_ready_pods(&[0]);
    h.pass(&mut broker).await.unwrap();
    assert!(broker.status.as_ref().unwrap().scale_down.is_none());
    assert_eq!(condition_status(&broker, SCALE_DOWN_PENDING), None);
    assert_eq!(props_keys(&h), vec![PROPERTIES_KEY.to_string()]);

    let writes = h.cluster.writes();
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(RESYNC));
    assert_eq!(h.cluster.writes(), writes);
}

#[tokio::test]
async fn size_increase_cancels_scale_down() {
    let h = Harness::new();
    let mut broker = broker(3);
    broker.spec.deployment_plan.message_migration = Some(true);
    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0, 1, 2]);

    broker.spec.deployment_plan.size = Some(1);
    h.probe.set_messages(2, 1);
    h.pass(&mut broker).await.unwrap();
    assert!(broker.status.as_ref().unwrap().scale_down.is_some());

    broker.spec.deployment_plan.size = Some(3);
    h.pass(&mut broker).await.unwrap();
    assert!(broker.status.as_ref().unwrap().scale_down.is_none());
    assert_eq!(condition_status(&broker, SCALE_DOWN_PENDING), None);
    assert_eq!(h.cluster.replicas(), Some(3));
    assert_eq!(props_keys(&h), vec![PROPERTIES_KEY.to_string()]);
}

#[tokio::test]
async fn unmanaged_scale_down_is_direct() {
    let h = Harness::new();
    let mut broker = broker(3);
    h.pass(&mut broker).await.unwrap();

    broker.spec.deployment_plan.size = Some(1);
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.cluster.replicas(), Some(1));
    assert!(broker.status.as_ref().unwrap().scale_down.is_none());
}

#[tokio::test]
async fn scale_down_prunes_cached_health() {
    let h = Harness::new();
    let mut broker = broker(3);
    h.report_applied(&broker);
    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0, 1, 2]);
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.reconciler.health().len(), 3);

    broker.spec.deployment_plan.size = Some(1);
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.reconciler.health().len(), 1);
}

#[tokio::test]
async fn cleanup_drops_cached_health() {
    let h = Harness::new();
    let mut broker = broker(2);
    h.report_applied(&broker);
    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0, 1]);
    h.pass(&mut broker).await.unwrap();
    assert_eq!(h.reconciler.health().len(), 2);

    assert_eq!(h.reconciler.cleanup(&broker), Action::await_change());
    assert!(h.reconciler.health().is_empty());
}

#[tokio::test]
async fn block_annotation_freezes_resources() {
    let h = Harness::new();
    let mut broker = broker(1);
    broker
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(BLOCK_RECONCILE_ANNOTATION.to_string(), "true".to_string());

    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(RESYNC));
    assert_eq!(h.cluster.writes(), 0);
    assert_eq!(condition_status(&broker, RECONCILE_BLOCKED), Some(ConditionStatus::True));
    assert_eq!(condition_status(&broker, VALID), None, "other conditions left as observed");

    broker
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(BLOCK_RECONCILE_ANNOTATION.to_string(), "false".to_string());
    h.pass(&mut broker).await.unwrap();
    assert_eq!(condition_status(&broker, RECONCILE_BLOCKED), None);
    assert_eq!(h.cluster.count(ResourceKind::StatefulSet), 1);
}

#[tokio::test]
async fn block_after_ready_defers_spec_changes() {
    let h = Harness::new();
    let mut broker = broker(1);
    h.report_applied(&broker);
    h.pass(&mut broker).await.unwrap();
    h.cluster.set_ready_pods(&[0]);
    h.pass(&mut broker).await.unwrap();
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::True));

    broker
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(BLOCK_RECONCILE_ANNOTATION.to_string(), "true".to_string());
    broker.spec.deployment_plan.image = Some("quay.io/example/broker:2".to_string());
    let writes = h.cluster.writes();

    for _ in 0..2 {
        let action = h.pass(&mut broker).await.unwrap();
        assert_eq!(action, Action::requeue(RESYNC));
    }
    assert_eq!(h.cluster.writes(), writes);
    assert_eq!(condition_status(&broker, RECONCILE_BLOCKED), Some(ConditionStatus::True));
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::True));
    let image = |h: &Harness| {
        h.cluster
            .object(ResourceKind::StatefulSet, "ex-ss")
            .and_then(|ss| ss.pointer("/spec/template/spec/containers/0/image").cloned())
    };
    assert_ne!(image(&h), Some(serde_json::json!("quay.io/example/broker:2")));

    broker
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .remove(BLOCK_RECONCILE_ANNOTATION);
    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(DRIFT_REQUEUE));
    assert_eq!(condition_status(&broker, RECONCILE_BLOCKED), None);
    assert_eq!(image(&h), Some(serde_json::json!("quay.io/example/broker:2")));
}

#[tokio::test]
async fn invalid_spec_waits_for_a_change() {
    let h = Harness::new();
    let mut broker = broker(1);
    broker.spec.broker_properties = vec!["a=1".to_string(), "a=2".to_string()];

    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.cluster.writes(), 0);
    assert_eq!(condition_status(&broker, VALID), Some(ConditionStatus::False));
    assert_eq!(condition_status(&broker, READY), Some(ConditionStatus::False));
}

#[tokio::test]
async fn missing_ssl_secret_is_retried() {
    let h = Harness::new();
    let mut broker = broker(1);
    broker.spec.acceptors = vec![Acceptor {
        name: "amqps".to_string(),
        ssl_enabled: true,
        ssl_secret: Some("tls".to_string()),
        ..Default::default()
    }];

    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::requeue(RESYNC));
    assert_eq!(h.cluster.writes(), 0);
    let status = broker.status.as_ref().unwrap();
    let valid = conditions::find(&status.conditions, VALID).unwrap();
    assert_eq!(valid.reason, conditions::reasons::FAILED_SECRET_NOT_FOUND);
}

#[tokio::test]
async fn status_conflict_is_classified() {
    let h = Harness::new();
    let mut broker = broker(1);
    h.cluster.fail_next(WriteOp::Status, 409);

    let err = h.pass(&mut broker).await.unwrap_err();
    assert!(err.is_conflict());

    h.pass(&mut broker).await.unwrap();
    assert!(h.cluster.status().is_some());
}

#[tokio::test]
async fn failed_write_leaves_status_intact() {
    let h = Harness::new();
    let mut broker = broker(1);
    h.pass(&mut broker).await.unwrap();
    let before = h.cluster.status();
    let patches = h.cluster.status_patches();

    broker.spec.deployment_plan.image = Some("quay.io/example/broker:2".to_string());
    h.cluster.fail_next(WriteOp::Replace, 500);
    let err = h.pass(&mut broker).await.unwrap_err();
    assert!(!err.is_conflict());
    assert_eq!(h.cluster.status_patches(), patches);
    assert_eq!(h.cluster.status(), before);
}

#[tokio::test]
async fn security_handlers_feed_properties() {
    let h = Harness::new();
    h.registry
        .upsert(SecurityHandler {
            key: ObjectKey::new(NAMESPACE, "sec"),
            apply_to: vec![NAME.to_string()],
            properties: vec!["securityEnabled=true".to_string()],
        })
        .await;

    let mut broker = broker(1);
    broker.spec.broker_properties = vec!["globalMaxSize=512m".to_string()];
    h.pass(&mut broker).await.unwrap();

    let data = props_secret(&h).data.unwrap();
    assert_eq!(data[PROPERTIES_KEY].0, b"globalMaxSize=512m\nsecurityEnabled=true".to_vec());
}

#[tokio::test]
async fn deleted_broker_is_left_alone() {
    let h = Harness::new();
    let mut broker = broker(1);
    broker.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));

    let action = h.pass(&mut broker).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.cluster.writes(), 0);
}

#[test]
fn reconciler_is_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<BrokerReconciler>();
}
