//! Generated resources for one broker
//!
//! Each generator is a pure function of the broker spec. The synchronizer
//! template-patches the result and decides whether a write is needed.

use crate::crds::Broker;
use crate::names::{Namer, CONSOLE_PORT, EXPOSURE_LABEL, PING_PORT, POD_NAME_LABEL};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::Resource;
use std::collections::BTreeMap;

/// Key of the shared properties file in the properties secret
pub const PROPERTIES_KEY: &str = "broker.properties";

/// Property injected into an instance being drained
pub const DRAIN_PROPERTY: &str = "HAPolicyConfiguration.scaleDownConfiguration.enabled=true";

/// Directory the properties secret is mounted under
pub const PROPERTIES_MOUNT_ROOT: &str = "/amq/extra/secrets";

/// Broker name inside the container, used for management object names
pub const AMQ_NAME: &str = "amq-broker";

/// Ordinal-scoped properties key read only by instance `ordinal`
pub fn ordinal_properties_key(ordinal: i32) -> String {
    format!("broker-{ordinal}.{PROPERTIES_KEY}")
}

fn owner_references(broker: &Broker) -> Option<Vec<OwnerReference>> {
    broker.controller_owner_ref(&()).map(|owner| vec![owner])
}

fn metadata(broker: &Broker, namer: &Namer, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namer.namespace().to_string()),
        labels: Some(namer.selector_labels()),
        owner_references: owner_references(broker),
        ..Default::default()
    }
}

/// Pod labels: selector labels plus user labels, selector keys win
pub fn pod_labels(broker: &Broker, namer: &Namer) -> BTreeMap<String, String> {
    let mut labels = broker.spec.deployment_plan.labels.clone();
    labels.extend(namer.selector_labels());
    labels
}

pub fn properties_volume_name(namer: &Namer) -> String {
    format!("{}-volume", namer.properties_secret())
}

/// Workload skeleton; the synchronizer fills in every managed dimension
pub fn statefulset(broker: &Broker, namer: &Namer) -> StatefulSet {
    let container = Container {
        name: namer.container(),
        image: Some(broker.image().to_string()),
        env: Some(vec![EnvVar {
            name: "AMQ_NAME".to_string(),
            value: Some(AMQ_NAME.to_string()),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some("jolokia".to_string()),
            container_port: CONSOLE_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: properties_volume_name(namer),
            mount_path: format!("{PROPERTIES_MOUNT_ROOT}/{}", namer.properties_secret()),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    StatefulSet {
        metadata: metadata(broker, namer, namer.statefulset()),
        spec: Some(StatefulSetSpec {
            replicas: Some(0),
            service_name: namer.headless_service(),
            selector: LabelSelector {
                match_labels: Some(namer.selector_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(broker, namer)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: properties_volume_name(namer),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(namer.properties_secret()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

/// Headless service giving every instance a stable DNS name
pub fn headless_service(broker: &Broker, namer: &Namer) -> Service {
    let mut ports = vec![service_port("console-jolokia", CONSOLE_PORT)];
    ports.extend(broker.spec.acceptors.iter().map(|a| service_port(&a.name, a.port)));

    Service {
        metadata: metadata(broker, namer, namer.headless_service()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(namer.selector_labels()),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Cluster discovery service
pub fn ping_service(broker: &Broker, namer: &Namer) -> Service {
    Service {
        metadata: metadata(broker, namer, namer.ping_service()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(namer.selector_labels()),
            ports: Some(vec![service_port("ping", PING_PORT)]),
            ..Default::default()
        }),
        status: None,
    }
}

fn ordinal_service(broker: &Broker, namer: &Namer, name: String, ordinal: i32, port: ServicePort) -> Service {
    let mut selector = namer.selector_labels();
    selector.insert(POD_NAME_LABEL.to_string(), namer.pod(ordinal));
    let mut metadata = metadata(broker, namer, name);
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(EXPOSURE_LABEL.to_string(), "true".to_string());
    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![port]),
            ..Default::default()
        }),
        status: None,
    }
}

/// One service per exposed acceptor (and console) per instance
pub fn exposure_services(broker: &Broker, namer: &Namer, size: i32) -> Vec<Service> {
    let mut services = Vec::new();
    for ordinal in 0..size {
        for acceptor in broker.spec.acceptors.iter().filter(|a| a.expose) {
            services.push(ordinal_service(
                broker,
                namer,
                namer.acceptor_service(&acceptor.name, ordinal),
                ordinal,
                service_port(&acceptor.name, acceptor.port),
            ));
        }
        if broker.spec.console.expose {
            services.push(ordinal_service(
                broker,
                namer,
                namer.acceptor_service("wconsj", ordinal),
                ordinal,
                service_port("wconsj", CONSOLE_PORT),
            ));
        }
    }
    services
}

/// Contents of `broker.properties`: user lines then security handler lines
pub fn properties_content(broker: &Broker, security_lines: &[String]) -> String {
    broker
        .spec
        .broker_properties
        .iter()
        .chain(security_lines.iter())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Properties secret, with drain keys for every ordinal being removed
pub fn properties_secret(broker: &Broker, namer: &Namer, content: &str, draining: &[i32]) -> Secret {
    let mut data = BTreeMap::from([(
        PROPERTIES_KEY.to_string(),
        ByteString(content.as_bytes().to_vec()),
    )]);
    for ordinal in draining {
        data.insert(
            ordinal_properties_key(*ordinal),
            ByteString(DRAIN_PROPERTY.as_bytes().to_vec()),
        );
    }

    Secret {
        metadata: metadata(broker, namer, namer.properties_secret()),
        data: Some(data),
        ..Default::default()
    }
}

/// Adler-32, the checksum the broker reports for each loaded properties file
pub fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    // 5552 is the largest block that cannot overflow `b` before reduction
    for chunk in data.chunks(5552) {
        for byte in chunk {
            a += u32::from(*byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Checksum string as reported by the broker status attribute
pub fn properties_checksum(content: &str) -> String {
    adler32(content.as_bytes()).to_string()
}
