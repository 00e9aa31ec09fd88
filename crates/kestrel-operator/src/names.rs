//! Resource names and labels derived from a broker identity

use std::collections::BTreeMap;

/// Reserved label: application identity of every generated resource
pub const LABEL_APP_KEY: &str = "application";

/// Reserved label: owning broker name
pub const LABEL_RESOURCE_KEY: &str = "Broker";

/// Label keys resource templates may not set
pub const RESERVED_LABEL_KEYS: [&str; 2] = [LABEL_APP_KEY, LABEL_RESOURCE_KEY];

/// Pod label the statefulset controller sets on each instance
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Marks per-instance exposure services so stale ones can be found
pub const EXPOSURE_LABEL: &str = "broker.kestrel.io/exposure";

pub const PING_PORT: i32 = 8888;
pub const CONSOLE_PORT: i32 = 8161;

/// Names of everything generated for one broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namer {
    name: String,
    namespace: String,
}

impl Namer {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn statefulset(&self) -> String {
        format!("{}-ss", self.name)
    }

    pub fn container(&self) -> String {
        format!("{}-container", self.name)
    }

    pub fn headless_service(&self) -> String {
        format!("{}-hdls-svc", self.name)
    }

    pub fn ping_service(&self) -> String {
        format!("{}-ping-svc", self.name)
    }

    pub fn acceptor_service(&self, acceptor: &str, ordinal: i32) -> String {
        format!("{}-{}-{}-svc", self.name, acceptor, ordinal)
    }

    pub fn properties_secret(&self) -> String {
        format!("{}-props", self.name)
    }

    pub fn credentials_secret(&self) -> String {
        format!("{}-credentials-secret", self.name)
    }

    pub fn data_volume(&self) -> String {
        format!("{}-data", self.name)
    }

    pub fn pod(&self, ordinal: i32) -> String {
        format!("{}-{}", self.statefulset(), ordinal)
    }

    /// Stable DNS name of one instance behind the headless service
    pub fn pod_fqdn(&self, ordinal: i32) -> String {
        format!(
            "{}.{}.{}.svc.cluster.local",
            self.pod(ordinal),
            self.headless_service(),
            self.namespace
        )
    }

    /// Ordinal encoded in a pod name, if the pod belongs to this broker
    pub fn ordinal_of(&self, pod_name: &str) -> Option<i32> {
        pod_name
            .strip_prefix(&self.statefulset())?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    pub fn app_label_value(&self) -> String {
        format!("{}-app", self.name)
    }

    /// Labels selecting the broker pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP_KEY.to_string(), self.app_label_value()),
            (LABEL_RESOURCE_KEY.to_string(), self.name.clone()),
        ])
    }

    /// `application=<cr>-app,Broker=<cr>`
    pub fn label_selector(&self) -> String {
        self.selector_labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Selects this broker's per-instance exposure services
    pub fn exposure_selector(&self) -> String {
        format!("{},{EXPOSURE_LABEL}=true", self.label_selector())
    }
}
