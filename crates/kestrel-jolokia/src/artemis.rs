//! ActiveMQ Artemis broker facade over Jolokia

use crate::{Argument, Jolokia, JolokiaError, JolokiaResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Broker name used when the deployment does not override `AMQ_NAME`
pub const DEFAULT_BROKER_NAME: &str = "amq-broker";

/// Server state reported once the broker has fully started
pub const STATE_STARTED: &str = "STARTED";

/// Typed access to the broker MBean of one Artemis instance
pub struct ArtemisBroker {
    jolokia: Arc<dyn Jolokia>,
    broker_name: String,
}

impl ArtemisBroker {
    pub fn new(jolokia: Arc<dyn Jolokia>, broker_name: &str) -> Self {
        Self {
            jolokia,
            broker_name: broker_name.to_string(),
        }
    }

    /// `org.apache.activemq.artemis:broker="<name>"`
    pub fn mbean(&self) -> String {
        format!("org.apache.activemq.artemis:broker=\"{}\"", self.broker_name)
    }

    /// Broker uptime as reported by the server
    pub async fn uptime(&self) -> JolokiaResult<String> {
        let value = self.read_attribute("Uptime").await?;
        match value {
            serde_json::Value::String(uptime) => Ok(uptime),
            other => Err(JolokiaError::UnexpectedValue {
                attribute: "Uptime".to_string(),
                value: other,
            }),
        }
    }

    /// The `Status` attribute: server state plus applied configuration checksums
    pub async fn status(&self) -> JolokiaResult<BrokerStatus> {
        let value = self.read_attribute("Status").await?;
        BrokerStatus::from_value(value)
    }

    /// Messages still held by this broker across all queues
    pub async fn total_message_count(&self) -> JolokiaResult<u64> {
        let value = self.read_attribute("TotalMessageCount").await?;
        value.as_u64().ok_or(JolokiaError::UnexpectedValue {
            attribute: "TotalMessageCount".to_string(),
            value,
        })
    }

    /// Invoke a broker operation, e.g. `scaleDown(java.lang.String)`
    pub async fn invoke(&self, operation: &str, arguments: Vec<Argument>) -> JolokiaResult<serde_json::Value> {
        self.jolokia
            .exec(&self.mbean(), operation, arguments)
            .await?
            .into_result()
    }

    async fn read_attribute(&self, attribute: &str) -> JolokiaResult<serde_json::Value> {
        self.jolokia
            .read(&self.mbean(), attribute)
            .await?
            .into_result()
    }
}

/// Parsed `Status` attribute
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BrokerStatus {
    #[serde(default)]
    pub server: ServerStatus,
    #[serde(default)]
    pub configuration: ConfigurationStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigurationStatus {
    /// Keyed by properties file name, e.g. `broker.properties`
    #[serde(default)]
    pub properties: BTreeMap<String, PropertiesStatus>,
}

/// Checksum of a properties source as loaded by the broker
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesStatus {
    /// Spelled this way by the broker
    #[serde(default)]
    pub alder32: String,
    #[serde(default)]
    pub reload_time: Option<String>,
}

impl BrokerStatus {
    /// The attribute arrives as a JSON document encoded in a string
    pub fn from_value(value: serde_json::Value) -> JolokiaResult<Self> {
        match value {
            serde_json::Value::String(raw) => Ok(serde_json::from_str(&raw)?),
            serde_json::Value::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(JolokiaError::UnexpectedValue {
                attribute: "Status".to_string(),
                value: other,
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.server.state == STATE_STARTED
    }

    /// Applied checksums by properties file name
    pub fn applied_checksums(&self) -> BTreeMap<String, String> {
        self.configuration
            .properties
            .iter()
            .map(|(name, status)| (name.clone(), status.alder32.clone()))
            .collect()
    }
}
