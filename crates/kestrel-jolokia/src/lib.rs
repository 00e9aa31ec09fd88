//! Jolokia management client
//!
//! This crate talks to the Jolokia agent embedded in an ActiveMQ Artemis
//! broker:
//! - [`JolokiaClient`]: JSON-RPC over HTTP (`read` / `exec`)
//! - [`ArtemisBroker`]: broker-level facade (status, uptime, message counts)
//!
//! A Jolokia reply with a non-200 `status` or a non-empty `error_type` is a
//! *managed* failure. It is reported as [`JolokiaError::Managed`] so callers
//! can tell a broker that is still starting apart from a broken transport.

pub mod artemis;
pub mod client;

pub use artemis::{ArtemisBroker, BrokerStatus, PropertiesStatus};
pub use client::JolokiaClient;

use serde::{Deserialize, Serialize};

/// Jolokia client trait
#[async_trait::async_trait]
pub trait Jolokia: Send + Sync {
    /// Read a single attribute of an MBean
    async fn read(&self, mbean: &str, attribute: &str) -> JolokiaResult<JolokiaResponse>;

    /// Invoke an MBean operation
    async fn exec(
        &self,
        mbean: &str,
        operation: &str,
        arguments: Vec<Argument>,
    ) -> JolokiaResult<JolokiaResponse>;
}

/// Jolokia connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JolokiaConfig {
    pub scheme: String,
    pub port: u16,
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_seconds: u64,
}

impl JolokiaConfig {
    pub fn new() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 8161,
            path: "/console/jolokia".to_string(),
            username: None,
            password: None,
            timeout_seconds: 10,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Endpoint URL of the agent running on `host`
    pub fn endpoint_for(&self, host: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, host, self.port, self.path)
    }
}

impl Default for JolokiaConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Request type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    Read,
    Exec,
}

/// Operation argument; Jolokia only needs strings and booleans here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Str(String),
    Bool(bool),
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Str(value.to_string())
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Str(value)
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Argument::Bool(value)
    }
}

/// Jolokia request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JolokiaRequest {
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub mbean: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Argument>,
}

impl JolokiaRequest {
    pub fn read(mbean: &str, attribute: &str) -> Self {
        Self {
            kind: RequestType::Read,
            mbean: mbean.to_string(),
            attribute: Some(attribute.to_string()),
            operation: None,
            arguments: Vec::new(),
        }
    }

    pub fn exec(mbean: &str, operation: &str, arguments: Vec<Argument>) -> Self {
        Self {
            kind: RequestType::Exec,
            mbean: mbean.to_string(),
            attribute: None,
            operation: Some(operation.to_string()),
            arguments,
        }
    }
}

/// Jolokia reply envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JolokiaResponse {
    pub status: u16,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "error_type", alias = "errorType")]
    pub error_type: Option<String>,
}

impl JolokiaResponse {
    /// True when the agent reported a business failure
    pub fn is_managed_failure(&self) -> bool {
        self.status != 200 || self.error_type.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Convert a managed failure into [`JolokiaError::Managed`]
    pub fn into_result(self) -> JolokiaResult<serde_json::Value> {
        if self.is_managed_failure() {
            return Err(JolokiaError::Managed {
                status: self.status,
                error_type: self.error_type.unwrap_or_default(),
                message: self.error.unwrap_or_default(),
            });
        }
        Ok(self.value)
    }
}

/// Jolokia operation result type
pub type JolokiaResult<T> = Result<T, JolokiaError>;

/// Jolokia error types
#[derive(thiserror::Error, Debug)]
pub enum JolokiaError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("managed failure {status} ({error_type}): {message}")]
    Managed {
        status: u16,
        error_type: String,
        message: String,
    },

    #[error("unexpected value for {attribute}: {value}")]
    UnexpectedValue {
        attribute: String,
        value: serde_json::Value,
    },
}

impl JolokiaError {
    /// The broker answered but is not ready to serve the request yet
    pub fn is_not_ready(&self) -> bool {
        matches!(self, JolokiaError::Managed { .. })
    }

    /// The remote MBean reported a missing attribute
    pub fn is_attribute_not_found(&self) -> bool {
        match self {
            JolokiaError::Managed { error_type, .. } => {
                error_type.ends_with("AttributeNotFoundException")
            }
            _ => false,
        }
    }
}
