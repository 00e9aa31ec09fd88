//! HTTP transport for the Jolokia agent

use crate::{Argument, Jolokia, JolokiaConfig, JolokiaError, JolokiaRequest, JolokiaResponse, JolokiaResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Jolokia client bound to one agent endpoint
pub struct JolokiaClient {
    config: JolokiaConfig,
    client: Client,
    endpoint: String,
}

impl JolokiaClient {
    /// Client for the agent running on `host`
    pub fn for_host(config: JolokiaConfig, host: &str) -> Self {
        let endpoint = config.endpoint_for(host);
        Self::new(config, endpoint)
    }

    /// Client for an explicit endpoint URL
    pub fn new(config: JolokiaConfig, endpoint: String) -> Self {
        Self {
            client: Client::new(),
            config,
            endpoint,
        }
    }

    /// Reuse an existing HTTP client (connection pool) for a new endpoint
    pub fn with_client(config: JolokiaConfig, client: Client, endpoint: String) -> Self {
        Self {
            config,
            client,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &JolokiaRequest) -> JolokiaResult<JolokiaResponse> {
        let url = format!("{}/", self.endpoint.trim_end_matches('/'));
        debug!(url = %url, mbean = %request.mbean, kind = ?request.kind, "jolokia request");

        let mut builder = self
            .client
            .post(&url)
            .json(request)
            .timeout(Duration::from_secs(self.config.timeout_seconds));

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.basic_auth(username, Some(password));
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(JolokiaError::ApiError { status, message: text });
        }

        let body = response.text().await?;
        let reply: JolokiaResponse = serde_json::from_str(&body)?;
        Ok(reply)
    }
}

#[async_trait]
impl Jolokia for JolokiaClient {
    async fn read(&self, mbean: &str, attribute: &str) -> JolokiaResult<JolokiaResponse> {
        self.post(&JolokiaRequest::read(mbean, attribute)).await
    }

    async fn exec(
        &self,
        mbean: &str,
        operation: &str,
        arguments: Vec<Argument>,
    ) -> JolokiaResult<JolokiaResponse> {
        self.post(&JolokiaRequest::exec(mbean, operation, arguments)).await
    }
}
