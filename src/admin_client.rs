use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::{CallbackEntry, RegistryPayload, RpcResponse};

use crate::{
    config::{ExecutorConfig, ADMIN_API_MOUNT},
    error::ExecutorError,
    http_objects::ACCESS_TOKEN_HEADER,
};

/// Admin-side API as the executor sees it. One implementation exists; the
/// trait keeps the heartbeat and callback loops testable against a recorder.
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Base URL of the admin this client talks to, for log lines.
    fn address(&self) -> &str;

    async fn register(&self, payload: &RegistryPayload) -> Result<(), ExecutorError>;

    async fn unregister(&self, payload: &RegistryPayload) -> Result<(), ExecutorError>;

    /// Deliver a batch of finished-job results. Ok only when the admin
    /// answered with a success code; any other outcome is an error so the
    /// caller can fall back to the retry log.
    async fn callback(&self, entries: &[CallbackEntry]) -> Result<(), ExecutorError>;
}

pub struct HttpAdminClient {
    base_url: String,
    access_token: String,
    client: reqwest::Client,
}

impl HttpAdminClient {
    pub fn new(
        base_url: &str,
        access_token: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build admin http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, ADMIN_API_MOUNT, path)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), ExecutorError> {
        let url = self.endpoint(path);
        let mut request = self.client.post(&url).json(body);
        if !self.access_token.is_empty() {
            request = request.header(ACCESS_TOKEN_HEADER, &self.access_token);
        }
        let response = request.send().await.map_err(|e| ExecutorError::Delivery {
            address: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Delivery {
                address: self.base_url.clone(),
                reason: format!("http status {}", status),
            });
        }
        let rpc_response =
            response
                .json::<RpcResponse>()
                .await
                .map_err(|e| ExecutorError::Delivery {
                    address: self.base_url.clone(),
                    reason: format!("undecodable admin response: {}", e),
                })?;
        if !rpc_response.is_success() {
            return Err(ExecutorError::AdminRejected {
                address: self.base_url.clone(),
                code: rpc_response.code,
                msg: rpc_response.msg.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AdminApi for HttpAdminClient {
    fn address(&self) -> &str {
        &self.base_url
    }

    async fn register(&self, payload: &RegistryPayload) -> Result<(), ExecutorError> {
        self.post_json("registry", payload).await
    }

    async fn unregister(&self, payload: &RegistryPayload) -> Result<(), ExecutorError> {
        self.post_json("registry-remove", payload).await
    }

    async fn callback(&self, entries: &[CallbackEntry]) -> Result<(), ExecutorError> {
        self.post_json("callback", entries).await
    }
}

/// One client per configured admin base address.
pub fn build_admin_clients(config: &ExecutorConfig) -> Result<Vec<HttpAdminClient>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    config
        .admin_address_list()
        .iter()
        .map(|address| HttpAdminClient::new(address, &config.access_token, timeout))
        .collect()
}
