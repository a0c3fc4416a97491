use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use data_model::{CallbackEntry, RegistryPayload, RpcResponse};
use tokio::task::JoinHandle;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    admin_client::AdminApi,
    config::ExecutorConfig,
    error::ExecutorError,
    http_objects::ACCESS_TOKEN_HEADER,
    service::Service,
};

/// In-process admin fake for unit tests: records every call, optionally
/// refuses registrations or callbacks.
pub struct RecordingAdmin {
    address: String,
    registrations: Mutex<Vec<RegistryPayload>>,
    unregistrations: Mutex<Vec<RegistryPayload>>,
    callbacks: Mutex<Vec<Vec<CallbackEntry>>>,
    fail_registrations: AtomicBool,
    fail_callbacks: AtomicBool,
}

impl Default for RecordingAdmin {
    fn default() -> Self {
        Self::named("admin")
    }
}

impl RecordingAdmin {
    pub fn named(name: &str) -> Self {
        Self {
            address: format!("http://recording-{}", name),
            registrations: Mutex::new(Vec::new()),
            unregistrations: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            fail_registrations: AtomicBool::new(false),
            fail_callbacks: AtomicBool::new(false),
        }
    }

    pub fn registrations(&self) -> Vec<RegistryPayload> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    pub fn unregistration_count(&self) -> usize {
        self.unregistrations.lock().unwrap().len()
    }

    pub fn callbacks(&self) -> Vec<Vec<CallbackEntry>> {
        self.callbacks.lock().unwrap().clone()
    }

    pub fn callback_entry_count(&self) -> usize {
        self.callbacks.lock().unwrap().iter().map(Vec::len).sum()
    }

    pub fn fail_registrations(&self, fail: bool) {
        self.fail_registrations.store(fail, Ordering::SeqCst);
    }

    pub fn fail_callbacks(&self, fail: bool) {
        self.fail_callbacks.store(fail, Ordering::SeqCst);
    }

    fn refused(&self, what: &str) -> ExecutorError {
        ExecutorError::Delivery {
            address: self.address.clone(),
            reason: format!("{} refused by test fixture", what),
        }
    }
}

#[async_trait]
impl AdminApi for RecordingAdmin {
    fn address(&self) -> &str {
        &self.address
    }

    async fn register(&self, payload: &RegistryPayload) -> Result<(), ExecutorError> {
        if self.fail_registrations.load(Ordering::SeqCst) {
            return Err(self.refused("register"));
        }
        self.registrations.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn unregister(&self, payload: &RegistryPayload) -> Result<(), ExecutorError> {
        self.unregistrations.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn callback(&self, entries: &[CallbackEntry]) -> Result<(), ExecutorError> {
        if self.fail_callbacks.load(Ordering::SeqCst) {
            return Err(self.refused("callback"));
        }
        self.callbacks.lock().unwrap().push(entries.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockAdminState {
    pub registrations: Mutex<Vec<RegistryPayload>>,
    pub unregistrations: Mutex<Vec<RegistryPayload>>,
    pub callbacks: Mutex<Vec<CallbackEntry>>,
    pub seen_tokens: Mutex<Vec<String>>,
    pub fail_callbacks: AtomicBool,
}

impl MockAdminState {
    pub fn callback_log_ids(&self) -> Vec<i64> {
        self.callbacks
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.log_id.get())
            .collect()
    }
}

/// A real admin endpoint on a loopback port, for driving the executor over
/// the wire.
pub struct MockAdmin {
    pub state: Arc<MockAdminState>,
    base_url: String,
}

impl MockAdmin {
    pub fn start() -> Result<Self> {
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").context("failed to bind mock admin")?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockAdminState::default());

        let app = Router::new()
            .route(
                "/jobs-api/registry",
                post(mock_registry).with_state(state.clone()),
            )
            .route(
                "/jobs-api/registry-remove",
                post(mock_registry_remove).with_state(state.clone()),
            )
            .route(
                "/jobs-api/callback",
                post(mock_callback).with_state(state.clone()),
            );
        tokio::spawn(async move {
            let _ = axum_server::from_tcp(listener)
                .serve(app.into_make_service())
                .await;
        });

        Ok(Self {
            state,
            base_url: format!("http://{}", addr),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn record_token(state: &MockAdminState, headers: &HeaderMap) {
    if let Some(token) = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        state.seen_tokens.lock().unwrap().push(token.to_string());
    }
}

async fn mock_registry(
    State(state): State<Arc<MockAdminState>>,
    headers: HeaderMap,
    Json(payload): Json<RegistryPayload>,
) -> Json<RpcResponse> {
    record_token(&state, &headers);
    state.registrations.lock().unwrap().push(payload);
    Json(RpcResponse::success())
}

async fn mock_registry_remove(
    State(state): State<Arc<MockAdminState>>,
    headers: HeaderMap,
    Json(payload): Json<RegistryPayload>,
) -> Json<RpcResponse> {
    record_token(&state, &headers);
    state.unregistrations.lock().unwrap().push(payload);
    Json(RpcResponse::success())
}

async fn mock_callback(
    State(state): State<Arc<MockAdminState>>,
    headers: HeaderMap,
    Json(entries): Json<Vec<CallbackEntry>>,
) -> Json<RpcResponse> {
    record_token(&state, &headers);
    if state.fail_callbacks.load(Ordering::SeqCst) {
        return Json(RpcResponse::failed("admin is refusing callbacks"));
    }
    state.callbacks.lock().unwrap().extend(entries);
    Json(RpcResponse::success())
}

/// A whole executor running against mock admins, on loopback ports, with a
/// throwaway log directory and fast timers.
pub struct TestService {
    pub service: Service,
    pub base_url: String,
    pub client: reqwest::Client,
    pub temp_dir: tempfile::TempDir,
    start_handle: JoinHandle<Result<()>>,
}

impl TestService {
    pub async fn new(admin_addresses: &str, access_token: &str) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let port = reserve_port()?;
        let config = ExecutorConfig {
            admin_addresses: admin_addresses.to_string(),
            app_name: "jobworks-test".to_string(),
            advertise_ip: "127.0.0.1".to_string(),
            advertise_port: port,
            access_token: access_token.to_string(),
            log_dir: temp_dir
                .path()
                .join("logs")
                .to_str()
                .unwrap()
                .to_string(),
            log_retention_days: 30,
            heartbeat_interval_secs: 1,
            callback_retry_scan_secs: 1,
            request_timeout_secs: 2,
            structured_logging: false,
        };

        let service = Service::new(config)?;
        let start_handle = {
            let service = service.clone();
            tokio::spawn(async move { service.start().await })
        };
        let base_url = format!("http://127.0.0.1:{}", port);
        let client = reqwest::Client::new();
        wait_until_serving(&client, &base_url).await?;

        Ok(Self {
            service,
            base_url,
            client,
            temp_dir,
            start_handle,
        })
    }

    /// POST a JSON body to an /api path with the given access token.
    pub async fn post_api<T: serde::Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(ACCESS_TOKEN_HEADER, token)
            .json(body)
            .send()
            .await?;
        Ok(response)
    }

    pub async fn stop(self) {
        self.service.stop().await;
        let _ = self.start_handle.await;
    }
}

fn reserve_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").context("failed to reserve a port")?;
    Ok(listener.local_addr()?.port())
}

async fn wait_until_serving(client: &reqwest::Client, base_url: &str) -> Result<()> {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if client.get(base_url).send().await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() > deadline {
            anyhow::bail!("executor endpoint never came up at {}", base_url);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
