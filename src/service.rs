use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use axum_server::Handle;
use data_model::{CallbackEntry, RegistryPayload};
use tokio::{
    signal,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    admin_client::{build_admin_clients, AdminApi},
    callbacks::{CallbackConsumer, CallbackDispatcher, CallbackRetryScanner},
    config::ExecutorConfig,
    gc::LogRetentionSweeper,
    handlers::HandlerRegistry,
    heartbeat::HeartbeatRegistrar,
    joblog,
    routes::{create_routes, RouteState},
    workers::WorkerRegistry,
};

const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// The executor runtime: owns every component and starts them in dependency
/// order. The inbound endpoint is serving before the first heartbeat
/// announces its address; stop() tears everything down in reverse and is safe
/// to call more than once.
#[derive(Clone)]
pub struct Service {
    pub config: Arc<ExecutorConfig>,
    pub handlers: Arc<HandlerRegistry>,
    pub workers: Arc<WorkerRegistry>,
    admins: Arc<Vec<Arc<dyn AdminApi>>>,
    callback_receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<CallbackEntry>>>>,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
    server_handle: Handle,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Service {
    pub fn new(mut config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        config.resolve_network()?;
        let config = Arc::new(config);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let clients = build_admin_clients(&config)?;
        let admins: Arc<Vec<Arc<dyn AdminApi>>> = Arc::new(
            clients
                .into_iter()
                .map(|client| Arc::new(client) as Arc<dyn AdminApi>)
                .collect(),
        );

        let (dispatcher, callback_receiver) = CallbackDispatcher::new(config.retry_dir());
        let handlers = Arc::new(HandlerRegistry::new());
        let workers = Arc::new(WorkerRegistry::new(
            handlers.clone(),
            dispatcher,
            config.log_dir.clone(),
        ));

        Ok(Self {
            config,
            handlers,
            workers,
            admins,
            callback_receiver: Arc::new(Mutex::new(Some(callback_receiver))),
            shutdown_tx,
            shutdown_rx,
            server_handle: Handle::new(),
            background: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs until the server is shut down by a signal or a stop() call.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("executor service already started");
        }
        if self.config.access_token.is_empty() {
            warn!("access_token is empty, inbound requests are unauthenticated");
        }
        if self.admins.is_empty() {
            warn!("no admin addresses configured, heartbeats and callbacks have nowhere to go");
        }
        if self.handlers.is_empty() {
            warn!("no job handlers registered, every trigger will be rejected");
        } else {
            info!("{} job handler(s) registered", self.handlers.len());
        }

        joblog::init_log_dir(&self.config.log_dir, &self.config.retry_dir()).await?;

        let mut background = self.background.lock().await;

        let mut sweeper = LogRetentionSweeper::new(
            self.config.log_dir.clone(),
            self.config.retry_dir(),
            self.config.log_retention_days,
            self.shutdown_rx.clone(),
        );
        background.push(tokio::spawn(async move { sweeper.start().await }));

        let receiver = self
            .callback_receiver
            .lock()
            .await
            .take()
            .context("callback receiver already taken")?;
        let mut consumer = CallbackConsumer::new(
            receiver,
            self.admins.clone(),
            self.config.retry_dir(),
            self.shutdown_rx.clone(),
        );
        background.push(tokio::spawn(async move { consumer.start().await }));

        let mut scanner = CallbackRetryScanner::new(
            self.admins.clone(),
            self.config.retry_dir(),
            Duration::from_secs(self.config.callback_retry_scan_secs),
            self.shutdown_rx.clone(),
        );
        background.push(tokio::spawn(async move { scanner.start().await }));

        // Heartbeats wait for the listener so the address they announce is
        // already accepting triggers.
        let mut registrar = HeartbeatRegistrar::new(
            self.admins.clone(),
            RegistryPayload {
                app_name: self.config.app_name.clone(),
                address: self.config.advertise_address(),
            },
            Duration::from_secs(self.config.heartbeat_interval_secs),
            self.shutdown_rx.clone(),
        );
        let listening = self.server_handle.clone();
        background.push(tokio::spawn(async move {
            if listening.listening().await.is_some() {
                registrar.start().await;
            }
        }));
        drop(background);

        let service = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("signal received, shutting down gracefully");
            service.stop().await;
        });

        let addr = self.config.listen_addr()?;
        info!("executor api listening on {}", addr);
        let routes = create_routes(RouteState {
            workers: self.workers.clone(),
            config: self.config.clone(),
        });
        axum_server::bind(addr)
            .handle(self.server_handle.clone())
            .serve(routes.into_make_service())
            .await?;

        // serve() returns once the handle shut down; finish the teardown if
        // nobody else did.
        self.stop().await;
        Ok(())
    }

    /// Reverse-order teardown: stop accepting triggers, stop workers (their
    /// final callbacks still flow), clear handlers, then signal every
    /// background loop and wait for them. Subsequent calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "executor runtime stopping, {} live worker(s)",
            self.workers.running_count()
        );
        self.server_handle.shutdown();
        self.workers.stop_all("runtime shutdown").await;
        self.handlers.clear();
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!(
                    "background loop did not stop within {:?}",
                    BACKGROUND_STOP_TIMEOUT
                );
            }
        }
        info!("executor runtime stopped");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
}
