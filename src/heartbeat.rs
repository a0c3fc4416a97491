use std::{sync::Arc, time::Duration};

use data_model::RegistryPayload;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{admin_client::AdminApi, error::ExecutorError};

/// Announces this executor to every admin endpoint on a fixed beat so the
/// admin side keeps routing triggers here. Ticks run strictly one at a time;
/// within a tick the endpoints are beaten concurrently.
pub struct HeartbeatRegistrar {
    admins: Arc<Vec<Arc<dyn AdminApi>>>,
    payload: RegistryPayload,
    interval: Duration,
    shutdown_rx: watch::Receiver<()>,
}

impl HeartbeatRegistrar {
    pub fn new(
        admins: Arc<Vec<Arc<dyn AdminApi>>>,
        payload: RegistryPayload,
        interval: Duration,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            admins,
            payload,
            interval,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) {
        info!(
            "registering executor '{}' at {} with {} admin endpoint(s)",
            self.payload.app_name,
            self.payload.address,
            self.admins.len()
        );
        loop {
            self.broadcast_register().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown_rx.changed() => break,
            }
        }
        self.broadcast_unregister().await;
        info!("heartbeat registrar stopped");
    }

    async fn broadcast_register(&self) {
        let results = join_all(self.admins.iter().map(|admin| {
            let payload = &self.payload;
            async move {
                admin
                    .register(payload)
                    .await
                    .map_err(|e| (admin.address().to_string(), e))
            }
        }))
        .await;

        let mut delivered = 0usize;
        for result in results {
            match result {
                Ok(()) => delivered += 1,
                Err((address, e)) => warn!("heartbeat register to {} failed: {}", address, e),
            }
        }
        if delivered == 0 && !self.admins.is_empty() {
            warn!("{}", ExecutorError::RegistryUnavailable);
        }
    }

    /// Best effort: a dead admin expires the registration by beat timeout
    /// anyway.
    async fn broadcast_unregister(&self) {
        let results = join_all(self.admins.iter().map(|admin| {
            let payload = &self.payload;
            async move {
                admin
                    .unregister(payload)
                    .await
                    .map_err(|e| (admin.address().to_string(), e))
            }
        }))
        .await;
        for result in results {
            if let Err((address, e)) = result {
                debug!("unregister from {} failed: {}", address, e);
            }
        }
    }
}
