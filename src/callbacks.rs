use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use data_model::CallbackEntry;
use nanoid::nanoid;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{admin_client::AdminApi, error::ExecutorError};

/// Producer handle workers report finished invocations through. Enqueueing
/// never blocks; if the consumer is already gone the entry goes straight to
/// the disk retry log.
#[derive(Clone)]
pub struct CallbackDispatcher {
    sender: mpsc::UnboundedSender<CallbackEntry>,
    retry_dir: PathBuf,
}

impl CallbackDispatcher {
    pub fn new(retry_dir: PathBuf) -> (Self, mpsc::UnboundedReceiver<CallbackEntry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, retry_dir }, receiver)
    }

    pub fn enqueue(&self, entry: CallbackEntry) {
        if let Err(send_error) = self.sender.send(entry) {
            let entry = send_error.0;
            warn!(
                "callback consumer stopped, persisting result for log {} directly",
                entry.log_id
            );
            if let Err(e) = persist_batch(&self.retry_dir, std::slice::from_ref(&entry)) {
                error!("failed to persist callback for log {}: {e:?}", entry.log_id);
            }
        }
    }
}

/// Drains the callback queue and delivers batches to the first admin that
/// accepts them. Batches nobody accepts are persisted for the retry scanner.
pub struct CallbackConsumer {
    receiver: mpsc::UnboundedReceiver<CallbackEntry>,
    admins: Arc<Vec<Arc<dyn AdminApi>>>,
    retry_dir: PathBuf,
    shutdown_rx: watch::Receiver<()>,
}

impl CallbackConsumer {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<CallbackEntry>,
        admins: Arc<Vec<Arc<dyn AdminApi>>>,
        retry_dir: PathBuf,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            receiver,
            admins,
            retry_dir,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) {
        info!("callback consumer started");
        loop {
            tokio::select! {
                maybe_entry = self.receiver.recv() => match maybe_entry {
                    Some(entry) => {
                        let mut batch = vec![entry];
                        while let Ok(more) = self.receiver.try_recv() {
                            batch.push(more);
                        }
                        deliver_or_persist(&self.admins, &self.retry_dir, &batch).await;
                    }
                    None => break,
                },
                _ = self.shutdown_rx.changed() => {
                    // close() rejects further sends, which reroutes stragglers
                    // to the disk fallback in enqueue().
                    self.receiver.close();
                    let mut batch = Vec::new();
                    while let Ok(entry) = self.receiver.try_recv() {
                        batch.push(entry);
                    }
                    if !batch.is_empty() {
                        deliver_or_persist(&self.admins, &self.retry_dir, &batch).await;
                    }
                    break;
                }
            }
        }
        info!("callback consumer stopped");
    }
}

/// Periodically replays persisted callback batches. Files are deleted only
/// after an admin acknowledged their content, so a crash mid-scan re-delivers
/// at most, never loses.
pub struct CallbackRetryScanner {
    admins: Arc<Vec<Arc<dyn AdminApi>>>,
    retry_dir: PathBuf,
    scan_interval: Duration,
    shutdown_rx: watch::Receiver<()>,
}

impl CallbackRetryScanner {
    pub fn new(
        admins: Arc<Vec<Arc<dyn AdminApi>>>,
        retry_dir: PathBuf,
        scan_interval: Duration,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            admins,
            retry_dir,
            scan_interval,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match scan_once(&self.admins, &self.retry_dir).await {
                        Ok(0) => {}
                        Ok(delivered) => {
                            info!("retry scan delivered {} persisted callback file(s)", delivered);
                        }
                        Err(e) => warn!("retry scan failed: {e:?}"),
                    }
                }
                _ = self.shutdown_rx.changed() => break,
            }
        }
        info!("callback retry scanner stopped");
    }
}

/// Try each admin in order and stop at the first that accepts the batch.
pub(crate) async fn deliver(
    admins: &[Arc<dyn AdminApi>],
    entries: &[CallbackEntry],
) -> Result<(), ExecutorError> {
    let mut last_error = ExecutorError::RegistryUnavailable;
    for admin in admins {
        match admin.callback(entries).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("callback to {} not accepted: {e}", admin.address());
                last_error = e;
            }
        }
    }
    Err(last_error)
}

async fn deliver_or_persist(
    admins: &[Arc<dyn AdminApi>],
    retry_dir: &Path,
    batch: &[CallbackEntry],
) {
    match deliver(admins, batch).await {
        Ok(()) => debug!("delivered {} callback(s)", batch.len()),
        Err(e) => {
            warn!("persisting {} callback(s) for retry: {e}", batch.len());
            if let Err(persist_error) = persist_batch(retry_dir, batch) {
                error!(
                    "failed to persist {} callback(s): {persist_error:?}",
                    batch.len()
                );
            }
        }
    }
}

/// Write one batch as `cb-<epoch-ms>-<nanoid>.json`. The content lands in a
/// `.tmp` file first and is renamed into place, so a crash mid-write never
/// leaves a half-record the scanner would pick up.
pub(crate) fn persist_batch(retry_dir: &Path, entries: &[CallbackEntry]) -> Result<PathBuf> {
    let file_name = format!(
        "cb-{}-{}.json",
        jobworks_utils::get_epoch_time_in_ms(),
        nanoid!(10)
    );
    let final_path = retry_dir.join(&file_name);
    let tmp_path = retry_dir.join(format!("{file_name}.tmp"));
    let bytes = serde_json::to_vec(entries).context("failed to encode callback batch")?;
    std::fs::write(&tmp_path, bytes)
        .with_context(|| format!("failed to write retry file {tmp_path:?}"))?;
    std::fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("failed to move retry file into place at {final_path:?}"))?;
    Ok(final_path)
}

/// One pass over the retry directory. Returns the number of files delivered
/// and deleted. Stops at the first delivery failure since the remaining files
/// would hit the same unreachable admins.
pub(crate) async fn scan_once(
    admins: &[Arc<dyn AdminApi>],
    retry_dir: &Path,
) -> Result<usize> {
    let mut dir = tokio::fs::read_dir(retry_dir)
        .await
        .with_context(|| format!("failed to read retry dir {retry_dir:?}"))?;
    let mut files = Vec::new();
    while let Some(dir_entry) = dir.next_entry().await? {
        let path = dir_entry.path();
        if path.extension().map(|ext| ext == "json").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();

    let mut delivered = 0;
    for path in files {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read retry file {path:?}"))?;
        let entries: Vec<CallbackEntry> = match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("retry file {path:?} is not decodable, setting it aside: {e}");
                let corrupt = path.with_extension("json.corrupt");
                if let Err(rename_error) = tokio::fs::rename(&path, &corrupt).await {
                    warn!("failed to set aside {path:?}: {rename_error}");
                }
                continue;
            }
        };
        match deliver(admins, &entries).await {
            Ok(()) => {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("failed to delete delivered retry file {path:?}"))?;
                delivered += 1;
            }
            Err(e) => {
                debug!("retry delivery still failing, keeping {path:?}: {e}");
                break;
            }
        }
    }
    Ok(delivered)
}
