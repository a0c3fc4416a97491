use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Deletes invocation log files older than the configured retention and
/// prunes per-job directories that end up empty. The callback retry
/// directory lives under the same root and is never touched.
pub struct LogRetentionSweeper {
    log_dir: String,
    retry_dir: PathBuf,
    retention_days: i64,
    shutdown_rx: watch::Receiver<()>,
}

impl LogRetentionSweeper {
    pub fn new(
        log_dir: String,
        retry_dir: PathBuf,
        retention_days: i64,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            log_dir,
            retry_dir,
            retention_days,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) {
        if self.retention_days < 1 {
            info!("log retention sweeping disabled");
            return;
        }
        let retention = Duration::from_secs(self.retention_days as u64 * 24 * 60 * 60);
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = SystemTime::now() - retention;
                    match sweep_once(&self.log_dir, &self.retry_dir, cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => info!("log retention sweep removed {} file(s)", removed),
                        Err(e) => warn!("log retention sweep failed: {e:?}"),
                    }
                }
                _ = self.shutdown_rx.changed() => break,
            }
        }
        info!("log retention sweeper stopped");
    }
}

/// One pass over `{log_dir}/{job_id}/*.log`. Returns how many files were
/// removed. Per-file failures are logged and skipped so one bad path cannot
/// hold back the rest of the sweep.
pub(crate) async fn sweep_once(
    log_dir: &str,
    retry_dir: &Path,
    cutoff: SystemTime,
) -> Result<usize> {
    let mut removed = 0usize;
    let mut root = tokio::fs::read_dir(log_dir)
        .await
        .with_context(|| format!("failed to read log directory {}", log_dir))?;
    while let Some(job_dir) = root.next_entry().await? {
        let job_path = job_dir.path();
        if job_path == retry_dir || !job_dir.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(&job_path)
            .await
            .with_context(|| format!("failed to read job log directory {:?}", job_path))?;
        let mut kept = 0usize;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            let modified = match file.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("skipping {:?}, no modification time: {e}", path);
                    kept += 1;
                    continue;
                }
            };
            if modified >= cutoff {
                kept += 1;
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("removed expired job log {:?}", path);
                    removed += 1;
                }
                Err(e) => {
                    warn!("failed to remove expired job log {:?}: {e}", path);
                    kept += 1;
                }
            }
        }
        if kept == 0 {
            // empty now; losing the race against a new worker is harmless
            if let Err(e) = tokio::fs::remove_dir(&job_path).await {
                debug!("left non-empty job directory {:?} in place: {e}", job_path);
            }
        }
    }
    Ok(removed)
}
