use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use data_model::{JobId, LogId};
use jobworks_utils::get_epoch_time_in_ms;
use tokio::io::AsyncWriteExt;

/// Create the job-log root and the callback retry directory under it.
/// Failure here aborts startup; everything else in the process assumes the
/// directories exist.
pub async fn init_log_dir(log_dir: &str, retry_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(log_dir)
        .await
        .with_context(|| format!("failed to create log directory {}", log_dir))?;
    tokio::fs::create_dir_all(retry_dir)
        .await
        .with_context(|| format!("failed to create retry directory {:?}", retry_dir))?;
    Ok(())
}

/// One log file per invocation, grouped by job id.
pub fn log_file_path(log_dir: &str, job_id: JobId, log_id: LogId) -> PathBuf {
    PathBuf::from(log_dir)
        .join(job_id.to_string())
        .join(format!("{}.log", log_id))
}

/// Append-only writer for one invocation's log file. Handlers receive one
/// through their execution context; the worker itself writes begin/end
/// markers around the handler run.
#[derive(Debug, Clone)]
pub struct JobLogAppender {
    path: PathBuf,
}

impl JobLogAppender {
    pub fn new(log_dir: &str, job_id: JobId, log_id: LogId) -> Self {
        Self {
            path: log_file_path(log_dir, job_id, log_id),
        }
    }

    pub async fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open job log {:?}", self.path))?;
        let record = format!("{} {}\n", get_epoch_time_in_ms(), line);
        file.write_all(record.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// A slice of an invocation log, read for live tailing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSlice {
    pub from_line: usize,
    pub to_line: usize,
    pub content: String,
}

/// Read the log from a 1-based line offset to the current end of file.
/// Errors when the file does not exist; callers surface that as an RPC
/// failure rather than guessing.
pub async fn read_log(
    log_dir: &str,
    job_id: JobId,
    log_id: LogId,
    from_line: usize,
) -> Result<LogSlice> {
    let path = log_file_path(log_dir, job_id, log_id);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("job log not found: {:?}", path))?;

    let from_line = from_line.max(1);
    let mut content = String::new();
    let mut to_line = from_line.saturating_sub(1);
    for (idx, line) in raw.lines().enumerate() {
        let line_number = idx + 1;
        if line_number < from_line {
            continue;
        }
        content.push_str(line);
        content.push('\n');
        to_line = line_number;
    }

    Ok(LogSlice {
        from_line,
        to_line,
        content,
    })
}
