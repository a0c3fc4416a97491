use std::fmt::{self, Display};

use jobworks_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

/// Wire code for a successful operation or job run.
pub const CODE_SUCCESS: i32 = 0;
/// Wire code for a failed operation or job run.
pub const CODE_FAILED: i32 = -1;

/// Identifier of a job definition on the admin side. The executor keys its
/// worker registry by this id.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
)]
pub struct JobId(i64);

impl JobId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Identifier of a single job invocation, assigned by the admin when it
/// triggers the run. Log files and callbacks are keyed by it; the admin
/// deduplicates callbacks on it.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
)]
pub struct LogId(i64);

impl LogId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LogId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Lifecycle of one worker. Terminal states are final: no transition leaves
/// Completed, Failed or Killed.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, AsRefStr)]
pub enum WorkerState {
    Created,
    Running,
    Completed,
    Failed,
    Killed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::Killed
        )
    }
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Result report for one finished invocation, queued by the worker and owned
/// by the callback dispatcher until the admin acknowledges it or it is
/// persisted to the retry log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackEntry {
    pub log_id: LogId,
    pub job_id: JobId,
    pub code: i32,
    pub msg: Option<String>,
    pub finished_at: u64,
}

impl CallbackEntry {
    pub fn new(job_id: JobId, log_id: LogId, code: i32, msg: Option<String>) -> Self {
        Self {
            log_id,
            job_id,
            code,
            msg,
            finished_at: get_epoch_time_in_ms(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

/// Heartbeat payload announcing this executor to an admin node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryPayload {
    pub app_name: String,
    pub address: String,
}

/// Response envelope shared by every RPC in the platform, both directions.
/// `code` 0 means success, everything else is a failure with a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl RpcResponse {
    pub fn success() -> Self {
        Self {
            code: CODE_SUCCESS,
            msg: None,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            code: CODE_FAILED,
            msg: Some(msg.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}
