use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use data_model::{CallbackEntry, JobId, LogId, WorkerState, CODE_FAILED, CODE_SUCCESS};
use futures::FutureExt;
use tokio::{
    sync::{watch, OnceCell},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    callbacks::CallbackDispatcher,
    error::ExecutorError,
    handlers::{HandlerRegistry, JobContext, JobHandler},
    joblog::JobLogAppender,
};

/// How long a stopped worker may keep running before we log that its handler
/// is ignoring cancellation. Cancellation is cooperative: a handler that
/// never yields cannot be stopped, only reported.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(5);

const SUPERSEDED_REASON: &str = "superseded by new trigger";

/// State shared between a worker's owning handle and its spawned task.
struct WorkerShared {
    job_id: JobId,
    log_id: LogId,
    handler_name: String,
    cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
    stop_reason: OnceCell<String>,
}

impl WorkerShared {
    /// Terminal states are final; later transitions are ignored.
    fn transition(&self, next: WorkerState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Handle to one live invocation. Owned by the registry; dropping it detaches
/// the task, which still reports its result through the dispatcher.
pub struct JobWorker {
    shared: Arc<WorkerShared>,
    join_handle: JoinHandle<()>,
}

impl JobWorker {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        workers: Arc<DashMap<JobId, JobWorker>>,
        job_id: JobId,
        log_id: LogId,
        handler_name: &str,
        handler: Arc<dyn JobHandler>,
        params: String,
        appender: JobLogAppender,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Created);
        let shared = Arc::new(WorkerShared {
            job_id,
            log_id,
            handler_name: handler_name.to_string(),
            cancel: CancellationToken::new(),
            state,
            stop_reason: OnceCell::new(),
        });
        let join_handle = tokio::spawn(run(
            shared.clone(),
            handler,
            params,
            appender,
            dispatcher,
            workers,
        ));
        Self {
            shared,
            join_handle,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.shared.job_id
    }

    /// Record the stop reason (first caller wins) and cancel the token. The
    /// worker turns Killed when its select observes the cancellation; a
    /// handler that never yields is reported after the grace period.
    pub fn request_stop(&self, reason: &str) {
        if self.shared.stop_reason.set(reason.to_string()).is_ok() {
            info!(
                "stop requested for job {} (reason: {})",
                self.shared.job_id, reason
            );
            let shared = self.shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(STOP_GRACE).await;
                if !shared.state.borrow().is_terminal() {
                    warn!(
                        "job {} did not observe its stop request within {:?}, handler '{}' is ignoring cancellation",
                        shared.job_id, STOP_GRACE, shared.handler_name
                    );
                }
            });
        }
        self.shared.cancel.cancel();
    }

    pub async fn join(self) {
        let _ = self.join_handle.await;
    }
}

async fn run(
    shared: Arc<WorkerShared>,
    handler: Arc<dyn JobHandler>,
    params: String,
    appender: JobLogAppender,
    dispatcher: CallbackDispatcher,
    workers: Arc<DashMap<JobId, JobWorker>>,
) {
    shared.transition(WorkerState::Running);
    info!(
        "worker started for job {} (handler '{}', log {})",
        shared.job_id, shared.handler_name, shared.log_id
    );
    if let Err(e) = appender
        .append(&format!("worker started, handler '{}'", shared.handler_name))
        .await
    {
        warn!("failed to write start marker for log {}: {e:?}", shared.log_id);
    }

    let ctx = JobContext::new(
        shared.job_id,
        shared.log_id,
        params,
        shared.cancel.clone(),
        appender.clone(),
    );
    let execute = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();
    let outcome = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => None,
        result = execute => Some(result),
    };

    let (state, code, msg) = match outcome {
        Some(Ok(Ok(()))) => (WorkerState::Completed, CODE_SUCCESS, None),
        Some(Ok(Err(e))) => (WorkerState::Failed, CODE_FAILED, Some(format!("{e:#}"))),
        Some(Err(panic)) => (
            WorkerState::Failed,
            CODE_FAILED,
            Some(format!("handler panicked: {}", panic_message(panic))),
        ),
        None => {
            let reason = shared
                .stop_reason
                .get()
                .cloned()
                .unwrap_or_else(|| "stop requested".to_string());
            (WorkerState::Killed, CODE_FAILED, Some(reason))
        }
    };
    shared.transition(state);

    let marker = match &msg {
        Some(m) => format!("worker finished as {}: {}", state, m),
        None => format!("worker finished as {}", state),
    };
    if let Err(e) = appender.append(&marker).await {
        debug!("failed to write end marker for log {}: {e:?}", shared.log_id);
    }

    dispatcher.enqueue(CallbackEntry::new(shared.job_id, shared.log_id, code, msg));
    workers.remove_if(&shared.job_id, |_, worker| {
        Arc::ptr_eq(&worker.shared, &shared)
    });
    info!("worker for job {} finished as {}", shared.job_id, state);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Live workers keyed by job id. At most one worker per job: a new trigger
/// stops the previous worker before its replacement is installed, with the
/// same-key race serialized by the map's entry lock.
pub struct WorkerRegistry {
    workers: Arc<DashMap<JobId, JobWorker>>,
    handlers: Arc<HandlerRegistry>,
    dispatcher: CallbackDispatcher,
    log_dir: String,
}

impl WorkerRegistry {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        dispatcher: CallbackDispatcher,
        log_dir: String,
    ) -> Self {
        Self {
            workers: Arc::new(DashMap::new()),
            handlers,
            dispatcher,
            log_dir,
        }
    }

    /// Start a worker for the trigger, replacing any worker currently running
    /// for the same job id. Fails before creating any state when the handler
    /// name is unknown.
    pub fn replace(
        &self,
        job_id: JobId,
        handler_name: &str,
        params: String,
        log_id: LogId,
    ) -> Result<(), ExecutorError> {
        let handler = self
            .handlers
            .get(handler_name)
            .ok_or_else(|| ExecutorError::UnknownHandler(handler_name.to_string()))?;
        let appender = JobLogAppender::new(&self.log_dir, job_id, log_id);
        match self.workers.entry(job_id) {
            Entry::Occupied(mut occupied) => {
                occupied.get().request_stop(SUPERSEDED_REASON);
                let worker = JobWorker::spawn(
                    self.workers.clone(),
                    job_id,
                    log_id,
                    handler_name,
                    handler,
                    params,
                    appender,
                    self.dispatcher.clone(),
                );
                occupied.insert(worker);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(JobWorker::spawn(
                    self.workers.clone(),
                    job_id,
                    log_id,
                    handler_name,
                    handler,
                    params,
                    appender,
                    self.dispatcher.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Stop and remove the worker for a job if one is live. Safe to call for
    /// jobs with no worker; kill requests are idempotent.
    pub fn remove(&self, job_id: JobId, reason: &str) -> bool {
        match self.workers.remove(&job_id) {
            Some((_, worker)) => {
                worker.request_stop(reason);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.workers.contains_key(&job_id)
    }

    pub fn running_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop every live worker and wait up to the grace period for each to
    /// finish. Used at shutdown, after the inbound endpoint stopped accepting
    /// triggers.
    pub async fn stop_all(&self, reason: &str) {
        let job_ids: Vec<JobId> = self.workers.iter().map(|entry| *entry.key()).collect();
        let mut stopping = Vec::new();
        for job_id in job_ids {
            if let Some((_, worker)) = self.workers.remove(&job_id) {
                worker.request_stop(reason);
                stopping.push(worker);
            }
        }
        for worker in stopping {
            let job_id = worker.job_id();
            if tokio::time::timeout(STOP_GRACE, worker.join())
                .await
                .is_err()
            {
                warn!("worker for job {} still running after stop grace period", job_id);
            }
        }
    }
}
