use std::{future::Future, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{JobId, LogId};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::joblog::JobLogAppender;

/// Everything a handler sees about the invocation it is running: ids, the
/// raw parameter payload from the admin, its own log file, and the
/// cancellation token it is expected to poll or await at blocking points.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub log_id: LogId,
    pub params: String,
    cancel: CancellationToken,
    log: JobLogAppender,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        log_id: LogId,
        params: String,
        cancel: CancellationToken,
        log: JobLogAppender,
    ) -> Self {
        Self {
            job_id,
            log_id,
            params,
            cancel,
            log,
        }
    }

    /// True once a stop was requested for this invocation. Long-running
    /// handlers should check this between units of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when a stop is requested. Useful inside `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Append a line to this invocation's log file. Log-write failures are
    /// reported but never fail the job itself.
    pub async fn log(&self, line: &str) {
        if let Err(e) = self.log.append(line).await {
            warn!(
                job_id = self.job_id.get(),
                log_id = self.log_id.get(),
                "failed to append job log: {:?}",
                e
            );
        }
    }
}

/// A named unit of work the admin can trigger on this executor. Returning
/// `Err` marks the invocation Failed; the error message travels back to the
/// admin in the result callback.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> Result<()>;
}

/// Adapter so plain async closures can be registered as handlers.
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn execute(&self, ctx: JobContext) -> Result<()> {
        (self.f)(ctx).await
    }
}

/// Name → handler map, populated at startup and consulted on every trigger.
/// Entries live for the process lifetime; re-registering a name replaces the
/// previous handler (last write wins) with a warning.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, name: &str, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(name.to_string(), handler).is_some() {
            warn!(
                handler = name,
                "job handler re-registered, replacing the previous one"
            );
        } else {
            debug!(handler = name, "job handler registered");
        }
    }

    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { f }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn test_ctx(dir: &tempfile::TempDir) -> JobContext {
        JobContext::new(
            JobId::new(1),
            LogId::new(1),
            String::new(),
            CancellationToken::new(),
            JobLogAppender::new(dir.path().to_str().unwrap(), JobId::new(1), LogId::new(1)),
        )
    }

    #[tokio::test]
    async fn test_register_and_execute_fn_handler() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::new();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        registry.register_fn("demoTask", |_ctx| async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let handler = registry.get("demoTask").expect("handler registered");
        handler.execute(test_ctx(&dir)).await.unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(registry.get("otherTask").is_none());
    }

    #[tokio::test]
    async fn test_reregistration_is_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::new();
        registry.register_fn("task", |_ctx| async { Err(anyhow::anyhow!("old")) });
        registry.register_fn("task", |_ctx| async { Ok(()) });
        assert_eq!(registry.len(), 1);

        let handler = registry.get("task").unwrap();
        assert!(handler.execute(test_ctx(&dir)).await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_empties_registry() {
        let registry = HandlerRegistry::new();
        registry.register_fn("a", |_ctx| async { Ok(()) });
        registry.register_fn("b", |_ctx| async { Ok(()) });
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert!(registry.is_empty());
    }
}
