use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::Details;

/// Everything an action learns about the invocation that triggered it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub name: String,
    pub details: Details,
    pub periodic: bool,
    /// Instant the executor started this invocation.
    pub fired_at: DateTime<Utc>,
}

/// Executable payload attached to every task, one-shot or periodic.
///
/// Implementations run on their own Tokio task with a timeout, so they may
/// block on I/O freely, but they must be `Send + Sync + 'static` to cross the
/// spawn boundary. Returning `Err` or panicking marks the run as failed.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

/// Action that does nothing and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAction;

#[async_trait]
impl TaskAction for NoopAction {
    async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapter returned by [`action_fn`].
pub struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskAction for FnAction<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable action.
///
/// ```ignore
/// let action = action_fn(|ctx| async move {
///     tracing::info!(task = %ctx.name, "backup");
///     Ok(())
/// });
/// ```
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn TaskAction>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnAction { f })
}
