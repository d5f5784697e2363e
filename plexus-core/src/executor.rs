//! Executor - the seam where cross-cutting call wrappers plug in
//!
//! Timeouts, retries and circuit breakers live outside plexus-core. They
//! implement [`Executor`] and receive each provider call as a restartable
//! operation together with the contract category and a cancellation token.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ExecutorError};

/// A provider call. Each invocation starts a fresh attempt.
pub type Operation<'a> = dyn Fn() -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync + 'a;

/// Wraps provider calls
pub trait Executor: Send + Sync {
    /// Run `operation` at least once unless `cancellation` fires first
    fn execute<'a>(
        &'a self,
        operation: &'a Operation<'a>,
        category: &'a str,
        cancellation: CancellationToken,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// Runs the operation once; gives up with [`ExecutorError::Cancelled`] if
/// the token fires first.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute<'a>(
        &'a self,
        operation: &'a Operation<'a>,
        category: &'a str,
        cancellation: CancellationToken,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(ExecutorError::Cancelled {
                    category: category.to_string(),
                }
                .into()),
                result = operation() => result,
            }
        })
    }
}

/// Run a typed call, through `executor` when one is configured.
///
/// The executor only sees `()`; the value of the last successful attempt is
/// handed back through a slot.
pub async fn run<T, F, Fut>(
    executor: Option<&dyn Executor>,
    category: &str,
    cancellation: CancellationToken,
    call: F,
) -> Result<T, BoxError>
where
    T: Send,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, BoxError>> + Send,
{
    let Some(executor) = executor else {
        return call().await;
    };

    let slot: Mutex<Option<T>> = Mutex::new(None);
    let operation: &Operation<'_> = &|| {
        let attempt = call();
        let slot = &slot;
        Box::pin(async move {
            let value = attempt.await?;
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
            Ok::<(), BoxError>(())
        })
    };

    executor.execute(operation, category, cancellation).await?;
    slot.into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .ok_or_else(|| format!("executor for '{category}' completed without running the call").into())
}
