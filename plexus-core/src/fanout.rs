//! Fan-out aggregator
//!
//! Starts one operation per selected provider, lets them run concurrently,
//! and collects results in completion order. A panicking provider is
//! reported as a failure like any other error.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{AggregateFailure, BoxError, ProviderFailure, panic_message};
use crate::providers::Registration;

/// What to do when providers fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Run every provider to completion, then report all failures together
    #[default]
    Continue,
    /// Report the first failure once every started call has finished
    FailFast,
}

/// Run `op` against every provider and return the successes, in completion order.
///
/// Every operation is started before any result is examined. Under
/// [`ErrorPolicy::Continue`] a failed fan-out still hands back the results
/// of the providers that succeeded in [`AggregateFailure::successes`]. Under
/// [`ErrorPolicy::FailFast`] the already-started calls still run to
/// completion; only the first observed failure is reported.
pub async fn collect<C, T, F, Fut>(
    providers: &[Registration<C>],
    op: F,
    policy: ErrorPolicy,
) -> Result<Vec<T>, AggregateFailure<T>>
where
    C: ?Sized,
    F: Fn(Arc<C>) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let attempted = providers.len();
    let mut pending: FuturesUnordered<_> = providers
        .iter()
        .map(|registration| {
            let provider_id = registration.provider_id().to_string();
            let call = AssertUnwindSafe(op(Arc::clone(registration.provider()))).catch_unwind();
            async move {
                let outcome = match call.await {
                    Ok(result) => result,
                    Err(panic) => Err(BoxError::from(format!(
                        "provider panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                };
                (provider_id, outcome)
            }
        })
        .collect();

    let mut successes = Vec::with_capacity(attempted);
    let mut failures = Vec::new();
    while let Some((provider_id, outcome)) = pending.next().await {
        match outcome {
            Ok(value) => successes.push(value),
            Err(error) => {
                tracing::debug!(provider = %provider_id, error = %error, "Provider call failed");
                failures.push(ProviderFailure { provider_id, error });
            }
        }
    }

    if failures.is_empty() {
        return Ok(successes);
    }
    if policy == ErrorPolicy::FailFast {
        failures.truncate(1);
        successes.clear();
    }
    Err(AggregateFailure {
        attempted,
        failures,
        successes,
    })
}

/// [`collect`], then fold the successes with `reduce`.
///
/// `reduce` only runs when every provider succeeded; a partial result is
/// returned unreduced inside the failure.
pub async fn aggregate<C, T, R, F, Fut>(
    providers: &[Registration<C>],
    op: F,
    policy: ErrorPolicy,
    reduce: impl FnOnce(Vec<T>) -> R,
) -> Result<R, AggregateFailure<T>>
where
    C: ?Sized,
    F: Fn(Arc<C>) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    collect(providers, op, policy).await.map(reduce)
}

/// Run a side-effecting operation against every provider
pub async fn execute_all<C, F, Fut>(
    providers: &[Registration<C>],
    op: F,
    policy: ErrorPolicy,
) -> Result<(), AggregateFailure>
where
    C: ?Sized,
    F: Fn(Arc<C>) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    collect(providers, op, policy).await.map(|_| ())
}
