//! Providers - typed accessor for one contract

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use plexus_plugin_api::{Contract, Metadata};
use tokio_util::sync::CancellationToken;

use super::registry::{ProviderRegistry, Registration, RegistrationSnapshot};
use crate::error::{BoxError, InvokeError, ProviderFailure, SelectionError};
use crate::executor::{self, Executor};
use crate::fanout::{self, ErrorPolicy};
use crate::selection::{SelectionContext, SelectionResult, SelectionStrategy};

/// Selects and invokes the providers of contract `C`.
///
/// Obtained from [`ProviderRegistry::providers`]. Every call made through
/// it gets a child of the context's cancellation token and, if one is set,
/// goes through the configured [`Executor`].
pub struct Providers<'r, C: ?Sized> {
    registry: &'r ProviderRegistry,
    executor: Option<Arc<dyn Executor>>,
    _contract: PhantomData<fn() -> Arc<C>>,
}

impl<'r, C: Contract + ?Sized> Providers<'r, C> {
    pub(crate) fn new(registry: &'r ProviderRegistry) -> Self {
        Self {
            registry,
            executor: None,
            _contract: PhantomData,
        }
    }

    /// Builder: wrap every provider call in `executor`
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Current snapshot of the active registrations
    pub fn snapshot(&self) -> RegistrationSnapshot<C> {
        self.registry.snapshot::<C>()
    }

    /// Selection context over a fresh snapshot
    pub fn context(&self) -> SelectionContext<C> {
        SelectionContext::new(self.snapshot())
    }

    /// Select with `strategy` for the given call metadata
    pub fn select(
        &self,
        strategy: &SelectionStrategy,
        call_metadata: Metadata,
    ) -> Result<SelectionResult<C>, SelectionError> {
        strategy.select(&self.context().with_metadata(call_metadata))
    }

    /// Invoke `op` on the first selected provider.
    ///
    /// Returns `Ok(None)` when nothing was selected.
    pub async fn invoke_one<T, F, Fut>(
        &self,
        strategy: &SelectionStrategy,
        ctx: SelectionContext<C>,
        op: F,
    ) -> Result<Option<T>, InvokeError>
    where
        T: Send,
        F: Fn(Arc<C>, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let selection = strategy.select(&ctx)?;
        let Some(registration) = selection.first() else {
            tracing::debug!(contract = %ctx.contract(), "No provider selected");
            return Ok(None);
        };

        let value = self
            .call(registration, ctx.cancellation(), &op)
            .await
            .map_err(|error| ProviderFailure {
                provider_id: registration.provider_id().to_string(),
                error,
            })?;
        Ok(Some(value))
    }

    /// Invoke `op` on every selected provider concurrently.
    ///
    /// Under [`ErrorPolicy::Continue`] a failure still carries the results
    /// of the providers that succeeded.
    pub async fn invoke_all<T, F, Fut>(
        &self,
        strategy: &SelectionStrategy,
        ctx: SelectionContext<C>,
        policy: ErrorPolicy,
        op: F,
    ) -> Result<Vec<T>, InvokeError<T>>
    where
        T: Send,
        F: Fn(Arc<C>, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let selection = strategy.select(&ctx)?;
        tracing::debug!(
            contract = %ctx.contract(),
            strategy = %selection.strategy,
            selected = selection.len(),
            "Invoking providers"
        );

        let batch = ctx.cancellation();
        let executor = self.executor.as_deref();
        let op = &op;
        let results = fanout::collect(
            &selection.selected,
            |provider| {
                let token = batch.child_token();
                executor::run(executor, C::CATEGORY, token.clone(), move || {
                    op(Arc::clone(&provider), token.clone())
                })
            },
            policy,
        )
        .await?;
        Ok(results)
    }

    /// [`invoke_all`](Self::invoke_all), then fold the results with `reduce`
    pub async fn aggregate<T, R, F, Fut>(
        &self,
        strategy: &SelectionStrategy,
        ctx: SelectionContext<C>,
        policy: ErrorPolicy,
        op: F,
        reduce: impl FnOnce(Vec<T>) -> R,
    ) -> Result<R, InvokeError<T>>
    where
        T: Send,
        F: Fn(Arc<C>, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.invoke_all(strategy, ctx, policy, op).await.map(reduce)
    }

    async fn call<T, F, Fut>(
        &self,
        registration: &Registration<C>,
        batch: &CancellationToken,
        op: &F,
    ) -> Result<T, BoxError>
    where
        T: Send,
        F: Fn(Arc<C>, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let token = batch.child_token();
        let provider = registration.provider();
        executor::run(self.executor.as_deref(), C::CATEGORY, token.clone(), || {
            op(Arc::clone(provider), token.clone())
        })
        .await
    }
}
