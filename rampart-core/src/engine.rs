//! Execution engine for guarded methods.
//!
//! The engine owns the registry of guarded method descriptors, one per
//! method identity, built lazily on first invocation and cached until the
//! application is removed. Every call runs through the descriptor's
//! pipeline, is recorded in the metrics sink exactly once, and is turned
//! into a `Result` for the caller.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rampart::{Engine, MethodDefinition, RetryConfig};
//!
//! let engine = Engine::new();
//! let definition = MethodDefinition::builder("Inventory.lookup")
//!     .retry(RetryConfig::new(2))
//!     .build();
//!
//! let stock = engine.invoke(&definition, |_ctx| async { lookup().await }).await?;
//! ```

use crate::arguments::Arguments;
use crate::clock::{Clock, TokioClock};
use crate::descriptor::{
    DEFAULT_APPLICATION, GuardedMethodDescriptor, MethodDefinition, MethodId, SHARED_APPLICATION,
    StateSharing,
};
use crate::error::{BoxError, DefinitionError, FaultToleranceError};
use crate::invocation::{ExecutionMode, ExecutionProbe, InvocationContext};
use crate::metrics::{MetricKind, MetricsSink, NoopMetrics};
use crate::policy::{Work, work_fn};
use crate::settings::FaultToleranceSettings;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    /// `None` for descriptors shared across applications.
    application: Option<String>,
    name: String,
}

struct RegistryEntry {
    descriptor: Arc<dyn Any + Send + Sync>,
    applications: HashSet<String>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    settings: FaultToleranceSettings,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(mut self, settings: FaultToleranceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            clock: self.clock,
            metrics: self.metrics,
            settings: Arc::new(self.settings),
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Runs guarded methods.
///
/// Cloning is cheap; clones share the descriptor registry.
#[derive(Clone)]
pub struct Engine {
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    settings: Arc<FaultToleranceSettings>,
    registry: Arc<RwLock<HashMap<RegistryKey, RegistryEntry>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with the tokio clock, no metrics and default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            clock: Arc::new(TokioClock),
            metrics: Arc::new(NoopMetrics),
            settings: FaultToleranceSettings::default(),
        }
    }

    pub fn settings(&self) -> &FaultToleranceSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Resolve the cached descriptor of `definition`, building it on first use.
    pub fn descriptor<T: Send + 'static>(
        &self,
        definition: &MethodDefinition<T>,
    ) -> Result<Arc<GuardedMethodDescriptor<T>>, DefinitionError> {
        let application = definition
            .application()
            .unwrap_or(DEFAULT_APPLICATION)
            .to_string();
        let shared = definition.sharing() == StateSharing::SharedAcrossApplications;
        let key = RegistryKey {
            application: (!shared).then(|| application.clone()),
            name: definition.name().to_string(),
        };

        if let Some(entry) = self.registry.read().get(&key)
            && entry.applications.contains(&application)
        {
            trace!(method = %key.name, application = %application, "Descriptor cache hit");
            return downcast(entry, &key);
        }

        let mut registry = self.registry.write();
        if let Some(entry) = registry.get_mut(&key) {
            let descriptor = downcast::<T>(entry, &key)?;
            if entry.applications.insert(application.clone()) {
                warn!(
                    method = %key.name,
                    application = %application,
                    shared_with = ?entry.applications,
                    "Application joins shared fault tolerance state, its own declaration is ignored"
                );
            }
            return Ok(descriptor);
        }

        let id = MethodId::new(
            if shared { SHARED_APPLICATION } else { application.as_str() },
            definition.name(),
        );
        let descriptor = Arc::new(GuardedMethodDescriptor::build(
            id,
            definition,
            &self.settings,
            self.clock.clone(),
            self.metrics.clone(),
        )?);
        info!(
            method = %descriptor.id(),
            stages = ?descriptor.pipeline().names(),
            "Guarded method registered"
        );

        registry.insert(
            key,
            RegistryEntry {
                descriptor: descriptor.clone(),
                applications: HashSet::from([application]),
            },
        );
        Ok(descriptor)
    }

    /// Evict the descriptors of `application`. Shared descriptors go once
    /// no application uses them anymore.
    ///
    /// Returns the number of descriptors evicted.
    pub fn remove_application(&self, application: &str) -> usize {
        let mut registry = self.registry.write();
        let before = registry.len();

        registry.retain(|key, entry| match &key.application {
            Some(owner) => owner != application,
            None => {
                entry.applications.remove(application);
                !entry.applications.is_empty()
            }
        });

        let evicted = before - registry.len();
        info!(application = %application, evicted, "Application removed");
        evicted
    }

    /// Number of cached descriptors.
    pub fn registered(&self) -> usize {
        self.registry.read().len()
    }

    /// Call `work` in synchronous mode on the caller's task.
    pub async fn invoke<T, F, Fut, E>(
        &self,
        definition: &MethodDefinition<T>,
        work: F,
    ) -> Result<T, FaultToleranceError>
    where
        T: Send + 'static,
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.invoke_with(definition, Arguments::new(), work).await
    }

    /// Like [`invoke`](Self::invoke), with call arguments visible to the
    /// work, interceptors and fallback.
    pub async fn invoke_with<T, F, Fut, E>(
        &self,
        definition: &MethodDefinition<T>,
        arguments: Arguments,
        work: F,
    ) -> Result<T, FaultToleranceError>
    where
        T: Send + 'static,
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let descriptor = self.descriptor(definition)?;
        let ctx = InvocationContext::new(
            descriptor.id().clone(),
            ExecutionMode::Synchronous,
            arguments,
        );
        drive(descriptor, self.metrics.clone(), ctx, work_fn(work)).await
    }

    /// Call `work` in asynchronous mode on its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn invoke_async<T, F, Fut, E>(
        &self,
        definition: &MethodDefinition<T>,
        work: F,
    ) -> InvocationHandle<T>
    where
        T: Send + 'static,
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.invoke_async_with(definition, Arguments::new(), work)
    }

    pub fn invoke_async_with<T, F, Fut, E>(
        &self,
        definition: &MethodDefinition<T>,
        arguments: Arguments,
        work: F,
    ) -> InvocationHandle<T>
    where
        T: Send + 'static,
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let resolved = self.descriptor(definition);
        let method = match &resolved {
            Ok(descriptor) => descriptor.id().clone(),
            Err(_) => MethodId::new(
                definition.application().unwrap_or(DEFAULT_APPLICATION),
                definition.name(),
            ),
        };
        let ctx = InvocationContext::new(method.clone(), ExecutionMode::Asynchronous, arguments);
        let probe = ctx.probe();
        let metrics = self.metrics.clone();
        let work = work_fn(work);

        let task = tokio::spawn(async move {
            match resolved {
                Ok(descriptor) => drive(descriptor, metrics, ctx, work).await,
                Err(e) => Err(e.into()),
            }
        });

        InvocationHandle {
            method,
            probe,
            task,
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("clock", &self.clock)
            .field("settings", &self.settings)
            .field("registered", &self.registered())
            .finish()
    }
}

fn downcast<T: Send + 'static>(
    entry: &RegistryEntry,
    key: &RegistryKey,
) -> Result<Arc<GuardedMethodDescriptor<T>>, DefinitionError> {
    entry
        .descriptor
        .clone()
        .downcast::<GuardedMethodDescriptor<T>>()
        .map_err(|_| DefinitionError::TypeMismatch(key.name.clone()))
}

async fn drive<T: Send + 'static>(
    descriptor: Arc<GuardedMethodDescriptor<T>>,
    metrics: Arc<dyn MetricsSink>,
    ctx: InvocationContext,
    work: Work<T>,
) -> Result<T, FaultToleranceError> {
    let method = descriptor.id().clone();
    let mut recorder = OutcomeRecorder::start(method.clone(), metrics);

    let span = info_span!("guarded_call", method = %method, mode = ?ctx.mode());
    let outcome = descriptor.run(ctx.clone(), work).instrument(span).await;

    let observed = ctx.guarded_outcome().unwrap_or_else(|| outcome.kind());
    recorder.finish(MetricKind::from(observed), ctx.fallback_invoked());
    debug!(
        method = %method,
        outcome = %outcome.kind(),
        observed = %observed,
        executions = ctx.executions(),
        "Guarded call finished"
    );

    outcome.into_result(&ctx)
}

/// Records one invocation and exactly one terminal outcome for it.
///
/// A call dropped before its pipeline finishes (aborted handle, caller
/// dropping the `invoke` future) is recorded as a failure.
struct OutcomeRecorder {
    method: MethodId,
    metrics: Arc<dyn MetricsSink>,
    finished: bool,
}

impl OutcomeRecorder {
    fn start(method: MethodId, metrics: Arc<dyn MetricsSink>) -> Self {
        metrics.record_invocation(&method);
        Self {
            method,
            metrics,
            finished: false,
        }
    }

    fn finish(&mut self, kind: MetricKind, fallback_invoked: bool) {
        self.finished = true;
        self.metrics.record_outcome(&self.method, kind);
        if fallback_invoked {
            self.metrics
                .record_outcome(&self.method, MetricKind::FallbackCalled);
        }
    }
}

impl Drop for OutcomeRecorder {
    fn drop(&mut self) {
        if !self.finished {
            debug!(method = %self.method, "Guarded call cancelled before it finished");
            self.metrics.record_outcome(&self.method, MetricKind::Failure);
        }
    }
}

/// Result of an asynchronous guarded call. Resolves once the call finishes.
///
/// Dropping the handle does not stop the call.
pub struct InvocationHandle<T> {
    method: MethodId,
    probe: ExecutionProbe,
    task: JoinHandle<Result<T, FaultToleranceError>>,
}

impl<T> InvocationHandle<T> {
    pub fn method(&self) -> &MethodId {
        &self.method
    }

    /// How often the work has run so far.
    pub fn executions(&self) -> u32 {
        self.probe.executions()
    }

    pub fn probe(&self) -> ExecutionProbe {
        self.probe.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the call. The handle then resolves to a work failure, and the
    /// call is recorded as failed.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for InvocationHandle<T> {
    type Output = Result<T, FaultToleranceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(FaultToleranceError::WorkFailure(Box::new(e))),
        })
    }
}

impl<T> fmt::Debug for InvocationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationHandle")
            .field("method", &self.method)
            .field("executions", &self.executions())
            .field("finished", &self.is_finished())
            .finish()
    }
}
