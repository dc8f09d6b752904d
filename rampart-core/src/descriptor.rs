//! Guarded method declarations and the descriptors built from them.
//!
//! A [`MethodDefinition`] is what the caller declares in code: the method's
//! name, the policies guarding it and any interceptors. The engine turns it
//! into a [`GuardedMethodDescriptor`] the first time the method is invoked,
//! applying [`FaultToleranceSettings`] on the way, and reuses that descriptor
//! (and its circuit breaker and bulkhead state) for every later call.
//!
//! ```rust,ignore
//! use rampart::{MethodDefinition, RetryConfig, TimeoutConfig, fallback_value};
//! use std::time::Duration;
//!
//! let definition = MethodDefinition::builder("LoadService.timeout")
//!     .application("load")
//!     .timeout(TimeoutConfig::new(Duration::from_millis(5000)))
//!     .retry(RetryConfig::new(2))
//!     .fallback(fallback_value("Hello from @Fallback method".to_string()))
//!     .build();
//! ```

use crate::chain::{ChainBuilder, Pipeline};
use crate::clock::Clock;
use crate::error::DefinitionError;
use crate::interceptor::{Interceptor, InterceptorStage};
use crate::invocation::InvocationContext;
use crate::metrics::MetricsSink;
use crate::outcome::Outcome;
use crate::policy::{Next, Policy, PolicyKind, Work};
use crate::resilience::{
    Bulkhead, BulkheadConfig, BulkheadPolicy, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerPolicy, Fallback, FallbackPolicy, PolicyEnv, RetryConfig, RetryPolicy,
    TimeoutConfig, TimeoutPolicy,
};
use crate::settings::FaultToleranceSettings;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Application used when a definition does not name one.
pub const DEFAULT_APPLICATION: &str = "default";

/// Application recorded on descriptors shared across applications.
pub const SHARED_APPLICATION: &str = "*";

/// Identity of a guarded method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MethodId {
    pub application: String,
    pub name: String,
}

impl MethodId {
    pub fn new(application: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.name)
    }
}

/// Whether applications declaring the same method name share state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSharing {
    /// Every application gets its own descriptor.
    #[default]
    Isolated,
    /// One descriptor, circuit breaker and bulkhead for all applications.
    /// The first declaration to be invoked configures it.
    SharedAcrossApplications,
}

enum Declaration<T> {
    Timeout(TimeoutConfig),
    Retry(RetryConfig),
    CircuitBreaker(CircuitBreakerConfig),
    Bulkhead(BulkheadConfig),
    Fallback(Fallback<T>),
    Interceptor {
        priority: i32,
        interceptor: Arc<dyn Interceptor>,
    },
    Stage {
        name: String,
        priority: i32,
        policy: Arc<dyn Policy<T>>,
    },
}

impl<T> Declaration<T> {
    fn kind(&self) -> Option<PolicyKind> {
        match self {
            Self::Timeout(_) => Some(PolicyKind::Timeout),
            Self::Retry(_) => Some(PolicyKind::Retry),
            Self::CircuitBreaker(_) => Some(PolicyKind::CircuitBreaker),
            Self::Bulkhead(_) => Some(PolicyKind::Bulkhead),
            Self::Fallback(_) => Some(PolicyKind::Fallback),
            Self::Interceptor { .. } | Self::Stage { .. } => None,
        }
    }
}

/// Declared policies and interceptors of one guarded method.
///
/// Cheap to clone. Validation happens when the engine builds the descriptor.
pub struct MethodDefinition<T> {
    name: Arc<str>,
    application: Option<Arc<str>>,
    sharing: StateSharing,
    declarations: Arc<Vec<Declaration<T>>>,
}

impl<T> Clone for MethodDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            application: self.application.clone(),
            sharing: self.sharing,
            declarations: self.declarations.clone(),
        }
    }
}

impl<T> fmt::Debug for MethodDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDefinition")
            .field("name", &self.name)
            .field("application", &self.application)
            .field("sharing", &self.sharing)
            .field("declarations", &self.declarations.len())
            .finish()
    }
}

impl<T: Send + 'static> MethodDefinition<T> {
    pub fn builder(name: impl Into<String>) -> MethodDefinitionBuilder<T> {
        MethodDefinitionBuilder {
            name: name.into(),
            application: None,
            sharing: StateSharing::default(),
            declarations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    pub fn sharing(&self) -> StateSharing {
        self.sharing
    }

    /// Built-in policy kinds in declaration order.
    pub fn declared_policies(&self) -> Vec<PolicyKind> {
        self.declarations.iter().filter_map(|d| d.kind()).collect()
    }
}

/// Builder for [`MethodDefinition`].
pub struct MethodDefinitionBuilder<T> {
    name: String,
    application: Option<String>,
    sharing: StateSharing,
    declarations: Vec<Declaration<T>>,
}

impl<T: Send + 'static> MethodDefinitionBuilder<T> {
    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn sharing(mut self, sharing: StateSharing) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.declarations.push(Declaration::Timeout(config));
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.declarations.push(Declaration::Retry(config));
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.declarations.push(Declaration::CircuitBreaker(config));
        self
    }

    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.declarations.push(Declaration::Bulkhead(config));
        self
    }

    pub fn fallback(mut self, fallback: Fallback<T>) -> Self {
        self.declarations.push(Declaration::Fallback(fallback));
        self
    }

    /// Splice a user interceptor in at `priority`.
    pub fn interceptor(mut self, priority: i32, interceptor: Arc<dyn Interceptor>) -> Self {
        self.declarations.push(Declaration::Interceptor {
            priority,
            interceptor,
        });
        self
    }

    /// Splice a custom pipeline stage in at `priority`.
    pub fn stage(
        mut self,
        name: impl Into<String>,
        priority: i32,
        policy: Arc<dyn Policy<T>>,
    ) -> Self {
        self.declarations.push(Declaration::Stage {
            name: name.into(),
            priority,
            policy,
        });
        self
    }

    pub fn build(self) -> MethodDefinition<T> {
        MethodDefinition {
            name: self.name.into(),
            application: self.application.map(Into::into),
            sharing: self.sharing,
            declarations: Arc::new(self.declarations),
        }
    }
}

/// A guarded method ready to be invoked: its ordered pipeline and the
/// circuit breaker and bulkhead state shared by all of its callers.
pub struct GuardedMethodDescriptor<T> {
    id: MethodId,
    pipeline: Arc<Pipeline<T>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    bulkhead: Option<Arc<Bulkhead>>,
}

impl<T: Send + 'static> GuardedMethodDescriptor<T> {
    /// Validate `definition`, apply `settings` and build the pipeline.
    pub fn build(
        id: MethodId,
        definition: &MethodDefinition<T>,
        settings: &FaultToleranceSettings,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, DefinitionError> {
        let env = PolicyEnv {
            method: id.clone(),
            clock: clock.clone(),
            metrics,
        };
        let method = definition.name();
        let mut chain = ChainBuilder::new(settings.priority_overrides());
        let mut circuit_breaker = None;
        let mut bulkhead = None;

        for declaration in definition.declarations.iter() {
            if let Some(kind) = declaration.kind()
                && !settings.is_enabled(method, kind)
            {
                debug!(method = %id, policy = %kind, "Policy disabled by settings");
                continue;
            }

            chain = match declaration {
                Declaration::Timeout(config) => {
                    let config = settings.timeout(method, config.clone());
                    config.validate()?;
                    chain.builtin(
                        PolicyKind::Timeout,
                        Arc::new(TimeoutPolicy::new(config, env.clone())),
                    )
                }
                Declaration::Retry(config) => {
                    let config = settings.retry(method, config.clone());
                    config.validate()?;
                    chain.builtin(
                        PolicyKind::Retry,
                        Arc::new(RetryPolicy::new(config, env.clone())),
                    )
                }
                Declaration::CircuitBreaker(config) => {
                    let config = settings.circuit_breaker(method, config.clone());
                    config.validate()?;
                    let breaker = CircuitBreaker::new(id.to_string(), config, clock.clone());
                    circuit_breaker = Some(breaker.clone());
                    chain.builtin(
                        PolicyKind::CircuitBreaker,
                        Arc::new(CircuitBreakerPolicy::new(breaker, env.clone())),
                    )
                }
                Declaration::Bulkhead(config) => {
                    let config = settings.bulkhead(method, config.clone());
                    config.validate()?;
                    let shared = Bulkhead::new(id.to_string(), config);
                    bulkhead = Some(shared.clone());
                    chain.builtin(
                        PolicyKind::Bulkhead,
                        Arc::new(BulkheadPolicy::new(shared, env.clone())),
                    )
                }
                Declaration::Fallback(fallback) => chain.builtin(
                    PolicyKind::Fallback,
                    Arc::new(FallbackPolicy::new(fallback.clone())),
                ),
                Declaration::Interceptor {
                    priority,
                    interceptor,
                } => chain.custom(
                    interceptor.name().to_string(),
                    *priority,
                    Arc::new(InterceptorStage::new(interceptor.clone())),
                ),
                Declaration::Stage {
                    name,
                    priority,
                    policy,
                } => chain.custom(name.clone(), *priority, policy.clone()),
            };
        }

        let pipeline = chain.build()?;
        debug!(method = %id, stages = ?pipeline.names(), "Built guarded method pipeline");

        Ok(Self {
            id,
            pipeline: Arc::new(pipeline),
            circuit_breaker,
            bulkhead,
        })
    }

    pub fn id(&self) -> &MethodId {
        &self.id
    }

    pub fn pipeline(&self) -> &Pipeline<T> {
        &self.pipeline
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Arc<Bulkhead>> {
        self.bulkhead.as_ref()
    }

    /// Thread one call through the pipeline.
    pub(crate) fn run(&self, ctx: InvocationContext, work: Work<T>) -> BoxFuture<'static, Outcome<T>> {
        Next::new(self.pipeline.clone(), work).run(ctx)
    }
}

impl<T> fmt::Debug for GuardedMethodDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedMethodDescriptor")
            .field("id", &self.id)
            .field("pipeline", &self.pipeline)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("bulkhead", &self.bulkhead)
            .finish()
    }
}
