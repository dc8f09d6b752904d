//! Ordering of policies and interceptors into a pipeline.
//!
//! Stages are sorted by priority, lowest first (closest to the caller), ties
//! keep declaration order. Built-in policies all sit at the fault tolerance
//! priority and always nest as
//! `Fallback -> Retry -> CircuitBreaker -> Timeout -> Bulkhead -> work`,
//! whatever order they were declared in. A user interceptor with a priority
//! above the fault tolerance priority therefore runs inside the retry loop
//! and is re-entered on each attempt.

use crate::error::DefinitionError;
use crate::policy::{Policy, PolicyKind};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Priority shared by the built-in policies unless overridden.
pub const DEFAULT_FAULT_TOLERANCE_PRIORITY: i32 = 4010;

/// Priority overrides applied when a pipeline is built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityOverrides {
    /// Replaces the default priority of the whole built-in block.
    pub fault_tolerance: Option<i32>,
    /// Per-kind priority, takes precedence over `fault_tolerance`.
    pub per_kind: BTreeMap<PolicyKind, i32>,
}

impl PriorityOverrides {
    pub fn fault_tolerance_priority(&self) -> i32 {
        self.fault_tolerance
            .unwrap_or(DEFAULT_FAULT_TOLERANCE_PRIORITY)
    }

    pub fn priority_of(&self, kind: PolicyKind) -> i32 {
        self.per_kind
            .get(&kind)
            .copied()
            .unwrap_or_else(|| self.fault_tolerance_priority())
    }
}

/// What a pipeline stage is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Builtin(PolicyKind),
    Interceptor,
}

/// One ordered entry of a pipeline.
pub struct Stage<T> {
    name: String,
    kind: StageKind,
    priority: i32,
    policy: Arc<dyn Policy<T>>,
}

impl<T: Send + 'static> Stage<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Immutable ordered list of stages, outermost first.
pub struct Pipeline<T> {
    stages: Vec<Stage<T>>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    /// Stage names, outermost first.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, kind: PolicyKind) -> bool {
        self.stages
            .iter()
            .any(|s| s.kind == StageKind::Builtin(kind))
    }

    pub(crate) fn policy_at(&self, position: usize) -> Option<Arc<dyn Policy<T>>> {
        self.stages.get(position).map(|s| s.policy.clone())
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stages.iter()).finish()
    }
}

enum Entry<T> {
    Builtin(PolicyKind, Arc<dyn Policy<T>>),
    Custom {
        name: String,
        priority: i32,
        policy: Arc<dyn Policy<T>>,
    },
}

/// Collects declared stages and orders them.
pub struct ChainBuilder<T> {
    priorities: PriorityOverrides,
    entries: Vec<Entry<T>>,
}

impl<T: Send + 'static> ChainBuilder<T> {
    pub fn new(priorities: PriorityOverrides) -> Self {
        Self {
            priorities,
            entries: Vec::new(),
        }
    }

    /// Add a built-in policy at the next declaration slot.
    pub fn builtin(mut self, kind: PolicyKind, policy: Arc<dyn Policy<T>>) -> Self {
        self.entries.push(Entry::Builtin(kind, policy));
        self
    }

    /// Add a user stage with an explicit priority.
    pub fn custom(
        mut self,
        name: impl Into<String>,
        priority: i32,
        policy: Arc<dyn Policy<T>>,
    ) -> Self {
        self.entries.push(Entry::Custom {
            name: name.into(),
            priority,
            policy,
        });
        self
    }

    pub fn build(self) -> Result<Pipeline<T>, DefinitionError> {
        let mut builtins: Vec<(PolicyKind, Arc<dyn Policy<T>>)> = Vec::new();
        for entry in &self.entries {
            if let Entry::Builtin(kind, policy) = entry {
                if builtins.iter().any(|(k, _)| k == kind) {
                    return Err(DefinitionError::DuplicatePolicy(*kind));
                }
                builtins.push((*kind, policy.clone()));
            }
        }
        builtins.sort_by_key(|(kind, _)| *kind);

        for pair in builtins.windows(2) {
            let (outer, inner) = (pair[0].0, pair[1].0);
            let outer_priority = self.priorities.priority_of(outer);
            let inner_priority = self.priorities.priority_of(inner);
            if outer_priority > inner_priority {
                return Err(DefinitionError::PriorityInversion {
                    outer,
                    outer_priority,
                    inner,
                    inner_priority,
                });
            }
        }

        // Built-ins refill their own declaration slots in canonical order.
        let mut canonical = builtins.into_iter();
        let mut stages = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let stage = match entry {
                Entry::Builtin(..) => match canonical.next() {
                    Some((kind, policy)) => Stage {
                        name: kind.as_str().to_string(),
                        kind: StageKind::Builtin(kind),
                        priority: self.priorities.priority_of(kind),
                        policy,
                    },
                    None => continue,
                },
                Entry::Custom {
                    name,
                    priority,
                    policy,
                } => Stage {
                    name,
                    kind: StageKind::Interceptor,
                    priority,
                    policy,
                },
            };
            stages.push(stage);
        }

        // Stable sort keeps declaration order among equal priorities.
        stages.sort_by_key(|stage| stage.priority);

        Ok(Pipeline { stages })
    }
}
