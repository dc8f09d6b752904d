// Error types for guarded invocations

use crate::descriptor::MethodId;
use crate::policy::PolicyKind;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by guarded work and fallback handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned to the caller of a guarded method.
#[derive(Error, Debug)]
pub enum FaultToleranceError {
    #[error("{0}")]
    WorkFailure(#[source] BoxError),

    #[error("Timed out after {0:?}")]
    TimeoutExceeded(Duration),

    #[error("Circuit breaker for '{0}' is open")]
    CircuitOpen(MethodId),

    #[error("Bulkhead for '{0}' is full")]
    BulkheadFull(MethodId),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<FaultToleranceError>,
    },

    #[error("Fallback handler failed: {0}")]
    FallbackFailure(#[source] BoxError),

    #[error("Invalid fault tolerance definition: {0}")]
    Definition(#[from] DefinitionError),
}

impl FaultToleranceError {
    /// The error from the guarded work, if this error originates from it.
    ///
    /// Looks through `RetriesExhausted`.
    pub fn work_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::WorkFailure(e) => Some(e.as_ref()),
            Self::RetriesExhausted { last, .. } => last.work_error(),
            _ => None,
        }
    }

    /// Whether the call was rejected without running the work.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::CircuitOpen(_) | Self::BulkheadFull(_) => true,
            Self::RetriesExhausted { last, .. } => last.is_rejection(),
            _ => false,
        }
    }
}

/// Invalid guarded-method declaration, detected when its pipeline is built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("{kind} parameter '{parameter}' is invalid: {reason}")]
    InvalidParameter {
        kind: PolicyKind,
        parameter: &'static str,
        reason: String,
    },

    #[error("{0} declared more than once")]
    DuplicatePolicy(PolicyKind),

    #[error("priority {outer_priority} of {outer} is greater than priority {inner_priority} of {inner}")]
    PriorityInversion {
        outer: PolicyKind,
        outer_priority: i32,
        inner: PolicyKind,
        inner_priority: i32,
    },

    #[error("'{0}' is already registered with a different result type")]
    TypeMismatch(String),
}

impl DefinitionError {
    pub(crate) fn invalid(
        kind: PolicyKind,
        parameter: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            kind,
            parameter,
            reason: reason.into(),
        }
    }
}

/// Panic raised by guarded work, converted into a failure.
#[derive(Error, Debug)]
#[error("Guarded work panicked: {0}")]
pub struct WorkPanicked(pub String);

impl WorkPanicked {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_work_error_through_retries_exhausted() {
        let err = FaultToleranceError::RetriesExhausted {
            attempts: 3,
            last: Box::new(FaultToleranceError::WorkFailure(Box::new(io::Error::other(
                "disk",
            )))),
        };

        let work = err.work_error().unwrap();
        assert!(work.downcast_ref::<io::Error>().is_some());
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_is_rejection() {
        let id = MethodId::new("app", "svc.call");
        assert!(FaultToleranceError::BulkheadFull(id.clone()).is_rejection());
        assert!(FaultToleranceError::CircuitOpen(id).is_rejection());
        assert!(!FaultToleranceError::TimeoutExceeded(Duration::from_secs(1)).is_rejection());
    }

    #[test]
    fn test_panic_payload_message() {
        let panicked = WorkPanicked::from_payload(Box::new("boom"));
        assert_eq!(panicked.to_string(), "Guarded work panicked: boom");

        let panicked = WorkPanicked::from_payload(Box::new(String::from("bang")));
        assert_eq!(panicked.0, "bang");
    }
}
