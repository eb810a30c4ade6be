//! Error taxonomy shared by synthesis and reconciliation.
//!
//! Every failure that escapes the reconciler is one of four kinds. The HTTP layer that
//! sits in front of this crate maps them onto status codes (400, 404, 409/5xx, 500), so
//! the kind matters more than the message.
use crate::store::StoreError;

use std::fmt::{self, Display};

/// A malformed field in a function spec, such as an unparseable resource quantity or
/// a constraint that isn't `key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> ValidationError {
        ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum ReconcileError {
    Validation(ValidationError),
    NotFound { kind: &'static str, name: String },
    /// Someone else already moved the object forward. Never retried synchronously.
    Conflict(String),
    Upstream(StoreError),
}

impl ReconcileError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> ReconcileError {
        ReconcileError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ReconcileError::Validation(_))
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Validation(e) => write!(f, "Validation error: {}", e),
            ReconcileError::NotFound { kind, name } => write!(f, "{} '{}' not found", kind, name),
            ReconcileError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ReconcileError::Upstream(e) => write!(f, "Upstream error: {}", e),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Validation(e) => Some(e),
            ReconcileError::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for ReconcileError {
    fn from(err: ValidationError) -> ReconcileError {
        ReconcileError::Validation(err)
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> ReconcileError {
        match err {
            StoreError::NotFound(name) => ReconcileError::NotFound {
                kind: "resource",
                name,
            },
            StoreError::Conflict(msg) => ReconcileError::Conflict(msg),
            other => ReconcileError::Upstream(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_errors_map_onto_reconcile_kinds() {
        let err: ReconcileError = StoreError::NotFound("apps/v1/statefulsets/fn/echo".to_owned()).into();
        assert!(err.is_not_found());

        let err: ReconcileError = StoreError::Conflict("stale resourceVersion".to_owned()).into();
        assert!(err.is_conflict());

        let err: ReconcileError = StoreError::Upstream("connection reset".to_owned()).into();
        assert!(matches!(err, ReconcileError::Upstream(_)));
    }
}
