//! Structured error taxonomy shared by steps, runners, and logs

use serde::{Deserialize, Serialize};

/// The kind of failure that produced an [`AflError`]
///
/// This is a closed set deliberately kept small: callers branch on kind,
/// not on message text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid declaration tree at load time
    Parse,

    /// Name resolution failed while evaluating an expression
    Reference,

    /// Type or arity mismatch in step parameters
    Validation,

    /// An external agent reported failure for a claimed task
    Agent,

    /// A watchdog declared a task or lock stale
    Timeout,

    /// A conditional write lost a race; the caller should re-read and retry
    Contention,

    /// Cooperative cancellation
    Cancelled,

    /// Invariant violation
    Internal,
}

/// A structured, persisted error attached to a step or runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AflError {
    pub kind: ErrorKind,
    pub message: String,
    pub origin: Option<String>,
}

impl AflError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn reference(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Reference, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Agent, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Contention is always recoverable by re-reading and retrying
    pub fn is_contention(&self) -> bool {
        self.kind == ErrorKind::Contention
    }
}

impl std::fmt::Display for AflError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "{:?}: {} (at {})", self.kind, self.message, origin),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for AflError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_afl_error_display() {
        let err = AflError::reference("unbound path research.report");
        assert!(err.to_string().contains("research.report"));
    }

    #[test]
    fn test_is_contention() {
        let err = AflError::new(ErrorKind::Contention, "lost race");
        assert!(err.is_contention());
        assert!(!AflError::internal("oops").is_contention());
    }

    #[test]
    fn test_with_origin() {
        let err = AflError::validation("bad arity").with_origin("step-42");
        assert_eq!(err.origin.as_deref(), Some("step-42"));
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::Reference).unwrap();
        assert_eq!(json, "\"reference\"");
    }
}
