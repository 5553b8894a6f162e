//! Error taxonomy for the session workflow
//!
//! Configuration and duplicate-definition errors are returned before anything
//! is queued. Setup and validation failures surface from the queue and always
//! carry the [`CommandOrigin`] of the `session` command that started them.

use thiserror::Error;

use crate::types::{CommandOrigin, SessionId, SessionPhase};

/// Invalid arguments to `run_session`, or an unreadable configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("session id must be a non-empty string or a serializable object, got {found}")]
    InvalidId { found: String },

    #[error("unknown session option `{key}`; expected one of: validate, cacheAcrossSpecs")]
    UnknownOption { key: String },

    #[error("session option `{key}` must be {expected}, got {found}")]
    InvalidOptionType {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("no session is defined with id `{id}` in this spec; pass a setup routine to define it")]
    SessionNotFound { id: SessionId },

    #[error("failed to load session configuration: {0}")]
    Load(String),
}

/// Which properties of a redefinition differ from the registered definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefinitionConflict {
    pub has_uniq_setup_definition: bool,
    pub has_uniq_validate_definition: bool,
    pub has_uniq_persistence: bool,
}

impl DefinitionConflict {
    pub fn is_conflicting(&self) -> bool {
        self.has_uniq_setup_definition || self.has_uniq_validate_definition || self.has_uniq_persistence
    }

    /// Human-readable list of the conflicting properties.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.has_uniq_setup_definition {
            parts.push("setup function");
        }
        if self.has_uniq_validate_definition {
            parts.push("validate function");
        }
        if self.has_uniq_persistence {
            parts.push("persistence (cacheAcrossSpecs)");
        }
        parts.join(" and ")
    }
}

/// Failure raised by a user routine or by a step it chained.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutineError {
    #[error("{message}")]
    Error { message: String },

    /// A value that is not an error was thrown.
    #[error("a non-error value was thrown: {0}")]
    Thrown(serde_json::Value),
}

impl RoutineError {
    pub fn msg(message: impl Into<String>) -> Self {
        RoutineError::Error {
            message: message.into(),
        }
    }

    /// Convert a thrown non-error value into a proper error.
    pub fn into_error(self) -> Self {
        match self {
            RoutineError::Thrown(value) => RoutineError::Error {
                message: match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                },
            },
            err => err,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RoutineError::Error { message } => message.clone(),
            RoutineError::Thrown(value) => value.to_string(),
        }
    }
}

impl From<anyhow::Error> for RoutineError {
    fn from(err: anyhow::Error) -> Self {
        RoutineError::msg(format!("{err:#}"))
    }
}

/// Why a validation routine judged the session invalid.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationCause {
    #[error("{0}")]
    Errored(RoutineError),

    #[error("the validate callback's promise resolved false")]
    ResolvedFalse,

    #[error("the validate callback yielded false")]
    YieldedFalse,
}

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("session `{id}` was already defined in this spec with a different {}", .conflict.describe())]
    DuplicateSessionDefinition {
        id: SessionId,
        conflict: DefinitionConflict,
    },

    #[error("setup of session `{id}` failed while {} the session: {source}", .phase.progressive())]
    SetupFailure {
        id: SessionId,
        phase: SessionPhase,
        origin: CommandOrigin,
        #[source]
        source: RoutineError,
    },

    #[error(
        "validation of session `{id}` failed: {cause}. This error occurred while {} the session. {}",
        .phase.progressive(),
        .phase.consequence()
    )]
    ValidationFailure {
        id: SessionId,
        phase: SessionPhase,
        origin: CommandOrigin,
        cause: ValidationCause,
    },

    /// Recorded by the queue when an interceptor redirects execution. Never
    /// returned to callers.
    #[error("execution redirected to queue index {resume_at}: {cause}")]
    QueueRedirect {
        resume_at: usize,
        cause: Box<SessionError>,
    },

    #[error("session store `{operation}` failed: {message}")]
    Store {
        operation: &'static str,
        message: String,
    },

    #[error("browser `{operation}` failed: {message}")]
    Browser {
        operation: &'static str,
        message: String,
    },

    /// A user step failed and nothing has attributed it yet.
    #[error("step `{step}` failed: {source}")]
    Routine {
        step: String,
        #[source]
        source: RoutineError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    pub(crate) fn store(operation: &'static str, err: anyhow::Error) -> Self {
        SessionError::Store {
            operation,
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn browser(operation: &'static str, err: anyhow::Error) -> Self {
        SessionError::Browser {
            operation,
            message: format!("{err:#}"),
        }
    }

    /// The session command a setup/validation failure is attributed to.
    pub fn origin(&self) -> Option<&CommandOrigin> {
        match self {
            SessionError::SetupFailure { origin, .. }
            | SessionError::ValidationFailure { origin, .. } => Some(origin),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<SessionPhase> {
        match self {
            SessionError::SetupFailure { phase, .. }
            | SessionError::ValidationFailure { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Routine-level cause, if this error came from user code.
    pub fn routine_cause(&self) -> Option<&RoutineError> {
        match self {
            SessionError::Routine { source, .. } | SessionError::SetupFailure { source, .. } => {
                Some(source)
            }
            SessionError::ValidationFailure {
                cause: ValidationCause::Errored(source),
                ..
            } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thrown_values_become_errors() {
        assert_eq!(
            RoutineError::Thrown(json!("expired")).into_error(),
            RoutineError::msg("expired")
        );
        assert_eq!(
            RoutineError::Thrown(json!({"code": 401})).into_error(),
            RoutineError::msg(r#"{"code":401}"#)
        );
    }

    #[test]
    fn duplicate_message_names_conflicting_properties() {
        let err = SessionError::DuplicateSessionDefinition {
            id: SessionId::new("login"),
            conflict: DefinitionConflict {
                has_uniq_setup_definition: true,
                has_uniq_validate_definition: false,
                has_uniq_persistence: true,
            },
        };
        let text = err.to_string();
        assert!(text.contains("setup function"));
        assert!(text.contains("persistence"));
        assert!(!text.contains("validate function"));
    }

    #[test]
    fn validation_message_explains_phase_and_consequence() {
        let id = SessionId::new("login");
        let err = SessionError::ValidationFailure {
            id: id.clone(),
            phase: SessionPhase::Restored,
            origin: CommandOrigin::new(7, id),
            cause: ValidationCause::Errored(RoutineError::msg("expired")),
        };
        let text = err.to_string();
        assert!(text.contains("expired"));
        assert!(text.contains("while restoring the session"));
        assert!(text.contains("it will be recreated"));
        assert_eq!(err.origin().map(|o| o.step_id), Some(7));
    }
}
