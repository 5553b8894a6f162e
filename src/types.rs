use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fingerprint::{hash_to_hex, sha256};

// ─── Scalar aliases ───────────────────────────────────────────

/// Identity of a step in the command queue. Allocated when the step is built,
/// so a step can be referenced before it is enqueued.
pub type StepId = u64;

// ─── Session keys ─────────────────────────────────────────────

/// Key supplied by the caller, before normalization into a [`SessionId`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionKey {
    Text(String),
    /// Serialized with sorted keys so equal objects map to the same id.
    Structured(serde_json::Value),
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        SessionKey::Text(value.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        SessionKey::Text(value)
    }
}

impl From<serde_json::Value> for SessionKey {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => SessionKey::Text(s),
            other => SessionKey::Structured(other),
        }
    }
}

/// Normalized session identifier, unique within a run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Fingerprints ─────────────────────────────────────────────

/// Stable textual identity of a routine: SHA-256 of its trimmed source, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_source(source: &str) -> Self {
        Self(hash_to_hex(&sha256(source.trim().as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell definitions apart in logs.
        let short: String = self.0.chars().take(12).collect();
        f.write_str(&short)
    }
}

// ─── Phases ───────────────────────────────────────────────────

/// How the session state under validation came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Created,
    Restored,
    Recreated,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Restored => "restored",
            Self::Recreated => "recreated",
        }
    }

    /// Verb used in failure messages ("while restoring the session").
    pub fn progressive(&self) -> &'static str {
        match self {
            Self::Created => "creating",
            Self::Restored => "restoring",
            Self::Recreated => "recreating",
        }
    }

    /// Only a restored session has a recovery branch.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Restored)
    }

    /// What happens after validation fails in this phase.
    pub fn consequence(&self) -> &'static str {
        match self {
            Self::Created => {
                "Because validation failed immediately after creating the session, the test failed."
            }
            Self::Restored => {
                "Because the restored session failed validation, it will be recreated."
            }
            Self::Recreated => {
                "Because validation failed immediately after recreating the session, the test failed."
            }
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Error attribution ────────────────────────────────────────

/// The `session` command that started a workflow. Captured once and threaded
/// through every error so failures point at the caller's command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOrigin {
    pub step_id: StepId,
    pub command: String,
    pub session_id: SessionId,
}

impl CommandOrigin {
    pub fn new(step_id: StepId, session_id: SessionId) -> Self {
        Self {
            step_id,
            command: format!("session({session_id})"),
            session_id,
        }
    }
}

impl fmt::Display for CommandOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [step {}]", self.command, self.step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_short_form_respects_char_boundaries() {
        let stored: Fingerprint = serde_json::from_value(json!("çé".repeat(10))).unwrap();
        assert_eq!(stored.to_string(), "çé".repeat(6));
        assert_eq!(Fingerprint::of_source("x").to_string().len(), 12);
    }

    #[test]
    fn fingerprint_ignores_surrounding_whitespace() {
        let a = Fingerprint::of_source("() => login()");
        let b = Fingerprint::of_source("\n  () => login()  \n");
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::of_source("() => login('admin')"));
    }

    #[test]
    fn json_string_key_becomes_text() {
        assert_eq!(
            SessionKey::from(json!("login")),
            SessionKey::Text("login".into())
        );
        assert!(matches!(
            SessionKey::from(json!({"user": "a"})),
            SessionKey::Structured(_)
        ));
    }

    #[test]
    fn only_restored_phase_recovers() {
        assert!(SessionPhase::Restored.is_recoverable());
        assert!(!SessionPhase::Created.is_recoverable());
        assert!(!SessionPhase::Recreated.is_recoverable());
    }
}
