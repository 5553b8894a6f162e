use serde::{Deserialize, Serialize};

use crate::types::{Fingerprint, SessionPhase};

/// Audit trail of one session workflow run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    Resolved {
        hydrated: bool,
    },
    /// Store lookup failed; treated as not found.
    StoreLookupFailed {
        message: String,
    },
    StoreEntryStale {
        stored_fingerprint: Fingerprint,
    },
    StoreEntryAdopted,
    StateCleared {
        phase: SessionPhase,
    },
    SetupStarted {
        phase: SessionPhase,
    },
    StateCaptured {
        phase: SessionPhase,
    },
    StateRestored,
    ValidationStarted {
        phase: SessionPhase,
    },
    /// A restored session failed validation; recreation follows.
    ValidationRecovered {
        cause: String,
    },
    Completed {
        status: SessionPhase,
    },
    Failed {
        phase: Option<SessionPhase>,
        message: String,
    },
}
