use serde::{Deserialize, Serialize};

use crate::error::DefinitionConflict;
use crate::routine::Routine;
use crate::types::{Fingerprint, SessionId};

/// Opaque captured browser state (cookies, storage, ...). Never inspected here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapturedState(serde_json::Value);

impl CapturedState {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// A session definition as passed to `run_session`, after key normalization.
#[derive(Clone, Debug)]
pub struct SessionDefinition {
    pub id: SessionId,
    pub setup: Routine,
    pub validate: Option<Routine>,
    pub cache_across_specs: bool,
}

/// What the backing store keeps for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: SessionId,
    pub setup_fingerprint: Fingerprint,
    pub validate_fingerprint: Option<Fingerprint>,
    pub cache_across_specs: bool,
    pub state: CapturedState,
}

/// Identity, routines and captured state for one named session.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    id: SessionId,
    setup: Routine,
    validate: Option<Routine>,
    cache_across_specs: bool,
    hydrated: bool,
    captured_state: Option<CapturedState>,
    /// False for records carried over from a prior spec until they are
    /// defined again in the current one.
    defined_in_current_spec: bool,
}

impl SessionRecord {
    pub fn new(definition: SessionDefinition) -> Self {
        Self {
            id: definition.id,
            setup: definition.setup,
            validate: definition.validate,
            cache_across_specs: definition.cache_across_specs,
            hydrated: false,
            captured_state: None,
            defined_in_current_spec: true,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn setup(&self) -> &Routine {
        &self.setup
    }

    pub fn validate(&self) -> Option<&Routine> {
        self.validate.as_ref()
    }

    pub fn setup_fingerprint(&self) -> &Fingerprint {
        self.setup.fingerprint()
    }

    pub fn validate_fingerprint(&self) -> Option<&Fingerprint> {
        self.validate.as_ref().map(Routine::fingerprint)
    }

    pub fn cache_across_specs(&self) -> bool {
        self.cache_across_specs
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn captured_state(&self) -> Option<&CapturedState> {
        self.captured_state.as_ref()
    }

    pub fn is_defined_in_current_spec(&self) -> bool {
        self.defined_in_current_spec
    }

    /// Compare a new definition against this record.
    pub fn conflict_with(&self, definition: &SessionDefinition) -> DefinitionConflict {
        DefinitionConflict {
            has_uniq_setup_definition: self.setup_fingerprint() != definition.setup.fingerprint(),
            has_uniq_validate_definition: self.validate_fingerprint()
                != definition.validate.as_ref().map(Routine::fingerprint),
            has_uniq_persistence: self.cache_across_specs != definition.cache_across_specs,
        }
    }

    /// Replace the routines of a carried-over record. Captured state produced by
    /// a different setup routine is dropped.
    pub(crate) fn redefine(&mut self, definition: SessionDefinition) {
        if self.setup_fingerprint() != definition.setup.fingerprint() {
            self.dehydrate();
        }
        self.setup = definition.setup;
        self.validate = definition.validate;
        self.defined_in_current_spec = true;
    }

    pub(crate) fn mark_carried_over(&mut self) {
        self.defined_in_current_spec = false;
    }

    pub(crate) fn mark_defined(&mut self) {
        self.defined_in_current_spec = true;
    }

    pub(crate) fn hydrate(&mut self, state: CapturedState) {
        self.captured_state = Some(state);
        self.hydrated = true;
    }

    pub(crate) fn dehydrate(&mut self) {
        self.captured_state = None;
        self.hydrated = false;
    }

    /// Build the store entry for the captured state.
    pub fn to_stored(&self, state: CapturedState) -> StoredSession {
        StoredSession {
            id: self.id.clone(),
            setup_fingerprint: self.setup_fingerprint().clone(),
            validate_fingerprint: self.validate_fingerprint().cloned(),
            cache_across_specs: self.cache_across_specs,
            state,
        }
    }

    /// A stored entry is reusable only when it was produced by this setup routine.
    pub fn matches_stored(&self, stored: &StoredSession) -> bool {
        &stored.setup_fingerprint == self.setup_fingerprint()
    }
}

/// Read-only view of a registered session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub hydrated: bool,
    pub cache_across_specs: bool,
    pub setup_fingerprint: Fingerprint,
    pub validate_fingerprint: Option<Fingerprint>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            hydrated: record.hydrated,
            cache_across_specs: record.cache_across_specs,
            setup_fingerprint: record.setup_fingerprint().clone(),
            validate_fingerprint: record.validate_fingerprint().cloned(),
        }
    }
}
