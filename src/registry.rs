//! Session registry and run context
//!
//! The registry keeps every session record for the run, and the set of ids
//! declared in the current spec. [`RunContext`] owns it explicitly and exposes
//! the run-start / spec-start lifecycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConfigurationError, DefinitionConflict, SessionError};
use crate::record::{SessionDefinition, SessionRecord, SessionSummary};
use crate::types::SessionId;

/// Run-scoped store of session records.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active_sessions: BTreeMap<SessionId, SessionRecord>,
    registered_for_spec: BTreeSet<SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, id: &SessionId) -> Option<&SessionRecord> {
        self.active_sessions.get(id)
    }

    pub(crate) fn resolve_mut(&mut self, id: &SessionId) -> Option<&mut SessionRecord> {
        self.active_sessions.get_mut(id)
    }

    pub fn is_registered(&self, id: &SessionId) -> bool {
        self.registered_for_spec.contains(id)
    }

    pub fn len(&self) -> usize {
        self.active_sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_sessions.is_empty()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.active_sessions.values().map(SessionSummary::from).collect()
    }

    /// Define a session, or reuse an existing definition.
    ///
    /// - unknown id: a fresh, unhydrated record is registered for this spec;
    /// - defined earlier in this spec: any difference is a duplicate definition,
    ///   an identical definition is a no-op;
    /// - carried over from a prior spec: persistence must match, differing
    ///   routines replace the old ones in place.
    pub fn define_or_reuse(
        &mut self,
        definition: SessionDefinition,
    ) -> Result<&SessionRecord, SessionError> {
        let id = definition.id.clone();
        let registered = self.registered_for_spec.contains(&id);

        match self.active_sessions.get_mut(&id) {
            None => {
                debug!(session_id = %id, "defining session");
                self.active_sessions
                    .insert(id.clone(), SessionRecord::new(definition));
            }
            Some(existing) => {
                let conflict = existing.conflict_with(&definition);
                if registered && existing.is_defined_in_current_spec() {
                    if conflict.is_conflicting() {
                        return Err(SessionError::DuplicateSessionDefinition { id, conflict });
                    }
                } else {
                    if conflict.has_uniq_persistence {
                        return Err(SessionError::DuplicateSessionDefinition {
                            id,
                            conflict: DefinitionConflict {
                                has_uniq_persistence: true,
                                ..DefinitionConflict::default()
                            },
                        });
                    }
                    if conflict.is_conflicting() {
                        debug!(session_id = %id, "updating carried-over session definition");
                        existing.redefine(definition);
                    } else {
                        existing.mark_defined();
                    }
                }
            }
        }

        self.registered_for_spec.insert(id.clone());
        self.active_sessions
            .get(&id)
            .ok_or_else(|| SessionError::Internal(format!("session `{id}` vanished after define")))
    }

    /// Bare reuse without a setup routine: the id must be active and
    /// registered for this spec.
    pub fn lookup_registered(&self, id: &SessionId) -> Result<&SessionRecord, SessionError> {
        match self.active_sessions.get(id) {
            Some(record) if self.registered_for_spec.contains(id) => Ok(record),
            _ => Err(ConfigurationError::SessionNotFound { id: id.clone() }.into()),
        }
    }

    /// Seed records carried from earlier state. Only cached records are kept;
    /// they are registered for the current spec so redefinition checks apply.
    pub fn seed(&mut self, records: impl IntoIterator<Item = SessionRecord>) {
        for mut record in records {
            if !record.cache_across_specs() {
                continue;
            }
            record.mark_carried_over();
            self.registered_for_spec.insert(record.id().clone());
            self.active_sessions.insert(record.id().clone(), record);
        }
    }

    /// Spec boundary: drop spec-scoped records, re-register cached ones.
    pub fn begin_spec(&mut self) {
        self.registered_for_spec.clear();
        self.active_sessions
            .retain(|_, record| record.cache_across_specs());
        for (id, record) in self.active_sessions.iter_mut() {
            record.mark_carried_over();
            self.registered_for_spec.insert(id.clone());
        }
    }

    pub fn clear_all(&mut self) {
        self.active_sessions.clear();
        self.registered_for_spec.clear();
    }

    /// Records that outlive the run (cached across specs).
    pub fn carry_over(&self) -> Vec<SessionRecord> {
        self.active_sessions
            .values()
            .filter(|r| r.cache_across_specs())
            .cloned()
            .collect()
    }
}

/// Explicitly owned run state: the registry shared by every workflow in the run.
#[derive(Clone, Debug)]
pub struct RunContext {
    run_id: Uuid,
    registry: Arc<RwLock<SessionRegistry>>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            registry: Arc::new(RwLock::new(SessionRegistry::new())),
        }
    }

    /// Run-start hook: seed cached records from a previous run.
    pub fn start_run(seed: impl IntoIterator<Item = SessionRecord>) -> Self {
        let mut registry = SessionRegistry::new();
        registry.seed(seed);
        Self {
            run_id: Uuid::now_v7(),
            registry: Arc::new(RwLock::new(registry)),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, SessionRegistry>, SessionError> {
        self.registry
            .read()
            .map_err(|e| SessionError::Internal(format!("registry lock: {e}")))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, SessionRegistry>, SessionError> {
        self.registry
            .write()
            .map_err(|e| SessionError::Internal(format!("registry lock: {e}")))
    }

    pub fn begin_spec(&self) -> Result<(), SessionError> {
        self.write()?.begin_spec();
        Ok(())
    }

    pub fn carry_over(&self) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self.read()?.carry_over())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CapturedState;
    use crate::routine::{Routine, RoutineReturn};
    use serde_json::json;

    fn routine(source: &str) -> Routine {
        Routine::new(source, |_| Ok(RoutineReturn::Undefined))
    }

    fn definition(id: &str, setup: &str, cache: bool) -> SessionDefinition {
        SessionDefinition {
            id: SessionId::new(id),
            setup: routine(setup),
            validate: None,
            cache_across_specs: cache,
        }
    }

    #[test]
    fn each_run_gets_its_own_time_ordered_id() {
        let first = RunContext::new();
        let second = RunContext::start_run(Vec::new());
        assert_ne!(first.run_id(), second.run_id());
        assert_eq!(first.run_id().get_version_num(), 7);
        assert_eq!(first.clone().run_id(), first.run_id());
    }

    #[test]
    fn identical_redefinition_is_noop() {
        let mut registry = SessionRegistry::new();
        registry.define_or_reuse(definition("login", "a", false)).unwrap();
        registry
            .resolve_mut(&SessionId::new("login"))
            .unwrap()
            .hydrate(CapturedState::new(json!({})));

        let record = registry.define_or_reuse(definition("login", "a", false)).unwrap();
        assert!(record.is_hydrated());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn conflicting_redefinition_in_same_spec_fails() {
        let mut registry = SessionRegistry::new();
        registry.define_or_reuse(definition("login", "a", false)).unwrap();

        let err = registry
            .define_or_reuse(definition("login", "b", false))
            .unwrap_err();
        match err {
            SessionError::DuplicateSessionDefinition { conflict, .. } => {
                assert!(conflict.has_uniq_setup_definition);
                assert!(!conflict.has_uniq_persistence);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = registry
            .define_or_reuse(definition("login", "a", true))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::DuplicateSessionDefinition { conflict, .. } if conflict.has_uniq_persistence
        ));
    }

    #[test]
    fn spec_boundary_keeps_only_cached_records() {
        let mut registry = SessionRegistry::new();
        registry.define_or_reuse(definition("cached", "a", true)).unwrap();
        registry.define_or_reuse(definition("local", "b", false)).unwrap();

        registry.begin_spec();

        assert!(registry.lookup_registered(&SessionId::new("cached")).is_ok());
        assert!(matches!(
            registry.lookup_registered(&SessionId::new("local")),
            Err(SessionError::Configuration(ConfigurationError::SessionNotFound { .. }))
        ));
    }

    #[test]
    fn carried_over_record_is_updated_in_place() {
        let mut registry = SessionRegistry::new();
        registry.define_or_reuse(definition("login", "old", true)).unwrap();
        registry.begin_spec();

        let record = registry.define_or_reuse(definition("login", "new", true)).unwrap();
        assert_eq!(record.setup().source(), "new");
        assert!(record.is_defined_in_current_spec());

        // now defined in this spec: a further change conflicts
        assert!(registry.define_or_reuse(definition("login", "newer", true)).is_err());
    }

    #[test]
    fn carried_over_record_rejects_persistence_change() {
        let mut registry = SessionRegistry::new();
        registry.define_or_reuse(definition("login", "a", true)).unwrap();
        registry.begin_spec();

        let err = registry
            .define_or_reuse(definition("login", "a", false))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::DuplicateSessionDefinition { conflict, .. }
                if conflict.has_uniq_persistence && !conflict.has_uniq_setup_definition
        ));
    }

    #[test]
    fn start_run_seeds_only_cached_records() {
        let cached = SessionRecord::new(definition("cached", "a", true));
        let local = SessionRecord::new(definition("local", "b", false));
        let ctx = RunContext::start_run([cached, local]);

        let registry = ctx.read().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_registered(&SessionId::new("cached")));
        assert!(!registry
            .resolve(&SessionId::new("cached"))
            .unwrap()
            .is_defined_in_current_spec());
    }
}
