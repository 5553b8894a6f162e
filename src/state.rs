//! Workflow State Types
//!
//! Lifecycle state machine for one `session` command, plus the handle callers
//! use to observe it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{SessionError, ValidationCause};
use crate::events::SessionEvent;
use crate::types::{CommandOrigin, SessionId, SessionPhase};

/// Lifecycle states.
///
/// `Resolving → {Creating | Restoring} → Validating → {Completed, Recreating, Failed}`,
/// with `Recreating → Validating`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Resolving,
    Creating,
    Restoring,
    Validating { phase: SessionPhase },
    Recreating,
    Completed { status: SessionPhase },
    Failed { phase: Option<SessionPhase> },
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Completed { .. } | WorkflowState::Failed { .. })
    }

    fn can_transition_to(&self, to: &WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Failed { .. }) => true,
            (Resolving, Creating | Restoring) => true,
            (Creating, Validating { phase: SessionPhase::Created }) => true,
            (Restoring, Validating { phase: SessionPhase::Restored }) => true,
            (Recreating, Validating { phase: SessionPhase::Recreated }) => true,
            (Creating, Completed { status: SessionPhase::Created }) => true,
            (Restoring, Completed { status: SessionPhase::Restored }) => true,
            (Recreating, Completed { status: SessionPhase::Recreated }) => true,
            (Validating { phase }, Completed { status }) => phase == status,
            (Validating { phase: SessionPhase::Restored }, Recreating) => true,
            _ => false,
        }
    }
}

/// Record of a state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: WorkflowState,
    pub to_state: WorkflowState,
    pub transitioned_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// What validation concluded, as far as it has run.
#[derive(Clone, Debug, PartialEq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(ValidationCause),
    /// The routine chained steps or returned nothing; the resume step decides
    /// from the subject the last step yielded.
    AwaitingSubject,
}

/// Mutable state of one workflow run.
#[derive(Debug)]
pub struct WorkflowRun {
    pub id: SessionId,
    pub origin: CommandOrigin,
    pub state: WorkflowState,
    pub history: Vec<StateTransition>,
    pub events: Vec<SessionEvent>,
    pub validation: Option<ValidationOutcome>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(origin: CommandOrigin) -> Self {
        Self {
            id: origin.session_id.clone(),
            origin,
            state: WorkflowState::Resolving,
            history: Vec::new(),
            events: Vec::new(),
            validation: None,
            started_at: Utc::now(),
        }
    }

    pub fn transition_to(
        &mut self,
        to: WorkflowState,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        if !self.state.can_transition_to(&to) {
            return Err(SessionError::Internal(format!(
                "invalid session transition {:?} → {:?} for `{}`",
                self.state, to, self.id
            )));
        }
        let from_state = std::mem::replace(&mut self.state, to.clone());
        self.history.push(StateTransition {
            from_state,
            to_state: to,
            transitioned_at: Utc::now(),
            reason,
        });
        Ok(())
    }

    /// Move to `Failed` unless already terminal, and record the error.
    pub fn fail(&mut self, error: &SessionError) {
        if self.state.is_terminal() {
            return;
        }
        let phase = error.phase();
        self.events.push(SessionEvent::Failed {
            phase,
            message: error.to_string(),
        });
        let _ = self.transition_to(WorkflowState::Failed { phase }, Some(error.to_string()));
    }
}

/// Shared handle to a workflow run; steps and interceptors hold clones.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    run: Arc<Mutex<WorkflowRun>>,
}

impl SessionHandle {
    pub(crate) fn new(origin: CommandOrigin) -> Self {
        Self {
            run: Arc::new(Mutex::new(WorkflowRun::new(origin))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WorkflowRun> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn transition(
        &self,
        to: WorkflowState,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        self.lock().transition_to(to, reason)
    }

    pub(crate) fn event(&self, event: SessionEvent) {
        self.lock().events.push(event);
    }

    pub(crate) fn fail(&self, error: &SessionError) {
        self.lock().fail(error);
    }

    pub(crate) fn record_validation(&self, outcome: ValidationOutcome) {
        self.lock().validation = Some(outcome);
    }

    pub(crate) fn take_validation(&self) -> Option<ValidationOutcome> {
        self.lock().validation.take()
    }

    pub fn id(&self) -> SessionId {
        self.lock().id.clone()
    }

    pub fn origin(&self) -> CommandOrigin {
        self.lock().origin.clone()
    }

    pub fn state(&self) -> WorkflowState {
        self.lock().state.clone()
    }

    /// Final status once the workflow completed.
    pub fn status(&self) -> Option<SessionPhase> {
        match self.lock().state {
            WorkflowState::Completed { status } => Some(status),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.lock().events.clone()
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.lock().history.clone()
    }

    /// States visited, starting with `Resolving`.
    pub fn path(&self) -> Vec<WorkflowState> {
        let run = self.lock();
        let mut path = vec![WorkflowState::Resolving];
        path.extend(run.history.iter().map(|t| t.to_state.clone()));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SessionHandle {
        SessionHandle::new(CommandOrigin::new(1, SessionId::new("login")))
    }

    #[test]
    fn restore_recreate_path_is_accepted() {
        let h = handle();
        h.transition(WorkflowState::Restoring, None).unwrap();
        h.transition(WorkflowState::Validating { phase: SessionPhase::Restored }, None)
            .unwrap();
        h.transition(WorkflowState::Recreating, Some("expired".into())).unwrap();
        h.transition(WorkflowState::Validating { phase: SessionPhase::Recreated }, None)
            .unwrap();
        h.transition(WorkflowState::Completed { status: SessionPhase::Recreated }, None)
            .unwrap();
        assert_eq!(h.status(), Some(SessionPhase::Recreated));
        assert_eq!(h.path().len(), 6);
    }

    #[test]
    fn created_session_cannot_recreate() {
        let h = handle();
        h.transition(WorkflowState::Creating, None).unwrap();
        h.transition(WorkflowState::Validating { phase: SessionPhase::Created }, None)
            .unwrap();
        assert!(h.transition(WorkflowState::Recreating, None).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let h = handle();
        h.fail(&SessionError::Internal("boom".into()));
        assert_eq!(h.state(), WorkflowState::Failed { phase: None });
        assert!(h.transition(WorkflowState::Creating, None).is_err());
        // a second failure does not add another event
        h.fail(&SessionError::Internal("again".into()));
        assert_eq!(h.events().len(), 1);
    }
}
