//! Failure interceptors
//!
//! Each session phase installs one interceptor on the queue while its user
//! code runs. Interceptors only classify a failure and return a decision; the
//! queue applies it. Redirect planning is a pure function of the snapshot.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{SessionError, ValidationCause};
use crate::queue::{
    FailureDecision, FailureInterceptor, QueueSnapshot, Redirect, StepFailure, StepState,
};
use crate::state::{SessionHandle, ValidationOutcome};
use crate::types::{CommandOrigin, SessionId, SessionPhase, StepId};

/// Plan a recovery that resumes at `resume_step`.
///
/// Pending steps between the failure and the resume step are skipped, except
/// `always_run` ones: the cursor lands on the first of those, if any. Returns
/// `None` when the resume step is missing, already ran, or is not after the
/// failed step.
pub fn plan_redirect(
    failed_index: usize,
    queue: &QueueSnapshot,
    resume_step: StepId,
    restore_subject: Value,
) -> Option<Redirect> {
    let resume_index = queue.index_of(resume_step)?;
    if resume_index <= failed_index || queue.steps[resume_index].state != StepState::Pending {
        return None;
    }

    let between = &queue.steps[failed_index + 1..resume_index];
    let pending = || between.iter().filter(|s| s.state == StepState::Pending);
    let skip = pending().filter(|s| !s.always_run).map(|s| s.index).collect();
    let cursor = pending()
        .find(|s| s.always_run)
        .map(|s| s.index)
        .unwrap_or(resume_index);

    Some(Redirect {
        cursor,
        resume: resume_index,
        skip,
        restore_subject: Some(restore_subject),
    })
}

/// Attributes failures of the setup routine (and the steps it chained) to the
/// `session` command.
#[derive(Debug)]
pub struct SetupInterceptor {
    id: SessionId,
    phase: SessionPhase,
    origin: CommandOrigin,
    handle: SessionHandle,
}

impl SetupInterceptor {
    pub fn new(phase: SessionPhase, origin: CommandOrigin, handle: SessionHandle) -> Self {
        Self {
            id: origin.session_id.clone(),
            phase,
            origin,
            handle,
        }
    }
}

impl FailureInterceptor for SetupInterceptor {
    fn on_failure(&mut self, failure: &StepFailure, _queue: &QueueSnapshot) -> FailureDecision {
        let error = match &failure.error {
            SessionError::Routine { source, .. } => SessionError::SetupFailure {
                id: self.id.clone(),
                phase: self.phase,
                origin: self.origin.clone(),
                source: source.clone().into_error(),
            },
            other => other.clone(),
        };
        debug!(session_id = %self.id, step = %failure.step_name, "setup step failed");
        self.handle.fail(&error);
        FailureDecision::Propagate(error)
    }
}

/// Guards the validate routine. A restored session that fails validation is
/// redirected to the resume step, which recreates it; any other phase fails.
#[derive(Debug)]
pub struct ValidationInterceptor {
    id: SessionId,
    phase: SessionPhase,
    resume_step: StepId,
    subject_at_start: Value,
    origin: CommandOrigin,
    handle: SessionHandle,
}

impl ValidationInterceptor {
    pub fn new(
        phase: SessionPhase,
        resume_step: StepId,
        subject_at_start: Value,
        origin: CommandOrigin,
        handle: SessionHandle,
    ) -> Self {
        Self {
            id: origin.session_id.clone(),
            phase,
            resume_step,
            subject_at_start,
            origin,
            handle,
        }
    }
}

impl FailureInterceptor for ValidationInterceptor {
    fn on_failure(&mut self, failure: &StepFailure, queue: &QueueSnapshot) -> FailureDecision {
        let cause = match &failure.error {
            SessionError::Routine { source, .. } => source.clone().into_error(),
            other => {
                self.handle.fail(other);
                return FailureDecision::Propagate(other.clone());
            }
        };

        if self.phase.is_recoverable() {
            if let Some(redirect) = plan_redirect(
                failure.index,
                queue,
                self.resume_step,
                self.subject_at_start.clone(),
            ) {
                warn!(
                    session_id = %self.id,
                    step = %failure.step_name,
                    error = %cause,
                    "restored session failed validation, recreating"
                );
                self.handle
                    .record_validation(ValidationOutcome::Invalid(ValidationCause::Errored(cause)));
                return FailureDecision::Recover(redirect);
            }
            warn!(session_id = %self.id, "resume step not found after failure, failing session");
        }

        let error = SessionError::ValidationFailure {
            id: self.id.clone(),
            phase: self.phase,
            origin: self.origin.clone(),
            cause: ValidationCause::Errored(cause),
        };
        self.handle.fail(&error);
        FailureDecision::Propagate(error)
    }
}
