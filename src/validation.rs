//! Validation scheduling
//!
//! Validation runs as two queue steps: the validate step calls the user
//! routine (its chained steps are spliced in after it), and the resume step
//! reduces whatever happened into a [`Verdict`]. The [`ValidationInterceptor`]
//! is installed from just before the validate step until the resume step.

use serde_json::Value;
use tracing::debug;

use crate::error::{SessionError, ValidationCause};
use crate::events::SessionEvent;
use crate::interceptor::ValidationInterceptor;
use crate::queue::{QueueDirective, Step, StepOutput};
use crate::routine::{Normalized, Routine};
use crate::state::{SessionHandle, ValidationOutcome, WorkflowState};
use crate::types::SessionPhase;

pub const VALIDATE_STEP: &str = "session:validate";
pub const RESUME_STEP: &str = "session:validated";

/// Final judgement on a validation run.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Valid,
    Failed(ValidationCause),
}

/// Reduce the recorded outcome and the subject yielded right before the resume
/// step. When the routine only chained steps, a final subject of exactly
/// `false` is a failure; anything else passes.
pub fn reduce(outcome: Option<ValidationOutcome>, previous_subject: &Value) -> Verdict {
    match outcome {
        Some(ValidationOutcome::Valid) => Verdict::Valid,
        Some(ValidationOutcome::Invalid(cause)) => Verdict::Failed(cause),
        Some(ValidationOutcome::AwaitingSubject) | None => {
            if previous_subject == &Value::Bool(false) {
                Verdict::Failed(ValidationCause::YieldedFalse)
            } else {
                Verdict::Valid
            }
        }
    }
}

/// The step that calls the validate routine.
pub(crate) fn validate_step(routine: Routine, phase: SessionPhase, handle: SessionHandle) -> Step {
    Step::new(VALIDATE_STEP, move |_input| async move {
        handle.transition(WorkflowState::Validating { phase }, None)?;
        handle.event(SessionEvent::ValidationStarted { phase });
        debug!(session_id = %handle.id(), %phase, "validating session");

        let invocation = routine.invoke();
        let outcome = match invocation.outcome {
            Normalized::Rejected(source) => {
                return Err(SessionError::Routine {
                    step: VALIDATE_STEP.into(),
                    source,
                })
            }
            Normalized::Pending(fut) => match fut.await {
                Ok(Value::Bool(false)) => ValidationOutcome::Invalid(ValidationCause::ResolvedFalse),
                Ok(_) => ValidationOutcome::Valid,
                Err(source) => {
                    return Err(SessionError::Routine {
                        step: VALIDATE_STEP.into(),
                        source: source.into_error(),
                    })
                }
            },
            Normalized::Chained => ValidationOutcome::AwaitingSubject,
            // A synchronous return value is not inspected, `false` included.
            Normalized::Sync(_) => ValidationOutcome::Valid,
        };
        handle.record_validation(outcome);

        Ok(StepOutput::null().with_children(invocation.chained))
    })
}

/// Build the validate and resume steps, and the directive that installs the
/// interceptor guarding them. `resume` becomes the recovery target and clears
/// the interceptor before it runs.
pub(crate) fn schedule(
    routine: Routine,
    phase: SessionPhase,
    subject_at_start: Value,
    handle: SessionHandle,
    resume: Step,
) -> (Vec<Step>, QueueDirective) {
    let resume = resume.clearing_interceptor();
    let interceptor = ValidationInterceptor::new(
        phase,
        resume.id(),
        subject_at_start,
        handle.origin(),
        handle.clone(),
    );
    let steps = vec![validate_step(routine, phase, handle), resume];
    (steps, QueueDirective::InstallInterceptor(Box::new(interceptor)))
}
