//! Command queue
//!
//! An indexed sequence of steps with a single execution cursor. Steps run one
//! at a time; a step may schedule child steps, which are inserted directly
//! after it so they run before anything that was already pending.
//!
//! A single failure interceptor may be installed. When a step fails the queue
//! hands the interceptor a [`QueueSnapshot`] and applies the
//! [`FailureDecision`] it returns: either propagate the error (the run ends)
//! or recover by skipping steps and moving the cursor forward. The
//! interceptor never touches queue internals itself.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::types::StepId;

static NEXT_STEP_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh step id.
pub fn next_step_id() -> StepId {
    NEXT_STEP_ID.fetch_add(1, Ordering::Relaxed)
}

pub type StepFuture = BoxFuture<'static, Result<StepOutput, SessionError>>;
type StepAction = Box<dyn FnOnce(StepInput) -> StepFuture + Send>;

/// What a step sees when it starts.
#[derive(Clone, Debug)]
pub struct StepInput {
    pub step_id: StepId,
    /// Subject yielded by the previous step.
    pub subject: Value,
}

/// Instructions a completed step sends back to the queue.
pub enum QueueDirective {
    InstallInterceptor(Box<dyn FailureInterceptor>),
    RemoveInterceptor,
}

impl fmt::Debug for QueueDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueDirective::InstallInterceptor(_) => f.write_str("InstallInterceptor"),
            QueueDirective::RemoveInterceptor => f.write_str("RemoveInterceptor"),
        }
    }
}

/// Result of a successful step.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub subject: Value,
    pub children: Vec<Step>,
    pub directives: Vec<QueueDirective>,
}

impl StepOutput {
    pub fn yields(subject: Value) -> Self {
        Self {
            subject,
            ..Self::default()
        }
    }

    pub fn null() -> Self {
        Self::yields(Value::Null)
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Step>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_directive(mut self, directive: QueueDirective) -> Self {
        self.directives.push(directive);
        self
    }
}

/// A unit of work waiting in the queue.
pub struct Step {
    id: StepId,
    name: String,
    always_run: bool,
    clears_interceptor: bool,
    action: StepAction,
}

impl Step {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(StepInput) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StepOutput, SessionError>> + Send + 'static,
    {
        Self::with_id(next_step_id(), name, f)
    }

    pub fn with_id<F, Fut>(id: StepId, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(StepInput) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StepOutput, SessionError>> + Send + 'static,
    {
        Self {
            id,
            name: name.into(),
            always_run: false,
            clears_interceptor: false,
            action: Box::new(move |input| f(input).boxed()),
        }
    }

    /// Never skipped by a recovery redirect (e.g. context restoration).
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// The installed interceptor is removed before this step runs.
    pub fn clearing_interceptor(mut self) -> Self {
        self.clears_interceptor = true;
        self
    }

    pub fn id(&self) -> StepId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("always_run", &self.always_run)
            .field("clears_interceptor", &self.clears_interceptor)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Passed,
    Failed,
    /// Failed, but an interceptor recovered the queue.
    Recovered,
    Skipped,
}

struct Slot {
    id: StepId,
    name: String,
    always_run: bool,
    clears_interceptor: bool,
    state: StepState,
    action: Option<StepAction>,
}

impl From<Step> for Slot {
    fn from(step: Step) -> Self {
        Self {
            id: step.id,
            name: step.name,
            always_run: step.always_run,
            clears_interceptor: step.clears_interceptor,
            state: StepState::Pending,
            action: Some(step.action),
        }
    }
}

/// One step as seen by an interceptor.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepView {
    pub index: usize,
    pub id: StepId,
    pub name: String,
    pub always_run: bool,
    pub state: StepState,
}

/// Read-only copy of the queue handed to interceptors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub cursor: usize,
    pub steps: Vec<StepView>,
}

impl QueueSnapshot {
    pub fn index_of(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }
}

/// A failed step, as reported to the interceptor.
#[derive(Debug)]
pub struct StepFailure {
    pub index: usize,
    pub step_id: StepId,
    pub step_name: String,
    pub error: SessionError,
}

/// Where execution continues after a recovered failure.
#[derive(Clone, Debug, PartialEq)]
pub struct Redirect {
    /// New cursor; must lie after the failed step and not past `resume`.
    pub cursor: usize,
    /// Index of the step execution resumes at once the redirect is done.
    pub resume: usize,
    /// Pending steps to mark skipped. Only those between the failed step and
    /// `resume` are honoured.
    pub skip: Vec<usize>,
    /// Subject to reinstate before resuming.
    pub restore_subject: Option<Value>,
}

#[derive(Debug)]
pub enum FailureDecision {
    Propagate(SessionError),
    Recover(Redirect),
}

/// Queue-level failure handler. At most one is installed at a time.
pub trait FailureInterceptor: Send {
    fn on_failure(&mut self, failure: &StepFailure, queue: &QueueSnapshot) -> FailureDecision;
}

/// Result of a single queue tick.
#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// A step ran; more may be pending.
    Continue,
    /// Nothing left to run.
    Idle,
}

/// The step queue shared by a test and the session workflows it invokes.
#[derive(Default)]
pub struct CommandQueue {
    slots: Vec<Slot>,
    cursor: usize,
    subject: Value,
    interceptor: Option<Box<dyn FailureInterceptor>>,
    recovered: Vec<SessionError>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, step: Step) -> StepId {
        let id = step.id;
        self.slots.push(step.into());
        id
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn subject(&self) -> &Value {
        &self.subject
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.slots[self.cursor.min(self.slots.len())..]
            .iter()
            .any(|s| s.state == StepState::Pending)
    }

    pub fn has_interceptor(&self) -> bool {
        self.interceptor.is_some()
    }

    /// Install the failure interceptor, replacing any previous one.
    pub fn install_interceptor(&mut self, interceptor: Box<dyn FailureInterceptor>) {
        if self.interceptor.replace(interceptor).is_some() {
            debug!("replaced installed failure interceptor");
        }
    }

    pub fn remove_interceptor(&mut self) -> bool {
        self.interceptor.take().is_some()
    }

    /// Mark a pending step at or after the cursor as skipped.
    pub fn skip(&mut self, index: usize) -> bool {
        if index < self.cursor {
            return false;
        }
        match self.slots.get_mut(index) {
            Some(slot) if slot.state == StepState::Pending => {
                slot.state = StepState::Skipped;
                slot.action = None;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            cursor: self.cursor,
            steps: self
                .slots
                .iter()
                .enumerate()
                .map(|(index, slot)| StepView {
                    index,
                    id: slot.id,
                    name: slot.name.clone(),
                    always_run: slot.always_run,
                    state: slot.state,
                })
                .collect(),
        }
    }

    /// State of the first step with this name.
    pub fn state_of(&self, name: &str) -> Option<StepState> {
        self.slots.iter().find(|s| s.name == name).map(|s| s.state)
    }

    /// Names and states in queue order.
    pub fn step_states(&self) -> Vec<(String, StepState)> {
        self.slots.iter().map(|s| (s.name.clone(), s.state)).collect()
    }

    /// Failures an interceptor recovered, wrapped as `QueueRedirect`.
    pub fn recovered(&self) -> &[SessionError] {
        &self.recovered
    }

    /// Stop the run: skip everything pending and drop the interceptor.
    pub fn abort(&mut self) {
        for slot in self.slots.iter_mut().skip(self.cursor) {
            if slot.state == StepState::Pending {
                slot.state = StepState::Skipped;
                slot.action = None;
            }
        }
        self.cursor = self.slots.len();
        if self.interceptor.take().is_some() {
            debug!("failure interceptor removed on abort");
        }
    }

    /// Execute the step at the cursor.
    pub async fn tick(&mut self) -> Result<TickOutcome, SessionError> {
        while self.cursor < self.slots.len() && self.slots[self.cursor].state != StepState::Pending {
            self.cursor += 1;
        }
        if self.cursor >= self.slots.len() {
            return Ok(TickOutcome::Idle);
        }

        let index = self.cursor;
        let slot = &mut self.slots[index];
        let action = slot
            .action
            .take()
            .ok_or_else(|| SessionError::Internal(format!("step `{}` has no action", slot.name)))?;
        let input = StepInput {
            step_id: slot.id,
            subject: self.subject.clone(),
        };
        if slot.clears_interceptor && self.interceptor.take().is_some() {
            debug!(step = %slot.name, "failure interceptor removed");
        }
        debug!(step = %slot.name, index, "running step");

        match action(input).await {
            Ok(output) => {
                self.slots[index].state = StepState::Passed;
                self.subject = output.subject;
                let children: Vec<Slot> = output.children.into_iter().map(Slot::from).collect();
                self.slots.splice(index + 1..index + 1, children);
                for directive in output.directives {
                    match directive {
                        QueueDirective::InstallInterceptor(interceptor) => {
                            self.install_interceptor(interceptor)
                        }
                        QueueDirective::RemoveInterceptor => {
                            self.remove_interceptor();
                        }
                    }
                }
                self.cursor = index + 1;
                Ok(TickOutcome::Continue)
            }
            Err(error) => self.handle_failure(index, error),
        }
    }

    fn handle_failure(
        &mut self,
        index: usize,
        error: SessionError,
    ) -> Result<TickOutcome, SessionError> {
        let failure = StepFailure {
            index,
            step_id: self.slots[index].id,
            step_name: self.slots[index].name.clone(),
            error,
        };
        let snapshot = self.snapshot();
        let decision = match self.interceptor.as_mut() {
            Some(interceptor) => interceptor.on_failure(&failure, &snapshot),
            None => FailureDecision::Propagate(failure.error.clone()),
        };

        match decision {
            FailureDecision::Recover(redirect)
                if redirect.cursor > index
                    && redirect.cursor <= redirect.resume
                    && redirect.resume <= self.slots.len() =>
            {
                self.slots[index].state = StepState::Recovered;
                for &skip in &redirect.skip {
                    if skip > index && skip < redirect.resume {
                        self.skip(skip);
                    }
                }
                if let Some(subject) = redirect.restore_subject {
                    self.subject = subject;
                }
                debug!(
                    step = %failure.step_name,
                    cursor = redirect.cursor,
                    resume_at = redirect.resume,
                    skipped = redirect.skip.len(),
                    "step failure recovered"
                );
                self.cursor = redirect.cursor;
                self.recovered.push(SessionError::QueueRedirect {
                    resume_at: redirect.resume,
                    cause: Box::new(failure.error),
                });
                Ok(TickOutcome::Continue)
            }
            FailureDecision::Recover(redirect) => {
                warn!(
                    step = %failure.step_name,
                    cursor = redirect.cursor,
                    "ignoring redirect that does not move the cursor forward"
                );
                self.fail_at(index);
                Err(failure.error)
            }
            FailureDecision::Propagate(err) => {
                self.fail_at(index);
                Err(err)
            }
        }
    }

    fn fail_at(&mut self, index: usize) {
        self.slots[index].state = StepState::Failed;
        self.cursor = index + 1;
        self.abort();
    }

    /// Run until the queue is idle or a step fails fatally.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        while self.tick().await? == TickOutcome::Continue {}
        Ok(())
    }

    /// Like [`run`](Self::run), but gives up after `max_steps` ticks.
    pub async fn run_with_limit(&mut self, max_steps: usize) -> Result<(), SessionError> {
        for _ in 0..max_steps {
            if self.tick().await? == TickOutcome::Idle {
                return Ok(());
            }
        }
        if self.has_pending() {
            self.abort();
            return Err(SessionError::Internal(format!(
                "queue did not settle within {max_steps} steps"
            )));
        }
        Ok(())
    }
}
