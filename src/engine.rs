//! Session workflow engine
//!
//! `run_session` validates its arguments and registers the definition
//! synchronously, then enqueues a single `session` step. Everything else
//! (store lookup, setup, capture, restore, validation, recreation) is
//! scheduled by that step as child steps on the same queue, so user code
//! chained from setup or validate runs in order with the engine's own steps.
//!
//! ```text
//! session ─┬─ restore ─────────────────────────── [validate ... validated]
//!          └─ clear ── setup ... ── capture ───── [validate ... validated]
//!                                                          │
//!                      (restored + invalid) clear ── setup ... ── capture ── [validate ... validated]
//! ```

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, ValidationCause};
use crate::events::SessionEvent;
use crate::fingerprint::derive_session_id;
use crate::interceptor::SetupInterceptor;
use crate::options::SessionOptions;
use crate::queue::{next_step_id, CommandQueue, QueueDirective, Step, StepInput, StepOutput};
use crate::record::{SessionDefinition, SessionRecord, SessionSummary};
use crate::registry::RunContext;
use crate::routine::{Normalized, Routine};
use crate::state::{SessionHandle, WorkflowState};
use crate::store::{BrowserDriver, SessionStore};
use crate::types::{CommandOrigin, SessionId, SessionKey, SessionPhase, StepId};
use crate::validation::{self, Verdict, RESUME_STEP};

pub const SESSION_STEP: &str = "session";
pub const CLEAR_STEP: &str = "session:clear";
pub const SETUP_STEP: &str = "session:setup";
pub const CAPTURE_STEP: &str = "session:capture";
pub const RESTORE_STEP: &str = "session:restore";

/// Drives session workflows against a store and a browser.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn SessionStore>,
    browser: Arc<dyn BrowserDriver>,
    config: SessionConfig,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn SessionStore>, browser: Arc<dyn BrowserDriver>) -> Self {
        Self::with_config(store, browser, SessionConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn SessionStore>,
        browser: Arc<dyn BrowserDriver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            browser,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Define (or reuse) a session and enqueue its workflow.
    ///
    /// Configuration and duplicate-definition errors are returned here, before
    /// anything is queued. Everything else surfaces when the queue runs; the
    /// returned handle reports the outcome.
    pub fn run_session(
        &self,
        ctx: &RunContext,
        queue: &mut CommandQueue,
        key: impl Into<SessionKey>,
        setup: Option<Routine>,
        options: SessionOptions,
    ) -> Result<SessionHandle, SessionError> {
        let id = derive_session_id(&key.into())?;

        match setup {
            Some(setup) => {
                let mut registry = ctx.write()?;
                registry.define_or_reuse(SessionDefinition {
                    id: id.clone(),
                    setup,
                    validate: options.validate,
                    cache_across_specs: options.cache_across_specs,
                })?;
            }
            None => {
                ctx.read()?.lookup_registered(&id)?;
            }
        }

        let step_id = next_step_id();
        let handle = SessionHandle::new(CommandOrigin::new(step_id, id.clone()));
        let flow = Flow {
            id,
            ctx: ctx.clone(),
            store: self.store.clone(),
            browser: self.browser.clone(),
            handle: handle.clone(),
        };
        debug!(run_id = %ctx.run_id(), session_id = %flow.id, step_id, "session workflow enqueued");
        queue.enqueue(flow.step(step_id, SESSION_STEP, |flow, input| flow.resolve(input)));
        Ok(handle)
    }

    /// Run the queue until idle, bounded by `max_queue_steps`.
    pub async fn drive(&self, queue: &mut CommandQueue) -> Result<(), SessionError> {
        queue.run_with_limit(self.config.max_queue_steps).await
    }

    /// Spec boundary: keep only cached sessions, in memory and in the store.
    pub async fn begin_spec(&self, ctx: &RunContext) -> Result<(), SessionError> {
        ctx.begin_spec()?;
        self.store
            .clear_saved(false)
            .await
            .map_err(|e| SessionError::store("clear_saved", e))
    }

    /// Per-test hook: clear the applied browser state unless isolation is off.
    pub async fn before_each_test(&self) -> Result<(), SessionError> {
        if !self.config.clears_between_tests() {
            debug!("test isolation disabled, keeping session state");
            return Ok(());
        }
        self.browser
            .navigate_blank()
            .await
            .map_err(|e| SessionError::browser("navigate_blank", e))?;
        self.clear_current_session_data().await
    }

    /// Forget every session, cached ones included.
    pub async fn clear_all_saved_sessions(&self, ctx: &RunContext) -> Result<(), SessionError> {
        ctx.write()?.clear_all();
        self.store
            .clear_saved(true)
            .await
            .map_err(|e| SessionError::store("clear_saved", e))
    }

    pub async fn clear_current_session_data(&self) -> Result<(), SessionError> {
        self.store
            .clear_current()
            .await
            .map_err(|e| SessionError::store("clear_current", e))
    }

    pub fn get_session(
        &self,
        ctx: &RunContext,
        key: impl Into<SessionKey>,
    ) -> Result<Option<SessionSummary>, SessionError> {
        let id = derive_session_id(&key.into())?;
        Ok(ctx.read()?.resolve(&id).map(SessionSummary::from))
    }
}

/// Everything the steps of one workflow run share.
#[derive(Clone)]
struct Flow {
    id: SessionId,
    ctx: RunContext,
    store: Arc<dyn SessionStore>,
    browser: Arc<dyn BrowserDriver>,
    handle: SessionHandle,
}

impl Flow {
    /// An engine step. Errors fail the run before they reach the queue.
    fn step<F, Fut>(&self, id: StepId, name: &'static str, f: F) -> Step
    where
        F: FnOnce(Flow, StepInput) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StepOutput, SessionError>> + Send + 'static,
    {
        let flow = self.clone();
        Step::with_id(id, name, move |input| async move {
            let handle = flow.handle.clone();
            let session_id = flow.id.clone();
            let run_id = flow.ctx.run_id();
            f(flow, input).await.map_err(|err| {
                error!(%run_id, session_id = %session_id, step = name, error = %err, "session step failed");
                handle.fail(&err);
                err
            })
        })
    }

    fn with_record<T>(&self, f: impl FnOnce(&mut SessionRecord) -> T) -> Result<T, SessionError> {
        let mut registry = self.ctx.write()?;
        let record = registry
            .resolve_mut(&self.id)
            .ok_or_else(|| SessionError::Internal(format!("session `{}` is not registered", self.id)))?;
        Ok(f(record))
    }

    fn origin(&self) -> CommandOrigin {
        self.handle.origin()
    }

    // ── Resolving ──

    async fn resolve(self, _input: StepInput) -> Result<StepOutput, SessionError> {
        let hydrated = self.with_record(|r| r.is_hydrated())?;
        self.handle.event(SessionEvent::Resolved { hydrated });
        if hydrated {
            debug!(session_id = %self.id, "reusing hydrated session");
            return self.begin_restore();
        }

        match self.store.get(&self.id).await {
            Ok(Some(stored)) => {
                let adopted = self.with_record(|record| {
                    if record.matches_stored(&stored) {
                        record.hydrate(stored.state.clone());
                        true
                    } else {
                        false
                    }
                })?;
                if adopted {
                    debug!(session_id = %self.id, "adopted saved session state");
                    self.handle.event(SessionEvent::StoreEntryAdopted);
                    return self.begin_restore();
                }
                debug!(
                    session_id = %self.id,
                    stored = %stored.setup_fingerprint,
                    "saved session was produced by a different setup"
                );
                self.handle.event(SessionEvent::StoreEntryStale {
                    stored_fingerprint: stored.setup_fingerprint,
                });
            }
            Ok(None) => debug!(session_id = %self.id, "no saved session"),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "session store lookup failed, creating");
                self.handle.event(SessionEvent::StoreLookupFailed {
                    message: format!("{e:#}"),
                });
            }
        }

        self.handle.transition(WorkflowState::Creating, None)?;
        Ok(StepOutput::null().with_children(self.create_branch(SessionPhase::Created)))
    }

    // ── Restoring ──

    fn begin_restore(&self) -> Result<StepOutput, SessionError> {
        self.handle.transition(WorkflowState::Restoring, None)?;
        let restore = self.step(next_step_id(), RESTORE_STEP, |flow, input| flow.restore(input));
        Ok(StepOutput::null().with_children([restore]))
    }

    async fn restore(self, input: StepInput) -> Result<StepOutput, SessionError> {
        self.reset_browser().await?;
        let state = self
            .with_record(|r| r.captured_state().cloned())?
            .ok_or_else(|| SessionError::Internal(format!("session `{}` has no captured state", self.id)))?;
        self.browser
            .apply(&state)
            .await
            .map_err(|e| SessionError::browser("apply", e))?;
        self.handle.event(SessionEvent::StateRestored);
        debug!(session_id = %self.id, "session state restored");

        self.after_hydration(SessionPhase::Restored, input.subject)
    }

    // ── Creating / Recreating ──

    fn create_branch(&self, phase: SessionPhase) -> Vec<Step> {
        let setup = {
            let flow = self.clone();
            Step::new(SETUP_STEP, move |_input| flow.run_setup(phase))
        };
        vec![
            self.step(next_step_id(), CLEAR_STEP, move |flow, _| flow.clear(phase)),
            setup,
            self.step(next_step_id(), CAPTURE_STEP, move |flow, input| flow.capture(phase, input))
                .clearing_interceptor(),
        ]
    }

    async fn clear(self, phase: SessionPhase) -> Result<StepOutput, SessionError> {
        self.reset_browser().await?;
        self.with_record(|r| r.dehydrate())?;
        self.handle.event(SessionEvent::StateCleared { phase });

        let interceptor = SetupInterceptor::new(phase, self.origin(), self.handle.clone());
        Ok(StepOutput::null().with_directive(QueueDirective::InstallInterceptor(Box::new(interceptor))))
    }

    /// User code runs here; failures are attributed by the setup interceptor.
    async fn run_setup(self, phase: SessionPhase) -> Result<StepOutput, SessionError> {
        let setup = self.with_record(|r| r.setup().clone())?;
        self.handle.event(SessionEvent::SetupStarted { phase });
        debug!(session_id = %self.id, %phase, "running session setup");

        let invocation = setup.invoke();
        match invocation.outcome {
            Normalized::Rejected(source) => {
                return Err(SessionError::Routine {
                    step: SETUP_STEP.into(),
                    source,
                })
            }
            Normalized::Pending(fut) => {
                fut.await.map_err(|source| SessionError::Routine {
                    step: SETUP_STEP.into(),
                    source,
                })?;
            }
            Normalized::Chained | Normalized::Sync(_) => {}
        }
        Ok(StepOutput::null().with_children(invocation.chained))
    }

    async fn capture(self, phase: SessionPhase, input: StepInput) -> Result<StepOutput, SessionError> {
        let state = self
            .browser
            .snapshot()
            .await
            .map_err(|e| SessionError::browser("snapshot", e))?;
        let stored = self.with_record(|r| r.to_stored(state.clone()))?;
        self.store
            .save(&stored)
            .await
            .map_err(|e| SessionError::store("save", e))?;
        self.with_record(|r| r.hydrate(state))?;
        self.handle.event(SessionEvent::StateCaptured { phase });
        debug!(session_id = %self.id, %phase, "session state captured");

        self.after_hydration(phase, input.subject)
    }

    async fn reset_browser(&self) -> Result<(), SessionError> {
        self.browser
            .navigate_blank()
            .await
            .map_err(|e| SessionError::browser("navigate_blank", e))?;
        self.store
            .clear_current()
            .await
            .map_err(|e| SessionError::store("clear_current", e))
    }

    // ── Validating ──

    fn after_hydration(&self, phase: SessionPhase, subject: Value) -> Result<StepOutput, SessionError> {
        match self.with_record(|r| r.validate().cloned())? {
            None => {
                self.complete(phase)?;
                Ok(StepOutput::null())
            }
            Some(routine) => {
                let resume = self.step(next_step_id(), RESUME_STEP, move |flow, input| {
                    flow.validated(phase, input)
                });
                let (steps, install) =
                    validation::schedule(routine, phase, subject, self.handle.clone(), resume);
                Ok(StepOutput::null().with_children(steps).with_directive(install))
            }
        }
    }

    async fn validated(self, phase: SessionPhase, input: StepInput) -> Result<StepOutput, SessionError> {
        match validation::reduce(self.handle.take_validation(), &input.subject) {
            Verdict::Valid => {
                self.complete(phase)?;
                Ok(StepOutput::null())
            }
            Verdict::Failed(cause) if phase.is_recoverable() => self.recreate(cause),
            Verdict::Failed(cause) => Err(SessionError::ValidationFailure {
                id: self.id.clone(),
                phase,
                origin: self.origin(),
                cause,
            }),
        }
    }

    fn recreate(&self, cause: ValidationCause) -> Result<StepOutput, SessionError> {
        warn!(session_id = %self.id, cause = %cause, "restored session is invalid, recreating");
        self.handle.event(SessionEvent::ValidationRecovered {
            cause: cause.to_string(),
        });
        self.handle
            .transition(WorkflowState::Recreating, Some(cause.to_string()))?;
        Ok(StepOutput::null().with_children(self.create_branch(SessionPhase::Recreated)))
    }

    fn complete(&self, status: SessionPhase) -> Result<(), SessionError> {
        self.handle
            .transition(WorkflowState::Completed { status }, None)?;
        self.handle.event(SessionEvent::Completed { status });
        info!(run_id = %self.ctx.run_id(), session_id = %self.id, %status, "session ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::RoutineReturn;
    use crate::store_memory::{MemoryBrowser, MemoryStore};
    use serde_json::json;

    fn engine() -> (WorkflowEngine, Arc<MemoryStore>, Arc<MemoryBrowser>) {
        let browser = Arc::new(MemoryBrowser::new());
        let store = Arc::new(MemoryStore::new(browser.clone()));
        (WorkflowEngine::new(store.clone(), browser.clone()), store, browser)
    }

    fn login(browser: &Arc<MemoryBrowser>) -> Routine {
        let browser = browser.clone();
        Routine::new("login()", move |_| {
            browser.set_cookie("token", "abc")?;
            Ok(RoutineReturn::Undefined)
        })
    }

    #[tokio::test]
    async fn create_without_validate_completes() {
        let (engine, store, browser) = engine();
        let ctx = RunContext::new();
        let mut queue = CommandQueue::new();

        let handle = engine
            .run_session(&ctx, &mut queue, "user", Some(login(&browser)), SessionOptions::new())
            .unwrap();
        engine.drive(&mut queue).await.unwrap();

        assert_eq!(handle.status(), Some(SessionPhase::Created));
        assert_eq!(
            handle.path(),
            vec![
                WorkflowState::Resolving,
                WorkflowState::Creating,
                WorkflowState::Completed {
                    status: SessionPhase::Created
                },
            ]
        );
        assert_eq!(store.saves(), 1);
        let summary = engine.get_session(&ctx, "user").unwrap().unwrap();
        assert!(summary.hydrated);
        assert_eq!(
            queue.step_states().iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec![SESSION_STEP, CLEAR_STEP, SETUP_STEP, CAPTURE_STEP]
        );
    }

    #[tokio::test]
    async fn bare_lookup_requires_registration() {
        let (engine, _, _) = engine();
        let ctx = RunContext::new();
        let mut queue = CommandQueue::new();

        let err = engine
            .run_session(&ctx, &mut queue, "nobody", None, SessionOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Configuration(crate::error::ConfigurationError::SessionNotFound { .. })
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn store_save_failure_fails_the_run() {
        let (engine, store, browser) = engine();
        store.set_fail_save(true);
        let ctx = RunContext::new();
        let mut queue = CommandQueue::new();

        let handle = engine
            .run_session(&ctx, &mut queue, "user", Some(login(&browser)), SessionOptions::new())
            .unwrap();
        let err = engine.drive(&mut queue).await.unwrap_err();

        assert!(matches!(err, SessionError::Store { operation: "save", .. }));
        assert_eq!(handle.state(), WorkflowState::Failed { phase: None });
        assert!(!engine.get_session(&ctx, "user").unwrap().unwrap().hydrated);
        assert!(matches!(
            handle.events().last(),
            Some(SessionEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn before_each_test_respects_isolation() {
        let browser = Arc::new(MemoryBrowser::new());
        let store = Arc::new(MemoryStore::new(browser.clone()));
        let config = SessionConfig {
            test_isolation: false,
            ..SessionConfig::default()
        };
        let engine = WorkflowEngine::with_config(store, browser.clone(), config);

        browser.set_cookie("token", "abc").unwrap();
        engine.before_each_test().await.unwrap();
        assert_eq!(browser.cookie("token").unwrap().as_deref(), Some("abc"));
        assert_eq!(browser.navigations(), 0);
    }

    #[tokio::test]
    async fn setup_chain_runs_before_capture() {
        let (engine, store, browser) = engine();
        let ctx = RunContext::new();
        let mut queue = CommandQueue::new();
        let chained_browser = browser.clone();
        let setup = Routine::new("visit('/login'); type(...)", move |chain| {
            let browser = chained_browser.clone();
            chain.then("type-credentials", move |_| async move {
                browser.set_cookie("token", "chained")?;
                Ok(json!(null))
            });
            Ok(RoutineReturn::Chain)
        });

        engine
            .run_session(&ctx, &mut queue, "user", Some(setup), SessionOptions::new())
            .unwrap();
        engine.drive(&mut queue).await.unwrap();

        let saved = store.saved(&SessionId::new("user")).unwrap();
        assert_eq!(saved.state.as_value()["cookies"]["token"], json!("chained"));
    }
}
