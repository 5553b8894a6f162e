//! User routines
//!
//! Setup and validation routines are plain closures paired with their source
//! text (the source is what gets fingerprinted). A routine may enqueue steps on
//! the [`Chain`] it receives and may return a value, a promise, or nothing.
//! [`normalize`] reduces every return shape to one tagged result.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{RoutineError, SessionError};
use crate::queue::{Step, StepOutput};
use crate::types::Fingerprint;

pub type RoutineFuture = BoxFuture<'static, Result<Value, RoutineError>>;

/// What a routine body hands back.
pub enum RoutineReturn {
    /// Returned nothing.
    Undefined,
    /// Returned the chain it enqueued steps on.
    Chain,
    Value(Value),
    Promise(RoutineFuture),
}

impl RoutineReturn {
    pub fn promise<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static,
    {
        RoutineReturn::Promise(fut.boxed())
    }
}

impl fmt::Debug for RoutineReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutineReturn::Undefined => f.write_str("Undefined"),
            RoutineReturn::Chain => f.write_str("Chain"),
            RoutineReturn::Value(v) => f.debug_tuple("Value").field(v).finish(),
            RoutineReturn::Promise(_) => f.write_str("Promise"),
        }
    }
}

/// Steps enqueued by a routine while it runs. They are scheduled right after
/// the step that invoked the routine.
#[derive(Debug, Default)]
pub struct Chain {
    steps: Vec<Step>,
}

impl Chain {
    /// Enqueue a step that receives the previous subject and yields a new one.
    pub fn then<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static,
    {
        self.steps.push(user_step(name.into(), f));
        self
    }

    /// Like [`then`](Self::then), but the step is never skipped by a recovery redirect.
    pub fn always<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static,
    {
        self.steps.push(user_step(name.into(), f).always_run());
        self
    }

    pub fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }
}

fn user_step<F, Fut>(name: String, f: F) -> Step
where
    F: FnOnce(Value) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, RoutineError>> + Send + 'static,
{
    Step::new(name.clone(), move |input| {
        let fut = f(input.subject);
        async move {
            fut.await
                .map(StepOutput::yields)
                .map_err(|source| SessionError::Routine { step: name, source })
        }
    })
}

type RoutineBody = dyn Fn(&mut Chain) -> Result<RoutineReturn, RoutineError> + Send + Sync;

/// A user-supplied routine and its source text.
#[derive(Clone)]
pub struct Routine {
    source: Arc<str>,
    fingerprint: Fingerprint,
    body: Arc<RoutineBody>,
}

impl Routine {
    pub fn new<F>(source: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Chain) -> Result<RoutineReturn, RoutineError> + Send + Sync + 'static,
    {
        let source: String = source.into();
        Self {
            fingerprint: Fingerprint::of_source(&source),
            source: source.into(),
            body: Arc::new(body),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Call the routine and normalize what it returned.
    pub fn invoke(&self) -> Invocation {
        let mut chain = Chain::default();
        let result = (self.body)(&mut chain);
        Invocation {
            outcome: normalize(result),
            chained: chain.into_steps(),
        }
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("source", &self.source)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Tagged result of a routine call.
pub enum Normalized {
    Sync(Value),
    /// Returned nothing or the chain; judge by the subject its steps yield.
    Chained,
    Rejected(RoutineError),
    Pending(RoutineFuture),
}

impl fmt::Debug for Normalized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalized::Sync(v) => f.debug_tuple("Sync").field(v).finish(),
            Normalized::Chained => f.write_str("Chained"),
            Normalized::Rejected(e) => f.debug_tuple("Rejected").field(e).finish(),
            Normalized::Pending(_) => f.write_str("Pending"),
        }
    }
}

pub fn normalize(result: Result<RoutineReturn, RoutineError>) -> Normalized {
    match result {
        Err(err) => Normalized::Rejected(err.into_error()),
        Ok(RoutineReturn::Promise(fut)) => Normalized::Pending(fut),
        Ok(RoutineReturn::Undefined | RoutineReturn::Chain) => Normalized::Chained,
        Ok(RoutineReturn::Value(value)) => Normalized::Sync(value),
    }
}

/// A routine call: its normalized return and the steps it enqueued.
#[derive(Debug)]
pub struct Invocation {
    pub outcome: Normalized,
    pub chained: Vec<Step>,
}
