//! session-lifecycle: reusable browser sessions on a step queue.
//!
//! A named session is created once by running its setup routine, its browser
//! state is captured and saved, and later uses restore that state instead of
//! running setup again. An optional validate routine checks restored state;
//! a restored session that fails validation is recreated.
//!
//! All work is expressed as steps on a [`CommandQueue`]. User routines may chain
//! more steps, and failures inside setup or validation are intercepted at the
//! queue level and attributed to the `session` command that caused them.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod interceptor;
pub mod options;
pub mod queue;
pub mod record;
pub mod registry;
pub mod routine;
pub mod state;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod validation;

pub use config::SessionConfig;
pub use engine::WorkflowEngine;
pub use error::{ConfigurationError, DefinitionConflict, RoutineError, SessionError, ValidationCause};
pub use events::SessionEvent;
pub use options::{OptionValue, SessionOptions};
pub use queue::{CommandQueue, Step, StepOutput, StepState};
pub use record::{CapturedState, SessionRecord, SessionSummary, StoredSession};
pub use registry::{RunContext, SessionRegistry};
pub use routine::{Chain, Routine, RoutineReturn};
pub use state::{SessionHandle, WorkflowState};
pub use store::{BrowserDriver, SessionStore};
pub use store_memory::{MemoryBrowser, MemoryStore};
pub use types::{CommandOrigin, Fingerprint, SessionId, SessionKey, SessionPhase};
