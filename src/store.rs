use anyhow::Result;
use async_trait::async_trait;

use crate::record::{CapturedState, StoredSession};
use crate::types::SessionId;

/// Backing store for captured session state.
///
/// The workflow engine only talks to persistence through this trait, so the
/// in-memory store used in tests and a file- or server-backed store are
/// interchangeable.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Saved entry for `id`; not-found is `Ok(None)`.
    async fn get(&self, id: &SessionId) -> Result<Option<StoredSession>>;
    async fn save(&self, session: &StoredSession) -> Result<()>;

    /// Clear the state currently applied to the browser (cookies, storage).
    async fn clear_current(&self) -> Result<()>;

    /// Drop saved entries. Entries cached across specs survive unless
    /// `include_cached` is set.
    async fn clear_saved(&self, include_cached: bool) -> Result<()>;
}

/// The browser the session state is captured from and applied to.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Leave the current page so nothing on it can observe the state change.
    async fn navigate_blank(&self) -> Result<()>;
    async fn snapshot(&self) -> Result<CapturedState>;
    async fn apply(&self, state: &CapturedState) -> Result<()>;
}
