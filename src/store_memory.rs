//! In-memory store and browser for tests and the demo binary.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::record::{CapturedState, StoredSession};
use crate::store::{BrowserDriver, SessionStore};
use crate::types::SessionId;

pub const BLANK_PAGE: &str = "about:blank";

// ── MemoryBrowser ──

/// Browser-side state a session captures.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub local_storage: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Page {
    url: String,
    state: PageState,
}

/// Fake browser holding cookies and local storage for a single page.
#[derive(Debug, Default)]
pub struct MemoryBrowser {
    page: Mutex<Page>,
    navigations: AtomicUsize,
    snapshots: AtomicUsize,
    applies: AtomicUsize,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn page(&self) -> Result<std::sync::MutexGuard<'_, Page>> {
        self.page.lock().map_err(|e| anyhow!("Lock: {}", e))
    }

    pub fn visit(&self, url: impl Into<String>) -> Result<()> {
        self.page()?.url = url.into();
        Ok(())
    }

    pub fn url(&self) -> Result<String> {
        Ok(self.page()?.url.clone())
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.page()?.state.cookies.insert(name.into(), value.into());
        Ok(())
    }

    pub fn cookie(&self, name: &str) -> Result<Option<String>> {
        Ok(self.page()?.state.cookies.get(name).cloned())
    }

    pub fn set_local_storage(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.page()?
            .state
            .local_storage
            .insert(key.into(), value.into());
        Ok(())
    }

    pub fn state(&self) -> Result<PageState> {
        Ok(self.page()?.state.clone())
    }

    pub fn clear(&self) -> Result<()> {
        self.page()?.state = PageState::default();
        Ok(())
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    pub fn snapshots(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for MemoryBrowser {
    async fn navigate_blank(&self) -> Result<()> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        self.visit(BLANK_PAGE)
    }

    async fn snapshot(&self) -> Result<CapturedState> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        let state = self.state()?;
        Ok(CapturedState::new(serde_json::to_value(state)?))
    }

    async fn apply(&self, state: &CapturedState) -> Result<()> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let state: PageState = serde_json::from_value(state.as_value().clone())?;
        self.page()?.state = state;
        Ok(())
    }
}

// ── MemoryStore ──

/// In-memory SessionStore. `clear_current` clears the attached browser.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<SessionId, StoredSession>>,
    browser: Arc<MemoryBrowser>,
    gets: AtomicUsize,
    saves: AtomicUsize,
    fail_get: AtomicBool,
    fail_save: AtomicBool,
    fail_clear: AtomicBool,
}

impl MemoryStore {
    pub fn new(browser: Arc<MemoryBrowser>) -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            browser,
            gets: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            fail_get: AtomicBool::new(false),
            fail_save: AtomicBool::new(false),
            fail_clear: AtomicBool::new(false),
        }
    }

    /// Put an entry directly, e.g. one left by a previous run.
    pub fn insert(&self, session: StoredSession) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        store.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn saved(&self, id: &SessionId) -> Option<StoredSession> {
        self.inner.read().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_clear(&self, fail: bool) {
        self.fail_clear.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: &SessionId) -> Result<Option<StoredSession>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.load(Ordering::SeqCst) {
            bail!("session store unavailable");
        }
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.get(id).cloned())
    }

    async fn save(&self, session: &StoredSession) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_save.load(Ordering::SeqCst) {
            bail!("session store is read-only");
        }
        self.insert(session.clone())
    }

    async fn clear_current(&self) -> Result<()> {
        if self.fail_clear.load(Ordering::SeqCst) {
            bail!("browser storage could not be cleared");
        }
        self.browser.clear()
    }

    async fn clear_saved(&self, include_cached: bool) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        store.retain(|_, session| !include_cached && session.cache_across_specs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fingerprint;
    use serde_json::json;

    fn stored(id: &str, cache: bool) -> StoredSession {
        StoredSession {
            id: SessionId::new(id),
            setup_fingerprint: Fingerprint::of_source("setup"),
            validate_fingerprint: None,
            cache_across_specs: cache,
            state: CapturedState::new(json!({"cookies": {"token": id}})),
        }
    }

    #[tokio::test]
    async fn snapshot_and_apply_round_trip_page_state() {
        let browser = MemoryBrowser::new();
        browser.set_cookie("token", "abc").unwrap();
        browser.set_local_storage("theme", "dark").unwrap();

        let captured = browser.snapshot().await.unwrap();
        browser.clear().unwrap();
        assert_eq!(browser.cookie("token").unwrap(), None);

        browser.apply(&captured).await.unwrap();
        assert_eq!(browser.cookie("token").unwrap().as_deref(), Some("abc"));
        assert_eq!(captured.as_value()["localStorage"]["theme"], json!("dark"));
    }

    #[tokio::test]
    async fn navigate_blank_leaves_page() {
        let browser = MemoryBrowser::new();
        browser.visit("https://app.test/dashboard").unwrap();
        browser.navigate_blank().await.unwrap();
        assert_eq!(browser.url().unwrap(), BLANK_PAGE);
        assert_eq!(browser.navigations(), 1);
    }

    #[tokio::test]
    async fn clear_saved_keeps_cached_entries_unless_asked() {
        let store = MemoryStore::new(Arc::new(MemoryBrowser::new()));
        store.save(&stored("local", false)).await.unwrap();
        store.save(&stored("cached", true)).await.unwrap();

        store.clear_saved(false).await.unwrap();
        assert!(store.get(&SessionId::new("local")).await.unwrap().is_none());
        assert!(store.get(&SessionId::new("cached")).await.unwrap().is_some());

        store.clear_saved(true).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failure_switches_surface_errors() {
        let store = MemoryStore::new(Arc::new(MemoryBrowser::new()));
        store.set_fail_get(true);
        store.set_fail_save(true);
        store.set_fail_clear(true);
        assert!(store.get(&SessionId::new("x")).await.is_err());
        assert!(store.save(&stored("x", false)).await.is_err());
        assert!(store.clear_current().await.is_err());
        assert_eq!(store.gets(), 1);
        assert_eq!(store.saves(), 1);
    }

    #[tokio::test]
    async fn clear_current_clears_attached_browser() {
        let browser = Arc::new(MemoryBrowser::new());
        let store = MemoryStore::new(browser.clone());
        browser.set_cookie("token", "abc").unwrap();
        store.clear_current().await.unwrap();
        assert_eq!(browser.state().unwrap(), PageState::default());
    }
}
