//! session-demo: walks a cached session through create, reuse, cross-spec
//! restore and recreate against the in-memory store.
//!
//! Reads config from env vars:
//!   SESSION_CONFIG: optional path to a YAML SessionConfig
//!   SESSION_*     : overrides, see `SessionConfig::apply_env`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use session_lifecycle::{
    CommandQueue, MemoryBrowser, MemoryStore, Routine, RoutineError, RoutineReturn, RunContext,
    SessionConfig, SessionHandle, SessionOptions, WorkflowEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,session_lifecycle=debug".into()),
        )
        .init();

    let config = match std::env::var("SESSION_CONFIG") {
        Ok(path) => SessionConfig::load(path)?,
        Err(_) => SessionConfig::default(),
    }
    .apply_env()?;

    let browser = Arc::new(MemoryBrowser::new());
    let store = Arc::new(MemoryStore::new(browser.clone()));
    let engine = WorkflowEngine::with_config(store.clone(), browser.clone(), config);
    let ctx = RunContext::new();

    // Server-side token validity; flipped off to force a recreate.
    let token_valid = Arc::new(AtomicBool::new(true));

    let setup = {
        let browser = browser.clone();
        let token_valid = token_valid.clone();
        Routine::new("login('admin')", move |_| {
            browser.set_cookie("token", "admin-token")?;
            token_valid.store(true, Ordering::SeqCst);
            Ok(RoutineReturn::Undefined)
        })
    };
    let validate = {
        let token_valid = token_valid.clone();
        Routine::new("expect(token).to.be.valid", move |chain| {
            let token_valid = token_valid.clone();
            chain.then("check-token", move |_| async move {
                if token_valid.load(Ordering::SeqCst) {
                    Ok(json!(true))
                } else {
                    Err(RoutineError::Thrown(json!("token expired")))
                }
            });
            Ok(RoutineReturn::Chain)
        })
    };
    let options = SessionOptions::new()
        .with_validate(validate)
        .cache_across_specs(true);

    let run = |label: &'static str| {
        let engine = engine.clone();
        let ctx = ctx.clone();
        let setup = setup.clone();
        let options = options.clone();
        async move {
            engine.before_each_test().await?;
            let mut queue = CommandQueue::new();
            let handle = engine.run_session(&ctx, &mut queue, "admin", Some(setup), options)?;
            engine.drive(&mut queue).await?;
            report(label, &handle);
            anyhow::Ok(())
        }
    };

    run("first test").await?;
    run("second test").await?;

    engine.begin_spec(&ctx).await?;
    run("next spec").await?;

    token_valid.store(false, Ordering::SeqCst);
    run("after token expiry").await?;

    tracing::info!(saved = store.len(), "demo finished");
    Ok(())
}

fn report(label: &str, handle: &SessionHandle) {
    let status = handle
        .status()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{:?}", handle.state()));
    tracing::info!(test = label, session = %handle.id(), %status, "session finished");
}
