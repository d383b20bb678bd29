//! One-shot session diagnostic: verify (or establish) an authenticated
//! session against the real browser, then exit. Exit code 1 when no session
//! could be established — useful as a cron/preflight probe.

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use linkpilot::{CredentialStore, SessionStateMachine};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let credentials = CredentialStore::from_env()
        .ok_or_else(|| anyhow!("LINKPILOT_EMAIL and LINKPILOT_PASSWORD must be set"))?;
    let machine = SessionStateMachine::with_defaults(credentials).ok_or_else(|| {
        anyhow!("no Chromium-family browser found; install one or set CHROME_EXECUTABLE")
    })?;

    info!("session-check: verifying session");
    let active = machine.ensure_active_session().await;
    if let Some(challenge) = machine.last_challenge().await {
        info!("session-check: last classification {:?}", challenge);
    }
    machine.close().await;

    if active {
        info!("session-check: session is active");
        Ok(())
    } else {
        warn!("session-check: no active session could be established");
        std::process::exit(1);
    }
}
