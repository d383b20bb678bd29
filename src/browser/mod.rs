//! The capability seam over an automated browser.
//!
//! The session manager never talks to CDP directly; it talks to
//! [`BrowserHandle`], a small trait covering navigation, element queries,
//! interaction, cookie replay and script injection. The production
//! implementation lives in [`cdp`]; tests drive the state machine through a
//! mock.
//!
//! A handle maps to exactly one live browser. Operations against one handle
//! are strictly ordered by the callers (see the single-flight guard in
//! `session::machine`) — the DOM behind a handle is shared mutable state with
//! no isolation between concurrent navigations.

pub mod cdp;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::store::SessionToken;

pub use cdp::{CdpBrowser, CdpBrowserFactory};

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("page interaction failed: {0}")]
    Interaction(String),

    #[error("browser is closed")]
    Closed,
}

/// A long-lived automated-browser process, reduced to the primitives the
/// session manager needs. Implementations must be safe to share behind `&`
/// across await points; mutual exclusion of *semantic* operations is the
/// caller's job.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Navigate the page, bounded by `timeout`.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// `true` when `selector` matches a visible element within `timeout`.
    /// Never errors: a dead page simply reports not-visible.
    async fn find_visible(&self, selector: &str, timeout: Duration) -> bool;

    /// Fill a form field.
    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError>;

    /// Click an element.
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// The URL the page currently shows; empty string when unavailable.
    async fn current_url(&self) -> String;

    /// Snapshot the current cookie jar as opaque token records.
    async fn get_tokens(&self) -> Vec<SessionToken>;

    /// Replay previously persisted tokens into the cookie jar.
    async fn set_tokens(&self, tokens: &[SessionToken]) -> Result<(), BrowserError>;

    /// Evaluate a script in the page. Result is discarded; used for the
    /// operator banner and last-resort interaction heuristics.
    async fn run_script(&self, src: &str) -> Result<(), BrowserError>;

    /// Release the underlying browser process. Idempotent.
    async fn close(&self);
}

/// Lazily launches browsers for the state machine, one per login identity.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self, user_agent: &str) -> Result<Box<dyn BrowserHandle>, BrowserError>;
}
