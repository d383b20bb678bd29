//! Automated challenge remedies.
//!
//! Each challenge class gets a best-effort, idempotent-safe remedy: a partial
//! success (password filled but submit lost) must leave the page in a state
//! the detector can classify again on the next pass, never in an error. The
//! security challenge is the one remedy that cannot be automated — it raises
//! an in-page banner for the operator and polls until the indicator clears,
//! the ceiling is hit, or shutdown is requested.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::BrowserHandle;
use crate::session::detector::{Challenge, ChallengeDetector, ChallengeObservation};
use crate::session::SiteProfile;

const BANNER_ELEMENT_ID: &str = "__linkpilot_challenge_banner__";

/// Result of one resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The challenge indicator is gone; caller should re-classify.
    Resolved,
    /// Nothing to do here — run the full credential login.
    NeedsCredentials,
    /// The remedy ran but the challenge is still up.
    Failed,
    /// The human-resolution window elapsed (or shutdown was requested).
    TimedOut,
}

pub struct ChallengeResolver {
    profile: SiteProfile,
    password: String,
    login_wait: Duration,
    check_timeout: Duration,
    challenge_ceiling: Duration,
    challenge_poll: Duration,
}

impl ChallengeResolver {
    pub fn new(
        profile: SiteProfile,
        password: impl Into<String>,
        login_wait: Duration,
        check_timeout: Duration,
        challenge_ceiling: Duration,
        challenge_poll: Duration,
    ) -> Self {
        Self {
            profile,
            password: password.into(),
            login_wait,
            check_timeout,
            challenge_ceiling,
            challenge_poll,
        }
    }

    /// Attempt to clear the observed challenge.
    ///
    /// `shutdown` is observed at every poll boundary of the security-challenge
    /// wait; a signalled shutdown reports `TimedOut` so the caller's failure
    /// path (persist, release) runs unchanged.
    pub async fn resolve(
        &self,
        browser: &dyn BrowserHandle,
        observation: &ChallengeObservation,
        detector: &ChallengeDetector,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ResolveOutcome {
        match observation.challenge {
            Challenge::None => ResolveOutcome::Resolved,
            Challenge::CredentialReprompt => self.resolve_reprompt(browser).await,
            Challenge::IdentityReconfirm => self.resolve_reconfirm(browser).await,
            Challenge::SecurityChallenge => {
                self.wait_out_security_challenge(browser, detector, shutdown)
                    .await
            }
            Challenge::LoginWall | Challenge::Unknown => ResolveOutcome::NeedsCredentials,
        }
    }

    /// The reprompt keeps the account context, so only the passphrase is
    /// re-entered — never the account identifier.
    async fn resolve_reprompt(&self, browser: &dyn BrowserHandle) -> ResolveOutcome {
        info!("resolver: credential reprompt — refilling passphrase");
        if let Err(e) = browser
            .fill(&self.profile.password_selector, &self.password)
            .await
        {
            warn!("resolver: reprompt fill failed: {}", e);
            return ResolveOutcome::Failed;
        }
        if let Err(e) = browser.click(&self.profile.submit_selector).await {
            warn!("resolver: reprompt submit failed: {}", e);
            return ResolveOutcome::Failed;
        }
        if browser
            .find_visible(&self.profile.logged_in_selector, self.login_wait)
            .await
        {
            info!("resolver: reprompt cleared");
            ResolveOutcome::Resolved
        } else {
            warn!("resolver: reprompt submit did not reach the authenticated page");
            ResolveOutcome::Failed
        }
    }

    /// Try each tile selector in order, then fall back to a script-level
    /// "click any plausible profile element" heuristic. Resolved only when
    /// the reconfirm UI is actually gone afterwards.
    async fn resolve_reconfirm(&self, browser: &dyn BrowserHandle) -> ResolveOutcome {
        info!("resolver: identity reconfirm — selecting account tile");

        let mut clicked = false;
        for selector in &self.profile.reconfirm_tile_selectors {
            if !browser.find_visible(selector, self.check_timeout).await {
                continue;
            }
            match browser.click(selector).await {
                Ok(()) => {
                    info!("resolver: clicked account tile via {}", selector);
                    clicked = true;
                    break;
                }
                Err(e) => warn!("resolver: tile click via {} failed: {}", selector, e),
            }
        }

        if !clicked {
            // Structural selectors all missed; last resort is a DOM sweep for
            // anything that looks like a clickable profile entry.
            let sweep = r#"(() => {
                const candidates = document.querySelectorAll(
                    "button[class*='profile'], div[class*='profile'][role='button'], li[class*='account'] button"
                );
                for (const el of candidates) {
                    if (el.offsetParent !== null) { el.click(); return true; }
                }
                return false;
            })()"#;
            if let Err(e) = browser.run_script(sweep).await {
                warn!("resolver: reconfirm script fallback failed: {}", e);
                return ResolveOutcome::Failed;
            }
        }

        // Give the site a moment to navigate, then verify the reconfirm UI is
        // gone rather than trusting the click.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let url = browser.current_url().await;
        let still_on_reconfirm = self
            .profile
            .reconfirm_url_fragments
            .iter()
            .any(|f| url.contains(f.as_str()));
        let mut marker_visible = false;
        for selector in &self.profile.reconfirm_marker_selectors {
            if browser.find_visible(selector, self.check_timeout).await {
                marker_visible = true;
                break;
            }
        }

        if still_on_reconfirm || marker_visible {
            warn!("resolver: reconfirm UI still present after tile selection");
            ResolveOutcome::Failed
        } else {
            info!("resolver: reconfirm cleared");
            ResolveOutcome::Resolved
        }
    }

    /// Raise the operator banner, then poll until the challenge indicator
    /// disappears, the ceiling elapses, or shutdown is signalled. The
    /// shutdown signal is checked at every poll boundary, not just at the
    /// ceiling.
    async fn wait_out_security_challenge(
        &self,
        browser: &dyn BrowserHandle,
        detector: &ChallengeDetector,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ResolveOutcome {
        warn!(
            "resolver: security challenge — waiting up to {:?} for a human operator",
            self.challenge_ceiling
        );
        if let Err(e) = browser.run_script(&banner_script()).await {
            warn!("resolver: could not inject operator banner: {}", e);
        }

        let deadline = tokio::time::Instant::now() + self.challenge_ceiling;
        loop {
            if *shutdown.borrow() {
                warn!("resolver: shutdown requested during security-challenge wait");
                return ResolveOutcome::TimedOut;
            }

            if !detector.security_challenge_present(browser).await {
                info!("resolver: security challenge cleared by operator");
                let _ = browser.run_script(&remove_banner_script()).await;
                return ResolveOutcome::Resolved;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(
                    "resolver: security challenge unresolved after {:?}",
                    self.challenge_ceiling
                );
                return ResolveOutcome::TimedOut;
            }

            let nap = self.challenge_poll.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

fn banner_script() -> String {
    format!(
        r#"(() => {{
            const id = '{id}';
            if (document.getElementById(id)) return;
            const div = document.createElement('div');
            div.id = id;
            div.style.position = 'fixed';
            div.style.left = '0';
            div.style.top = '0';
            div.style.right = '0';
            div.style.zIndex = '2147483647';
            div.style.padding = '20px';
            div.style.fontSize = '24px';
            div.style.fontWeight = '700';
            div.style.background = 'rgba(0,0,0,0.88)';
            div.style.color = 'white';
            div.style.textAlign = 'center';
            div.style.borderBottom = '4px solid #ff4444';
            div.textContent = 'LINKPILOT NEEDS HELP: please complete the verification step in this window.';
            document.documentElement.appendChild(div);
        }})()"#,
        id = BANNER_ELEMENT_ID
    )
}

fn remove_banner_script() -> String {
    format!(
        "(() => {{ const el = document.getElementById('{id}'); if (el) el.remove(); }})()",
        id = BANNER_ELEMENT_ID
    )
}
