//! Page-state classification.
//!
//! After navigating to a URL that requires authentication, the detector
//! inspects the current page and names what it sees. Checks run in a fixed
//! order and the first match wins — several challenge pages share DOM
//! fragments with the logged-in state, so the authenticated-nav probe must
//! come first. Each check is bounded by a short timeout, keeping a full
//! classification pass bounded even when every check misses. Detection is
//! strictly read-only: no clicks, no fills, no scripts.

use std::time::Duration;

use tracing::debug;

use crate::browser::BrowserHandle;
use crate::session::SiteProfile;

/// What the current page was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    /// Logged in; nothing to resolve.
    None,
    /// Generic login / authwall page.
    LoginWall,
    /// The site kept the account context but wants the password again.
    CredentialReprompt,
    /// "Confirm it's you" — resume a known account without re-entering the
    /// password.
    IdentityReconfirm,
    /// A human-verification step; cannot be automated.
    SecurityChallenge,
    /// Nothing recognizable. Treated downstream as not-logged-in.
    Unknown,
}

/// How the classification was reached. Element probes are stronger evidence
/// than URL-pattern matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Element,
    UrlPattern,
}

/// Ephemeral result of one classification pass. Never persisted.
#[derive(Debug, Clone)]
pub struct ChallengeObservation {
    pub challenge: Challenge,
    pub url: String,
    pub confidence: Confidence,
}

pub struct ChallengeDetector {
    profile: SiteProfile,
    check_timeout: Duration,
}

fn url_matches(url: &str, fragments: &[String]) -> bool {
    fragments.iter().any(|f| url.contains(f.as_str()))
}

impl ChallengeDetector {
    pub fn new(profile: SiteProfile, check_timeout: Duration) -> Self {
        Self {
            profile,
            check_timeout,
        }
    }

    /// Classify the current page. Ordered, first match wins.
    pub async fn classify(&self, browser: &dyn BrowserHandle) -> ChallengeObservation {
        let url = browser.current_url().await;

        // 1. Authenticated-nav element → logged in. This must precede every
        //    challenge check; see the precedence test in tests/session_flow.rs.
        if browser
            .find_visible(&self.profile.logged_in_selector, self.check_timeout)
            .await
        {
            debug!("detector: authenticated-nav element visible");
            return ChallengeObservation {
                challenge: Challenge::None,
                url,
                confidence: Confidence::Element,
            };
        }

        // 2. Credential reprompt: known URL pattern, or a password field shown
        //    without the account-identifier field.
        if url_matches(&url, &self.profile.reprompt_url_fragments) {
            return ChallengeObservation {
                challenge: Challenge::CredentialReprompt,
                url,
                confidence: Confidence::UrlPattern,
            };
        }
        let password_visible = browser
            .find_visible(&self.profile.password_selector, self.check_timeout)
            .await;
        if password_visible {
            let username_visible = browser
                .find_visible(&self.profile.username_selector, self.check_timeout)
                .await;
            if !username_visible {
                debug!("detector: password-only input visible");
                return ChallengeObservation {
                    challenge: Challenge::CredentialReprompt,
                    url,
                    confidence: Confidence::Element,
                };
            }
        }

        // 3. Identity reconfirm ("confirm it's you" account tiles).
        if url_matches(&url, &self.profile.reconfirm_url_fragments) {
            return ChallengeObservation {
                challenge: Challenge::IdentityReconfirm,
                url,
                confidence: Confidence::UrlPattern,
            };
        }
        for selector in &self.profile.reconfirm_marker_selectors {
            if browser.find_visible(selector, self.check_timeout).await {
                debug!("detector: reconfirm marker visible ({})", selector);
                return ChallengeObservation {
                    challenge: Challenge::IdentityReconfirm,
                    url,
                    confidence: Confidence::Element,
                };
            }
        }

        // 4. Security challenge indicators.
        if url_matches(&url, &self.profile.security_url_fragments) {
            return ChallengeObservation {
                challenge: Challenge::SecurityChallenge,
                url,
                confidence: Confidence::UrlPattern,
            };
        }
        for selector in &self.profile.security_selectors {
            if browser.find_visible(selector, self.check_timeout).await {
                debug!("detector: security-challenge indicator visible ({})", selector);
                return ChallengeObservation {
                    challenge: Challenge::SecurityChallenge,
                    url,
                    confidence: Confidence::Element,
                };
            }
        }

        // 5. Generic login wall. Checked after the specific challenge pages
        //    because their URLs often also contain a login fragment.
        if url_matches(&url, &self.profile.login_wall_fragments) {
            return ChallengeObservation {
                challenge: Challenge::LoginWall,
                url,
                confidence: Confidence::UrlPattern,
            };
        }

        // 6. Nothing recognized.
        ChallengeObservation {
            challenge: Challenge::Unknown,
            url,
            confidence: Confidence::UrlPattern,
        }
    }

    /// Cheap re-probe used inside the security-challenge wait loop: is any
    /// challenge indicator still present?
    pub async fn security_challenge_present(&self, browser: &dyn BrowserHandle) -> bool {
        let url = browser.current_url().await;
        if url_matches(&url, &self.profile.security_url_fragments) {
            return true;
        }
        for selector in &self.profile.security_selectors {
            if browser.find_visible(selector, self.check_timeout).await {
                return true;
            }
        }
        false
    }
}
