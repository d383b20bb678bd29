//! Authenticated-session management: persistence, challenge classification,
//! challenge resolution, and the state machine that ties them together.

pub mod detector;
pub mod machine;
pub mod resolver;
pub mod store;

use std::time::Duration;

/// URLs, selectors and URL fragments for the target site.
///
/// The defaults target the professional-network site this crate automates;
/// every field is overridable so tests (and a site redesign) can swap the
/// surface without touching the detector/resolver logic.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    /// A URL that requires authentication — the verification navigation target.
    pub check_url: String,
    /// The credential-entry page.
    pub login_url: String,

    /// Present only when logged in (the primary authenticated-nav element).
    pub logged_in_selector: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,

    /// URL fragments of the password-reprompt flow.
    pub reprompt_url_fragments: Vec<String>,

    /// "Confirm it's you" account-tile page: URL fragments plus the markers
    /// that identify it, plus the ordered click strategies used to resolve it.
    pub reconfirm_url_fragments: Vec<String>,
    pub reconfirm_marker_selectors: Vec<String>,
    pub reconfirm_tile_selectors: Vec<String>,

    /// Security-challenge indicators (challenge iframe, human-verification
    /// control) and checkpoint URL fragments.
    pub security_selectors: Vec<String>,
    pub security_url_fragments: Vec<String>,

    /// Generic login / authwall URL fragments.
    pub login_wall_fragments: Vec<String>,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            check_url: "https://www.linkedin.com/feed/".into(),
            login_url: "https://www.linkedin.com/login".into(),
            logged_in_selector: "#global-nav".into(),
            username_selector: "#username".into(),
            password_selector: "input#password".into(),
            submit_selector: "button[type='submit']".into(),
            reprompt_url_fragments: vec!["checkpoint/lg".into()],
            reconfirm_url_fragments: vec!["checkpoint/rm".into()],
            reconfirm_marker_selectors: vec![
                "button[aria-label^='Sign in as']".into(),
                ".member-profile-block".into(),
            ],
            reconfirm_tile_selectors: vec![
                "button[aria-label^='Sign in as']".into(),
                ".member-profile-block".into(),
                ".profile__details".into(),
            ],
            security_selectors: vec![
                "#captcha-internal".into(),
                "iframe[title*='challenge']".into(),
                ".captcha__image".into(),
            ],
            security_url_fragments: vec!["checkpoint/challenge".into()],
            login_wall_fragments: vec!["/login".into(), "authwall".into(), "/uas/".into()],
        }
    }
}

/// Tunables for the state machine, detector and resolver.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Re-verification interval after a successful check.
    pub staleness_valid: Duration,
    /// Shorter interval after a failed check — no tight-loop login retries,
    /// but trouble gets re-examined sooner than a healthy session.
    pub staleness_invalid: Duration,

    /// Bound for a single page navigation.
    pub nav_timeout: Duration,
    /// Per-check bound inside the detector; classification as a whole stays
    /// bounded because each of the ordered checks uses this.
    pub check_timeout: Duration,
    /// How long to wait for the authenticated-nav element after submitting
    /// credentials.
    pub login_wait: Duration,

    /// Ceiling for the human-resolution wait on a security challenge.
    pub challenge_ceiling: Duration,
    /// Poll interval inside that wait.
    pub challenge_poll: Duration,

    /// Navigation attempts before degrading to classify-whatever-is-there.
    pub nav_retries: u32,

    /// Post-navigation settle jitter (ms). Zero disables it.
    pub settle_min_ms: u64,
    pub settle_max_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            staleness_valid: Duration::from_secs(1800),
            staleness_invalid: Duration::from_secs(300),
            nav_timeout: Duration::from_secs(45),
            check_timeout: Duration::from_secs(3),
            login_wait: Duration::from_secs(20),
            challenge_ceiling: Duration::from_secs(300),
            challenge_poll: Duration::from_secs(5),
            nav_retries: 3,
            settle_min_ms: 1000,
            settle_max_ms: 3000,
        }
    }
}

impl SessionConfig {
    /// Defaults with environment overrides applied.
    ///
    /// `LINKPILOT_STALENESS_SECS`, `LINKPILOT_STALENESS_INVALID_SECS`,
    /// `LINKPILOT_CHALLENGE_CEILING_SECS` — everything else stays at its
    /// default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_u64("LINKPILOT_STALENESS_SECS") {
            cfg.staleness_valid = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LINKPILOT_STALENESS_INVALID_SECS") {
            cfg.staleness_invalid = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LINKPILOT_CHALLENGE_CEILING_SECS") {
            cfg.challenge_ceiling = Duration::from_secs(secs);
        }
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
