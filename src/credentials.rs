//! Account secrets and client-identity strings.
//!
//! `CredentialStore` is a plain data holder: the account identifier, the
//! passphrase, and a pool of user-agent strings used to vary the automation
//! fingerprint between browser launches. It performs no I/O of its own beyond
//! the `from_env` constructor.

use rand::seq::IndexedRandom;

/// Realistic desktop user-agents used when the caller supplies no pool.
///
/// Kept current-ish; an outdated UA is itself a bot signal.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox 133 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// The two secrets plus the fingerprint pool. Pure data; no behavior beyond
/// random user-agent selection.
#[derive(Clone)]
pub struct CredentialStore {
    pub email: String,
    pub password: String,
    pub user_agents: Vec<String>,
}

impl CredentialStore {
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        user_agents: Vec<String>,
    ) -> Self {
        let mut user_agents = user_agents;
        if user_agents.is_empty() {
            user_agents = DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect();
        }
        Self {
            email: email.into(),
            password: password.into(),
            user_agents,
        }
    }

    /// Build from `LINKPILOT_EMAIL`, `LINKPILOT_PASSWORD` and the optional
    /// comma-separated `LINKPILOT_USER_AGENTS`.
    ///
    /// Returns `None` when either secret is missing; credentials are never
    /// defaulted.
    pub fn from_env() -> Option<Self> {
        let email = std::env::var("LINKPILOT_EMAIL").ok()?;
        let password = std::env::var("LINKPILOT_PASSWORD").ok()?;
        let user_agents = std::env::var("LINKPILOT_USER_AGENTS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Some(Self::new(email, password, user_agents))
    }

    /// Pick a random user-agent from the pool for the next browser launch.
    pub fn random_user_agent(&self) -> &str {
        let mut rng = rand::rng();
        self.user_agents
            .choose(&mut rng)
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENTS[0])
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the passphrase.
        f.debug_struct("CredentialStore")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("user_agents", &self.user_agents.len())
            .finish()
    }
}
