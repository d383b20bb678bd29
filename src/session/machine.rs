//! The session state machine.
//!
//! `ensure_active_session()` is the single entry point callers hit before
//! every unit of scraping work. It decides — from elapsed time and the last
//! known validity — whether to trust the in-memory state, re-verify against
//! the live site, or run a full credential login, and always answers with a
//! plain boolean. Browser and DOM failures never escape this module.
//!
//! States: Unknown → CookiesLoaded → Verifying → {Valid, ChallengeHandling,
//! CredentialLogin} → Valid | Invalid. A session is marked Valid only through
//! an explicit logged-in classification; absence of a bad signal is never
//! treated as success.

use std::time::{Duration, Instant};

use rand::distr::{Distribution, Uniform};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::browser::{BrowserFactory, BrowserHandle};
use crate::credentials::CredentialStore;
use crate::session::detector::{Challenge, ChallengeDetector, ChallengeObservation};
use crate::session::resolver::{ChallengeResolver, ResolveOutcome};
use crate::session::store::{SessionStore, SessionToken};
use crate::session::{SessionConfig, SiteProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    CookiesLoaded,
    Verifying,
    ChallengeHandling,
    CredentialLogin,
    Valid,
    Invalid,
}

/// The central session entity. Guarded by the machine's mutex; at most one
/// authentication attempt may touch the browser at a time, because two
/// concurrent navigations against one browser race destructively.
struct Session {
    browser: Option<Box<dyn BrowserHandle>>,
    state: SessionState,
    /// In-memory copy of the last known-good token set. Content is opaque.
    tokens: Vec<SessionToken>,
    /// Whether persisted tokens were replayed into the current browser.
    tokens_replayed: bool,
    last_checked_at: Option<Instant>,
    last_check_ok: bool,
    last_challenge: Option<Challenge>,
}

pub struct SessionStateMachine {
    credentials: CredentialStore,
    store: SessionStore,
    factory: Box<dyn BrowserFactory>,
    profile: SiteProfile,
    config: SessionConfig,
    detector: ChallengeDetector,
    resolver: ChallengeResolver,
    session: Mutex<Session>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionStateMachine {
    pub fn new(
        credentials: CredentialStore,
        store: SessionStore,
        factory: Box<dyn BrowserFactory>,
        profile: SiteProfile,
        config: SessionConfig,
    ) -> Self {
        let detector = ChallengeDetector::new(profile.clone(), config.check_timeout);
        let resolver = ChallengeResolver::new(
            profile.clone(),
            credentials.password.clone(),
            config.login_wait,
            config.check_timeout,
            config.challenge_ceiling,
            config.challenge_poll,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            credentials,
            store,
            factory,
            profile,
            config,
            detector,
            resolver,
            session: Mutex::new(Session {
                browser: None,
                state: SessionState::Unknown,
                tokens: Vec::new(),
                tokens_replayed: false,
                last_checked_at: None,
                last_check_ok: false,
                last_challenge: None,
            }),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Default wiring: auto-discovered Chromium (headful, so an operator can
    /// clear a security challenge), default store location, env-tuned config.
    /// `None` when no browser executable is installed.
    pub fn with_defaults(credentials: CredentialStore) -> Option<Self> {
        let factory = crate::browser::CdpBrowserFactory::auto(false)?;
        Some(Self::new(
            credentials,
            SessionStore::default_location(),
            Box::new(factory),
            SiteProfile::default(),
            SessionConfig::from_env(),
        ))
    }

    /// Make sure an authenticated session is live, re-verifying or logging in
    /// as needed. Always returns a boolean; callers skip the dependent
    /// operation on `false` instead of aborting their batch.
    ///
    /// Concurrent callers serialize on the session mutex: the late caller
    /// blocks until the in-flight attempt finishes and then observes its
    /// result through the staleness fast path, without a second navigation.
    pub async fn ensure_active_session(&self) -> bool {
        let mut session = self.session.lock().await;

        // Staleness fast path: trust a recent check without touching the
        // browser. The post-failure tier is shorter so trouble gets
        // re-examined sooner, but a definitively failed login is not retried
        // in a tight loop.
        if let Some(checked_at) = session.last_checked_at {
            let window = if session.last_check_ok {
                self.config.staleness_valid
            } else {
                self.config.staleness_invalid
            };
            if checked_at.elapsed() < window
                && matches!(session.state, SessionState::Valid | SessionState::Invalid)
            {
                debug!(
                    "machine: within staleness window ({:?} elapsed) — cached result {}",
                    checked_at.elapsed(),
                    session.last_check_ok
                );
                return session.last_check_ok;
            }
        }

        self.verify_locked(&mut session).await
    }

    /// Force the next `ensure_active_session` call to re-verify.
    pub async fn invalidate(&self) {
        let mut session = self.session.lock().await;
        session.last_checked_at = None;
        session.last_check_ok = false;
        session.state = SessionState::Unknown;
        info!("machine: session invalidated; next call re-verifies");
    }

    /// Persist whatever tokens are currently available and release the
    /// browser. Also signals shutdown to any in-flight security-challenge
    /// wait, which observes it at its next poll boundary.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut session = self.session.lock().await;
        if let Some(browser) = session.browser.take() {
            let tokens = browser.get_tokens().await;
            if !tokens.is_empty() {
                self.store.save(&tokens);
                session.tokens = tokens;
            }
            browser.close().await;
            info!("machine: browser released");
        }
        session.state = SessionState::Unknown;
        session.tokens_replayed = false;
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state
    }

    pub async fn last_challenge(&self) -> Option<Challenge> {
        self.session.lock().await.last_challenge
    }

    /// In-memory copy of the last known-good token set.
    pub async fn tokens(&self) -> Vec<SessionToken> {
        self.session.lock().await.tokens.clone()
    }

    // ── verification pass ────────────────────────────────────────────────

    async fn verify_locked(&self, session: &mut Session) -> bool {
        session.state = SessionState::Verifying;

        if session.browser.is_none() {
            let user_agent = self.credentials.random_user_agent().to_string();
            match self.factory.launch(&user_agent).await {
                Ok(browser) => {
                    info!("machine: browser launched");
                    session.browser = Some(browser);
                    session.tokens_replayed = false;
                }
                Err(e) => {
                    warn!("machine: browser launch failed: {}", e);
                    return self.mark_invalid(session);
                }
            }
        }

        if !session.tokens_replayed {
            let tokens = self.store.load();
            if !tokens.is_empty() {
                let browser = session.browser.as_deref().expect("browser launched above");
                match browser.set_tokens(&tokens).await {
                    Ok(()) => {
                        info!("machine: replayed {} persisted tokens", tokens.len());
                        session.tokens = tokens;
                        session.state = SessionState::CookiesLoaded;
                    }
                    Err(e) => warn!("machine: token replay failed: {}", e),
                }
            }
            session.tokens_replayed = true;
        }

        {
            let browser = session.browser.as_deref().expect("browser launched above");
            self.navigate_best_effort(browser, &self.profile.check_url)
                .await;
        }
        self.settle().await;

        let observation = self.classify(session).await;
        session.last_challenge = Some(observation.challenge);
        info!(
            "machine: classified {:?} at {}",
            observation.challenge, observation.url
        );

        match observation.challenge {
            Challenge::None => return self.mark_valid(session).await,
            Challenge::CredentialReprompt
            | Challenge::IdentityReconfirm
            | Challenge::SecurityChallenge => {
                session.state = SessionState::ChallengeHandling;
                let outcome = self.resolve(session, &observation).await;
                info!("machine: challenge resolution -> {:?}", outcome);
                if outcome == ResolveOutcome::Resolved {
                    // Re-classify once; only an explicit logged-in
                    // classification counts as success.
                    let recheck = self.classify(session).await;
                    session.last_challenge = Some(recheck.challenge);
                    if recheck.challenge == Challenge::None {
                        return self.mark_valid(session).await;
                    }
                }
                if *self.shutdown_rx.borrow() {
                    return self.mark_invalid(session);
                }
            }
            Challenge::LoginWall | Challenge::Unknown => {}
        }

        session.state = SessionState::CredentialLogin;
        if self.credential_login(session).await {
            self.mark_valid(session).await
        } else {
            self.mark_invalid(session)
        }
    }

    /// Full credential login, with challenge handling both before and after
    /// submit — challenges can appear at either point.
    async fn credential_login(&self, session: &mut Session) -> bool {
        info!("machine: attempting full credential login");

        {
            let browser = session.browser.as_deref().expect("browser launched");
            self.navigate_best_effort(browser, &self.profile.login_url)
                .await;
        }
        self.settle().await;

        let pre = self.classify(session).await;
        session.last_challenge = Some(pre.challenge);
        match pre.challenge {
            // Already authenticated — the login page bounced us in.
            Challenge::None => return true,
            Challenge::SecurityChallenge | Challenge::IdentityReconfirm => {
                let outcome = self.resolve(session, &pre).await;
                if outcome != ResolveOutcome::Resolved {
                    warn!("machine: pre-login challenge unresolved ({:?})", outcome);
                    return false;
                }
                // Resolving the challenge may already have landed us inside.
                let recheck = self.classify(session).await;
                session.last_challenge = Some(recheck.challenge);
                if recheck.challenge == Challenge::None {
                    return true;
                }
            }
            // A login form of some shape; fill it below.
            Challenge::LoginWall | Challenge::CredentialReprompt | Challenge::Unknown => {}
        }

        let submitted = {
            let browser = session.browser.as_deref().expect("browser launched");
            self.fill_and_submit(browser).await
        };
        if !submitted {
            return false;
        }

        let landed = {
            let browser = session.browser.as_deref().expect("browser launched");
            browser
                .find_visible(&self.profile.logged_in_selector, self.config.login_wait)
                .await
        };
        if landed {
            let confirm = self.classify(session).await;
            session.last_challenge = Some(confirm.challenge);
            return confirm.challenge == Challenge::None;
        }

        // Submit did not land on the authenticated page — a post-submit
        // challenge may be up.
        let post = self.classify(session).await;
        session.last_challenge = Some(post.challenge);
        info!("machine: post-submit classification {:?}", post.challenge);
        if matches!(
            post.challenge,
            Challenge::SecurityChallenge
                | Challenge::IdentityReconfirm
                | Challenge::CredentialReprompt
        ) {
            let outcome = self.resolve(session, &post).await;
            if outcome == ResolveOutcome::Resolved {
                let confirm = self.classify(session).await;
                session.last_challenge = Some(confirm.challenge);
                return confirm.challenge == Challenge::None;
            }
        }

        warn!("machine: credential login failed verification");
        false
    }

    async fn fill_and_submit(&self, browser: &dyn BrowserHandle) -> bool {
        // The account-identifier field is absent on reprompt-style forms.
        if browser
            .find_visible(&self.profile.username_selector, self.config.check_timeout)
            .await
        {
            if let Err(e) = browser
                .fill(&self.profile.username_selector, &self.credentials.email)
                .await
            {
                warn!("machine: username fill failed: {}", e);
                return false;
            }
        }
        if !browser
            .find_visible(&self.profile.password_selector, self.config.check_timeout)
            .await
        {
            warn!("machine: no password field on the credential page");
            return false;
        }
        if let Err(e) = browser
            .fill(&self.profile.password_selector, &self.credentials.password)
            .await
        {
            warn!("machine: password fill failed: {}", e);
            return false;
        }
        if let Err(e) = browser.click(&self.profile.submit_selector).await {
            warn!("machine: submit click failed: {}", e);
            return false;
        }
        true
    }

    // ── helpers ──────────────────────────────────────────────────────────

    async fn classify(&self, session: &Session) -> ChallengeObservation {
        let browser = session.browser.as_deref().expect("browser launched");
        self.detector.classify(browser).await
    }

    async fn resolve(
        &self,
        session: &Session,
        observation: &ChallengeObservation,
    ) -> ResolveOutcome {
        let browser = session.browser.as_deref().expect("browser launched");
        let mut shutdown = self.shutdown_rx.clone();
        self.resolver
            .resolve(browser, observation, &self.detector, &mut shutdown)
            .await
    }

    /// Bounded retry; on total failure the pass continues and classifies
    /// whatever page is current — a transient navigation failure by itself
    /// does not decide session validity.
    async fn navigate_best_effort(&self, browser: &dyn BrowserHandle, url: &str) {
        for attempt in 1..=self.config.nav_retries {
            match browser.navigate(url, self.config.nav_timeout).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "machine: navigation to {} failed (attempt {}/{}): {}",
                        url, attempt, self.config.nav_retries, e
                    );
                    if attempt < self.config.nav_retries {
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
        }
    }

    /// Randomized post-navigation pause; fixed-cadence checks are a bot
    /// signal.
    async fn settle(&self) {
        if self.config.settle_max_ms == 0 {
            return;
        }
        let pause_ms = {
            let mut rng = rand::rng();
            Uniform::new_inclusive(self.config.settle_min_ms, self.config.settle_max_ms)
                .map(|dist| dist.sample(&mut rng))
                .unwrap_or(self.config.settle_min_ms)
        };
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    }

    async fn mark_valid(&self, session: &mut Session) -> bool {
        if let Some(browser) = session.browser.as_deref() {
            let tokens = browser.get_tokens().await;
            if !tokens.is_empty() {
                self.store.save(&tokens);
                session.tokens = tokens;
            }
        }
        session.state = SessionState::Valid;
        session.last_check_ok = true;
        session.last_checked_at = Some(Instant::now());
        info!("machine: session valid");
        true
    }

    /// Persisted tokens are deliberately kept: a session that fails today may
    /// succeed tomorrow after a target-side hiccup.
    fn mark_invalid(&self, session: &mut Session) -> bool {
        session.state = SessionState::Invalid;
        session.last_check_ok = false;
        session.last_checked_at = Some(Instant::now());
        warn!("machine: session invalid");
        false
    }
}
