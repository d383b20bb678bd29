//! Scenario tests for the session state machine, driven through a scripted
//! mock browser. No real browser is launched here; the mock models pages as
//! (current URL, visible selectors) and lets each test route navigations and
//! script what a submit click does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use linkpilot::browser::{BrowserError, BrowserFactory, BrowserHandle};
use linkpilot::{
    Challenge, ChallengeDetector, ChallengeObservation, ChallengeResolver, Confidence,
    CredentialStore, ResolveOutcome, SessionConfig, SessionStateMachine, SessionStore,
    SessionToken, SiteProfile,
};

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

const FEED: &str = "https://www.linkedin.com/feed/";
const LOGIN: &str = "https://www.linkedin.com/login";
const AUTHWALL: &str = "https://www.linkedin.com/authwall?trk=guest";
const REPROMPT: &str = "https://www.linkedin.com/checkpoint/lg/login-submit";
const CHECKPOINT: &str = "https://www.linkedin.com/checkpoint/challenge/verify";

fn token(name: &str, value: &str) -> SessionToken {
    SessionToken {
        name: name.into(),
        value: value.into(),
        domain: ".linkedin.com".into(),
        path: "/".into(),
    }
}

// ── scripted mock browser ────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    nav_log: StdMutex<Vec<String>>,
    current: StdMutex<String>,
    /// navigate(url) lands on routes[url], defaulting to url itself.
    routes: StdMutex<HashMap<String, String>>,
    /// URL → selectors visible on that page.
    visible: StdMutex<HashMap<String, Vec<String>>>,
    fills: StdMutex<Vec<(String, String)>>,
    clicks: StdMutex<Vec<String>>,
    /// Where a submit click lands, and the cookie jar it produces.
    submit_target: StdMutex<Option<String>>,
    jar_after_submit: StdMutex<Option<Vec<SessionToken>>>,
    jar: StdMutex<Vec<SessionToken>>,
    replayed: StdMutex<Vec<SessionToken>>,
    nav_delay_ms: u64,
}

#[derive(Clone)]
struct MockBrowser(Arc<MockState>);

impl MockBrowser {
    fn nav_count(&self) -> usize {
        self.0.nav_log.lock().unwrap().len()
    }

    fn route(&self, from: &str, to: &str) {
        self.0
            .routes
            .lock()
            .unwrap()
            .insert(from.to_string(), to.to_string());
    }

    fn show(&self, url: &str, selectors: &[&str]) {
        self.0.visible.lock().unwrap().insert(
            url.to_string(),
            selectors.iter().map(|s| s.to_string()).collect(),
        );
    }

    fn on_submit(&self, lands_on: &str, jar: Vec<SessionToken>) {
        *self.0.submit_target.lock().unwrap() = Some(lands_on.to_string());
        *self.0.jar_after_submit.lock().unwrap() = Some(jar);
    }

    fn filled(&self, selector: &str) -> bool {
        self.0
            .fills
            .lock()
            .unwrap()
            .iter()
            .any(|(s, _)| s == selector)
    }
}

#[async_trait]
impl BrowserHandle for MockBrowser {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), BrowserError> {
        if self.0.nav_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.0.nav_delay_ms)).await;
        }
        self.0.nav_log.lock().unwrap().push(url.to_string());
        let dest = self
            .0
            .routes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| url.to_string());
        *self.0.current.lock().unwrap() = dest;
        Ok(())
    }

    async fn find_visible(&self, selector: &str, _timeout: Duration) -> bool {
        let current = self.0.current.lock().unwrap().clone();
        self.0
            .visible
            .lock()
            .unwrap()
            .get(&current)
            .map(|sels| sels.iter().any(|s| s == selector))
            .unwrap_or(false)
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        self.0
            .fills
            .lock()
            .unwrap()
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.0.clicks.lock().unwrap().push(selector.to_string());
        if selector == "button[type='submit']" {
            if let Some(target) = self.0.submit_target.lock().unwrap().clone() {
                *self.0.current.lock().unwrap() = target;
            }
            if let Some(jar) = self.0.jar_after_submit.lock().unwrap().clone() {
                *self.0.jar.lock().unwrap() = jar;
            }
        }
        Ok(())
    }

    async fn current_url(&self) -> String {
        self.0.current.lock().unwrap().clone()
    }

    async fn get_tokens(&self) -> Vec<SessionToken> {
        self.0.jar.lock().unwrap().clone()
    }

    async fn set_tokens(&self, tokens: &[SessionToken]) -> Result<(), BrowserError> {
        *self.0.replayed.lock().unwrap() = tokens.to_vec();
        *self.0.jar.lock().unwrap() = tokens.to_vec();
        Ok(())
    }

    async fn run_script(&self, _src: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn close(&self) {}
}

struct MockFactory {
    browser: MockBrowser,
    launches: Arc<AtomicUsize>,
}

impl MockFactory {
    fn new(browser: MockBrowser) -> Self {
        Self {
            browser,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl BrowserFactory for MockFactory {
    async fn launch(&self, _user_agent: &str) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.browser.clone()))
    }
}

// ── shared wiring ────────────────────────────────────────────────────────

fn test_config() -> SessionConfig {
    SessionConfig {
        staleness_valid: Duration::from_secs(600),
        staleness_invalid: Duration::from_secs(600),
        nav_timeout: Duration::from_secs(1),
        check_timeout: Duration::from_millis(10),
        login_wait: Duration::from_millis(10),
        challenge_ceiling: Duration::from_millis(300),
        challenge_poll: Duration::from_millis(50),
        nav_retries: 1,
        settle_min_ms: 0,
        settle_max_ms: 0,
    }
}

fn temp_store(tag: &str) -> SessionStore {
    SessionStore::new(std::env::temp_dir().join(format!(
        "linkpilot_flow_{}_{}_{}.json",
        tag,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )))
}

fn credentials() -> CredentialStore {
    CredentialStore::new("user@example.com", "s3cret", vec!["TestAgent/1.0".into()])
}

fn machine_with(browser: &MockBrowser, store: SessionStore) -> SessionStateMachine {
    SessionStateMachine::new(
        credentials(),
        store,
        Box::new(MockFactory::new(browser.clone())),
        SiteProfile::default(),
        test_config(),
    )
}

// ── scenarios ────────────────────────────────────────────────────────────

/// A second call inside the staleness window must not touch the browser.
#[tokio::test]
async fn staleness_check_skips_navigation() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    browser.show(FEED, &["#global-nav"]);
    let factory = MockFactory::new(browser.clone());
    let launches = factory.launches.clone();
    let store = temp_store("stale");
    let machine = SessionStateMachine::new(
        credentials(),
        store,
        Box::new(factory),
        SiteProfile::default(),
        test_config(),
    );

    assert!(machine.ensure_active_session().await);
    let navs_after_first = browser.nav_count();
    assert!(navs_after_first > 0);
    assert_eq!(launches.load(Ordering::SeqCst), 1, "browser launches lazily, once");

    assert!(machine.ensure_active_session().await);
    assert_eq!(
        browser.nav_count(),
        navs_after_first,
        "second call within the staleness window must perform zero navigations"
    );
}

/// Cold start: persisted tokens replay, classification says logged-in, no
/// credential login happens.
#[tokio::test]
async fn cold_start_with_valid_stored_tokens() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    browser.show(FEED, &["#global-nav"]);
    let store = temp_store("cold");
    let persisted = vec![token("li_at", "AQEstored"), token("JSESSIONID", "ajax:1")];
    store.save(&persisted);
    let store_path = store.path().to_path_buf();
    let machine = machine_with(&browser, store);

    assert!(machine.ensure_active_session().await);
    assert_eq!(
        *browser.0.replayed.lock().unwrap(),
        persisted,
        "persisted tokens must be replayed into the browser"
    );
    assert!(
        !browser.filled("input#password"),
        "no credential login may run when stored tokens verify"
    );
    let _ = std::fs::remove_file(store_path);
}

/// Stale tokens: the site answers with an authwall, so the machine runs a
/// full credential login and overwrites the token file with the fresh jar.
#[tokio::test]
async fn stale_tokens_trigger_full_login_and_fresh_persist() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    browser.route(FEED, AUTHWALL);
    browser.show(LOGIN, &["#username", "input#password"]);
    browser.show(FEED, &["#global-nav"]);
    let fresh = vec![token("li_at", "AQEfresh")];
    browser.on_submit(FEED, fresh.clone());

    let store = temp_store("relogin");
    store.save(&[token("li_at", "AQEstale")]);
    let store_path = store.path().to_path_buf();
    let machine = machine_with(&browser, store);

    assert!(machine.ensure_active_session().await);
    assert!(browser.filled("#username"));
    assert!(browser.filled("input#password"));
    assert_eq!(
        SessionStore::new(&store_path).load(),
        fresh,
        "token file must hold the fresh post-login jar"
    );
    let _ = std::fs::remove_file(store_path);
}

/// A credential reprompt is cleared by refilling the passphrase only; the
/// account identifier is never re-entered.
#[tokio::test]
async fn credential_reprompt_refills_password_only() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    browser.route(FEED, REPROMPT);
    browser.show(REPROMPT, &["input#password"]);
    browser.show(FEED, &["#global-nav"]);
    browser.on_submit(FEED, vec![token("li_at", "AQErefreshed")]);

    let store = temp_store("reprompt");
    let store_path = store.path().to_path_buf();
    let machine = machine_with(&browser, store);

    assert!(machine.ensure_active_session().await);
    assert!(browser.filled("input#password"));
    assert!(
        !browser.filled("#username"),
        "reprompt resolution must not re-enter the account identifier"
    );
    let _ = std::fs::remove_file(store_path);
}

/// Definitive failure: every page is a login wall and submits go nowhere.
/// The result is false, and a second call inside the post-failure window
/// returns the cached false without renewed navigation.
#[tokio::test]
async fn failed_login_is_cached_within_invalid_window() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    browser.route(FEED, AUTHWALL);
    browser.route(LOGIN, AUTHWALL);
    let store = temp_store("failed");
    let store_path = store.path().to_path_buf();
    let machine = machine_with(&browser, store);

    assert!(!machine.ensure_active_session().await);
    let navs_after_first = browser.nav_count();

    assert!(!machine.ensure_active_session().await);
    assert_eq!(
        browser.nav_count(),
        navs_after_first,
        "failed result must be cached for the invalid staleness tier"
    );
    let _ = std::fs::remove_file(store_path);
}

/// Two concurrent callers: exactly one navigation sequence; the late caller
/// observes the first one's result.
#[tokio::test]
async fn single_flight_serializes_concurrent_callers() {
    init_logger();
    let state = MockState {
        nav_delay_ms: 50,
        ..Default::default()
    };
    let browser = MockBrowser(Arc::new(state));
    browser.show(FEED, &["#global-nav"]);
    let store = temp_store("singleflight");
    let store_path = store.path().to_path_buf();
    let machine = Arc::new(machine_with(&browser, store));

    let a = {
        let m = machine.clone();
        tokio::spawn(async move { m.ensure_active_session().await })
    };
    let b = {
        let m = machine.clone();
        tokio::spawn(async move { m.ensure_active_session().await })
    };
    assert!(a.await.unwrap());
    assert!(b.await.unwrap());
    assert_eq!(
        browser.nav_count(),
        1,
        "concurrent callers must share one navigation sequence"
    );
    let _ = std::fs::remove_file(store_path);
}

/// `close()` writes the live cookie jar to disk before releasing the
/// browser — cookies rotated since the last verification must survive.
#[tokio::test]
async fn close_persists_live_tokens() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    browser.show(FEED, &["#global-nav"]);
    let store = temp_store("close");
    let store_path = store.path().to_path_buf();
    let machine = machine_with(&browser, store);

    assert!(machine.ensure_active_session().await);
    let rotated = vec![token("li_at", "AQErotated"), token("JSESSIONID", "ajax:2")];
    *browser.0.jar.lock().unwrap() = rotated.clone();
    // Drop the on-disk copy so only close() can have written the jar back.
    let _ = std::fs::remove_file(&store_path);

    machine.close().await;
    assert_eq!(
        SessionStore::new(&store_path).load(),
        rotated,
        "close must persist the live jar before releasing the browser"
    );
    let _ = std::fs::remove_file(store_path);
}

/// `invalidate()` defeats the staleness fast path.
#[tokio::test]
async fn invalidate_forces_reverification() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    browser.show(FEED, &["#global-nav"]);
    let store = temp_store("invalidate");
    let store_path = store.path().to_path_buf();
    let machine = machine_with(&browser, store);

    assert!(machine.ensure_active_session().await);
    let navs = browser.nav_count();
    machine.invalidate().await;
    assert!(machine.ensure_active_session().await);
    assert!(
        browser.nav_count() > navs,
        "invalidate must force a fresh verification pass"
    );
    let _ = std::fs::remove_file(store_path);
}

// ── detector / resolver properties ───────────────────────────────────────

/// The authenticated-nav probe precedes the security-challenge check: a page
/// exposing both classifies as logged-in.
#[tokio::test]
async fn classification_prefers_authenticated_nav_over_challenge_markers() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    *browser.0.current.lock().unwrap() = FEED.to_string();
    browser.show(FEED, &["#global-nav", "#captcha-internal"]);

    let detector = ChallengeDetector::new(SiteProfile::default(), Duration::from_millis(10));
    let obs = detector.classify(&browser).await;
    assert_eq!(obs.challenge, Challenge::None);
    assert_eq!(obs.confidence, Confidence::Element);
}

#[tokio::test]
async fn unrecognized_page_classifies_unknown() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    *browser.0.current.lock().unwrap() = "https://www.linkedin.com/404".to_string();

    let detector = ChallengeDetector::new(SiteProfile::default(), Duration::from_millis(10));
    let obs = detector.classify(&browser).await;
    assert_eq!(obs.challenge, Challenge::Unknown);
}

fn test_resolver(profile: &SiteProfile) -> ChallengeResolver {
    ChallengeResolver::new(
        profile.clone(),
        "s3cret",
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_millis(300),
        Duration::from_millis(50),
    )
}

/// A never-resolving security challenge times out at the ceiling — not
/// earlier, not materially later.
#[tokio::test]
async fn security_challenge_times_out_at_ceiling() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    *browser.0.current.lock().unwrap() = CHECKPOINT.to_string();
    browser.show(CHECKPOINT, &["#captcha-internal"]);

    let profile = SiteProfile::default();
    let detector = ChallengeDetector::new(profile.clone(), Duration::from_millis(10));
    let resolver = test_resolver(&profile);
    let obs = ChallengeObservation {
        challenge: Challenge::SecurityChallenge,
        url: CHECKPOINT.to_string(),
        confidence: Confidence::Element,
    };
    let (_tx, mut rx) = watch::channel(false);

    let start = Instant::now();
    let outcome = resolver.resolve(&browser, &obs, &detector, &mut rx).await;
    let elapsed = start.elapsed();

    assert_eq!(outcome, ResolveOutcome::TimedOut);
    assert!(
        elapsed >= Duration::from_millis(300),
        "returned before the ceiling: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(1500),
        "returned long after the ceiling: {:?}",
        elapsed
    );
}

/// A shutdown signal is honored at the next poll boundary, well before the
/// ceiling.
#[tokio::test]
async fn security_challenge_wait_honors_shutdown() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    *browser.0.current.lock().unwrap() = CHECKPOINT.to_string();
    browser.show(CHECKPOINT, &["#captcha-internal"]);

    let profile = SiteProfile::default();
    let detector = ChallengeDetector::new(profile.clone(), Duration::from_millis(10));
    let resolver = ChallengeResolver::new(
        profile.clone(),
        "s3cret",
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_secs(30),
        Duration::from_millis(50),
    );
    let obs = ChallengeObservation {
        challenge: Challenge::SecurityChallenge,
        url: CHECKPOINT.to_string(),
        confidence: Confidence::Element,
    };
    let (tx, mut rx) = watch::channel(false);
    tx.send(true).unwrap();

    let start = Instant::now();
    let outcome = resolver.resolve(&browser, &obs, &detector, &mut rx).await;
    assert_eq!(outcome, ResolveOutcome::TimedOut);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "shutdown must cut the wait short of the 30s ceiling"
    );
}

/// The reconfirm remedy trusts the page, not the click: resolution counts
/// only when the reconfirm UI is actually gone afterwards.
#[tokio::test]
async fn identity_reconfirm_resolves_only_when_ui_disappears() {
    init_logger();
    let profile = SiteProfile::default();
    let detector = ChallengeDetector::new(profile.clone(), Duration::from_millis(10));
    let resolver = test_resolver(&profile);
    let (_tx, mut rx) = watch::channel(false);

    // Tile clicked but the checkpoint URL fragment remains — failure.
    let reconfirm_url = "https://www.linkedin.com/checkpoint/rm/sign-in-another-account";
    let stuck = MockBrowser(Arc::new(MockState::default()));
    *stuck.0.current.lock().unwrap() = reconfirm_url.to_string();
    stuck.show(reconfirm_url, &[".profile__details"]);
    let obs = ChallengeObservation {
        challenge: Challenge::IdentityReconfirm,
        url: reconfirm_url.to_string(),
        confidence: Confidence::UrlPattern,
    };
    let outcome = resolver.resolve(&stuck, &obs, &detector, &mut rx).await;
    assert_eq!(outcome, ResolveOutcome::Failed);
    assert!(!stuck.0.clicks.lock().unwrap().is_empty());

    // No reconfirm fragment or marker left after the click — resolved.
    let clean_url = "https://www.linkedin.com/m/resume-account";
    let cleared = MockBrowser(Arc::new(MockState::default()));
    *cleared.0.current.lock().unwrap() = clean_url.to_string();
    cleared.show(clean_url, &[".profile__details"]);
    let obs = ChallengeObservation {
        challenge: Challenge::IdentityReconfirm,
        url: clean_url.to_string(),
        confidence: Confidence::Element,
    };
    let outcome = resolver.resolve(&cleared, &obs, &detector, &mut rx).await;
    assert_eq!(outcome, ResolveOutcome::Resolved);
}

/// LoginWall and Unknown observations resolve to NeedsCredentials without
/// touching the page.
#[tokio::test]
async fn login_wall_and_unknown_need_credentials() {
    init_logger();
    let browser = MockBrowser(Arc::new(MockState::default()));
    let profile = SiteProfile::default();
    let detector = ChallengeDetector::new(profile.clone(), Duration::from_millis(10));
    let resolver = test_resolver(&profile);
    let (_tx, mut rx) = watch::channel(false);

    for challenge in [Challenge::LoginWall, Challenge::Unknown] {
        let obs = ChallengeObservation {
            challenge,
            url: AUTHWALL.to_string(),
            confidence: Confidence::UrlPattern,
        };
        let outcome = resolver.resolve(&browser, &obs, &detector, &mut rx).await;
        assert_eq!(outcome, ResolveOutcome::NeedsCredentials);
    }
    assert!(browser.0.clicks.lock().unwrap().is_empty());
    assert!(browser.0.fills.lock().unwrap().is_empty());
}
