//! chromiumoxide-backed [`BrowserHandle`].
//!
//! Covers: executable discovery (env override → PATH scan → well-known
//! paths), stealth launch flags, the CDP event-handler loop, and the page
//! primitives the session manager consumes. No scraping logic lives here.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BrowserError, BrowserFactory, BrowserHandle};
use crate::session::store::SessionToken;

/// Masks the most common automation giveaways before any site script runs.
const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', {get: () => undefined});
Object.defineProperty(navigator, 'plugins', {get: () => [1, 2, 3, 4, 5]});
Object.defineProperty(navigator, 'languages', {get: () => ['en-US', 'en']});
"#;

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH scan — finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
            "brave",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/brave-browser",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

/// Build a launch config with the stealth defaults the session manager needs.
///
/// `--disable-blink-features=AutomationControlled` hides the
/// `navigator.webdriver` flag at the process level; the rest is CI-friendly
/// hygiene. Headful is the default for login flows — a visible window is what
/// lets an operator resolve a security challenge by hand.
fn build_config(exe: &str, user_agent: &str, headless: bool) -> Result<BrowserConfig, BrowserError> {
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: 1366,
            height: 900,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(1366, 900)
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-crash-reporter")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", user_agent));

    if headless {
        builder = builder.arg("--disable-gpu").arg("--hide-scrollbars");
    } else {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| BrowserError::LaunchFailed(format!("config: {}", e)))
}

/// Reset an input's value and let the page's listeners know. Used before
/// typing so a fill replaces existing content instead of appending to it.
fn clear_field_script(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); if (el) {{ el.value = ''; \
         el.dispatchEvent(new Event('input', {{bubbles: true}})); }} }})()",
        sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".into())
    )
}

/// One live Chromium process plus the single page the session runs on.
pub struct CdpBrowser {
    browser: Mutex<Option<Browser>>,
    page: Page,
}

impl CdpBrowser {
    /// Launch a browser and prepare its page (stealth init script applied
    /// before any navigation).
    pub async fn launch(
        exe: &str,
        user_agent: &str,
        headless: bool,
    ) -> Result<Self, BrowserError> {
        info!("cdp: launching browser ({}) headless={}", exe, headless);
        let config = build_config(exe, user_agent, headless)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("{}: {}", exe, e)))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("cdp handler event error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("open page: {}", e)))?;

        if let Err(e) = page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(
                STEALTH_INIT_SCRIPT,
            ))
            .await
        {
            warn!("cdp: could not apply stealth init script: {}", e);
        }

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
        })
    }
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(BrowserError::Navigation(e.to_string())),
            Err(_) => Err(BrowserError::NavigationTimeout(timeout)),
        }
    }

    async fn find_visible(&self, selector: &str, timeout: Duration) -> bool {
        // offsetParent is null for display:none subtrees; getClientRects covers
        // position:fixed elements where offsetParent is also null.
        let probe = format!(
            "(() => {{ const el = document.querySelector({sel}); \
             return !!(el && (el.offsetParent !== null || el.getClientRects().length > 0)); }})()",
            sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".into())
        );

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let found = self
                .page
                .evaluate(probe.clone())
                .await
                .ok()
                .and_then(|v| v.into_value::<bool>().ok())
                .unwrap_or(false);
            if found {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::Interaction(format!("find {}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Interaction(format!("focus {}: {}", selector, e)))?;
        // type_str appends to whatever the field already holds (autofill, a
        // previous attempt), so reset the value first.
        self.page
            .evaluate(clear_field_script(selector))
            .await
            .map_err(|e| BrowserError::Interaction(format!("clear {}: {}", selector, e)))?;
        element
            .type_str(text)
            .await
            .map_err(|e| BrowserError::Interaction(format!("type into {}: {}", selector, e)))?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::Interaction(format!("find {}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Interaction(format!("click {}: {}", selector, e)))?;
        Ok(())
    }

    async fn current_url(&self) -> String {
        self.page.url().await.ok().flatten().unwrap_or_default()
    }

    async fn get_tokens(&self) -> Vec<SessionToken> {
        match self.page.get_cookies().await {
            Ok(cookies) => cookies
                .into_iter()
                .map(|c| SessionToken {
                    name: c.name,
                    value: c.value,
                    domain: c.domain,
                    path: c.path,
                })
                .collect(),
            Err(e) => {
                warn!("cdp: cookie snapshot failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn set_tokens(&self, tokens: &[SessionToken]) -> Result<(), BrowserError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let params: Vec<CookieParam> = tokens
            .iter()
            .map(|t| {
                let mut cookie = CookieParam::new(t.name.clone(), t.value.clone());
                cookie.domain = Some(t.domain.clone());
                cookie.path = Some(t.path.clone());
                cookie
            })
            .collect();
        let count = params.len();
        self.page
            .set_cookies(params)
            .await
            .map_err(|e| BrowserError::Interaction(format!("set cookies: {}", e)))?;
        info!("cdp: replayed {} session cookies", count);
        Ok(())
    }

    async fn run_script(&self, src: &str) -> Result<(), BrowserError> {
        self.page
            .evaluate(src.to_string())
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::Interaction(format!("script: {}", e)))
    }

    async fn close(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            if let Err(e) = browser.close().await {
                warn!("cdp: browser close error (non-fatal): {}", e);
            }
        }
    }
}

/// Launches a [`CdpBrowser`] per request from the state machine.
pub struct CdpBrowserFactory {
    executable: String,
    headless: bool,
}

impl CdpBrowserFactory {
    pub fn new(executable: impl Into<String>, headless: bool) -> Self {
        Self {
            executable: executable.into(),
            headless,
        }
    }

    /// Auto-discover the executable. Returns `None` when no Chromium-family
    /// browser is installed on this machine.
    pub fn auto(headless: bool) -> Option<Self> {
        find_chrome_executable().map(|exe| Self::new(exe, headless))
    }
}

#[async_trait]
impl BrowserFactory for CdpBrowserFactory {
    async fn launch(&self, user_agent: &str) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        let browser = CdpBrowser::launch(&self.executable, user_agent, self.headless).await?;
        Ok(Box::new(browser))
    }
}
