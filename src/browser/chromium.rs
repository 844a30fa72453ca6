//! Chromium-backed implementation of the browser traits via chromiumoxide.

use super::{BrowserEngine, Navigation, PageHandle};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Managed-install locations under `~/.lotpilot/chromium/`.
#[cfg(target_os = "macos")]
const MANAGED_RELATIVE: &[&str] = &[
    ".lotpilot/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
    ".lotpilot/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
    ".lotpilot/chromium/chrome",
];
#[cfg(not(target_os = "macos"))]
const MANAGED_RELATIVE: &[&str] = &[
    ".lotpilot/chromium/chrome-linux64/chrome",
    ".lotpilot/chromium/chrome",
];

const PATH_NAMES: &[&str] = &["google-chrome", "chromium", "chromium-browser"];

/// Find the Chromium binary: `LOTPILOT_CHROMIUM_PATH` wins, then the
/// managed install dir, then `PATH`, then the stock macOS app bundle.
pub fn find_chromium() -> Option<PathBuf> {
    let override_path = std::env::var("LOTPILOT_CHROMIUM_PATH")
        .ok()
        .map(PathBuf::from)
        .filter(|p| p.exists());
    if override_path.is_some() {
        return override_path;
    }

    if let Some(home) = dirs::home_dir() {
        if let Some(managed) = MANAGED_RELATIVE
            .iter()
            .map(|rel| home.join(rel))
            .find(|p| p.exists())
        {
            return Some(managed);
        }
    }

    if let Some(on_path) = PATH_NAMES.iter().find_map(|name| which::which(name).ok()) {
        return Some(on_path);
    }

    if cfg!(target_os = "macos") {
        let bundle =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if bundle.exists() {
            return Some(bundle);
        }
    }

    None
}

/// Chromium-based engine. Listing sites are JS-heavy, so the browser runs
/// headless but with a normal-looking window size.
pub struct ChromiumEngine {
    browser: Browser,
    open_count: Arc<AtomicUsize>,
}

impl ChromiumEngine {
    /// Launch a headless Chromium instance.
    pub async fn launch() -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found — set LOTPILOT_CHROMIUM_PATH or install Chrome")?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--window-size=1440,900")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        // Drive the CDP event loop
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self {
            browser,
            open_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("failed to open page")?;

        self.open_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumPage {
            page,
            open_count: Arc::clone(&self.open_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        // Browser process exits when the engine is dropped
        Ok(())
    }

    fn open_pages(&self) -> usize {
        self.open_count.load(Ordering::Relaxed)
    }
}

/// One Chromium tab.
pub struct ChromiumPage {
    page: Page,
    open_count: Arc<AtomicUsize>,
}

impl ChromiumPage {
    /// Marketplace pages render their listings client-side after the load
    /// event. Poll `readyState` within the remaining budget, then give
    /// hydration one extra beat; returning early on a skeleton DOM would
    /// hand the extractor an empty page.
    async fn settle(&self, deadline: Instant) {
        while Instant::now() < deadline {
            let ready = self
                .page
                .evaluate("document.readyState === 'complete'")
                .await
                .ok()
                .and_then(|v| v.into_value::<bool>().ok())
                .unwrap_or(false);
            if ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(HYDRATION_GRACE).await;
    }
}

/// Post-`readyState` grace for client-side listing hydration.
const HYDRATION_GRACE: Duration = Duration::from_millis(500);

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<Navigation> {
        let start = Instant::now();
        let budget = Duration::from_millis(timeout_ms);

        match tokio::time::timeout(budget, self.page.goto(url)).await {
            Ok(Ok(_response)) => {}
            Ok(Err(e)) => bail!("navigation failed: {e}"),
            Err(_) => bail!("navigation timed out after {timeout_ms}ms"),
        }
        let _ = self.page.wait_for_navigation().await;
        self.settle(start + budget).await;

        let final_url = self
            .page
            .url()
            .await
            .unwrap_or_default()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());

        Ok(Navigation {
            final_url,
            load_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS evaluation failed")?;

        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }

    async fn html(&self) -> Result<String> {
        self.page.content().await.context("failed to get HTML")
    }

    async fn url(&self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .context("failed to get URL")?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.open_count.fetch_sub(1, Ordering::Relaxed);
        let _ = self.page.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_navigate_and_evaluate() {
        let engine = ChromiumEngine::launch().await.expect("launch failed");
        let mut page = engine.new_page().await.expect("new page failed");

        let nav = page
            .navigate("data:text/html,<h1>Lot</h1><span class='price'>$5</span>", 10000)
            .await
            .expect("navigation failed");
        assert!(nav.load_time_ms < 10000);

        let result = page
            .evaluate("document.querySelector('.price').textContent")
            .await
            .expect("evaluate failed");
        assert_eq!(result.as_str().unwrap(), "$5");

        page.close().await.expect("close failed");
        assert_eq!(engine.open_pages(), 0);
    }
}
