//! Browser abstraction for driving live listing pages.
//!
//! The automation driver and mutation monitor never talk to chromiumoxide
//! directly; they work against the [`PageHandle`] trait so tests can swap in
//! a scripted fake page. [`BrowserEngine`] creates page handles and owns the
//! underlying browser process.

pub mod chromium;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of navigating a page to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Navigation {
    /// The final URL after any redirects.
    pub final_url: String,
    /// Time taken to load the page in milliseconds.
    pub load_time_ms: u64,
}

/// A browser engine that can open pages.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Open a new page (tab).
    async fn new_page(&self) -> Result<Box<dyn PageHandle>>;
    /// Shut down the browser engine.
    async fn shutdown(&self) -> Result<()>;
    /// Number of currently open pages.
    fn open_pages(&self) -> usize;
}

/// One live, externally-rendered page.
///
/// All interaction — field fills, clicks, observer queue drains — goes
/// through `evaluate`, which runs a JS expression in the page context and
/// returns its JSON value. This is the single shared mutable resource of a
/// session; callers serialize writes to it (see the automation driver).
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate to a URL with a timeout.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<Navigation>;
    /// Evaluate a JS expression in the page and return the result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;
    /// Full page HTML snapshot.
    async fn html(&self) -> Result<String>;
    /// Current page URL.
    async fn url(&self) -> Result<String>;
    /// Close this page.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A no-op engine used when Chromium is unavailable. Every page request
/// fails with a setup hint instead of a launch backtrace.
pub struct NoopEngine;

#[async_trait]
impl BrowserEngine for NoopEngine {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>> {
        Err(anyhow::anyhow!(
            "browser not available — run `lotpilot doctor` to check Chromium discovery"
        ))
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    fn open_pages(&self) -> usize {
        0
    }
}

/// Launch the best engine available: Chromium when it can be discovered and
/// started, otherwise [`NoopEngine`].
pub async fn default_engine() -> Box<dyn BrowserEngine> {
    match chromium::ChromiumEngine::launch().await {
        Ok(engine) => Box::new(engine),
        Err(e) => {
            tracing::warn!(error = %e, "no Chromium, browser operations will fail");
            Box::new(NoopEngine)
        }
    }
}
