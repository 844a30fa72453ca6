//! Pacing and wait-budget configuration.
//!
//! Every artificial delay the automation driver sleeps through lives here as
//! a named field rather than a literal scattered through the driver, so tests
//! can substitute [`PacingConfig::zero`] and run the same code paths without
//! wall-clock time.

use std::time::Duration;

/// Hard cap on images per listing, both at extraction and at upload time.
pub const MAX_IMAGES: usize = 10;

/// Delays used to make driven input look like interactive typing and to give
/// target pages time to react to injected events.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Sleep between individual keystrokes during a field fill.
    pub inter_character_delay: Duration,
    /// Extra random jitter added on top of each keystroke delay (upper bound).
    pub typing_jitter: Duration,
    /// Settle time after opening a dropdown/menu before scanning options.
    pub menu_settle_delay: Duration,
    /// Per-file wait after injecting images into an upload control.
    pub per_image_upload_delay: Duration,
    /// Settle time after clicking a submit control.
    pub submit_settle_delay: Duration,
    /// Polling interval for element-appearance waits.
    pub wait_poll_interval: Duration,
    /// Budget for the initial destination-form wait.
    pub form_wait_budget: Duration,
}

impl PacingConfig {
    /// Zero-delay pacing for tests. Same code paths, no wall-clock sleeps.
    pub fn zero() -> Self {
        Self {
            inter_character_delay: Duration::ZERO,
            typing_jitter: Duration::ZERO,
            menu_settle_delay: Duration::ZERO,
            per_image_upload_delay: Duration::ZERO,
            submit_settle_delay: Duration::ZERO,
            wait_poll_interval: Duration::ZERO,
            form_wait_budget: Duration::from_millis(50),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            inter_character_delay: Duration::from_millis(45),
            typing_jitter: Duration::from_millis(30),
            menu_settle_delay: Duration::from_millis(800),
            per_image_upload_delay: Duration::from_millis(1500),
            submit_settle_delay: Duration::from_millis(2000),
            wait_poll_interval: Duration::from_millis(250),
            form_wait_budget: Duration::from_secs(15),
        }
    }
}

/// How often the mutation monitor drains the injected observer queue.
pub const MONITOR_DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive drain failures tolerated before the monitor gives up on a
/// page. Page re-renders routinely drop a single evaluation.
pub const MONITOR_DRAIN_FAILURE_LIMIT: usize = 3;

/// Request timeout for backend collaborator calls.
pub const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Request timeout for fetching a single listing image.
pub const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
