//! DOM automation driver.
//!
//! Executes an [`AutomationTask`] — a scripted sequence of field fills,
//! media attachment, menu selection, and submission — against a live page
//! with human-plausible pacing and bounded waiting. Used both for listing
//! publication and for sending chat replies.
//!
//! All interaction goes through [`PageHandle::evaluate`] with JS built the
//! same way for every target site; values are embedded as JSON string
//! literals so nothing can break out of a JS string context. The driver
//! takes the page by `&mut` so the type system enforces the single-writer
//! rule: no two tasks can run against the same page concurrently.
//!
//! Failure semantics: a control that never appears for an optional step is
//! skipped with a warning and the task continues. Total absence of the
//! destination form after the initial wait is fatal and reported to the
//! caller, which owns any retry decision. A task is consumed before its
//! submit scan, so a caller retry after an ambiguous failure can never click
//! submit twice.

use crate::browser::PageHandle;
use crate::config::{PacingConfig, IMAGE_FETCH_TIMEOUT, MAX_IMAGES};
use crate::events::{EventBus, LotEvent};
use crate::monitor::MonitorGate;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Caller-visible failure taxonomy for one task.
#[derive(Debug, Error)]
pub enum AutomationError {
    /// The destination form/control never appeared within its wait budget.
    /// Fatal for the task; zero writes were performed.
    #[error("target {selector:?} never appeared within {waited_ms}ms")]
    TargetMissing { selector: String, waited_ms: u64 },

    /// The task was already run once. Submission is at-most-once per task,
    /// even across a failure-and-retry cycle.
    #[error("task {0} was already consumed")]
    AlreadyConsumed(String),

    /// The page itself failed underneath us (navigation, JS evaluation).
    #[error(transparent)]
    Page(#[from] anyhow::Error),
}

/// How a field is written: typed text or a menu choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Menu,
}

/// One field to set, with its ordered candidate selector chain (same
/// fallback policy as extraction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldAssignment {
    pub field_key: String,
    pub selectors: Vec<String>,
    pub value: String,
    pub kind: FieldKind,
}

/// Submit control description: candidate selectors plus a small label
/// synonym set matched exactly first, then by substring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAction {
    pub labels: Vec<String>,
}

impl Default for SubmitAction {
    fn default() -> Self {
        Self {
            labels: ["publish", "post", "submit", "list it", "send"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// A publish or reply request. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTask {
    #[serde(default = "new_task_id")]
    pub id: String,
    /// Selector the destination form must satisfy before any write happens.
    pub form_selector: String,
    pub assignments: Vec<FieldAssignment>,
    /// Image source URLs to download and attach, capped at [`MAX_IMAGES`].
    #[serde(default)]
    pub image_manifest: Vec<String>,
    /// Candidate selectors for the file upload control.
    #[serde(default = "default_upload_selectors")]
    pub upload_selectors: Vec<String>,
    #[serde(default)]
    pub submit: SubmitAction,
    #[serde(skip)]
    consumed: bool,
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_upload_selectors() -> Vec<String> {
    vec!["input[type='file']".to_string()]
}

impl AutomationTask {
    pub fn new(form_selector: impl Into<String>) -> Self {
        Self {
            id: new_task_id(),
            form_selector: form_selector.into(),
            assignments: Vec::new(),
            image_manifest: Vec::new(),
            upload_selectors: default_upload_selectors(),
            submit: SubmitAction::default(),
            consumed: false,
        }
    }

    pub fn consumed(&self) -> bool {
        self.consumed
    }

    /// Overwrite description/price assignment values with backend-optimized
    /// ones. Empty enhancement fields leave the original values alone.
    pub fn apply_enhancement(&mut self, enhancement: &crate::backend::ListingEnhancement) {
        for assignment in &mut self.assignments {
            match assignment.field_key.as_str() {
                "description" if !enhancement.optimized_description.is_empty() => {
                    assignment.value = enhancement.optimized_description.clone();
                }
                "price" if !enhancement.recommended_price.is_empty() => {
                    assignment.value = enhancement.recommended_price.clone();
                }
                _ => {}
            }
        }
    }
}

/// What actually happened during a task. Partial completion is legal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReport {
    pub filled: Vec<String>,
    pub skipped: Vec<String>,
    pub images_attached: usize,
    pub submitted: bool,
}

/// The driver owns pacing, an HTTP client for image fetches, and optional
/// hooks into the event bus and the monitor's forwarding gate.
pub struct Driver {
    pacing: PacingConfig,
    http: reqwest::Client,
    events: Option<Arc<EventBus>>,
    gate: Option<MonitorGate>,
}

impl Driver {
    pub fn new(pacing: PacingConfig) -> Self {
        Self {
            pacing,
            http: reqwest::Client::new(),
            events: None,
            gate: None,
        }
    }

    /// Emit task lifecycle events on this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Pause this monitor gate while a task is mid-flight, so inbound
    /// message forwarding never interleaves with writes to the same page.
    pub fn with_monitor_gate(mut self, gate: MonitorGate) -> Self {
        self.gate = Some(gate);
        self
    }

    fn emit(&self, event: LotEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    /// Execute a task against a live page.
    pub async fn run(
        &self,
        page: &mut dyn PageHandle,
        task: &mut AutomationTask,
    ) -> Result<TaskReport, AutomationError> {
        if task.consumed {
            return Err(AutomationError::AlreadyConsumed(task.id.clone()));
        }

        let start = Instant::now();
        let url = page.url().await.unwrap_or_default();
        self.emit(LotEvent::TaskStarted {
            task_id: task.id.clone(),
            url,
        });

        if let Some(gate) = &self.gate {
            gate.pause();
        }
        let result = self.run_inner(page, task).await;
        if let Some(gate) = &self.gate {
            gate.resume();
        }

        match &result {
            Ok(report) => self.emit(LotEvent::TaskComplete {
                task_id: task.id.clone(),
                fields_filled: report.filled.len(),
                fields_skipped: report.skipped.len(),
                images_attached: report.images_attached,
                submitted: report.submitted,
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
            Err(e) => self.emit(LotEvent::TaskFailed {
                task_id: task.id.clone(),
                error: e.to_string(),
            }),
        }
        result
    }

    async fn run_inner(
        &self,
        page: &mut dyn PageHandle,
        task: &mut AutomationTask,
    ) -> Result<TaskReport, AutomationError> {
        // The destination form must exist before any write.
        self.wait_for(&*page, &task.form_selector, self.pacing.form_wait_budget)
            .await?;

        let mut report = TaskReport::default();

        for assignment in &task.assignments {
            let done = match assignment.kind {
                FieldKind::Text => self.fill_field(&*page, assignment).await?,
                FieldKind::Menu => self.select_option(&*page, assignment).await?,
            };
            if done {
                report.filled.push(assignment.field_key.clone());
            } else {
                tracing::warn!(
                    field = %assignment.field_key,
                    "no usable control found, skipping"
                );
                report.skipped.push(assignment.field_key.clone());
            }
        }

        report.images_attached = self.attach_images(&*page, task).await?;

        // Consume before the submit scan: a retry after an ambiguous failure
        // must never be able to click submit a second time.
        task.consumed = true;

        report.submitted = self.click_submit(&*page, &task.submit).await?;
        if report.submitted {
            tokio::time::sleep(self.pacing.submit_settle_delay).await;
        } else {
            tracing::warn!(task = %task.id, "no submit control matched, leaving unsubmitted");
        }

        Ok(report)
    }

    /// Bounded element-appearance wait: resolves on first match, fails with
    /// [`AutomationError::TargetMissing`] when the budget elapses.
    pub async fn wait_for(
        &self,
        page: &dyn PageHandle,
        selector: &str,
        budget: Duration,
    ) -> Result<(), AutomationError> {
        let start = Instant::now();
        loop {
            let script = format!("!!document.querySelector({})", js_str(selector));
            let found = page
                .evaluate(&script)
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if found {
                return Ok(());
            }
            if start.elapsed() >= budget {
                return Err(AutomationError::TargetMissing {
                    selector: selector.to_string(),
                    waited_ms: budget.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.pacing.wait_poll_interval).await;
        }
    }

    /// Locate the first usable control in the candidate chain, clear it,
    /// then write the value character by character so the page's own input
    /// listeners fire as they would for a human.
    async fn fill_field(
        &self,
        page: &dyn PageHandle,
        assignment: &FieldAssignment,
    ) -> Result<bool, AutomationError> {
        let Some(selector) = self.first_present(page, &assignment.selectors).await else {
            return Ok(false);
        };

        let clear = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.focus();
                el.value = '';
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = js_str(&selector)
        );
        if !truthy(page.evaluate(&clear).await?) {
            return Ok(false);
        }

        for ch in assignment.value.chars() {
            let keystroke = format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return false;
                    el.value = el.value + {ch};
                    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    el.dispatchEvent(new Event('keyup', {{ bubbles: true }}));
                    return true;
                }})()"#,
                sel = js_str(&selector),
                ch = js_str(&ch.to_string()),
            );
            if !truthy(page.evaluate(&keystroke).await?) {
                // Control vanished mid-fill (re-render); count as skipped.
                tracing::warn!(field = %assignment.field_key, "control vanished mid-fill");
                return Ok(false);
            }
            tokio::time::sleep(self.keystroke_delay()).await;
        }

        let blur = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (el) el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = js_str(&selector)
        );
        let _ = page.evaluate(&blur).await;
        Ok(true)
    }

    /// Open a menu control, wait for it to settle, then click the first
    /// visible option whose text contains the wanted value
    /// (case-insensitive). Native `<select>` elements short-circuit.
    async fn select_option(
        &self,
        page: &dyn PageHandle,
        assignment: &FieldAssignment,
    ) -> Result<bool, AutomationError> {
        let Some(selector) = self.first_present(page, &assignment.selectors).await else {
            return Ok(false);
        };

        let open = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                if (el.tagName === 'SELECT') {{
                    const want = {want}.toLowerCase();
                    const m = [...el.options].find(o => o.textContent.toLowerCase().includes(want));
                    if (!m) return false;
                    el.value = m.value;
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return 'selected';
                }}
                el.click();
                return 'opened';
            }})()"#,
            sel = js_str(&selector),
            want = js_str(&assignment.value),
        );

        match page.evaluate(&open).await?.as_str() {
            Some("selected") => return Ok(true),
            Some("opened") => {}
            _ => return Ok(false),
        }

        tokio::time::sleep(self.pacing.menu_settle_delay).await;

        let pick = format!(
            r#"(() => {{
                const want = {want}.toLowerCase();
                const nodes = [...document.querySelectorAll(
                    "[role='option'], li[class*='option'], .dropdown-item, [role='menuitem']"
                )];
                const m = nodes.find(n => (n.textContent || '').toLowerCase().includes(want));
                if (!m) return false;
                m.click();
                return true;
            }})()"#,
            want = js_str(&assignment.value),
        );
        Ok(truthy(page.evaluate(&pick).await?))
    }

    /// Download each manifest image (bounded to [`MAX_IMAGES`]), wrap the
    /// set as File objects, and inject them into the upload control in one
    /// batch. The post-injection wait scales with the number of files — a
    /// processing-time heuristic, not a completion signal.
    async fn attach_images(
        &self,
        page: &dyn PageHandle,
        task: &AutomationTask,
    ) -> Result<usize, AutomationError> {
        if task.image_manifest.is_empty() {
            return Ok(0);
        }
        let Some(selector) = self.first_present(page, &task.upload_selectors).await else {
            tracing::warn!(task = %task.id, "no upload control found, skipping images");
            return Ok(0);
        };

        let mut files: Vec<(String, String, String)> = Vec::new();
        for (i, url) in task.image_manifest.iter().take(MAX_IMAGES).enumerate() {
            match self.fetch_image(url).await {
                Ok(bytes) => {
                    let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    let mime = mime_for(url);
                    let name = format!("photo-{}.{}", i + 1, ext_for(mime));
                    files.push((name, mime.to_string(), b64));
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "image fetch failed, skipping");
                }
            }
        }
        if files.is_empty() {
            return Ok(0);
        }

        let manifest = serde_json::to_string(&files).unwrap_or_else(|_| "[]".to_string());
        let inject = format!(
            r#"(() => {{
                const input = document.querySelector({sel});
                if (!input) return false;
                const dt = new DataTransfer();
                for (const [name, mime, b64] of {manifest}) {{
                    const bytes = Uint8Array.from(atob(b64), c => c.charCodeAt(0));
                    dt.items.add(new File([bytes], name, {{ type: mime }}));
                }}
                input.files = dt.files;
                input.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = js_str(&selector),
        );

        if !truthy(page.evaluate(&inject).await?) {
            tracing::warn!(task = %task.id, "upload control rejected injection, skipping images");
            return Ok(0);
        }

        let count = files.len();
        tokio::time::sleep(self.pacing.per_image_upload_delay * count as u32).await;
        Ok(count)
    }

    /// Scan for a submit control by label: exact match against the synonym
    /// set first, then substring. Clicked-is-success — server-side
    /// acceptance is not verified here.
    async fn click_submit(
        &self,
        page: &dyn PageHandle,
        submit: &SubmitAction,
    ) -> Result<bool, AutomationError> {
        let labels = serde_json::to_string(
            &submit
                .labels
                .iter()
                .map(|l| l.to_lowercase())
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());

        let script = format!(
            r#"(() => {{
                const labels = {labels};
                const ctrls = [...document.querySelectorAll(
                    "button, input[type='submit'], [role='button']"
                )];
                const text = el => (el.innerText || el.value || el.getAttribute('aria-label') || '')
                    .trim().toLowerCase();
                let m = ctrls.find(el => labels.includes(text(el)));
                if (!m) m = ctrls.find(el => labels.some(l => text(el).includes(l)));
                if (!m) return false;
                m.click();
                return true;
            }})()"#,
        );
        Ok(truthy(page.evaluate(&script).await?))
    }

    /// First selector in the chain that currently matches an element.
    async fn first_present(&self, page: &dyn PageHandle, selectors: &[String]) -> Option<String> {
        for selector in selectors {
            let script = format!("!!document.querySelector({})", js_str(selector));
            let found = page
                .evaluate(&script)
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if found {
                return Some(selector.clone());
            }
        }
        None
    }

    async fn fetch_image(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .timeout(IMAGE_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    fn keystroke_delay(&self) -> Duration {
        let jitter_max = self.pacing.typing_jitter.as_millis() as u64;
        let jitter = if jitter_max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_max)
        };
        self.pacing.inter_character_delay + Duration::from_millis(jitter)
    }
}

/// Guess a MIME type from the image URL's extension. Listing CDNs serve
/// almost exclusively JPEG, so that is the fallback.
fn mime_for(url: &str) -> &'static str {
    let lower = url.to_ascii_lowercase();
    let path = lower.split('?').next().unwrap_or("");
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// File extension matching [`mime_for`].
fn ext_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

/// Embed a Rust string as a JS string literal. JSON string encoding is a
/// strict subset of JS, so nothing can escape the literal context.
pub(crate) fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn truthy(value: serde_json::Value) -> bool {
    value.as_bool().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_str_escaping() {
        assert_eq!(js_str("hello"), "\"hello\"");
        assert_eq!(js_str("it's"), "\"it's\"");
        let escaped = js_str("</script><script>alert(1)</script>");
        assert!(!escaped.contains('\n'));
        // The quote characters themselves are escaped
        assert_eq!(js_str("a\"b"), r#""a\"b""#);
        assert_eq!(js_str("line\nbreak"), r#""line\nbreak""#);
    }

    #[test]
    fn test_task_starts_unconsumed() {
        let task = AutomationTask::new("form#post");
        assert!(!task.consumed());
        assert_eq!(task.upload_selectors, vec!["input[type='file']"]);
    }

    #[test]
    fn test_task_file_defaults() {
        // Hand-written task files only need the form and the assignments.
        let task: AutomationTask =
            serde_json::from_str(r#"{"form_selector":"form#post","assignments":[]}"#).unwrap();
        assert!(!task.consumed());
        assert!(!task.id.is_empty());
        assert_eq!(task.upload_selectors, vec!["input[type='file']"]);
        assert!(task.submit.labels.contains(&"publish".to_string()));
    }

    #[test]
    fn test_apply_enhancement_overwrites_only_nonempty() {
        let mut task = AutomationTask::new("form#sell");
        for (key, value) in [("title", "2015 Honda Civic"), ("description", "runs"), ("price", "9500")] {
            task.assignments.push(FieldAssignment {
                field_key: key.to_string(),
                selectors: vec![format!("input[name='{key}']")],
                value: value.to_string(),
                kind: FieldKind::Text,
            });
        }

        task.apply_enhancement(&crate::backend::ListingEnhancement {
            optimized_description: "One owner, dealer maintained.".to_string(),
            recommended_price: String::new(),
            keywords: vec!["civic".to_string()],
        });

        let value = |key: &str| {
            task.assignments
                .iter()
                .find(|a| a.field_key == key)
                .map(|a| a.value.clone())
                .unwrap()
        };
        assert_eq!(value("description"), "One owner, dealer maintained.");
        // Empty recommendation keeps the task's own price
        assert_eq!(value("price"), "9500");
        assert_eq!(value("title"), "2015 Honda Civic");
    }

    #[test]
    fn test_default_submit_labels() {
        let submit = SubmitAction::default();
        assert!(submit.labels.iter().any(|l| l == "publish"));
        assert!(submit.labels.iter().any(|l| l == "send"));
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for("https://cdn.example.com/a.png"), "image/png");
        assert_eq!(mime_for("https://cdn.example.com/a.webp"), "image/webp");
        assert_eq!(mime_for("https://cdn.example.com/a.jpg"), "image/jpeg");
        assert_eq!(mime_for("https://cdn.example.com/a"), "image/jpeg");
        assert_eq!(ext_for("image/png"), "png");
    }
}
