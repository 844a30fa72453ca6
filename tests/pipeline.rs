//! End-to-end pipeline tests: profile detection through extraction and
//! normalization on static HTML, plus automation driver and mutation monitor
//! behavior against scripted fake pages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use lotpilot::automation::{AutomationError, AutomationTask, Driver, FieldAssignment, FieldKind};
use lotpilot::browser::{Navigation, PageHandle};
use lotpilot::config::PacingConfig;
use lotpilot::extract::extract_many;
use lotpilot::extract::normalize::normalize_batch;
use lotpilot::monitor::{MonitorGate, MutationMonitor};
use lotpilot::profiles::registry;

// ── Scrape pipeline ──────────────────────────────────────────────────────

const CRAIGSLIST_SEARCH: &str = r#"
<html><body>
  <ul>
    <li class="result-row">
      <a class="result-title" href="/cto/d/1.html">2015 Honda Civic LX</a>
      <span class="result-price">$8,995</span>
    </li>
    <li class="result-row">
      <a class="result-title" href="/cto/d/2.html">2012 Ford Focus - parts car</a>
    </li>
    <li class="result-row">
      <a class="result-title" href="/cto/d/3.html">2020 Chevy Silverado 1500</a>
      <span class="result-price">$31,500</span>
    </li>
  </ul>
</body></html>"#;

#[test]
fn test_search_page_detect_extract_normalize() {
    let url = "https://sfbay.craigslist.org/search/cta";
    let profile = registry().detect(url, CRAIGSLIST_SEARCH).unwrap();
    assert_eq!(profile.id, "craigslist");

    let raws = extract_many(CRAIGSLIST_SEARCH, url, profile);
    assert_eq!(raws.len(), 3);

    let (listings, stats) = normalize_batch(raws, url, &profile.id);

    // The middle row has no price and is dropped; order is preserved.
    assert_eq!(listings.len(), 2);
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.rejected_missing_price, 1);
    assert_eq!(stats.rejected_missing_title, 0);

    let civic = &listings[0];
    assert_eq!(civic.title, "2015 Honda Civic LX");
    assert_eq!(civic.price, "8995");
    // Inference fills year/make from the title text.
    assert_eq!(civic.year, "2015");
    assert_eq!(civic.make, "Honda");
    assert_eq!(civic.source_site, "craigslist");

    let truck = &listings[1];
    assert_eq!(truck.price, "31500");
    assert_eq!(truck.make, "Chevrolet", "alias resolves to canonical make");
}

#[test]
fn test_unknown_dealer_page_uses_generic_profile() {
    let html = r#"
    <html><body>
      <div class="vehicle-card">
        <h2 class="listing-title">2018 Toyota RAV4 XLE AWD</h2>
        <span class="price">$21,400</span>
        <span class="mileage">44,210 miles</span>
        <div class="vin">JTMRFREV5JD220110</div>
      </div>
    </body></html>"#;

    let url = "https://www.smalltown-motors.example.com/inventory/rav4";
    let profile = registry().detect(url, html).unwrap();
    assert_eq!(profile.id, "generic");

    let raws = extract_many(html, url, profile);
    let (listings, stats) = normalize_batch(raws, url, &profile.id);
    assert_eq!(stats.accepted, 1);

    let rav4 = &listings[0];
    assert_eq!(rav4.title, "2018 Toyota RAV4 XLE AWD");
    assert_eq!(rav4.price, "21400");
    assert_eq!(rav4.mileage, "44210");
    assert_eq!(rav4.vin, "JTMRFREV5JD220110");
}

#[test]
fn test_non_listing_page_detects_nothing() {
    let html = "<html><body><h1>Quarterly report</h1></body></html>";
    assert!(registry().detect("https://news.example.com/q3", html).is_none());
}

// ── Automation driver ────────────────────────────────────────────────────

#[derive(Default)]
struct FormState {
    /// Selectors that "exist" on the page.
    present: Vec<String>,
    /// Characters typed through keystroke scripts, in order.
    typed: Vec<String>,
    clears: usize,
    submit_clicks: usize,
}

/// A scripted page that answers the driver's generated JS by inspecting it.
struct FakeFormPage {
    state: Arc<StdMutex<FormState>>,
}

impl FakeFormPage {
    fn new(present: &[&str]) -> (Self, Arc<StdMutex<FormState>>) {
        let state = Arc::new(StdMutex::new(FormState {
            present: present.iter().map(|s| s.to_string()).collect(),
            ..FormState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl PageHandle for FakeFormPage {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> Result<Navigation> {
        Ok(Navigation {
            final_url: url.to_string(),
            load_time_ms: 1,
        })
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let mut st = self.state.lock().unwrap();

        if let Some(rest) = script.strip_prefix("!!document.querySelector(") {
            let selector: String = serde_json::from_str(rest.trim_end_matches(')'))?;
            return Ok(Value::Bool(st.present.contains(&selector)));
        }
        if script.contains("el.focus();") {
            st.clears += 1;
            return Ok(Value::Bool(true));
        }
        if script.contains("el.value = el.value + ") {
            let idx = script.find("el.value + ").unwrap() + "el.value + ".len();
            let rest = &script[idx..];
            let ch: String = serde_json::from_str(&rest[..rest.find(';').unwrap()])?;
            st.typed.push(ch);
            return Ok(Value::Bool(true));
        }
        if script.contains("tagName === 'SELECT'") {
            return Ok(Value::String("selected".to_string()));
        }
        if script.contains("const labels =") {
            st.submit_clicks += 1;
            return Ok(Value::Bool(true));
        }
        // blur / change dispatch
        Ok(Value::Bool(true))
    }

    async fn html(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn url(&self) -> Result<String> {
        Ok("https://example.com/sell/form".to_string())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn text_assignment(key: &str, selector: &str, value: &str) -> FieldAssignment {
    FieldAssignment {
        field_key: key.to_string(),
        selectors: vec![selector.to_string()],
        value: value.to_string(),
        kind: FieldKind::Text,
    }
}

#[tokio::test]
async fn test_missing_form_is_fatal_with_zero_writes() {
    let (mut page, state) = FakeFormPage::new(&[]);
    let driver = Driver::new(PacingConfig::zero());
    let mut task = AutomationTask::new("form#sell");
    task.assignments
        .push(text_assignment("title", "input[name='title']", "2015 Honda Civic"));

    let err = driver.run(&mut page, &mut task).await.unwrap_err();
    assert!(matches!(err, AutomationError::TargetMissing { .. }));

    let st = state.lock().unwrap();
    assert_eq!(st.typed.len(), 0, "no field writes after a fatal wait");
    assert_eq!(st.clears, 0);
    assert_eq!(st.submit_clicks, 0);
}

#[tokio::test]
async fn test_optional_missing_control_skips_and_continues() {
    let (mut page, state) = FakeFormPage::new(&["form#sell", "input[name='title']"]);
    let driver = Driver::new(PacingConfig::zero());
    let mut task = AutomationTask::new("form#sell");
    task.assignments
        .push(text_assignment("title", "input[name='title']", "Civic"));
    task.assignments
        .push(text_assignment("price", "input[name='price']", "8995"));

    let report = driver.run(&mut page, &mut task).await.unwrap();
    assert_eq!(report.filled, vec!["title"]);
    assert_eq!(report.skipped, vec!["price"]);
    assert!(report.submitted, "skipped field must not abort the task");
    assert_eq!(state.lock().unwrap().submit_clicks, 1);
}

#[tokio::test]
async fn test_typing_is_per_character() {
    let (mut page, state) = FakeFormPage::new(&["form#sell", "input[name='title']"]);
    let driver = Driver::new(PacingConfig::zero());
    let mut task = AutomationTask::new("form#sell");
    task.assignments
        .push(text_assignment("title", "input[name='title']", "Civic"));

    driver.run(&mut page, &mut task).await.unwrap();

    let st = state.lock().unwrap();
    assert_eq!(st.typed.join(""), "Civic");
    assert_eq!(st.typed.len(), 5);
}

#[tokio::test]
async fn test_menu_assignment_uses_native_select() {
    let (mut page, _state) = FakeFormPage::new(&["form#sell", "select[name='condition']"]);
    let driver = Driver::new(PacingConfig::zero());
    let mut task = AutomationTask::new("form#sell");
    task.assignments.push(FieldAssignment {
        field_key: "condition".to_string(),
        selectors: vec!["select[name='condition']".to_string()],
        value: "Excellent".to_string(),
        kind: FieldKind::Menu,
    });

    let report = driver.run(&mut page, &mut task).await.unwrap();
    assert_eq!(report.filled, vec!["condition"]);
}

#[tokio::test]
async fn test_submit_is_at_most_once_across_retry() {
    let (mut page, state) = FakeFormPage::new(&["form#sell"]);
    let driver = Driver::new(PacingConfig::zero());
    let mut task = AutomationTask::new("form#sell");

    let report = driver.run(&mut page, &mut task).await.unwrap();
    assert!(report.submitted);
    assert!(task.consumed());

    // A blind retry of the same task must not reach the page again.
    let err = driver.run(&mut page, &mut task).await.unwrap_err();
    assert!(matches!(err, AutomationError::AlreadyConsumed(_)));
    assert_eq!(state.lock().unwrap().submit_clicks, 1);
}

#[test]
fn test_task_file_from_disk() {
    use std::io::Write as _;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "form_selector": "form#sell",
            "assignments": [
                {{"field_key": "title", "selectors": ["input[name='title']"],
                  "value": "2015 Honda Civic", "kind": "Text"}}
            ],
            "image_manifest": ["https://cdn.example.com/1.jpg"]
        }}"#
    )
    .unwrap();

    let raw = std::fs::read_to_string(file.path()).unwrap();
    let task: AutomationTask = serde_json::from_str(&raw).unwrap();
    assert_eq!(task.form_selector, "form#sell");
    assert_eq!(task.assignments.len(), 1);
    assert_eq!(task.assignments[0].kind, FieldKind::Text);
    assert!(!task.consumed());
}

#[tokio::test]
async fn test_photos_fetched_and_attached() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (mut page, _state) = FakeFormPage::new(&["form#sell", "input[type='file']"]);
    let driver = Driver::new(PacingConfig::zero());
    let mut task = AutomationTask::new("form#sell");
    task.image_manifest = vec![
        format!("{}/a.jpg", server.uri()),
        format!("{}/b.jpg", server.uri()),
    ];

    let report = driver.run(&mut page, &mut task).await.unwrap();
    // The 404 is skipped with a warning; the rest still upload.
    assert_eq!(report.images_attached, 1);
}

// ── Mutation monitor ─────────────────────────────────────────────────────

/// A conversation page whose observer queue drains come from a script.
struct FakeThreadPage {
    container_present: bool,
    /// Number of drain evaluations to fail before answering normally.
    fail_drains: Arc<StdMutex<usize>>,
    drains: Arc<StdMutex<VecDeque<Value>>>,
}

#[async_trait]
impl PageHandle for FakeThreadPage {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> Result<Navigation> {
        Ok(Navigation {
            final_url: url.to_string(),
            load_time_ms: 1,
        })
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        if script.contains("new MutationObserver") {
            return Ok(Value::Bool(self.container_present));
        }
        if script.contains("window.__lpQueue || []") {
            {
                let mut remaining = self.fail_drains.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("Execution context was destroyed");
                }
            }
            let next = self.drains.lock().unwrap().pop_front();
            return Ok(next.unwrap_or_else(|| json!([])));
        }
        Ok(Value::Null)
    }

    async fn html(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn url(&self) -> Result<String> {
        Ok("https://example.com/messages/t/42".to_string())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn thread_page(drains: &[Value], container_present: bool) -> Arc<Mutex<Box<dyn PageHandle>>> {
    flaky_thread_page(drains, container_present, 0)
}

fn flaky_thread_page(
    drains: &[Value],
    container_present: bool,
    fail_drains: usize,
) -> Arc<Mutex<Box<dyn PageHandle>>> {
    let page = FakeThreadPage {
        container_present,
        fail_drains: Arc::new(StdMutex::new(fail_drains)),
        drains: Arc::new(StdMutex::new(drains.iter().cloned().collect())),
    };
    Arc::new(Mutex::new(Box::new(page)))
}

fn node(signature: &str, text: &str) -> Value {
    json!({ "signature": signature, "text": text, "classes": "message-bubble" })
}

#[tokio::test]
async fn test_monitor_requires_container() {
    let page = thread_page(&[], false);
    let monitor = MutationMonitor::new(MonitorGate::new());
    let err = monitor.watch(page, "[role='main']").await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test(start_paused = true)]
async fn test_monitor_forwards_drained_batches() {
    let page = thread_page(&[json!([node("m1", "is it available?")])], true);
    let monitor = MutationMonitor::new(MonitorGate::new());
    let mut rx = monitor.watch(page, "[role='main']").await.unwrap();

    let batch = rx.recv().await.unwrap().unwrap();
    assert_eq!(batch.nodes.len(), 1);
    assert_eq!(batch.nodes[0].signature, "m1");
    assert_eq!(batch.nodes[0].text, "is it available?");
}

#[tokio::test(start_paused = true)]
async fn test_monitor_survives_transient_drain_failure() {
    let page = flaky_thread_page(&[json!([node("m1", "still there?")])], true, 1);
    let monitor = MutationMonitor::new(MonitorGate::new());
    let mut rx = monitor.watch(page, "[role='main']").await.unwrap();

    // First drain errors, the next one recovers and delivers the batch.
    let batch = rx.recv().await.unwrap().unwrap();
    assert_eq!(batch.nodes[0].signature, "m1");
}

#[tokio::test(start_paused = true)]
async fn test_monitor_surfaces_persistent_drain_failure() {
    let page = flaky_thread_page(&[], true, 10);
    let monitor = MutationMonitor::new(MonitorGate::new());
    let mut rx = monitor.watch(page, "[role='main']").await.unwrap();

    let err = rx.recv().await.unwrap().unwrap_err();
    assert!(err.to_string().contains("stopped answering"));
    // Terminal error closes the stream.
    assert!(rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_paused_gate_buffers_batches_in_order() {
    let page = thread_page(
        &[
            json!([node("m1", "first")]),
            json!([node("m2", "second")]),
        ],
        true,
    );
    let gate = MonitorGate::new();
    gate.pause();

    let monitor = MutationMonitor::new(gate.clone());
    let mut rx = monitor.watch(page, "[role='main']").await.unwrap();

    // Several drain cycles pass while an automation task holds the gate.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(rx.try_recv().is_err(), "nothing delivered while paused");

    gate.resume();
    let batch = rx.recv().await.unwrap().unwrap();
    let sigs: Vec<_> = batch.nodes.iter().map(|n| n.signature.as_str()).collect();
    assert_eq!(sigs, vec!["m1", "m2"], "held batches delivered in order");
}
