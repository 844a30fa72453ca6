//! Mutation monitor — watches a live conversation thread for new messages.
//!
//! A `MutationObserver` is injected into the page on attach; it pushes a
//! snapshot of every newly-added element into a window-scoped queue. A
//! background task drains that queue on a fixed interval and forwards
//! [`DomChangeBatch`] values over an mpsc channel, so downstream consumers
//! are ordinary channel readers instead of nested callbacks. The full
//! document is never re-polled.
//!
//! Classification is pure: a node that *is a message bubble* and *is not
//! outgoing* becomes an [`InboundMessage`]. Nodes are deduplicated by a
//! signature computed in the page (stable id when present, content+position
//! hash otherwise), so overlapping batches can never emit the same message
//! twice. On attach, pre-existing unread-indicator nodes are walked once to
//! catch history missed while detached.
//!
//! While an automation task is mid-flight the [`MonitorGate`] is paused;
//! drained batches are buffered, not dropped, and delivered in order after
//! the task completes.

use crate::browser::PageHandle;
use crate::config::{MONITOR_DRAIN_FAILURE_LIMIT, MONITOR_DRAIN_INTERVAL};
use crate::events::{EventBus, LotEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Snapshot of one DOM node added to the watched container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Stable node identity computed in the page.
    pub signature: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub classes: String,
    #[serde(default)]
    pub role: String,
    /// Author name harvested from the surrounding row, when the markup
    /// exposes one. Empty for single-thread composers without headers.
    #[serde(default)]
    pub sender: String,
    /// True for nodes collected by the initial unread-indicator walk.
    #[serde(default)]
    pub unread: bool,
}

/// One drained burst of DOM changes, in document order of appearance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomChangeBatch {
    pub nodes: Vec<NodeSnapshot>,
}

/// A newly-detected buyer message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub text: String,
    pub signature: String,
    /// Author name when the page markup exposed one; empty otherwise.
    pub sender: String,
}

/// Structural/role heuristics for "this node is a message bubble".
pub fn is_message_bubble(node: &NodeSnapshot) -> bool {
    if node.text.trim().is_empty() {
        return false;
    }
    let classes = node.classes.to_ascii_lowercase();
    let role = node.role.to_ascii_lowercase();
    node.unread
        || role == "row"
        || role == "listitem"
        || ["message", "bubble", "chat-item", "msg"]
            .iter()
            .any(|hint| classes.contains(hint))
}

/// Presence of an "outgoing" marker: our own messages must not loop back in.
pub fn is_outgoing(node: &NodeSnapshot) -> bool {
    let classes = node.classes.to_ascii_lowercase();
    ["outgoing", "sent", "own-message", "self", "from-me"]
        .iter()
        .any(|hint| classes.contains(hint))
}

/// Classify a batch into inbound messages, deduplicating against `seen`.
///
/// Processing the same node twice (overlapping batches, observer quirks)
/// yields exactly one event. Order within the batch is preserved.
pub fn classify_batch(batch: &DomChangeBatch, seen: &mut HashSet<String>) -> Vec<InboundMessage> {
    let mut out = Vec::new();
    for node in &batch.nodes {
        if !seen.insert(node.signature.clone()) {
            continue;
        }
        if is_message_bubble(node) && !is_outgoing(node) {
            out.push(InboundMessage {
                text: node.text.trim().to_string(),
                signature: node.signature.clone(),
                sender: node.sender.trim().to_string(),
            });
        }
    }
    out
}

/// Pause/resume gate shared between the monitor and the automation driver.
///
/// Paused means "hold forwarded batches"; the drain task keeps draining the
/// page queue so nothing is lost, it just buffers delivery.
#[derive(Clone)]
pub struct MonitorGate {
    paused: Arc<AtomicBool>,
}

impl MonitorGate {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// JS injected once per page: installs the observer and the drain queue.
fn observer_script(container_selector: &str) -> String {
    format!(
        r#"(() => {{
            if (window.__lpQueue) return true;
            const container = document.querySelector({sel});
            if (!container) return false;
            window.__lpQueue = [];
            const sig = el => {{
                const id = el.getAttribute && (el.getAttribute('data-message-id') || el.id);
                if (id) return id;
                const siblings = el.parentNode ? [...el.parentNode.children] : [];
                const s = (el.textContent || '') + '|' + siblings.indexOf(el);
                let h = 0;
                for (let i = 0; i < s.length; i++) h = (h * 31 + s.charCodeAt(i)) | 0;
                return 'h' + h;
            }};
            const sender = el => {{
                const row = (el.closest && el.closest("[role='row'], [role='listitem'], [data-testid*='message']")) || el;
                const hint = row.querySelector(
                    "[data-testid*='author'], h4, h5, a[href*='/profile'] span, img[alt]"
                );
                if (!hint) return '';
                return (hint.textContent || hint.getAttribute('alt') || '').trim();
            }};
            const snap = (el, unread) => ({{
                signature: sig(el),
                text: el.innerText || '',
                classes: el.className || '',
                role: (el.getAttribute && el.getAttribute('role')) || '',
                sender: sender(el),
                unread: !!unread
            }});
            const obs = new MutationObserver(muts => {{
                for (const m of muts)
                    for (const n of m.addedNodes)
                        if (n.nodeType === 1) window.__lpQueue.push(snap(n, false));
            }});
            obs.observe(container, {{ childList: true, subtree: true }});
            for (const el of container.querySelectorAll("[class*='unread'], [aria-label*='unread']")) {{
                const row = el.closest("[role='row']") || el;
                window.__lpQueue.push(snap(row, true));
            }}
            return true;
        }})()"#,
        sel = crate::automation::js_str(container_selector),
    )
}

/// Drain-and-reset the page queue.
const DRAIN_SCRIPT: &str =
    "(() => { const q = window.__lpQueue || []; window.__lpQueue = []; return q; })()";

/// Attach a monitor to a conversation page.
///
/// The page handle is shared with the automation driver through a mutex;
/// the drain task holds the lock only for the duration of one evaluation,
/// so an in-flight task (which locks for its whole run) naturally blocks
/// draining rather than interleaving with it.
pub struct MutationMonitor {
    gate: MonitorGate,
    events: Option<Arc<EventBus>>,
}

impl MutationMonitor {
    pub fn new(gate: MonitorGate) -> Self {
        Self { gate, events: None }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Inject the observer and start the drain task. Returns the batch
    /// stream; dropping the receiver stops the monitor.
    ///
    /// Transient drain failures (a CDP hiccup during a page re-render) are
    /// tolerated up to [`MONITOR_DRAIN_FAILURE_LIMIT`] consecutive misses;
    /// past that the stream yields one terminal `Err` and closes, so a dead
    /// monitor is never mistaken for a clean stop.
    pub async fn watch(
        &self,
        page: Arc<Mutex<Box<dyn PageHandle>>>,
        container_selector: &str,
    ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<DomChangeBatch>>> {
        let url = {
            let guard = page.lock().await;
            let installed = guard
                .evaluate(&observer_script(container_selector))
                .await?
                .as_bool()
                .unwrap_or(false);
            if !installed {
                anyhow::bail!("conversation container {container_selector:?} not found");
            }
            guard.url().await.unwrap_or_default()
        };

        if let Some(bus) = &self.events {
            bus.emit(LotEvent::MonitorStarted { url: url.clone() });
        }

        let (tx, rx) = mpsc::channel(64);
        let gate = self.gate.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut held: Vec<NodeSnapshot> = Vec::new();
            let mut consecutive_failures = 0usize;
            loop {
                tokio::time::sleep(MONITOR_DRAIN_INTERVAL).await;

                let drained = {
                    let guard = page.lock().await;
                    guard.evaluate(DRAIN_SCRIPT).await
                };
                let mut nodes: Vec<NodeSnapshot> = match drained {
                    Ok(value) => {
                        consecutive_failures = 0;
                        serde_json::from_value(value).unwrap_or_default()
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures < MONITOR_DRAIN_FAILURE_LIMIT {
                            tracing::warn!(
                                error = %e,
                                attempt = consecutive_failures,
                                "monitor drain failed, retrying"
                            );
                            continue;
                        }
                        tracing::error!(error = %e, "monitor drain failed repeatedly, stopping");
                        let _ = tx
                            .send(Err(e.context("conversation page stopped answering drains")))
                            .await;
                        break;
                    }
                };

                if gate.is_paused() {
                    // An automation task owns the page; queue, don't drop.
                    held.append(&mut nodes);
                    continue;
                }

                if !held.is_empty() {
                    held.append(&mut nodes);
                    nodes = std::mem::take(&mut held);
                }
                if nodes.is_empty() {
                    continue;
                }
                if tx.send(Ok(DomChangeBatch { nodes })).await.is_err() {
                    // Receiver dropped: monitor stopped by the caller.
                    break;
                }
            }
            if let Some(bus) = &events {
                bus.emit(LotEvent::MonitorStopped { url });
            }
        });

        Ok(rx)
    }
}
