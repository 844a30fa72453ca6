// Copyright 2026 Lotpilot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lotpilot event bus — typed events from every component.
//!
//! The bus is a `tokio::sync::broadcast` channel carrying [`LotEvent`]
//! values. Any consumer — the CLI, log files, a future dashboard — can
//! subscribe independently. When no subscribers exist, events are silently
//! dropped (zero overhead).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event Lotpilot emits. Serialized to JSON for logs and streaming.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LotEvent {
    // ── Scrape Events ─────────────────────
    /// A scrape of a listing page has started.
    ScrapeStarted { site: String, url: String },
    /// A scrape finished; counts cover raw records before validation.
    ScrapeComplete {
        site: String,
        raw_records: usize,
        valid_listings: usize,
        elapsed_ms: u64,
    },
    /// A raw record was dropped by the normalizer.
    ListingRejected { site: String, reason: String },

    // ── Conversation Events ───────────────
    /// The mutation monitor attached to a conversation page.
    MonitorStarted { url: String },
    /// The mutation monitor detached.
    MonitorStopped { url: String },
    /// A new inbound buyer message was detected.
    InboundMessage {
        conversation_id: String,
        preview: String,
    },
    /// A reply decision was made for an inbound message.
    ReplyDecision {
        conversation_id: String,
        stage: String,
        auto_send: bool,
        suggest_appointment: bool,
    },

    // ── Automation Events ─────────────────
    /// An automation task (publish or chat reply) has started.
    TaskStarted { task_id: String, url: String },
    /// An automation task finished.
    TaskComplete {
        task_id: String,
        fields_filled: usize,
        fields_skipped: usize,
        images_attached: usize,
        submitted: bool,
        elapsed_ms: u64,
    },
    /// An automation task failed before any submission.
    TaskFailed { task_id: String, error: String },

    // ── Collaborator Events ───────────────
    /// A backend/AI call failed; the triggering event was dropped.
    CollaboratorError { operation: String, error: String },
}

/// The central event bus.
///
/// All components emit events through this bus. Consumers subscribe to
/// receive a stream of all events.
pub struct EventBus {
    sender: broadcast::Sender<LotEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: LotEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<LotEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = LotEvent::ScrapeStarted {
            site: "autotrader".to_string(),
            url: "https://www.autotrader.com/cars-for-sale".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("ScrapeStarted"));
        assert!(json.contains("autotrader"));

        // Roundtrip
        let parsed: LotEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            LotEvent::ScrapeStarted { site, .. } => assert_eq!(site, "autotrader"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_emit_no_subscribers() {
        let bus = EventBus::new(16);
        // Should not panic when no subscribers
        bus.emit(LotEvent::MonitorStarted {
            url: "https://example.com/messages".to_string(),
        });
    }

    #[test]
    fn test_subscribe_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(LotEvent::TaskFailed {
            task_id: "task-1".to_string(),
            error: "form never appeared".to_string(),
        });

        let event = rx.try_recv().unwrap();
        match event {
            LotEvent::TaskFailed { task_id, .. } => assert_eq!(task_id, "task-1"),
            _ => panic!("wrong event"),
        }
    }
}
