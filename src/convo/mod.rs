//! Conversation state tracking and reply decisions.
//!
//! A [`MonitorSession`] owns everything that used to be ambient in the old
//! automation scripts: the auto-response toggle and the per-counterpart
//! conversation map. It is created and dropped explicitly by the caller —
//! there are no module-level globals and no persistence; a host restart
//! starts clean.
//!
//! The CRISP stage is advisory classification metadata, not an enforced
//! state machine: whatever stage the most recent AI response carries becomes
//! the conversation's stage, and the collaborator is free to move a
//! conversation backward when a buyer raises a new objection.

use crate::backend::{AppointmentRequest, Collaborator, ConversationSnapshot, LeadRecord};
use crate::events::{EventBus, LotEvent};
use crate::extract::VehicleListing;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// CRISP methodology stages: Connecting → Researching → Investigating →
/// Solving → Proposing. Ordering is advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrispStage {
    Connecting,
    Researching,
    Investigating,
    Solving,
    Proposing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One message in a conversation, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

/// Per-counterpart conversation state. Created on the first detected inbound
/// message; never deleted within a session.
#[derive(Debug, Clone)]
pub struct ConversationState {
    /// Derived from the counterpart name and first-seen timestamp.
    pub id: String,
    pub counterpart: String,
    pub messages: Vec<Message>,
    pub stage: Option<CrispStage>,
    /// Key into the session's listing map — lookup only, no ownership.
    pub vehicle_context: Option<String>,
    pub last_ai_reply: Option<String>,
    lead_submitted: bool,
}

impl ConversationState {
    fn new(counterpart: &str) -> Self {
        let first_seen = Utc::now();
        let slug: String = counterpart
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        Self {
            id: format!("{slug}-{}", first_seen.timestamp()),
            counterpart: counterpart.to_string(),
            messages: Vec::new(),
            stage: None,
            vehicle_context: None,
            last_ai_reply: None,
            lead_submitted: false,
        }
    }
}

/// What to do with an AI reply: send it, or queue it for human approval.
#[derive(Debug, Clone)]
pub struct OutboundDecision {
    pub conversation_id: String,
    pub text: String,
    pub auto_send: bool,
    pub suggest_appointment: bool,
}

/// Explicit owner of conversation state for one monitored page.
pub struct MonitorSession {
    auto_response_enabled: bool,
    conversations: HashMap<String, ConversationState>,
    /// Listings known to this session, keyed by source URL, used to resolve
    /// a conversation's vehicle context.
    listings: HashMap<String, VehicleListing>,
    events: Option<Arc<EventBus>>,
}

impl MonitorSession {
    pub fn new(auto_response_enabled: bool) -> Self {
        Self {
            auto_response_enabled,
            conversations: HashMap::new(),
            listings: HashMap::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Toggle automatic sending of AI replies. When off, every decision
    /// comes back with `auto_send == false` regardless of the AI's opinion.
    pub fn set_auto_response(&mut self, enabled: bool) {
        self.auto_response_enabled = enabled;
    }

    /// Register a listing so conversations about it can carry context.
    pub fn register_listing(&mut self, listing: VehicleListing) {
        self.listings.insert(listing.source_url.clone(), listing);
    }

    /// Point a conversation at a listing by source URL.
    pub fn set_vehicle_context(&mut self, counterpart: &str, source_url: &str) {
        if let Some(state) = self.conversations.get_mut(counterpart) {
            state.vehicle_context = Some(source_url.to_string());
        }
    }

    pub fn conversation(&self, counterpart: &str) -> Option<&ConversationState> {
        self.conversations.get(counterpart)
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Handle one detected inbound message.
    ///
    /// Appends to the conversation (creating it on first contact), submits a
    /// lead for new conversations, asks the AI collaborator for a reply, and
    /// returns the resulting decision. A collaborator failure produces no
    /// reply: the event is logged and dropped, the stage stays unchanged,
    /// and the next inbound message re-triggers naturally.
    pub async fn on_inbound_message(
        &mut self,
        collaborator: &dyn Collaborator,
        counterpart: &str,
        text: &str,
    ) -> Option<OutboundDecision> {
        let state = self
            .conversations
            .entry(counterpart.to_string())
            .or_insert_with(|| ConversationState::new(counterpart));

        state.messages.push(Message {
            text: text.to_string(),
            direction: Direction::Inbound,
            timestamp: Utc::now(),
        });

        if let Some(bus) = &self.events {
            bus.emit(LotEvent::InboundMessage {
                conversation_id: state.id.clone(),
                preview: text.chars().take(80).collect(),
            });
        }

        let vehicle = state
            .vehicle_context
            .as_ref()
            .and_then(|key| self.listings.get(key))
            .cloned();

        // First qualifying inbound message becomes a lead.
        if !state.lead_submitted {
            let lead = LeadRecord {
                conversation_id: state.id.clone(),
                counterpart: state.counterpart.clone(),
                first_message: text.to_string(),
                vehicle: vehicle.clone(),
                captured_at: Utc::now(),
            };
            match collaborator.submit_lead(&lead).await {
                Ok(()) => state.lead_submitted = true,
                Err(e) => {
                    tracing::warn!(counterpart, error = %e, "lead submission failed");
                }
            }
        }

        let snapshot = ConversationSnapshot {
            conversation_id: state.id.clone(),
            counterpart: state.counterpart.clone(),
            messages: state.messages.clone(),
            vehicle,
        };

        let reply = match collaborator.crisp_response(&snapshot).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(counterpart, error = %e, "collaborator unavailable, dropping event");
                if let Some(bus) = &self.events {
                    bus.emit(LotEvent::CollaboratorError {
                        operation: "crisp-response".to_string(),
                        error: e.to_string(),
                    });
                }
                return None;
            }
        };

        // Whatever stage the latest response carries wins, including
        // regressions to an earlier stage.
        state.stage = Some(reply.crisp_stage);
        state.last_ai_reply = Some(reply.message.clone());

        if reply.suggest_appointment {
            let request = AppointmentRequest {
                conversation_id: state.id.clone(),
                counterpart: state.counterpart.clone(),
                notes: reply.appointment_notes.clone().unwrap_or_default(),
            };
            // Best-effort booking; the reply still goes out either way.
            if let Err(e) = collaborator.schedule_appointment(&request).await {
                tracing::warn!(counterpart, error = %e, "appointment scheduling failed");
            }
        }

        let decision = OutboundDecision {
            conversation_id: state.id.clone(),
            text: reply.message,
            auto_send: reply.auto_send && self.auto_response_enabled,
            suggest_appointment: reply.suggest_appointment,
        };

        if let Some(bus) = &self.events {
            bus.emit(LotEvent::ReplyDecision {
                conversation_id: decision.conversation_id.clone(),
                stage: format!("{:?}", reply.crisp_stage),
                auto_send: decision.auto_send,
                suggest_appointment: decision.suggest_appointment,
            });
        }

        Some(decision)
    }

    /// Record a reply that was actually sent (auto or human-approved).
    pub fn record_outbound(&mut self, counterpart: &str, text: &str) {
        if let Some(state) = self.conversations.get_mut(counterpart) {
            state.messages.push(Message {
                text: text.to_string(),
                direction: Direction::Outbound,
                timestamp: Utc::now(),
            });
        }
    }
}
