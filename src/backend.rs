//! External collaborator interfaces.
//!
//! The AI/analytics backend, bulk upload endpoint, and lead capture endpoint
//! are simple request/response JSON-over-HTTP. The core treats any non-2xx
//! response as collaborator failure; there is no retry or backoff here — a
//! fresh trigger (new message, new scrape) gets a fresh attempt.
//!
//! [`Collaborator`] is the seam: the conversation tracker and the CLI talk
//! to the trait, so tests can substitute a scripted implementation.

use crate::config::COLLABORATOR_TIMEOUT;
use crate::convo::{CrispStage, Message};
use crate::extract::VehicleListing;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SEO text and pricing guidance for a listing about to be published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingEnhancement {
    pub optimized_description: String,
    pub recommended_price: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// The conversation as sent to the AI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub counterpart: String,
    pub messages: Vec<Message>,
    /// Optional vehicle the buyer is asking about.
    pub vehicle: Option<VehicleListing>,
}

/// One AI-generated reply plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrispReply {
    pub message: String,
    pub crisp_stage: CrispStage,
    pub auto_send: bool,
    #[serde(default)]
    pub suggest_appointment: bool,
    #[serde(default)]
    pub appointment_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentRequest {
    pub conversation_id: String,
    pub counterpart: String,
    pub notes: String,
}

/// Submitted on the first qualifying inbound message of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub conversation_id: String,
    pub counterpart: String,
    pub first_message: String,
    pub vehicle: Option<VehicleListing>,
    pub captured_at: DateTime<Utc>,
}

/// Bulk upload wrapper for scraped listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadPayload<'a> {
    listings: &'a [VehicleListing],
    source_site: &'a str,
    source_url: &'a str,
    scraped_at: DateTime<Utc>,
}

/// Everything the core needs from the outside world.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn enhance_listing(&self, listing: &VehicleListing) -> Result<ListingEnhancement>;
    async fn crisp_response(&self, snapshot: &ConversationSnapshot) -> Result<CrispReply>;
    async fn schedule_appointment(&self, request: &AppointmentRequest) -> Result<()>;
    async fn upload_listings(
        &self,
        listings: &[VehicleListing],
        source_site: &str,
        source_url: &str,
    ) -> Result<()>;
    async fn submit_lead(&self, lead: &LeadRecord) -> Result<()>;
}

/// HTTP implementation against the dealership backend.
pub struct HttpCollaborator {
    base_url: String,
    http: reqwest::Client,
}

impl HttpCollaborator {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .timeout(COLLABORATOR_TIMEOUT)
            .json(body)
            .send()
            .await
            .with_context(|| format!("collaborator unreachable: {path}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("collaborator {path} returned {status}");
        }
        resp.json::<R>()
            .await
            .with_context(|| format!("collaborator {path} returned malformed body"))
    }

    async fn post_ack<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .timeout(COLLABORATOR_TIMEOUT)
            .json(body)
            .send()
            .await
            .with_context(|| format!("collaborator unreachable: {path}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("collaborator {path} returned {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl Collaborator for HttpCollaborator {
    async fn enhance_listing(&self, listing: &VehicleListing) -> Result<ListingEnhancement> {
        self.post("enhance-listing", listing).await
    }

    async fn crisp_response(&self, snapshot: &ConversationSnapshot) -> Result<CrispReply> {
        self.post("crisp-response", snapshot).await
    }

    async fn schedule_appointment(&self, request: &AppointmentRequest) -> Result<()> {
        self.post_ack("schedule-appointment", request).await
    }

    async fn upload_listings(
        &self,
        listings: &[VehicleListing],
        source_site: &str,
        source_url: &str,
    ) -> Result<()> {
        let payload = UploadPayload {
            listings,
            source_site,
            source_url,
            scraped_at: Utc::now(),
        };
        self.post_ack("listings/bulk", &payload).await
    }

    async fn submit_lead(&self, lead: &LeadRecord) -> Result<()> {
        self.post_ack("leads", lead).await
    }
}
