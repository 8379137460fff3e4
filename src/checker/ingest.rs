use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::constants::USER_AGENT;
use crate::error::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// The downstream already knows this profile; treated like acceptance.
    AlreadyLinked,
    /// 5xx, network trouble or an explicit unavailability message: the
    /// profile stays queued and is re-submitted on a later scheduler cycle.
    Retryable(String),
    /// Any other 4xx: the submission will never succeed, drop the profile.
    Rejected(String),
}

/// Client for the downstream ingestion API. Retries are not looped here;
/// the scheduler re-submits retryable profiles across cycles.
pub struct IngestClient {
    client: Client,
    url: String,
    api_key: String,
}

impl IngestClient {
    pub fn new(url: String, api_key: String) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT.as_str())
            .build()?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    pub async fn submit(&self, steam_id: &str, username: &str) -> IngestOutcome {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "steam_id": steam_id, "username": username }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("[Ingest] Submission transport failure for {}: {}", steam_id, e);
                return IngestOutcome::Retryable(e.to_string());
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let body_lower = body.to_lowercase();

        if status.is_success() {
            debug!("[Ingest] Accepted {} ({})", steam_id, status);
            return IngestOutcome::Accepted;
        }
        if body_lower.contains("link already exists") || body_lower.contains("already exists") {
            debug!("[Ingest] {} already linked downstream", steam_id);
            return IngestOutcome::AlreadyLinked;
        }
        if status.is_server_error() || body_lower.contains("service temporarily unavailable") {
            return IngestOutcome::Retryable(format!("HTTP {}: {}", status.as_u16(), body));
        }
        IngestOutcome::Rejected(format!("HTTP {}: {}", status.as_u16(), body))
    }
}
