//! HTTP adapter for the artifact distribution service.
//!
//! The engine delegates all device-facing work to campaigns on the update
//! service; this client maps the service's REST API onto the
//! [`UpdateClient`] trait. Byte transfer, retry scheduling and per-device
//! delivery all live on the other side of this interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use convoy_core::deployment::Deployment;
use convoy_core::manifest::Artifact;
use convoy_core::updater::{CampaignProgress, CampaignState, CampaignStatus, UpdateClient};
use convoy_core::{Error, Result};

/// REST client for the update service.
pub struct HttpUpdateClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpUpdateClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    async fn post_action(&self, campaign_id: &str, action: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("campaigns/{}/{}", campaign_id, action)))
            .send()
            .await
            .map_err(transport_err)?;
        check_status(campaign_id, response).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CreateCampaignRequest<'a> {
    deployment_id: String,
    name: &'a str,
    devices: &'a [String],
    artifacts: &'a [Artifact],
}

#[derive(Debug, Deserialize)]
struct CreateCampaignResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CampaignResponse {
    id: String,
    status: String,
    #[serde(default)]
    progress: ProgressResponse,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressResponse {
    total: i64,
    pending: i64,
    running: i64,
    succeeded: i64,
    failed: i64,
    percentage: f64,
}

/// The service's status vocabulary is wider than the engine's; anything
/// unrecognized counts as running and the progress counts decide completion.
fn parse_state(status: &str) -> CampaignState {
    match status {
        "pending" | "created" | "scheduled" => CampaignState::Pending,
        "paused" => CampaignState::Paused,
        "completed" | "succeeded" | "failed" => CampaignState::Completed,
        "cancelled" | "canceled" => CampaignState::Cancelled,
        _ => CampaignState::Running,
    }
}

impl From<CampaignResponse> for CampaignStatus {
    fn from(response: CampaignResponse) -> Self {
        CampaignStatus {
            id: response.id,
            state: parse_state(&response.status),
            progress: CampaignProgress {
                total: response.progress.total,
                pending: response.progress.pending,
                running: response.progress.running,
                succeeded: response.progress.succeeded,
                failed: response.progress.failed,
                percentage: response.progress.percentage,
            },
            updated_at: response.updated_at.unwrap_or_else(Utc::now),
        }
    }
}

fn transport_err(e: reqwest::Error) -> Error {
    Error::Unavailable(format!("update service unreachable: {}", e))
}

async fn check_status(subject: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::NotFound(format!("campaign {}", subject)));
    }
    Err(Error::Internal(format!(
        "update service returned {} for {}: {}",
        status, subject, body
    )))
}

#[async_trait]
impl UpdateClient for HttpUpdateClient {
    async fn create_campaign(
        &self,
        deployment: &Deployment,
        devices: &[String],
    ) -> Result<String> {
        let request = CreateCampaignRequest {
            deployment_id: deployment.id.to_string(),
            name: &deployment.name,
            devices,
            artifacts: &deployment.manifest.spec.template.spec.artifacts,
        };
        let response = self
            .client
            .post(self.url("campaigns"))
            .json(&request)
            .send()
            .await
            .map_err(transport_err)?;
        let response = check_status(&deployment.name, response).await?;
        let created: CreateCampaignResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed campaign response: {}", e)))?;

        debug!(
            deployment_id = %deployment.id,
            campaign_id = %created.id,
            devices = devices.len(),
            "Campaign created"
        );
        Ok(created.id)
    }

    async fn campaign_status(&self, campaign_id: &str) -> Result<CampaignStatus> {
        let response = self
            .client
            .get(self.url(&format!("campaigns/{}", campaign_id)))
            .send()
            .await
            .map_err(transport_err)?;
        let response = check_status(campaign_id, response).await?;
        let body: CampaignResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed campaign status: {}", e)))?;
        Ok(body.into())
    }

    async fn pause_campaign(&self, campaign_id: &str) -> Result<()> {
        self.post_action(campaign_id, "pause").await
    }

    async fn resume_campaign(&self, campaign_id: &str) -> Result<()> {
        self.post_action(campaign_id, "resume").await
    }

    async fn cancel_campaign(&self, campaign_id: &str) -> Result<()> {
        self.post_action(campaign_id, "cancel").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_is_lenient() {
        assert_eq!(parse_state("pending"), CampaignState::Pending);
        assert_eq!(parse_state("completed"), CampaignState::Completed);
        assert_eq!(parse_state("failed"), CampaignState::Completed);
        assert_eq!(parse_state("canceled"), CampaignState::Cancelled);
        assert_eq!(parse_state("rolling"), CampaignState::Running);
    }

    #[test]
    fn campaign_response_maps_to_status() {
        let body = serde_json::json!({
            "id": "cmp-42",
            "status": "in_progress",
            "progress": {
                "total": 10,
                "pending": 2,
                "running": 3,
                "succeeded": 4,
                "failed": 1,
                "percentage": 50.0
            },
            "updated_at": "2025-06-01T12:00:00Z"
        });
        let response: CampaignResponse = serde_json::from_value(body).unwrap();
        let status: CampaignStatus = response.into();
        assert_eq!(status.id, "cmp-42");
        assert_eq!(status.state, CampaignState::Running);
        assert_eq!(status.progress.succeeded, 4);
        assert!(!status.progress.is_complete());
    }

    #[test]
    fn missing_progress_defaults_to_zero() {
        let body = serde_json::json!({"id": "cmp-1", "status": "created", "updated_at": null});
        let response: CampaignResponse = serde_json::from_value(body).unwrap();
        let status: CampaignStatus = response.into();
        assert_eq!(status.progress.total, 0);
        assert!(!status.progress.is_complete());
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = HttpUpdateClient::new("http://updates.local/");
        assert_eq!(
            client.url("campaigns/abc/pause"),
            "http://updates.local/api/v1/campaigns/abc/pause"
        );
    }
}
