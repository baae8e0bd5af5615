//! The update client: the engine's delegate for per-batch campaigns on the
//! artifact distribution subsystem. The engine never moves artifact bytes
//! itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::deployment::Deployment;

/// Coarse campaign state as reported by the distribution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
}

/// Aggregate device counts for a campaign. `succeeded + failed` is monotonic
/// over the campaign's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub percentage: f64,
}

impl CampaignProgress {
    /// A campaign is complete once every device reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.succeeded + self.failed == self.total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStatus {
    pub id: String,
    pub state: CampaignState,
    pub progress: CampaignProgress,
    pub updated_at: DateTime<Utc>,
}

/// Creates and steers campaigns. A campaign targets exactly the devices
/// supplied at creation; `cancel_campaign` is best-effort and may leave
/// devices in any terminal state.
#[async_trait]
pub trait UpdateClient: Send + Sync {
    async fn create_campaign(&self, deployment: &Deployment, devices: &[String])
    -> Result<String>;

    async fn campaign_status(&self, campaign_id: &str) -> Result<CampaignStatus>;

    async fn pause_campaign(&self, campaign_id: &str) -> Result<()>;

    async fn resume_campaign(&self, campaign_id: &str) -> Result<()>;

    async fn cancel_campaign(&self, campaign_id: &str) -> Result<()>;
}
