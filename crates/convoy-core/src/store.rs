//! The deployment store: persistence for deployments, assignments and the
//! event log. The engine treats it as a narrow API, not SQL; PostgreSQL and
//! in-memory implementations live elsewhere.

use async_trait::async_trait;

use crate::DeploymentId;
use crate::Result;
use crate::deployment::{
    AssignmentStatus, Deployment, DeploymentEvent, DeploymentProgress, DeploymentStatus,
    DeviceAssignment, EventType,
};

/// Filter for deployment listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub namespace: Option<String>,
    pub status: Option<DeploymentStatus>,
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Persist a new deployment together with one pending assignment per
    /// target device, atomically.
    async fn create_deployment(&self, deployment: &Deployment, devices: &[String]) -> Result<()>;

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment>;

    async fn list_deployments(
        &self,
        filter: &ListFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Deployment>>;

    /// Set the deployment status and bump `updated_at`. Transition legality
    /// is the orchestrator's concern; concurrent writes are last-write-wins.
    async fn update_status(&self, id: DeploymentId, status: DeploymentStatus) -> Result<()>;

    /// Target device ids for a deployment, sorted stably by device id.
    async fn list_target_devices(&self, id: DeploymentId) -> Result<Vec<String>>;

    /// Idempotent per-device status update. Sets `started_at` on the first
    /// transition away from pending and `completed_at` on the first terminal
    /// transition.
    async fn update_assignment(
        &self,
        id: DeploymentId,
        device_id: &str,
        status: AssignmentStatus,
        progress: i32,
        message: &str,
    ) -> Result<()>;

    async fn list_assignments(&self, id: DeploymentId) -> Result<Vec<DeviceAssignment>>;

    /// SUM/COUNT over the deployment's assignments.
    async fn aggregate_progress(&self, id: DeploymentId) -> Result<DeploymentProgress>;

    async fn append_event(
        &self,
        id: DeploymentId,
        device_id: Option<&str>,
        event_type: EventType,
        message: &str,
    ) -> Result<()>;

    /// Events with `seq` strictly greater than `after_seq`, oldest first.
    async fn events_after(
        &self,
        id: DeploymentId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentEvent>>;
}
