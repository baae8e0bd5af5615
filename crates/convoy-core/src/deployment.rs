//! The deployment entity, per-device assignments, events and progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DeploymentId;
use crate::manifest::{Manifest, Strategy};
use crate::selector::Selector;

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    RollingBack,
    Cancelled,
}

impl DeploymentStatus {
    /// Terminal states admit no further progression without an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }

    /// Whether the state machine admits a transition from `self` to `next`.
    ///
    /// `failed` and `cancelled` may reset to `pending` (retry); everything
    /// else follows pending -> running -> (paused <-> running) ->
    /// {succeeded, failed, cancelled, rolling_back} -> ...
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, RollingBack) => true,
            (Paused, Running) | (Paused, Cancelled) => true,
            (RollingBack, Succeeded) | (RollingBack, Failed) => true,
            (Failed, Pending) | (Cancelled, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Paused => "paused",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RollingBack => "rolling_back",
            DeploymentStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "running" => Ok(DeploymentStatus::Running),
            "paused" => Ok(DeploymentStatus::Paused),
            "succeeded" => Ok(DeploymentStatus::Succeeded),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolling_back" => Ok(DeploymentStatus::RollingBack),
            "cancelled" => Ok(DeploymentStatus::Cancelled),
            other => Err(format!("unknown deployment status: {}", other)),
        }
    }
}

/// A persisted deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub namespace: String,
    /// The validated manifest this deployment was created from.
    pub manifest: Manifest,
    /// The resolved rollout strategy.
    pub strategy: Strategy,
    /// The selector the target devices were materialized from.
    pub selector: Selector,
    pub status: DeploymentStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of one (deployment, device) assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl AssignmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentStatus::Succeeded | AssignmentStatus::Failed)
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Running => "running",
            AssignmentStatus::Succeeded => "succeeded",
            AssignmentStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssignmentStatus::Pending),
            "running" => Ok(AssignmentStatus::Running),
            "succeeded" => Ok(AssignmentStatus::Succeeded),
            "failed" => Ok(AssignmentStatus::Failed),
            other => Err(format!("unknown assignment status: {}", other)),
        }
    }
}

/// One (deployment, device) pair. Created for every selected device when the
/// deployment is created; unique per (deployment_id, device_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub deployment_id: DeploymentId,
    pub device_id: String,
    pub status: AssignmentStatus,
    /// 0-100.
    pub progress: i32,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Symbolic type of an audit-log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DeploymentCreated,
    DeploymentStarted,
    DeploymentSucceeded,
    DeploymentFailed,
    DeploymentCancelled,
    DeploymentPaused,
    DeploymentResumed,
    DeploymentApproved,
    CampaignCreated,
    CanaryStepStarted,
    CanaryStepSucceeded,
    CanaryAnalysisFailed,
    CanaryAwaitingApproval,
    BlueGreenPromoted,
    BlueGreenAwaitingPromotion,
    RollbackStarted,
    RollbackCompleted,
    RollbackFailed,
    ProcessRestart,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DeploymentCreated => "deployment_created",
            EventType::DeploymentStarted => "deployment_started",
            EventType::DeploymentSucceeded => "deployment_succeeded",
            EventType::DeploymentFailed => "deployment_failed",
            EventType::DeploymentCancelled => "deployment_cancelled",
            EventType::DeploymentPaused => "deployment_paused",
            EventType::DeploymentResumed => "deployment_resumed",
            EventType::DeploymentApproved => "deployment_approved",
            EventType::CampaignCreated => "campaign_created",
            EventType::CanaryStepStarted => "canary_step_started",
            EventType::CanaryStepSucceeded => "canary_step_succeeded",
            EventType::CanaryAnalysisFailed => "canary_analysis_failed",
            EventType::CanaryAwaitingApproval => "canary_awaiting_approval",
            EventType::BlueGreenPromoted => "blue_green_promoted",
            EventType::BlueGreenAwaitingPromotion => "blue_green_awaiting_promotion",
            EventType::RollbackStarted => "rollback_started",
            EventType::RollbackCompleted => "rollback_completed",
            EventType::RollbackFailed => "rollback_failed",
            EventType::ProcessRestart => "process_restart",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "deployment_created" => Ok(EventType::DeploymentCreated),
            "deployment_started" => Ok(EventType::DeploymentStarted),
            "deployment_succeeded" => Ok(EventType::DeploymentSucceeded),
            "deployment_failed" => Ok(EventType::DeploymentFailed),
            "deployment_cancelled" => Ok(EventType::DeploymentCancelled),
            "deployment_paused" => Ok(EventType::DeploymentPaused),
            "deployment_resumed" => Ok(EventType::DeploymentResumed),
            "deployment_approved" => Ok(EventType::DeploymentApproved),
            "campaign_created" => Ok(EventType::CampaignCreated),
            "canary_step_started" => Ok(EventType::CanaryStepStarted),
            "canary_step_succeeded" => Ok(EventType::CanaryStepSucceeded),
            "canary_analysis_failed" => Ok(EventType::CanaryAnalysisFailed),
            "canary_awaiting_approval" => Ok(EventType::CanaryAwaitingApproval),
            "blue_green_promoted" => Ok(EventType::BlueGreenPromoted),
            "blue_green_awaiting_promotion" => Ok(EventType::BlueGreenAwaitingPromotion),
            "rollback_started" => Ok(EventType::RollbackStarted),
            "rollback_completed" => Ok(EventType::RollbackCompleted),
            "rollback_failed" => Ok(EventType::RollbackFailed),
            "process_restart" => Ok(EventType::ProcessRestart),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// One entry in a deployment's append-only audit log. Events are never
/// mutated or deleted; `seq` is monotonic within a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub seq: i64,
    pub deployment_id: DeploymentId,
    pub device_id: Option<String>,
    pub event_type: EventType,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate progress over a deployment's assignments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentProgress {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    /// (succeeded + failed) / total * 100; 0 when there are no assignments.
    pub percentage: f64,
}

impl DeploymentProgress {
    pub fn from_counts(total: i64, pending: i64, running: i64, succeeded: i64, failed: i64) -> Self {
        let percentage = if total > 0 {
            (succeeded + failed) as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total,
            pending,
            running,
            succeeded,
            failed,
            percentage,
        }
    }
}
