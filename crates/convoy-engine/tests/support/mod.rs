//! In-process fakes for the engine's injected collaborators.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use convoy_core::analysis::AnalysisEvaluator;
use convoy_core::clock::SystemClock;
use convoy_core::deployment::{
    AssignmentStatus, Deployment, DeploymentEvent, DeploymentProgress, DeploymentStatus,
    DeviceAssignment, EventType,
};
use convoy_core::inventory::{DeviceInventory, DeviceRecord};
use convoy_core::store::{DeploymentStore, ListFilter};
use convoy_core::updater::{CampaignProgress, CampaignState, CampaignStatus, UpdateClient};
use convoy_core::{DeploymentId, Error, Result};
use convoy_engine::{EngineConfig, Orchestrator};

// ---------------------------------------------------------------------------
// In-memory deployment store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    deployments: HashMap<DeploymentId, Deployment>,
    assignments: HashMap<DeploymentId, BTreeMap<String, DeviceAssignment>>,
    events: Vec<DeploymentEvent>,
    next_seq: i64,
}

/// Mutex-guarded in-memory store with the same contract as the PostgreSQL
/// implementation.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events of a deployment, oldest first.
    pub fn events(&self, id: DeploymentId) -> Vec<DeploymentEvent> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.deployment_id == id)
            .cloned()
            .collect()
    }

    pub fn events_of_type(&self, id: DeploymentId, event_type: EventType) -> Vec<DeploymentEvent> {
        self.events(id)
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl DeploymentStore for MemStore {
    async fn create_deployment(&self, deployment: &Deployment, devices: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deployments.contains_key(&deployment.id) {
            return Err(Error::Conflict(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        let assignments = devices
            .iter()
            .map(|device_id| {
                (
                    device_id.clone(),
                    DeviceAssignment {
                        deployment_id: deployment.id,
                        device_id: device_id.clone(),
                        status: AssignmentStatus::Pending,
                        progress: 0,
                        message: String::new(),
                        started_at: None,
                        completed_at: None,
                    },
                )
            })
            .collect();
        inner.deployments.insert(deployment.id, deployment.clone());
        inner.assignments.insert(deployment.id, assignments);
        Ok(())
    }

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment> {
        self.inner
            .lock()
            .unwrap()
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("deployment {}", id)))
    }

    async fn list_deployments(
        &self,
        filter: &ListFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Deployment>> {
        let inner = self.inner.lock().unwrap();
        let mut matched: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| {
                filter
                    .namespace
                    .as_ref()
                    .is_none_or(|ns| &d.namespace == ns)
                    && filter.status.is_none_or(|s| d.status == s)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_status(&self, id: DeploymentId, status: DeploymentStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("deployment {}", id)))?;
        deployment.status = status;
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn list_target_devices(&self, id: DeploymentId) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let assignments = inner
            .assignments
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("deployment {}", id)))?;
        Ok(assignments.keys().cloned().collect())
    }

    async fn update_assignment(
        &self,
        id: DeploymentId,
        device_id: &str,
        status: AssignmentStatus,
        progress: i32,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let assignment = inner
            .assignments
            .get_mut(&id)
            .and_then(|a| a.get_mut(device_id))
            .ok_or_else(|| Error::NotFound(format!("assignment {}/{}", id, device_id)))?;
        assignment.status = status;
        assignment.progress = progress;
        assignment.message = message.to_string();
        if status != AssignmentStatus::Pending && assignment.started_at.is_none() {
            assignment.started_at = Some(Utc::now());
        }
        if status.is_terminal() && assignment.completed_at.is_none() {
            assignment.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_assignments(&self, id: DeploymentId) -> Result<Vec<DeviceAssignment>> {
        let inner = self.inner.lock().unwrap();
        let assignments = inner
            .assignments
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("deployment {}", id)))?;
        Ok(assignments.values().cloned().collect())
    }

    async fn aggregate_progress(&self, id: DeploymentId) -> Result<DeploymentProgress> {
        let assignments = self.list_assignments(id).await?;
        let count = |status: AssignmentStatus| {
            assignments.iter().filter(|a| a.status == status).count() as i64
        };
        Ok(DeploymentProgress::from_counts(
            assignments.len() as i64,
            count(AssignmentStatus::Pending),
            count(AssignmentStatus::Running),
            count(AssignmentStatus::Succeeded),
            count(AssignmentStatus::Failed),
        ))
    }

    async fn append_event(
        &self,
        id: DeploymentId,
        device_id: Option<&str>,
        event_type: EventType,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.events.push(DeploymentEvent {
            seq,
            deployment_id: id,
            device_id: device_id.map(str::to_string),
            event_type,
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn events_after(
        &self,
        id: DeploymentId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.deployment_id == id && e.seq > after_seq)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Fake inventory
// ---------------------------------------------------------------------------

pub struct FakeInventory {
    devices: Vec<DeviceRecord>,
}

impl FakeInventory {
    pub fn new(devices: Vec<DeviceRecord>) -> Arc<Self> {
        Arc::new(Self { devices })
    }
}

#[async_trait]
impl DeviceInventory for FakeInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.devices.clone())
    }
}

/// `count` devices labelled env=prod, ids dev-00..dev-NN.
pub fn prod_devices(count: usize) -> Vec<DeviceRecord> {
    (0..count)
        .map(|i| DeviceRecord {
            id: format!("dev-{:02}", i),
            labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scripted update client
// ---------------------------------------------------------------------------

struct FakeCampaign {
    id: String,
    devices: Vec<String>,
    polls: u32,
}

#[derive(Default)]
struct UpdaterScript {
    campaigns: Vec<FakeCampaign>,
    /// Campaign indexes (0-based, creation order) that complete with one
    /// failed device.
    fail_campaigns: HashSet<usize>,
    /// Batch index (0-based) whose creation errors out.
    fail_create_on: Option<usize>,
    /// When set, campaigns never complete; only cancel ends them.
    stall: bool,
    /// Status polls before a campaign reports complete.
    polls_to_complete: u32,
    pause_calls: Vec<String>,
    resume_calls: Vec<String>,
    cancel_calls: Vec<String>,
}

/// Update client fake with per-campaign scripting.
pub struct FakeUpdater {
    inner: Mutex<UpdaterScript>,
}

impl FakeUpdater {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(UpdaterScript {
                polls_to_complete: 1,
                ..Default::default()
            }),
        })
    }

    pub fn stalled() -> Arc<Self> {
        let updater = Self::new();
        updater.inner.lock().unwrap().stall = true;
        updater
    }

    pub fn failing_campaign(index: usize) -> Arc<Self> {
        let updater = Self::new();
        updater.inner.lock().unwrap().fail_campaigns.insert(index);
        updater
    }

    pub fn failing_create(batch: usize) -> Arc<Self> {
        let updater = Self::new();
        updater.inner.lock().unwrap().fail_create_on = Some(batch);
        updater
    }

    /// Require several status polls before campaigns report complete.
    pub fn set_polls_to_complete(&self, polls: u32) {
        self.inner.lock().unwrap().polls_to_complete = polls;
    }

    /// Device batches in campaign creation order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.inner
            .lock()
            .unwrap()
            .campaigns
            .iter()
            .map(|c| c.devices.clone())
            .collect()
    }

    pub fn cancel_calls(&self, campaign_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .cancel_calls
            .iter()
            .filter(|c| c.as_str() == campaign_id)
            .count()
    }

    pub fn all_cancel_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancel_calls.clone()
    }

    pub fn pause_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().pause_calls.clone()
    }

    pub fn resume_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().resume_calls.clone()
    }
}

#[async_trait]
impl UpdateClient for FakeUpdater {
    async fn create_campaign(
        &self,
        _deployment: &Deployment,
        devices: &[String],
    ) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.campaigns.len();
        if inner.fail_create_on == Some(index) {
            return Err(Error::Unavailable("update service rejected campaign".into()));
        }
        let id = format!("campaign-{}", index + 1);
        inner.campaigns.push(FakeCampaign {
            id: id.clone(),
            devices: devices.to_vec(),
            polls: 0,
        });
        Ok(id)
    }

    async fn campaign_status(&self, campaign_id: &str) -> Result<CampaignStatus> {
        let mut inner = self.inner.lock().unwrap();
        let stall = inner.stall;
        let polls_to_complete = inner.polls_to_complete;
        let fail_campaigns = inner.fail_campaigns.clone();
        let (index, campaign) = inner
            .campaigns
            .iter_mut()
            .enumerate()
            .find(|(_, c)| c.id == campaign_id)
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;
        campaign.polls += 1;
        let total = campaign.devices.len() as i64;

        let (state, progress) = if stall || campaign.polls < polls_to_complete {
            (
                CampaignState::Running,
                CampaignProgress {
                    total,
                    pending: 0,
                    running: total,
                    succeeded: 0,
                    failed: 0,
                    percentage: 0.0,
                },
            )
        } else {
            let failed = if fail_campaigns.contains(&index) { 1 } else { 0 };
            (
                CampaignState::Completed,
                CampaignProgress {
                    total,
                    pending: 0,
                    running: 0,
                    succeeded: total - failed,
                    failed,
                    percentage: 100.0,
                },
            )
        };

        Ok(CampaignStatus {
            id: campaign_id.to_string(),
            state,
            progress,
            updated_at: Utc::now(),
        })
    }

    async fn pause_campaign(&self, campaign_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .pause_calls
            .push(campaign_id.to_string());
        Ok(())
    }

    async fn resume_campaign(&self, campaign_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .resume_calls
            .push(campaign_id.to_string());
        Ok(())
    }

    async fn cancel_campaign(&self, campaign_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .cancel_calls
            .push(campaign_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixed-score analysis evaluator
// ---------------------------------------------------------------------------

pub struct FixedScoreEvaluator {
    pub score: f64,
}

#[async_trait]
impl AnalysisEvaluator for FixedScoreEvaluator {
    async fn evaluate(&self, _deployment: &Deployment, _metrics: &[String]) -> Result<f64> {
        Ok(self.score)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemStore>,
    pub updater: Arc<FakeUpdater>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(2),
        campaign_timeout: Duration::from_secs(10),
    }
}

pub fn harness(devices: Vec<DeviceRecord>, updater: Arc<FakeUpdater>) -> Harness {
    let store = MemStore::new();
    let orchestrator = Orchestrator::new(
        store.clone(),
        updater.clone(),
        FakeInventory::new(devices),
        Arc::new(SystemClock),
        test_config(),
    );
    Harness {
        orchestrator,
        store,
        updater,
    }
}

/// Harness with a fixed-score canary analysis evaluator wired in.
pub fn harness_with_analysis(
    devices: Vec<DeviceRecord>,
    updater: Arc<FakeUpdater>,
    score: f64,
) -> Harness {
    let store = MemStore::new();
    let orchestrator = Orchestrator::new(
        store.clone(),
        updater.clone(),
        FakeInventory::new(devices),
        Arc::new(SystemClock),
        test_config(),
    )
    .with_analysis(Arc::new(FixedScoreEvaluator { score }));
    Harness {
        orchestrator,
        store,
        updater,
    }
}

/// Poll the deployment until it reaches a terminal state.
pub async fn wait_terminal(harness: &Harness, id: DeploymentId) -> DeploymentStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = harness
            .orchestrator
            .get_status(id)
            .await
            .expect("deployment should exist")
            .status;
        if status.is_terminal() {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deployment {} did not reach a terminal state (last: {})",
            id,
            status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until an event of the given type shows up.
pub async fn wait_event(harness: &Harness, id: DeploymentId, event_type: EventType) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !harness.store.events_of_type(id, event_type).is_empty() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no {} event for deployment {}",
            event_type,
            id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
