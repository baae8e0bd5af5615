//! The orchestrator: deployment lifecycle, control operations and the map of
//! live rollouts.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tracing::{error, info, warn};

use convoy_core::clock::Clock;
use convoy_core::deployment::{
    Deployment, DeploymentEvent, DeploymentProgress, DeploymentStatus, EventType,
};
use convoy_core::analysis::AnalysisEvaluator;
use convoy_core::inventory::DeviceInventory;
use convoy_core::manifest::Strategy;
use convoy_core::selector::select_devices;
use convoy_core::store::{DeploymentStore, ListFilter};
use convoy_core::updater::UpdateClient;
use convoy_core::{DeploymentId, Error, Result};

use crate::rollout::{self, Outcome, RolloutCtx, RolloutState};

/// Engine tuning knobs. Tests lower the poll interval to a few milliseconds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Campaign status poll cadence.
    pub poll_interval: Duration,
    /// Hard per-campaign monitoring timeout.
    pub campaign_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            campaign_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Snapshot returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub status: DeploymentStatus,
    pub updated_at: DateTime<Utc>,
    pub progress: DeploymentProgress,
}

enum TaskKind {
    Strategy,
    Rollback,
}

/// Process-wide rollout coordinator. Holds one [`RolloutState`] per active
/// deployment and drives each rollout in a background task detached from the
/// request that started it.
pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    updater: Arc<dyn UpdateClient>,
    inventory: Arc<dyn DeviceInventory>,
    clock: Arc<dyn Clock>,
    analysis: Option<Arc<dyn AnalysisEvaluator>>,
    config: EngineConfig,
    active: Arc<Mutex<HashMap<DeploymentId, Arc<RolloutState>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        updater: Arc<dyn UpdateClient>,
        inventory: Arc<dyn DeviceInventory>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            updater,
            inventory,
            clock,
            analysis: None,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wire in a canary analysis evaluator. Without one, analysis passes
    /// trivially.
    pub fn with_analysis(mut self, evaluator: Arc<dyn AnalysisEvaluator>) -> Self {
        self.analysis = Some(evaluator);
        self
    }

    /// Whether a rollout task is live for the deployment.
    pub fn is_active(&self, id: DeploymentId) -> bool {
        self.active.lock().unwrap().contains_key(&id)
    }

    /// Parse and validate a manifest, materialize its target devices and
    /// persist the deployment as `pending`.
    pub async fn create_deployment(&self, manifest: &[u8], created_by: &str) -> Result<Deployment> {
        let manifest = convoy_manifest::parse_and_validate(manifest)?;
        let strategy =
            Strategy::from_spec(&manifest.spec.strategy).map_err(Error::InvalidManifest)?;

        let inventory = self.inventory.list_devices().await?;
        let devices = select_devices(&manifest.spec.selector, &inventory);

        let now = self.clock.now();
        let deployment = Deployment {
            id: DeploymentId::generate(),
            name: manifest.metadata.name.clone(),
            namespace: manifest.metadata.namespace.clone(),
            selector: manifest.spec.selector.clone(),
            strategy,
            manifest,
            status: DeploymentStatus::Pending,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };

        self.store.create_deployment(&deployment, &devices).await?;
        self.append_event(
            deployment.id,
            EventType::DeploymentCreated,
            &format!(
                "deployment {} created with {} target devices",
                deployment.name,
                devices.len()
            ),
        )
        .await;

        info!(
            deployment_id = %deployment.id,
            name = %deployment.name,
            devices = devices.len(),
            "Deployment created"
        );
        Ok(deployment)
    }

    /// Start the rollout for a `pending` deployment. Spawns the background
    /// rollout task; the caller's request returns immediately.
    pub async fn start(&self, id: DeploymentId) -> Result<()> {
        let deployment = self.store.get_deployment(id).await?;
        if self.is_active(id) {
            return Err(Error::Conflict(format!(
                "deployment {} is already running",
                id
            )));
        }
        if deployment.status != DeploymentStatus::Pending {
            return Err(Error::FailedPrecondition(format!(
                "deployment {} is not in pending state (currently {})",
                id, deployment.status
            )));
        }
        let devices = self.store.list_target_devices(id).await?;
        if devices.is_empty() {
            return Err(Error::FailedPrecondition(format!(
                "deployment {} has no devices to deploy",
                id
            )));
        }

        let state = Arc::new(RolloutState::new(id, self.clock.now()));
        {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(&id) {
                return Err(Error::Conflict(format!(
                    "deployment {} is already running",
                    id
                )));
            }
            active.insert(id, state.clone());
        }

        if let Err(e) = self
            .store
            .update_status(id, DeploymentStatus::Running)
            .await
        {
            self.active.lock().unwrap().remove(&id);
            return Err(e);
        }
        self.append_event(
            id,
            EventType::DeploymentStarted,
            &format!("rollout started across {} devices", devices.len()),
        )
        .await;

        info!(deployment_id = %id, devices = devices.len(), "Rollout starting");
        self.spawn_task(deployment, devices, state, TaskKind::Strategy);
        Ok(())
    }

    /// Pause a running rollout. Forwards to the in-flight campaign when one
    /// exists.
    pub async fn pause(&self, id: DeploymentId) -> Result<()> {
        let deployment = self.store.get_deployment(id).await?;
        if deployment.status != DeploymentStatus::Running {
            return Err(Error::FailedPrecondition(format!(
                "deployment {} is not running (currently {})",
                id, deployment.status
            )));
        }

        let state = self.active.lock().unwrap().get(&id).cloned();
        if let Some(state) = state {
            if let Some(campaign_id) = state.campaign_id() {
                self.updater.pause_campaign(&campaign_id).await?;
            }
        }
        self.store
            .update_status(id, DeploymentStatus::Paused)
            .await?;
        self.append_event(id, EventType::DeploymentPaused, "rollout paused")
            .await;
        info!(deployment_id = %id, "Rollout paused");
        Ok(())
    }

    /// Resume a paused rollout, or re-run start semantics when no rollout
    /// task is live.
    pub async fn resume(&self, id: DeploymentId) -> Result<()> {
        let state = self.active.lock().unwrap().get(&id).cloned();
        let Some(state) = state else {
            return self.start(id).await;
        };

        let deployment = self.store.get_deployment(id).await?;
        if deployment.status != DeploymentStatus::Paused {
            return Err(Error::FailedPrecondition(format!(
                "deployment {} is not paused (currently {})",
                id, deployment.status
            )));
        }
        if let Some(campaign_id) = state.campaign_id() {
            self.updater.resume_campaign(&campaign_id).await?;
        }
        self.store
            .update_status(id, DeploymentStatus::Running)
            .await?;
        self.append_event(id, EventType::DeploymentResumed, "rollout resumed")
            .await;
        info!(deployment_id = %id, "Rollout resumed");
        Ok(())
    }

    /// Cancel a deployment. For a live rollout this closes the cancel signal
    /// and lets the rollout task cancel its campaign and settle the terminal
    /// state; cancelling twice has the same effect as cancelling once.
    pub async fn cancel(&self, id: DeploymentId) -> Result<()> {
        let state = self.active.lock().unwrap().get(&id).cloned();
        if let Some(state) = state {
            state.cancel();
            info!(deployment_id = %id, "Cancel signalled");
            return Ok(());
        }

        let deployment = self.store.get_deployment(id).await?;
        match deployment.status {
            DeploymentStatus::Cancelled => Ok(()),
            status if status.is_terminal() => Err(Error::FailedPrecondition(format!(
                "deployment {} is already {}",
                id, status
            ))),
            status => {
                self.store
                    .update_status(id, DeploymentStatus::Cancelled)
                    .await?;
                self.append_event(
                    id,
                    EventType::DeploymentCancelled,
                    &format!("cancelled while {}", status),
                )
                .await;
                info!(deployment_id = %id, "Deployment cancelled");
                Ok(())
            }
        }
    }

    /// Deliver the external approval signal a canary approval gate or a
    /// manual blue-green promotion is parked on.
    pub async fn approve(&self, id: DeploymentId) -> Result<()> {
        let state = self.active.lock().unwrap().get(&id).cloned();
        match state {
            Some(state) if state.approve() => {
                self.append_event(id, EventType::DeploymentApproved, "approved by operator")
                    .await;
                info!(deployment_id = %id, "Deployment approved");
                Ok(())
            }
            Some(_) => Err(Error::FailedPrecondition(format!(
                "deployment {} is not awaiting approval",
                id
            ))),
            None => {
                // Resolves to NotFound for unknown ids.
                let _ = self.store.get_deployment(id).await?;
                Err(Error::FailedPrecondition(format!(
                    "deployment {} is not awaiting approval",
                    id
                )))
            }
        }
    }

    /// Roll a deployment back to the previous version. Only valid when no
    /// rollout task is live; the revert itself runs as a background task.
    pub async fn rollback(&self, id: DeploymentId) -> Result<()> {
        if self.is_active(id) {
            return Err(Error::Conflict(format!(
                "deployment {} has a rollout in progress; cancel it first",
                id
            )));
        }
        let deployment = self.store.get_deployment(id).await?;
        if !deployment.status.can_transition_to(DeploymentStatus::RollingBack) {
            return Err(Error::FailedPrecondition(format!(
                "deployment {} cannot roll back from {}",
                id, deployment.status
            )));
        }
        let devices = self.store.list_target_devices(id).await?;

        let state = Arc::new(RolloutState::new(id, self.clock.now()));
        {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(&id) {
                return Err(Error::Conflict(format!(
                    "deployment {} has a rollout in progress; cancel it first",
                    id
                )));
            }
            active.insert(id, state.clone());
        }

        info!(deployment_id = %id, "Rollback starting");
        self.spawn_task(deployment, devices, state, TaskKind::Rollback);
        Ok(())
    }

    pub async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment> {
        self.store.get_deployment(id).await
    }

    pub async fn get_status(&self, id: DeploymentId) -> Result<StatusSummary> {
        let deployment = self.store.get_deployment(id).await?;
        let progress = self.store.aggregate_progress(id).await?;
        Ok(StatusSummary {
            status: deployment.status,
            updated_at: deployment.updated_at,
            progress,
        })
    }

    pub async fn list(
        &self,
        filter: &ListFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Deployment>> {
        self.store.list_deployments(filter, limit, offset).await
    }

    /// Events with seq > `after_seq`, oldest first.
    pub async fn events_after(
        &self,
        id: DeploymentId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentEvent>> {
        let _ = self.store.get_deployment(id).await?;
        self.store.events_after(id, after_seq, limit).await
    }

    /// Lazy event stream from the append log, restartable from a cursor.
    /// Finite once the deployment reaches a terminal state.
    pub fn stream_events(
        &self,
        id: DeploymentId,
        after_seq: i64,
    ) -> BoxStream<'static, Result<DeploymentEvent>> {
        struct StreamState {
            store: Arc<dyn DeploymentStore>,
            id: DeploymentId,
            cursor: i64,
            buffered: VecDeque<DeploymentEvent>,
            draining: bool,
            interval: Duration,
        }

        let state = StreamState {
            store: self.store.clone(),
            id,
            cursor: after_seq,
            buffered: VecDeque::new(),
            draining: false,
            interval: self.config.poll_interval,
        };

        Box::pin(futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.buffered.pop_front() {
                    st.cursor = event.seq;
                    return Some((Ok(event), st));
                }
                if st.draining {
                    return None;
                }
                match st.store.events_after(st.id, st.cursor, 100).await {
                    Ok(events) if !events.is_empty() => st.buffered.extend(events),
                    Ok(_) => match st.store.get_deployment(st.id).await {
                        Ok(d) if d.status.is_terminal() => {
                            // One final fetch: the terminal event may have
                            // landed after the empty read above.
                            st.draining = true;
                            if let Ok(events) = st.store.events_after(st.id, st.cursor, 100).await {
                                st.buffered.extend(events);
                            }
                        }
                        Ok(_) => tokio::time::sleep(st.interval).await,
                        Err(e) => {
                            st.draining = true;
                            return Some((Err(e), st));
                        }
                    },
                    Err(e) => {
                        st.draining = true;
                        return Some((Err(e), st));
                    }
                }
            }
        }))
    }

    /// Startup scan: deployments left `running` or `rolling_back` by a dead
    /// process have no live rollout task and are marked failed.
    pub async fn recover(&self) -> Result<()> {
        for status in [DeploymentStatus::Running, DeploymentStatus::RollingBack] {
            let filter = ListFilter {
                namespace: None,
                status: Some(status),
            };
            let orphans = self.store.list_deployments(&filter, 10_000, 0).await?;
            for deployment in orphans {
                warn!(
                    deployment_id = %deployment.id,
                    status = %status,
                    "Orphaned rollout from a previous process; marking failed"
                );
                self.store
                    .update_status(deployment.id, DeploymentStatus::Failed)
                    .await?;
                self.append_event(
                    deployment.id,
                    EventType::ProcessRestart,
                    "process restarted while the rollout was active; deployment marked failed",
                )
                .await;
            }
        }
        Ok(())
    }

    fn spawn_task(
        &self,
        deployment: Deployment,
        devices: Vec<String>,
        state: Arc<RolloutState>,
        kind: TaskKind,
    ) {
        let ctx = RolloutCtx {
            store: self.store.clone(),
            updater: self.updater.clone(),
            analysis: self.analysis.clone(),
            config: self.config.clone(),
            state,
            deployment,
            devices,
        };
        let active = self.active.clone();

        // The task owns a context detached from the caller: dropping the
        // request that started it must not abort the rollout.
        tokio::spawn(async move {
            let id = ctx.state.deployment_id;
            let store = ctx.store.clone();
            let outcome = AssertUnwindSafe(async {
                match kind {
                    TaskKind::Strategy => rollout::run(&ctx).await,
                    TaskKind::Rollback => {
                        rollout::run_rollback(&ctx, "operator requested rollback").await
                    }
                }
            })
            .catch_unwind()
            .await;

            active.lock().unwrap().remove(&id);

            match outcome {
                Ok(outcome) => finalize(store, id, outcome).await,
                Err(_) => {
                    // Recovered panic: the deployment stays `running` with no
                    // live owner until an operator (or restart recovery)
                    // intervenes.
                    error!(deployment_id = %id, "Rollout task panicked");
                }
            }
        });
    }

    async fn append_event(&self, id: DeploymentId, event_type: EventType, message: &str) {
        if let Err(e) = self.store.append_event(id, None, event_type, message).await {
            warn!(deployment_id = %id, event = %event_type, error = %e, "Failed to append event");
        }
    }
}

/// Settle the terminal status and event for a finished rollout task. The
/// event is appended before the status flips so event streams terminate only
/// after the terminal event is visible.
async fn finalize(store: Arc<dyn DeploymentStore>, id: DeploymentId, outcome: Outcome) {
    let (event_type, message, status) = match outcome {
        Outcome::Succeeded => {
            let summary = match store.aggregate_progress(id).await {
                Ok(p) => format!("rollout completed: {} of {} devices succeeded", p.succeeded, p.total),
                Err(_) => "rollout completed".to_string(),
            };
            (
                EventType::DeploymentSucceeded,
                summary,
                DeploymentStatus::Succeeded,
            )
        }
        Outcome::Failed(err) => (
            EventType::DeploymentFailed,
            err.to_string(),
            DeploymentStatus::Failed,
        ),
        Outcome::Cancelled => {
            let message = match store.aggregate_progress(id).await {
                Ok(p) if p.pending > 0 => format!(
                    "rollout cancelled; {} of {} devices were never reached and remain pending",
                    p.pending, p.total
                ),
                _ => "rollout cancelled".to_string(),
            };
            (
                EventType::DeploymentCancelled,
                message,
                DeploymentStatus::Cancelled,
            )
        }
        Outcome::RolledBack => (
            EventType::RollbackCompleted,
            "rollback completed".to_string(),
            DeploymentStatus::Succeeded,
        ),
        Outcome::RollbackFailed(err) => {
            (EventType::RollbackFailed, err.to_string(), DeploymentStatus::Failed)
        }
    };

    if let Err(e) = store.append_event(id, None, event_type, &message).await {
        warn!(deployment_id = %id, error = %e, "Failed to append terminal event");
    }
    if let Err(e) = store.update_status(id, status).await {
        error!(deployment_id = %id, error = %e, "Failed to persist terminal status");
    }
    info!(deployment_id = %id, status = %status, "Rollout finished");
}
