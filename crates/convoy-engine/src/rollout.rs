//! Rollout execution: strategy loops, campaign monitoring and rollback.
//!
//! One rollout task runs per active deployment. All waits inside a task
//! (batch sleeps, status polls, approval gates) race against the rollout's
//! cancel signal, and the cancel arm always wins the race.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use convoy_core::analysis::AnalysisEvaluator;
use convoy_core::{DeploymentId, Error};
use convoy_core::deployment::{AssignmentStatus, Deployment, EventType};
use convoy_core::manifest::{
    BlueGreenConfig, CanaryConfig, PercentOrInt, RollingUpdateConfig, Strategy,
};
use convoy_core::store::DeploymentStore;
use convoy_core::updater::{CampaignProgress, UpdateClient};

use crate::orchestrator::EngineConfig;

/// Single-shot broadcast cancel signal: cancelled once, observed by every
/// waiter, idempotent.
#[derive(Debug)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal fires; never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct RolloutInner {
    campaign_id: Option<String>,
    current_step: usize,
    waiting_for_approval: bool,
}

/// Process-local handle for one active rollout. Created on start, dropped
/// when the rollout task terminates; at most one exists per deployment id.
#[derive(Debug)]
pub struct RolloutState {
    pub deployment_id: DeploymentId,
    pub started_at: DateTime<Utc>,
    cancel: CancelSignal,
    approve: Notify,
    inner: RwLock<RolloutInner>,
}

impl RolloutState {
    pub fn new(deployment_id: DeploymentId, started_at: DateTime<Utc>) -> Self {
        Self {
            deployment_id,
            started_at,
            cancel: CancelSignal::new(),
            approve: Notify::new(),
            inner: RwLock::new(RolloutInner::default()),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Sleep that races the cancel signal. Returns true when cancelled.
    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    pub fn campaign_id(&self) -> Option<String> {
        self.inner.read().unwrap().campaign_id.clone()
    }

    fn set_campaign(&self, campaign_id: Option<String>) {
        self.inner.write().unwrap().campaign_id = campaign_id;
    }

    pub fn current_step(&self) -> usize {
        self.inner.read().unwrap().current_step
    }

    fn set_current_step(&self, step: usize) {
        self.inner.write().unwrap().current_step = step;
    }

    pub fn waiting_for_approval(&self) -> bool {
        self.inner.read().unwrap().waiting_for_approval
    }

    fn begin_approval_wait(&self) {
        self.inner.write().unwrap().waiting_for_approval = true;
    }

    fn end_approval_wait(&self) {
        self.inner.write().unwrap().waiting_for_approval = false;
    }

    /// Deliver an approval. Returns false when the rollout is not parked at
    /// an approval gate.
    pub fn approve(&self) -> bool {
        let waiting = self.inner.read().unwrap().waiting_for_approval;
        if waiting {
            self.approve.notify_one();
        }
        waiting
    }

    async fn approved(&self) {
        self.approve.notified().await
    }
}

/// Everything a rollout task needs, detached from the request that spawned
/// it.
pub(crate) struct RolloutCtx {
    pub store: Arc<dyn DeploymentStore>,
    pub updater: Arc<dyn UpdateClient>,
    pub analysis: Option<Arc<dyn AnalysisEvaluator>>,
    pub config: EngineConfig,
    pub state: Arc<RolloutState>,
    pub deployment: Deployment,
    pub devices: Vec<String>,
}

/// Terminal result of a rollout task. Fatal failures carry the typed error
/// (`RolloutFailed`, `Timeout`, ...) that is persisted as the terminal event.
#[derive(Debug)]
pub(crate) enum Outcome {
    Succeeded,
    Failed(Error),
    Cancelled,
    /// Rollback ran to completion; the deployment ends `succeeded`.
    RolledBack,
    RollbackFailed(Error),
}

/// Execute the deployment's strategy to a terminal outcome.
pub(crate) async fn run(ctx: &RolloutCtx) -> Outcome {
    match ctx.deployment.strategy.clone() {
        Strategy::RollingUpdate(cfg) => run_rolling(ctx, &cfg).await,
        Strategy::Canary(cfg) => run_canary(ctx, &cfg).await,
        Strategy::BlueGreen(cfg) => run_blue_green(ctx, &cfg).await,
    }
}

/// Number of devices per rolling batch; percentages round up, never zero.
pub(crate) fn batch_size(total: usize, max_unavailable: &PercentOrInt) -> usize {
    max_unavailable.resolve(total).max(1)
}

/// Cumulative device count covered by a canary step of the given weight.
pub(crate) fn canary_target(total: usize, weight: u32) -> usize {
    (total * weight as usize).div_ceil(100).min(total)
}

async fn run_rolling(ctx: &RolloutCtx, cfg: &RollingUpdateConfig) -> Outcome {
    let size = batch_size(ctx.devices.len(), &cfg.max_unavailable);
    let batches: Vec<&[String]> = ctx.devices.chunks(size).collect();
    let total_batches = batches.len();

    info!(
        deployment_id = %ctx.state.deployment_id,
        devices = ctx.devices.len(),
        batch_size = size,
        batches = total_batches,
        "Starting rolling update"
    );

    for (i, batch) in batches.into_iter().enumerate() {
        if ctx.state.is_cancelled() {
            return Outcome::Cancelled;
        }

        let campaign_id =
            match open_campaign(ctx, batch, &format!("batch {}/{}", i + 1, total_batches)).await {
                Ok(id) => id,
                Err(e) => return Outcome::Failed(e),
            };

        match await_batch(ctx, &campaign_id, batch).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Outcome::Cancelled,
            Err(e) => return Outcome::Failed(e),
        }
        ctx.state.set_campaign(None);

        let last = i + 1 == total_batches;
        if !last && !cfg.wait_time.is_zero() && ctx.state.sleep_cancellable(cfg.wait_time).await {
            return Outcome::Cancelled;
        }
    }

    Outcome::Succeeded
}

async fn run_canary(ctx: &RolloutCtx, cfg: &CanaryConfig) -> Outcome {
    let total = ctx.devices.len();
    let total_steps = cfg.steps.len();
    let mut deployed = 0usize;

    for (i, step) in cfg.steps.iter().enumerate() {
        if ctx.state.is_cancelled() {
            return Outcome::Cancelled;
        }
        ctx.state.set_current_step(i);

        let target = canary_target(total, step.weight).max(deployed);
        let batch = &ctx.devices[deployed..target];
        deployed = target;

        record_event(
            ctx,
            EventType::CanaryStepStarted,
            &format!(
                "step {}/{}: weight {}%, {} new devices",
                i + 1,
                total_steps,
                step.weight,
                batch.len()
            ),
        )
        .await;

        let last = i + 1 == total_steps;
        if !batch.is_empty() {
            let campaign_id =
                match open_campaign(ctx, batch, &format!("canary step {}/{}", i + 1, total_steps))
                    .await
                {
                    Ok(id) => id,
                    Err(e) => return Outcome::Failed(e),
                };

            if cfg.require_approval && !last {
                ctx.state.begin_approval_wait();
                record_event(
                    ctx,
                    EventType::CanaryAwaitingApproval,
                    &format!("step {}/{} awaiting approval", i + 1, total_steps),
                )
                .await;
                let cancelled = tokio::select! {
                    biased;
                    _ = ctx.state.cancelled() => true,
                    _ = ctx.state.approved() => false,
                };
                ctx.state.end_approval_wait();
                if cancelled {
                    if let Err(e) = ctx.updater.cancel_campaign(&campaign_id).await {
                        warn!(campaign_id = %campaign_id, error = %e, "Failed to cancel campaign");
                    }
                    return Outcome::Cancelled;
                }
            }

            match await_batch(ctx, &campaign_id, batch).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Outcome::Cancelled,
                Err(e) => return Outcome::Failed(e),
            }
            ctx.state.set_campaign(None);
        }

        if !step.duration.is_zero() && ctx.state.sleep_cancellable(step.duration).await {
            return Outcome::Cancelled;
        }

        if let Some(analysis) = &cfg.analysis {
            if let Some(evaluator) = &ctx.analysis {
                match evaluator.evaluate(&ctx.deployment, &analysis.metrics).await {
                    Ok(score) if score >= analysis.threshold => {
                        info!(
                            deployment_id = %ctx.state.deployment_id,
                            step = i + 1,
                            score,
                            "Canary analysis passed"
                        );
                    }
                    Ok(score) => {
                        record_event(
                            ctx,
                            EventType::CanaryAnalysisFailed,
                            &format!(
                                "step {}/{}: score {:.3} below threshold {:.3}",
                                i + 1,
                                total_steps,
                                score,
                                analysis.threshold
                            ),
                        )
                        .await;
                        return run_rollback(ctx, "canary analysis failed").await;
                    }
                    Err(e) => {
                        // No evaluator answer is treated like no evaluator:
                        // analysis passes rather than killing the rollout.
                        warn!(
                            deployment_id = %ctx.state.deployment_id,
                            error = %e,
                            "Canary analysis evaluator unavailable; step passes"
                        );
                    }
                }
            }
        }

        record_event(
            ctx,
            EventType::CanaryStepSucceeded,
            &format!("step {}/{} succeeded", i + 1, total_steps),
        )
        .await;
    }

    Outcome::Succeeded
}

async fn run_blue_green(ctx: &RolloutCtx, cfg: &BlueGreenConfig) -> Outcome {
    if ctx.state.is_cancelled() {
        return Outcome::Cancelled;
    }

    let campaign_id = match open_campaign(ctx, &ctx.devices, "green fleet").await {
        Ok(id) => id,
        Err(e) => return Outcome::Failed(e),
    };

    match await_batch(ctx, &campaign_id, &ctx.devices).await {
        Ok(()) => {}
        Err(Error::Cancelled) => return Outcome::Cancelled,
        Err(e) => return Outcome::Failed(e),
    }
    ctx.state.set_campaign(None);

    if cfg.auto_promote {
        if !cfg.promote_timeout.is_zero() && ctx.state.sleep_cancellable(cfg.promote_timeout).await
        {
            return Outcome::Cancelled;
        }
        record_event(
            ctx,
            EventType::BlueGreenPromoted,
            &format!(
                "promoted automatically after {}",
                convoy_core::manifest::duration::format(&cfg.promote_timeout)
            ),
        )
        .await;
    } else {
        ctx.state.begin_approval_wait();
        record_event(
            ctx,
            EventType::BlueGreenAwaitingPromotion,
            "waiting for manual promotion",
        )
        .await;
        let cancelled = tokio::select! {
            biased;
            _ = ctx.state.cancelled() => true,
            _ = ctx.state.approved() => false,
        };
        ctx.state.end_approval_wait();
        if cancelled {
            return Outcome::Cancelled;
        }
        record_event(ctx, EventType::BlueGreenPromoted, "promoted by operator").await;
    }

    if !cfg.scale_down_delay.is_zero() && ctx.state.sleep_cancellable(cfg.scale_down_delay).await {
        return Outcome::Cancelled;
    }

    Outcome::Succeeded
}

/// Roll the touched devices back to their previous version. The revert
/// content is resolved by the distribution service; the engine only names
/// the devices. Ends the deployment `succeeded` when the revert campaign
/// completes, `failed` otherwise.
pub(crate) async fn run_rollback(ctx: &RolloutCtx, reason: &str) -> Outcome {
    let id = ctx.state.deployment_id;
    if let Err(e) = ctx
        .store
        .update_status(id, convoy_core::deployment::DeploymentStatus::RollingBack)
        .await
    {
        return Outcome::RollbackFailed(e);
    }
    record_event(ctx, EventType::RollbackStarted, reason).await;

    let touched: Vec<String> = match ctx.store.list_assignments(id).await {
        Ok(assignments) => assignments
            .into_iter()
            .filter(|a| a.status != AssignmentStatus::Pending)
            .map(|a| a.device_id)
            .collect(),
        Err(e) => return Outcome::RollbackFailed(e),
    };

    if touched.is_empty() {
        return Outcome::RolledBack;
    }

    info!(deployment_id = %id, devices = touched.len(), reason, "Rolling back");

    let campaign_id = match ctx.updater.create_campaign(&ctx.deployment, &touched).await {
        Ok(id) => id,
        Err(e) => {
            return Outcome::RollbackFailed(Error::RolloutFailed(format!(
                "revert campaign creation failed: {}",
                e
            )));
        }
    };
    ctx.state.set_campaign(Some(campaign_id.clone()));

    match monitor_campaign(ctx, &campaign_id).await {
        Ok(progress) if progress.failed == 0 => Outcome::RolledBack,
        Ok(progress) => Outcome::RollbackFailed(Error::RolloutFailed(format!(
            "{} of {} devices failed to revert",
            progress.failed, progress.total
        ))),
        // rolling_back only resolves to succeeded or failed; a cancel here
        // ends the rollback as failed.
        Err(Error::Cancelled) => Outcome::RollbackFailed(Error::RolloutFailed(
            "cancelled while rolling back".to_string(),
        )),
        Err(e) => Outcome::RollbackFailed(e),
    }
}

/// Create a campaign for a batch and mark its assignments running.
async fn open_campaign(ctx: &RolloutCtx, batch: &[String], label: &str) -> Result<String, Error> {
    let campaign_id = ctx
        .updater
        .create_campaign(&ctx.deployment, batch)
        .await
        .map_err(|e| {
            Error::RolloutFailed(format!("campaign creation failed for {}: {}", label, e))
        })?;
    ctx.state.set_campaign(Some(campaign_id.clone()));

    record_event(
        ctx,
        EventType::CampaignCreated,
        &format!("{}: campaign {} for {} devices", label, campaign_id, batch.len()),
    )
    .await;

    for device in batch {
        if let Err(e) = ctx
            .store
            .update_assignment(
                ctx.state.deployment_id,
                device,
                AssignmentStatus::Running,
                0,
                "update dispatched",
            )
            .await
        {
            warn!(device_id = %device, error = %e, "Failed to mark assignment running");
        }
    }
    Ok(campaign_id)
}

/// Monitor a campaign to completion and fold the result into the batch's
/// assignments.
async fn await_batch(
    ctx: &RolloutCtx,
    campaign_id: &str,
    batch: &[String],
) -> Result<(), Error> {
    let progress = monitor_campaign(ctx, campaign_id).await?;
    if progress.failed == 0 {
        for device in batch {
            if let Err(e) = ctx
                .store
                .update_assignment(
                    ctx.state.deployment_id,
                    device,
                    AssignmentStatus::Succeeded,
                    100,
                    "update completed",
                )
                .await
            {
                warn!(device_id = %device, error = %e, "Failed to mark assignment succeeded");
            }
        }
        Ok(())
    } else {
        // The adapter records per-device outcomes where it can; any batch
        // device still non-terminal is counted against the campaign.
        mark_unfinished_failed(ctx, batch, campaign_id).await;
        Err(Error::RolloutFailed(format!(
            "campaign {}: {} of {} devices failed",
            campaign_id, progress.failed, progress.total
        )))
    }
}

async fn mark_unfinished_failed(ctx: &RolloutCtx, batch: &[String], campaign_id: &str) {
    let assignments = match ctx.store.list_assignments(ctx.state.deployment_id).await {
        Ok(assignments) => assignments,
        Err(e) => {
            warn!(error = %e, "Failed to list assignments after campaign failure");
            return;
        }
    };
    for assignment in assignments {
        if batch.contains(&assignment.device_id) && !assignment.status.is_terminal() {
            if let Err(e) = ctx
                .store
                .update_assignment(
                    ctx.state.deployment_id,
                    &assignment.device_id,
                    AssignmentStatus::Failed,
                    assignment.progress,
                    &format!("campaign {} reported failures", campaign_id),
                )
                .await
            {
                warn!(device_id = %assignment.device_id, error = %e, "Failed to mark assignment failed");
            }
        }
    }
}

/// Poll the campaign until every device reaches a terminal state, the cancel
/// signal fires, or the hard timeout lapses. Transient status failures are
/// logged and retried on the next tick.
async fn monitor_campaign(
    ctx: &RolloutCtx,
    campaign_id: &str,
) -> Result<CampaignProgress, Error> {
    let started = tokio::time::Instant::now();
    loop {
        let cancelled = tokio::select! {
            biased;
            _ = ctx.state.cancelled() => true,
            _ = tokio::time::sleep(ctx.config.poll_interval) => false,
        };
        if cancelled {
            if let Err(e) = ctx.updater.cancel_campaign(campaign_id).await {
                warn!(campaign_id = %campaign_id, error = %e, "Failed to cancel campaign");
            }
            return Err(Error::Cancelled);
        }
        if started.elapsed() >= ctx.config.campaign_timeout {
            return Err(Error::Timeout(format!("campaign {} timed out", campaign_id)));
        }

        match ctx.updater.campaign_status(campaign_id).await {
            Ok(status) => {
                if status.progress.is_complete() {
                    return Ok(status.progress);
                }
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "Campaign status query failed; retrying");
            }
        }
    }
}

async fn record_event(ctx: &RolloutCtx, event_type: EventType, message: &str) {
    if let Err(e) = ctx
        .store
        .append_event(ctx.state.deployment_id, None, event_type, message)
        .await
    {
        warn!(
            deployment_id = %ctx.state.deployment_id,
            event = %event_type,
            error = %e,
            "Failed to append event"
        );
    }
}
