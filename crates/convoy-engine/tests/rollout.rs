//! Strategy execution scenarios against in-process fakes.

mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use convoy_core::deployment::{AssignmentStatus, DeploymentStatus, EventType};
use convoy_core::inventory::DeviceRecord;
use convoy_core::store::DeploymentStore;

use support::*;

fn manifest(strategy_block: &str) -> String {
    format!(
        r#"
apiVersion: fleet/v1
kind: Deployment
metadata:
  name: fleet-agent
spec:
  selector:
    matchLabels: {{env: prod}}
  strategy:
{}
  template:
    spec:
      artifacts:
        - name: agent
          version: 1.2.3
          url: https://artifacts.example.com/agent-1.2.3.tar.gz
"#,
        strategy_block
    )
}

fn rolling_manifest(max_unavailable: &str) -> String {
    manifest(&format!(
        "    type: RollingUpdate\n    rollingUpdate:\n      maxUnavailable: {}",
        max_unavailable
    ))
}

#[tokio::test]
async fn rolling_quarter_of_eight_runs_four_even_batches() {
    let h = harness(prod_devices(8), FakeUpdater::new());
    let deployment = h
        .orchestrator
        .create_deployment(rolling_manifest("25%").as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);

    let batches = h.updater.batches();
    let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![2, 2, 2, 2]);

    let status = h.orchestrator.get_status(deployment.id).await.unwrap();
    assert_eq!(status.progress.total, 8);
    assert_eq!(status.progress.succeeded, 8);
    assert!((status.progress.percentage - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn rolling_absolute_three_runs_uneven_tail_batch() {
    let h = harness(prod_devices(8), FakeUpdater::new());
    let deployment = h
        .orchestrator
        .create_deployment(rolling_manifest("\"3\"").as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);
    let sizes: Vec<usize> = h.updater.batches().iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![3, 3, 2]);
}

#[tokio::test]
async fn rolling_full_fleet_is_a_single_batch() {
    let h = harness(prod_devices(8), FakeUpdater::new());
    let deployment = h
        .orchestrator
        .create_deployment(rolling_manifest("100%").as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);
    assert_eq!(h.updater.batches().len(), 1);
    assert_eq!(h.updater.batches()[0].len(), 8);
}

#[tokio::test]
async fn canary_steps_cover_new_devices_per_step() {
    let h = harness(prod_devices(100), FakeUpdater::new());
    let yaml = manifest(
        r#"    type: Canary
    canary:
      steps:
        - {weight: 5, duration: 10ms}
        - {weight: 25, duration: 10ms}
        - {weight: 50, duration: 10ms}
        - {weight: 100, duration: 10ms}"#,
    );
    let deployment = h
        .orchestrator
        .create_deployment(yaml.as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);

    let sizes: Vec<usize> = h.updater.batches().iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![5, 20, 25, 50]);

    let status = h.orchestrator.get_status(deployment.id).await.unwrap();
    assert_eq!(status.progress.succeeded, 100);

    let store = &h.store;
    assert_eq!(store.events_of_type(deployment.id, EventType::CanaryStepStarted).len(), 4);
    assert_eq!(store.events_of_type(deployment.id, EventType::CanaryStepSucceeded).len(), 4);
    assert_eq!(store.events_of_type(deployment.id, EventType::DeploymentSucceeded).len(), 1);
}

#[tokio::test]
async fn single_step_canary_at_full_weight_is_one_batch() {
    let h = harness(prod_devices(10), FakeUpdater::new());
    let yaml = manifest(
        r#"    type: Canary
    canary:
      steps:
        - {weight: 100}"#,
    );
    let deployment = h
        .orchestrator
        .create_deployment(yaml.as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);
    assert_eq!(h.updater.batches().len(), 1);
    assert_eq!(h.updater.batches()[0].len(), 10);
}

#[tokio::test]
async fn blue_green_auto_promotes_on_schedule() {
    let h = harness(prod_devices(5), FakeUpdater::new());
    let yaml = manifest(
        r#"    type: BlueGreen
    blueGreen:
      autoPromote: true
      promoteTimeout: 50ms
      scaleDownDelay: 10ms"#,
    );
    let deployment = h
        .orchestrator
        .create_deployment(yaml.as_bytes(), "tester")
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    h.orchestrator.start(deployment.id).await.unwrap();
    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);
    let elapsed = started.elapsed();

    // One campaign covers the whole fleet; promote + scale-down delays are
    // honoured.
    assert_eq!(h.updater.batches().len(), 1);
    assert_eq!(h.updater.batches()[0].len(), 5);
    assert!(elapsed >= Duration::from_millis(60), "finished too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(150), "took too long: {:?}", elapsed);
    assert_eq!(
        h.store.events_of_type(deployment.id, EventType::BlueGreenPromoted).len(),
        1
    );
}

#[tokio::test]
async fn selector_limits_batches_to_matching_devices() {
    let mut devices = Vec::new();
    for i in 0..10 {
        let mut labels = BTreeMap::new();
        if i < 3 {
            labels.insert("env".to_string(), "prod".to_string());
            labels.insert("tier".to_string(), "web".to_string());
        } else if i < 6 {
            labels.insert("env".to_string(), "prod".to_string());
        } else {
            labels.insert("env".to_string(), "staging".to_string());
        }
        devices.push(DeviceRecord {
            id: format!("edge-{:02}", i),
            labels,
        });
    }

    let h = harness(devices, FakeUpdater::new());
    let yaml = r#"
apiVersion: fleet/v1
kind: Deployment
metadata:
  name: web-fleet
spec:
  selector:
    matchLabels: {env: prod, tier: web}
  template:
    spec:
      artifacts:
        - name: agent
          version: 1.2.3
"#;
    let deployment = h
        .orchestrator
        .create_deployment(yaml.as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);

    let mut deployed: Vec<String> = h.updater.batches().into_iter().flatten().collect();
    deployed.sort();
    assert_eq!(deployed, vec!["edge-00", "edge-01", "edge-02"]);
}

#[tokio::test]
async fn campaign_failure_fails_the_rollout_without_rollback() {
    let h = harness(prod_devices(8), FakeUpdater::failing_campaign(1));
    let deployment = h
        .orchestrator
        .create_deployment(rolling_manifest("25%").as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Failed);

    // The first batch landed, the failing second batch stopped the rollout.
    assert_eq!(h.updater.batches().len(), 2);
    assert!(!h.store.events_of_type(deployment.id, EventType::DeploymentFailed).is_empty());
    assert!(h.store.events_of_type(deployment.id, EventType::RollbackStarted).is_empty());

    let assignments = h.store.list_assignments(deployment.id).await.unwrap();
    let succeeded = assignments
        .iter()
        .filter(|a| a.status == AssignmentStatus::Succeeded)
        .count();
    let failed = assignments
        .iter()
        .filter(|a| a.status == AssignmentStatus::Failed)
        .count();
    let pending = assignments
        .iter()
        .filter(|a| a.status == AssignmentStatus::Pending)
        .count();
    assert_eq!(succeeded, 2);
    assert_eq!(failed, 2);
    assert_eq!(pending, 4);
}

#[tokio::test]
async fn campaign_creation_failure_fails_the_rollout() {
    let h = harness(prod_devices(4), FakeUpdater::failing_create(0));
    let deployment = h
        .orchestrator
        .create_deployment(rolling_manifest("50%").as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Failed);
    let failures = h.store.events_of_type(deployment.id, EventType::DeploymentFailed);
    assert!(failures[0].message.contains("campaign creation failed"));
}

#[tokio::test]
async fn failed_canary_analysis_triggers_rollback() {
    let h = harness_with_analysis(prod_devices(10), FakeUpdater::new(), 0.42);
    let yaml = manifest(
        r#"    type: Canary
    canary:
      steps:
        - {weight: 50, duration: 5ms}
        - {weight: 100}
      analysis:
        metrics: [error_rate]
        threshold: 0.9"#,
    );
    let deployment = h
        .orchestrator
        .create_deployment(yaml.as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    // Rollback completion ends the deployment succeeded.
    assert_eq!(wait_terminal(&h, deployment.id).await, DeploymentStatus::Succeeded);

    assert!(!h.store.events_of_type(deployment.id, EventType::CanaryAnalysisFailed).is_empty());
    assert!(!h.store.events_of_type(deployment.id, EventType::RollbackStarted).is_empty());
    assert!(!h.store.events_of_type(deployment.id, EventType::RollbackCompleted).is_empty());

    // The revert campaign targets exactly the devices the canary touched.
    let batches = h.updater.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1], batches[0]);
}

#[tokio::test]
async fn progress_is_monotone_during_a_rollout() {
    let updater = FakeUpdater::new();
    updater.set_polls_to_complete(3);
    let h = harness(prod_devices(8), updater);
    let deployment = h
        .orchestrator
        .create_deployment(rolling_manifest("25%").as_bytes(), "tester")
        .await
        .unwrap();
    h.orchestrator.start(deployment.id).await.unwrap();

    let mut last = -1.0f64;
    loop {
        let status = h.orchestrator.get_status(deployment.id).await.unwrap();
        assert!(
            status.progress.percentage >= last,
            "progress regressed from {} to {}",
            last,
            status.progress.percentage
        );
        assert_eq!(status.progress.total, 8, "assignment count must stay fixed");
        last = status.progress.percentage;
        if status.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    assert!((last - 100.0).abs() < f64::EPSILON);
}
