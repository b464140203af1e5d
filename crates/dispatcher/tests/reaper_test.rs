use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use dispatch_core::models::{Instance, JobKind, JobStatus};
use dispatch_dispatcher::{Reaper, ReaperConfig};
use dispatch_testing_utils::{JobRecordBuilder, MockJobRepository};

const REAPED_MARKER: &str = "marked as failed by the reaper";

fn reaper(repo: &MockJobRepository) -> Reaper {
    Reaper::new(Arc::new(repo.clone()), ReaperConfig::default())
}

fn node1() -> Instance {
    Instance::new("node1")
}

#[tokio::test]
async fn test_should_reap_running_job() {
    let repo = MockJobRepository::with_jobs(vec![JobRecordBuilder::new()
        .with_id(1)
        .running_on("node1")
        .build()]);

    let reaped = reaper(&repo).reap(&node1(), &[], None).await.unwrap();
    assert_eq!(reaped.len(), 1);

    let job = repo.get(1).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.job_explanation.contains(REAPED_MARKER));
    assert!(job.job_explanation.contains("node1"));
    assert_eq!(job.start_args, "");
    assert_eq!(reaped[0], job);
}

#[tokio::test]
async fn test_should_reap_by_controller_node() {
    let repo = MockJobRepository::with_jobs(vec![JobRecordBuilder::new()
        .with_id(1)
        .running_on("exec-node")
        .with_controller_node("node1")
        .build()]);

    let reaped = reaper(&repo).reap(&node1(), &[], None).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_other_nodes_and_statuses_are_ignored() {
    let repo = MockJobRepository::with_jobs(vec![
        JobRecordBuilder::new().with_id(1).running_on("node2").build(),
        JobRecordBuilder::new()
            .with_id(2)
            .with_status(JobStatus::Pending)
            .with_execution_node("node1")
            .build(),
        JobRecordBuilder::new()
            .with_id(3)
            .with_status(JobStatus::Successful)
            .with_execution_node("node1")
            .build(),
    ]);

    let reaped = reaper(&repo).reap(&node1(), &[], None).await.unwrap();
    assert!(reaped.is_empty());
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Running);
    assert_eq!(repo.get(2).unwrap().status, JobStatus::Pending);
    assert_eq!(repo.get(3).unwrap().status, JobStatus::Successful);
}

#[tokio::test]
async fn test_should_reap_stale_waiting_job() {
    let repo = MockJobRepository::with_jobs(vec![
        JobRecordBuilder::new()
            .with_id(1)
            .waiting_on("node1", Duration::hours(25))
            .build(),
        JobRecordBuilder::new()
            .with_id(2)
            .waiting_on("node1", Duration::seconds(30))
            .build(),
    ]);

    let reaped = reaper(&repo)
        .reap_waiting(&node1(), &[], None)
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, 1);

    let stale = repo.get(1).unwrap();
    assert_eq!(stale.status, JobStatus::Failed);
    assert!(stale.job_explanation.contains(REAPED_MARKER));
    assert_eq!(stale.start_args, "");
    assert_eq!(repo.get(2).unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn test_waiting_reap_only_considers_controller_node() {
    let repo = MockJobRepository::with_jobs(vec![JobRecordBuilder::new()
        .with_id(1)
        .waiting_on("other-controller", Duration::hours(25))
        .with_execution_node("node1")
        .build()]);

    let reaped = reaper(&repo)
        .reap_waiting(&node1(), &[], None)
        .await
        .unwrap();
    assert!(reaped.is_empty());
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn test_waiting_grace_period_is_configurable() {
    let repo = MockJobRepository::with_jobs(vec![JobRecordBuilder::new()
        .with_id(1)
        .waiting_on("node1", Duration::seconds(30))
        .build()]);
    let reaper = Reaper::new(
        Arc::new(repo.clone()),
        ReaperConfig {
            waiting_grace_period: StdDuration::from_secs(10),
        },
    );

    let reaped = reaper.reap_waiting(&node1(), &[], None).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert!(reaped[0].job_explanation.contains("10 seconds"));
}

#[tokio::test]
async fn test_excluded_uuids_are_never_reaped() {
    let running = JobRecordBuilder::new()
        .with_id(1)
        .with_uuid("running-uuid")
        .running_on("node1")
        .build();
    let waiting = JobRecordBuilder::new()
        .with_id(2)
        .with_uuid("waiting-uuid")
        .waiting_on("node1", Duration::hours(25))
        .build();
    let repo = MockJobRepository::with_jobs(vec![running, waiting]);
    let excluded = vec!["running-uuid".to_string(), "waiting-uuid".to_string()];

    let reaper = reaper(&repo);
    assert!(reaper.reap(&node1(), &excluded, None).await.unwrap().is_empty());
    assert!(reaper
        .reap_waiting(&node1(), &excluded, None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Running);
    assert_eq!(repo.get(2).unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn test_ref_time_protects_recently_started_jobs() {
    let ref_time = Utc::now() - Duration::minutes(5);
    let repo = MockJobRepository::with_jobs(vec![
        // 参考时间之前开始
        JobRecordBuilder::new()
            .with_id(1)
            .running_on("node1")
            .with_started(ref_time - Duration::seconds(1))
            .build(),
        // 恰好在参考时间开始
        JobRecordBuilder::new()
            .with_id(2)
            .running_on("node1")
            .with_started(ref_time)
            .build(),
        // 参考时间之后开始
        JobRecordBuilder::new()
            .with_id(3)
            .running_on("node1")
            .with_started(ref_time + Duration::seconds(1))
            .build(),
        // 还没有开始时间
        JobRecordBuilder::new()
            .with_id(4)
            .with_status(JobStatus::Running)
            .with_execution_node("node1")
            .build(),
    ]);

    let reaped = reaper(&repo)
        .reap(&node1(), &[], Some(ref_time))
        .await
        .unwrap();
    let ids: Vec<i64> = reaped.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![1]);
    for id in [2, 3, 4] {
        assert_eq!(repo.get(id).unwrap().status, JobStatus::Running);
    }
}

#[tokio::test]
async fn test_without_ref_time_unstarted_jobs_are_reaped() {
    let repo = MockJobRepository::with_jobs(vec![JobRecordBuilder::new()
        .with_id(1)
        .with_status(JobStatus::Running)
        .with_execution_node("node1")
        .build()]);

    let reaped = reaper(&repo).reap(&node1(), &[], None).await.unwrap();
    assert_eq!(reaped.len(), 1);
}

#[tokio::test]
async fn test_workflow_jobs_are_not_reaped() {
    let repo = MockJobRepository::with_jobs(vec![
        JobRecordBuilder::new()
            .with_id(1)
            .with_kind(JobKind::WorkflowJob)
            .running_on("node1")
            .build(),
        JobRecordBuilder::new()
            .with_id(2)
            .with_kind(JobKind::WorkflowJob)
            .waiting_on("node1", Duration::hours(25))
            .build(),
    ]);

    let reaper = reaper(&repo);
    assert!(reaper.reap(&node1(), &[], None).await.unwrap().is_empty());
    assert!(reaper
        .reap_waiting(&node1(), &[], None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Running);
    assert_eq!(repo.get(2).unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn test_explanation_is_appended() {
    let repo = MockJobRepository::with_jobs(vec![JobRecordBuilder::new()
        .with_id(1)
        .running_on("node1")
        .with_job_explanation("Previous explanation.")
        .build()]);

    reaper(&repo).reap(&node1(), &[], None).await.unwrap();
    let explanation = repo.get(1).unwrap().job_explanation;
    assert!(explanation.starts_with("Previous explanation. "));
    assert!(explanation.contains(REAPED_MARKER));
}

#[tokio::test]
async fn test_repository_errors_propagate() {
    let repo = MockJobRepository::with_jobs(vec![JobRecordBuilder::new()
        .with_id(1)
        .running_on("node1")
        .build()]);
    repo.fail_queries(true);

    assert!(reaper(&repo).reap(&node1(), &[], None).await.is_err());
    repo.fail_queries(false);
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_failed_update_does_not_stop_the_pass() {
    let repo = MockJobRepository::with_jobs(vec![
        JobRecordBuilder::new().with_id(1).running_on("node1").build(),
        JobRecordBuilder::new().with_id(2).running_on("node1").build(),
    ]);
    repo.fail_updates_for(1);

    let reaped = reaper(&repo).reap(&node1(), &[], None).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, 2);
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Running);
    assert_eq!(repo.get(2).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_failed_update_does_not_stop_the_waiting_pass() {
    let repo = MockJobRepository::with_jobs(vec![
        JobRecordBuilder::new()
            .with_id(1)
            .waiting_on("node1", Duration::hours(25))
            .build(),
        JobRecordBuilder::new()
            .with_id(2)
            .waiting_on("node1", Duration::hours(25))
            .build(),
    ]);
    repo.fail_updates_for(1);

    let reaped = reaper(&repo)
        .reap_waiting(&node1(), &[], None)
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, 2);
    assert_eq!(repo.get(1).unwrap().status, JobStatus::Waiting);
    assert_eq!(repo.get(2).unwrap().status, JobStatus::Failed);
}
