//! End-to-end job lifecycle against a real SQLite store with fake collaborators.

mod common;

use std::time::Duration;

use chrono::Utc;
use stemsplit::Error;
use stemsplit::database::repositories::TransitionFields;
use stemsplit::domain::{FailureReason, JobStatus};
use stemsplit::pipeline::{CollaboratorError, ExecutionOutcome, FailureCause};

use common::{API_KEY, Harness, STEMS, ScriptedDownloader, video_url};

#[tokio::test]
async fn test_job_completes_with_all_stems() {
    let h = Harness::new().await;
    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(1))
        .await
        .unwrap();
    assert!(submission.is_new);
    assert_eq!(submission.status, JobStatus::Pending);

    let outcomes = h.drive_to_terminal(&submission.job_id).await;
    assert_eq!(outcomes, vec![ExecutionOutcome::Completed]);

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.attempt_count, 1);
    assert!(job.completed_at.is_some());
    assert!(job.expires_at.unwrap() > Utc::now());

    let names: Vec<_> = job.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, STEMS.to_vec());
    for artifact in &job.artifacts {
        assert!(artifact.file.starts_with("stems/"), "unexpected path {}", artifact.file);
        let resolved = h
            .container
            .artifacts
            .resolve(&job, &artifact.name, Utc::now())
            .await
            .unwrap();
        assert!(resolved.size > 0);
    }

    // Fetched audio is scratch data.
    assert!(!h.container.artifacts.fetched_audio(&job.id).exists());
    assert_eq!(h.container.queue.depth().await.unwrap(), 0);
    assert_eq!(h.container.admission.quota().active("client-a"), 0);

    // The cache holds the stored expiry exactly, as a rebuild after restart would.
    let entry = h.container.cache.get(&job.input_key).unwrap();
    assert_eq!(entry.job_id, job.id);
    assert_eq!(entry.expires_at, job.expires_at);
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let downloader = ScriptedDownloader::with_script([
        Err(CollaboratorError::new(FailureCause::Network, "connection reset")),
        Err(CollaboratorError::new(FailureCause::RateLimited, "HTTP Error 429")),
    ]);
    let h = Harness::build(|_| {}, downloader).await;

    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(2))
        .await
        .unwrap();
    let outcomes = h.drive_to_terminal(&submission.job_id).await;

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], ExecutionOutcome::Requeued { attempt: 1, .. }));
    assert!(matches!(outcomes[1], ExecutionOutcome::Requeued { attempt: 2, .. }));
    assert_eq!(outcomes[2], ExecutionOutcome::Completed);

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(h.downloader.calls(), 3);
    assert_eq!(h.separator.calls(), 1);

    let snapshot = h.container.metrics.snapshot();
    assert_eq!(snapshot.job_retries, 2);
    assert_eq!(snapshot.jobs_completed, 1);
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts() {
    let downloader = ScriptedDownloader::with_script(
        (0..3).map(|_| Err(CollaboratorError::new(FailureCause::Timeout, "read timed out"))),
    );
    let h = Harness::build(|_| {}, downloader).await;

    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(3))
        .await
        .unwrap();
    let outcomes = h.drive_to_terminal(&submission.job_id).await;
    assert_eq!(
        outcomes.last(),
        Some(&ExecutionOutcome::Failed(FailureReason::AttemptsExhausted))
    );

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 3);
    let error = job.error.unwrap();
    assert_eq!(error.reason, FailureReason::AttemptsExhausted);
    assert_eq!(error.stage, Some(JobStatus::Fetching));
    assert_eq!(h.separator.calls(), 0);
}

#[tokio::test]
async fn test_permanent_failure_releases_everything() {
    let downloader = ScriptedDownloader::with_script([Err(CollaboratorError::new(
        FailureCause::ContentUnavailable,
        "Video unavailable",
    ))]);
    let h = Harness::build(|_| {}, downloader).await;

    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(4))
        .await
        .unwrap();
    assert_eq!(h.container.admission.quota().active("client-a"), 1);

    let outcomes = h.drive_to_terminal(&submission.job_id).await;
    assert_eq!(outcomes, vec![ExecutionOutcome::Failed(FailureReason::Permanent)]);

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.attempt_count, 1);
    assert!(job.artifacts.is_empty());
    assert!(job.error.unwrap().message.contains("Video unavailable"));

    assert_eq!(h.container.admission.quota().active("client-a"), 0);
    assert!(h.container.cache.get(&job.input_key).is_none());
    assert!(!h.container.artifacts.job_dir(&job.id).exists());
    assert_eq!(h.container.queue.depth().await.unwrap(), 0);

    // A failed job is not joined; resubmitting starts over.
    let again = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(4))
        .await
        .unwrap();
    assert!(again.is_new);
    assert_ne!(again.job_id, submission.job_id);
}

#[tokio::test]
async fn test_job_timeout_fails_the_attempt() {
    let downloader = ScriptedDownloader::new().with_delay(Duration::from_secs(5));
    let h = Harness::build(|c| c.job_timeout = Duration::from_millis(100), downloader).await;

    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(5))
        .await
        .unwrap();
    let outcomes = h.drive_to_terminal(&submission.job_id).await;
    assert_eq!(outcomes, vec![ExecutionOutcome::Failed(FailureReason::Timeout)]);

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().reason, FailureReason::Timeout);
    assert_eq!(h.container.admission.quota().active("client-a"), 0);
}

#[tokio::test]
async fn test_lapsed_lease_is_recovered_without_duplicate_artifacts() {
    let h = Harness::build(|c| c.lease_timeout = Duration::from_millis(100), ScriptedDownloader::new()).await;
    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(6))
        .await
        .unwrap();

    // A worker leases the job, picks it up, then dies without acking.
    let crashed = h.container.queue.lease().await.unwrap().unwrap();
    h.container
        .jobs
        .compare_and_set_status(
            &submission.job_id,
            JobStatus::Pending,
            JobStatus::Fetching,
            TransitionFields::new().pickup().at_attempt(0),
        )
        .await
        .unwrap();

    assert!(h.container.queue.lease().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcomes = h.drive_to_terminal(&submission.job_id).await;
    assert_eq!(outcomes, vec![ExecutionOutcome::Completed]);

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.artifacts.len(), STEMS.len());
    assert_eq!(h.downloader.calls(), 1);

    // The crashed worker's lease is gone for good.
    assert!(!h.container.queue.ack(&crashed).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_running_job_keeps_its_lease_past_lease_timeout() {
    let downloader = ScriptedDownloader::new().with_delay(Duration::from_millis(500));
    let h = Harness::build(
        |c| {
            c.lease_timeout = Duration::from_millis(100);
            c.job_timeout = Duration::from_secs(10);
        },
        downloader,
    )
    .await;
    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(10))
        .await
        .unwrap();

    let executor = h.executor().clone();
    let running = tokio::spawn(async move { executor.run_once().await });

    // Twice the lease timeout in, the job must still be held.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.executor().run_once().await.unwrap(), None);
    assert_eq!(h.downloader.calls(), 1);

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, Some(ExecutionOutcome::Completed));
    assert_eq!(h.downloader.calls(), 1);

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_lease_abandons_attempt() {
    let downloader = ScriptedDownloader::new().with_delay(Duration::from_millis(500));
    let h = Harness::build(|c| c.lease_timeout = Duration::from_millis(100), downloader).await;
    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(11))
        .await
        .unwrap();

    let executor = h.executor().clone();
    let running = tokio::spawn(async move { executor.run_once().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Someone else now holds the entry.
    sqlx::query("UPDATE work_queue SET lease_token = 'other-worker' WHERE job_id = ?")
        .bind(&submission.job_id)
        .execute(&h.container.pool)
        .await
        .unwrap();

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, Some(ExecutionOutcome::Superseded));

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.status, JobStatus::Fetching);
    assert!(job.artifacts.is_empty());
    assert_eq!(h.separator.calls(), 0);
    // Quota stays with the job until whoever holds it now finishes.
    assert_eq!(h.container.admission.quota().active("client-a"), 1);
}

#[tokio::test]
async fn test_stale_writer_loses_compare_and_set() {
    let h = Harness::new().await;
    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(7))
        .await
        .unwrap();
    let jobs = &h.container.jobs;

    jobs.compare_and_set_status(
        &submission.job_id,
        JobStatus::Pending,
        JobStatus::Fetching,
        TransitionFields::new().pickup().at_attempt(0),
    )
    .await
    .unwrap();

    // Second pickup expecting the old attempt number.
    let err = jobs
        .compare_and_set_status(
            &submission.job_id,
            JobStatus::Fetching,
            JobStatus::Fetching,
            TransitionFields::new().pickup().at_attempt(0),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Terminal states never move.
    let err = jobs
        .compare_and_set_status(
            &submission.job_id,
            JobStatus::Completed,
            JobStatus::Fetching,
            TransitionFields::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    let job = h.job(&submission.job_id).await;
    assert_eq!(job.status, JobStatus::Fetching);
    assert_eq!(job.attempt_count, 1);
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let h = Harness::new().await;
    let submission = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &video_url(8))
        .await
        .unwrap();
    let jobs = &h.container.jobs;

    jobs.compare_and_set_status(
        &submission.job_id,
        JobStatus::Pending,
        JobStatus::Fetching,
        TransitionFields::new().pickup().progress(40),
    )
    .await
    .unwrap();
    let job = jobs
        .compare_and_set_status(
            &submission.job_id,
            JobStatus::Fetching,
            JobStatus::Fetching,
            TransitionFields::new().progress(20),
        )
        .await
        .unwrap();
    assert_eq!(job.progress, 40);
}

#[tokio::test]
async fn test_expired_job_is_swept_and_resubmission_is_new() {
    let h = Harness::build(|c| c.retention = Duration::from_millis(200), ScriptedDownloader::new()).await;
    let url = video_url(9);
    let first = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &url)
        .await
        .unwrap();
    h.drive_to_terminal(&first.job_id).await;

    let job = h.job(&first.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(h.container.artifacts.resolve(&job, "vocals", Utc::now()).await.is_ok());

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Past expires_at the artifacts are gone even before the sweep runs.
    let err = h
        .container
        .artifacts
        .resolve(&job, "vocals", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let report = h.container.sweeper().run_sweep(Utc::now()).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(h.job(&first.job_id).await.status, JobStatus::Expired);
    assert!(!h.container.artifacts.job_dir(&first.job_id).exists());

    let second = h
        .container
        .job_service
        .submit("client-a", Some(API_KEY), &url)
        .await
        .unwrap();
    assert!(second.is_new);
    assert_ne!(second.job_id, first.job_id);
}
