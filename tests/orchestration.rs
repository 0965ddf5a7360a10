//! End-to-end orchestration scenarios driven through the public API with a
//! temp database and in-memory queues.

use std::sync::Arc;

use stacflow::config::Settings;
use stacflow::models::{
    ErrorCategory, Job, JobStatus, WorkItemStatus, WorkItemUpdate, WorkflowStep,
};
use stacflow::queue::{MemoryQueueProvider, Queue, QueueProvider, WorkMessage};
use stacflow::repository::{migrations, RepositoryError, SqlitePool};
use stacflow::services::{
    CoreContext, Dispatcher, JobRequest, Orchestrator, UpdateDisposition, UpdateProcessor,
    WorkFailer,
};

const CATALOG: &str = "harmony/query-cmr";
const TRANSFORMER: &str = "example/subsetter";
const AGGREGATOR: &str = "example/aggregator";

struct Harness {
    ctx: CoreContext,
    orchestrator: Orchestrator,
    dispatcher: Dispatcher,
    updater: UpdateProcessor,
    failer: WorkFailer,
    _dir: tempfile::TempDir,
}

async fn harness(settings: Settings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = SqlitePool::from_path(&dir.path().join("stacflow.db"));
    migrations::ensure_schema(&pool).await.unwrap();
    let ctx = CoreContext::new(settings, pool, Arc::new(MemoryQueueProvider::new()));
    Harness {
        orchestrator: Orchestrator::new(ctx.clone()),
        dispatcher: Dispatcher::new(ctx.clone()),
        updater: UpdateProcessor::new(ctx.clone()),
        failer: WorkFailer::new(ctx.clone(), UpdateProcessor::new(ctx.clone())),
        ctx,
        _dir: dir,
    }
}

fn test_settings() -> Settings {
    Settings {
        work_item_retry_limit: 1,
        ..Settings::default()
    }
}

/// [catalog-query, transformer]
fn two_step_pipeline() -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new(1, CATALOG, r#"{"accessToken":"t0"}"#).input_producer(),
        WorkflowStep::new(2, TRANSFORMER, r#"{"accessToken":"t0"}"#),
    ]
}

/// [catalog-query, transformer, aggregator(batched)]
fn batched_pipeline(max_batch_inputs: i32) -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new(1, CATALOG, r#"{"accessToken":"t0"}"#).input_producer(),
        WorkflowStep::new(2, TRANSFORMER, "{}"),
        WorkflowStep::new(3, AGGREGATOR, "{}").batched(max_batch_inputs, 1_000_000_000),
    ]
}

impl Harness {
    async fn submit(&self, steps: Vec<WorkflowStep>, granules: i32, ignore_errors: bool) -> Job {
        self.orchestrator
            .create_job(JobRequest {
                username: "ada".to_string(),
                request_url: "https://harmony.example.com/req".to_string(),
                ignore_errors,
                num_input_granules: granules,
                collection_ids: vec!["C1234-PROV".to_string()],
                steps,
                preview: false,
            })
            .await
            .unwrap()
    }

    /// Claim one item for a service, expecting one to exist.
    async fn take(&self, service_id: &str) -> WorkMessage {
        self.dispatcher
            .get_work(service_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("expected ready work for {service_id}"))
    }

    async fn succeed(&self, work_item_id: i32, results: &[&str]) -> UpdateDisposition {
        let update = WorkItemUpdate::success(
            work_item_id,
            results.iter().map(|r| r.to_string()).collect(),
        );
        self.updater.process(&update).await.unwrap()
    }

    /// Keep failing an item (claiming it again after each requeue) until the
    /// retry budget runs out; the count lives on the item, not the update.
    async fn fail_until_terminal(&self, service_id: &str, message: &str) -> UpdateDisposition {
        loop {
            let claimed = self.take(service_id).await;
            let update = WorkItemUpdate::failure(claimed.work_item.id, message);
            match self.updater.process(&update).await.unwrap() {
                UpdateDisposition::Requeued => continue,
                disposition => return disposition,
            }
        }
    }

    async fn job(&self, job_id: &str) -> Job {
        self.orchestrator.get_job(job_id).await.unwrap()
    }

    async fn item_statuses(&self, job_id: &str) -> Vec<(String, WorkItemStatus)> {
        self.orchestrator
            .job_items(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|item| (item.service_id, item.status))
            .collect()
    }

    /// Backdate an item so the failer sees it as stuck.
    async fn age_item(&self, work_item_id: i32, minutes: i64) {
        use diesel::prelude::*;
        use diesel_async::RunQueryDsl;
        use stacflow::schema::work_items;

        let stale = (chrono::Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339();
        let mut conn = self.ctx.pool.get().await.unwrap();
        diesel::update(work_items::table.find(work_item_id))
            .set((
                work_items::updated_at.eq(&stale),
                work_items::started_at.eq(&stale),
            ))
            .execute(&mut conn)
            .await
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Spec scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_granule_success() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 1, false).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(catalog.work_item.id, &["s3://results/cat0.json"]).await;

    let transform = h.take(TRANSFORMER).await;
    assert_eq!(
        transform.work_item.stac_catalog_location.as_deref(),
        Some("s3://results/cat0.json")
    );
    let disposition = h.succeed(transform.work_item.id, &["s3://results/out0.json"]).await;
    assert_eq!(disposition, UpdateDisposition::JobCompleted);

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.progress, 100);
    assert!(job.links.iter().any(|l| l.href == "s3://results/out0.json"));

    let items = h.item_statuses(&job.id).await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|(_, s)| *s == WorkItemStatus::Successful));
}

#[tokio::test]
async fn single_granule_failure_without_ignore_errors() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 1, false).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(catalog.work_item.id, &["s3://results/cat0.json"]).await;

    let disposition = h.fail_until_terminal(TRANSFORMER, "no variables subset").await;
    assert_eq!(disposition, UpdateDisposition::JobFailed);

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "WorkItem failed: no variables subset");

    let items = h.item_statuses(&job.id).await;
    assert_eq!(items.len(), 2);
    assert!(items.contains(&(CATALOG.to_string(), WorkItemStatus::Successful)));
    assert!(items.contains(&(TRANSFORMER.to_string(), WorkItemStatus::Failed)));

    // No further updates are accepted for the failed item.
    let failed_id = h
        .orchestrator
        .job_items(&job.id)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.status == WorkItemStatus::Failed)
        .unwrap()
        .id;
    let late = h
        .updater
        .process(&WorkItemUpdate::success(failed_id, vec![]))
        .await
        .unwrap();
    assert!(matches!(late, UpdateDisposition::Dropped(_)));
}

#[tokio::test]
async fn three_granules_one_failure_with_ignore_errors() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 3, true).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(
        catalog.work_item.id,
        &["s3://g/0.json", "s3://g/1.json", "s3://g/2.json"],
    )
    .await;

    let disposition = h.fail_until_terminal(TRANSFORMER, "corrupt granule").await;
    assert_eq!(disposition, UpdateDisposition::Applied);
    assert_eq!(h.job(&job.id).await.status, JobStatus::RunningWithErrors);

    for _ in 0..2 {
        let item = h.take(TRANSFORMER).await;
        h.succeed(item.work_item.id, &["s3://out.json"]).await;
    }

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::CompleteWithErrors);
    assert_eq!(job.progress, 100);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].category, ErrorCategory::Error);
    assert_eq!(job.errors[0].message, "corrupt granule");
}

#[tokio::test]
async fn absolute_error_threshold_fails_job_and_cancels_remainder() {
    let settings = Settings {
        work_item_retry_limit: 0,
        max_errors_for_job: 1,
        ..Settings::default()
    };
    let h = harness(settings).await;
    let job = h.submit(two_step_pipeline(), 4, true).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(
        catalog.work_item.id,
        &["s3://g/0.json", "s3://g/1.json", "s3://g/2.json", "s3://g/3.json"],
    )
    .await;

    let first = h.take(TRANSFORMER).await;
    h.succeed(first.work_item.id, &["s3://out/0.json"]).await;

    let disposition = h.fail_until_terminal(TRANSFORMER, "bad granule").await;
    assert_eq!(disposition, UpdateDisposition::Applied);
    assert_eq!(h.job(&job.id).await.status, JobStatus::RunningWithErrors);

    let disposition = h.fail_until_terminal(TRANSFORMER, "bad granule").await;
    assert_eq!(disposition, UpdateDisposition::JobFailed);

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.errors.len(), 2);

    let items = h.item_statuses(&job.id).await;
    let canceled = items
        .iter()
        .filter(|(_, s)| *s == WorkItemStatus::Canceled)
        .count();
    assert_eq!(canceled, 1);

    // Nothing is left for dispatch after the cascade.
    assert!(h.dispatcher.get_work(TRANSFORMER).await.unwrap().is_none());
}

#[tokio::test]
async fn catalog_failure_is_fatal_despite_ignore_errors() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 3, true).await;

    let disposition = h.fail_until_terminal(CATALOG, "Bad scroll session").await;
    assert_eq!(disposition, UpdateDisposition::JobFailed);

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "WorkItem failed: Bad scroll session");

    // The pipeline never materialized downstream items.
    let items = h.item_statuses(&job.id).await;
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn batched_aggregation_with_midstream_failure() {
    let h = harness(test_settings()).await;
    let job = h.submit(batched_pipeline(1), 3, true).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(
        catalog.work_item.id,
        &["s3://g/0.json", "s3://g/1.json", "s3://g/2.json"],
    )
    .await;

    // First transformer success spawns the first aggregate item.
    let first = h.take(TRANSFORMER).await;
    h.succeed(first.work_item.id, &["s3://t/0.json"]).await;

    // Second transformer fails terminally; no aggregate for it.
    h.fail_until_terminal(TRANSFORMER, "corrupt granule").await;

    // Third succeeds and closes out the step, sealing the last batch.
    let third = h.take(TRANSFORMER).await;
    h.succeed(third.work_item.id, &["s3://t/2.json"]).await;

    let batches = h.ctx.batches.list_for_job(&job.id).await.unwrap();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|b| b.is_sealed));
    assert_eq!(batches.iter().filter(|b| b.is_last).count(), 1);

    // Both aggregate items carry their batch's catalog.
    let agg_one = h.take(AGGREGATOR).await;
    assert_eq!(
        agg_one.work_item.stac_catalog_locations,
        Some(vec!["s3://t/0.json".to_string()])
    );
    h.succeed(agg_one.work_item.id, &["s3://agg/0.json"]).await;
    let agg_two = h.take(AGGREGATOR).await;
    let disposition = h.succeed(agg_two.work_item.id, &["s3://agg/1.json"]).await;
    assert_eq!(disposition, UpdateDisposition::JobCompleted);

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::CompleteWithErrors);
    let items = h.item_statuses(&job.id).await;
    let aggregates: Vec<_> = items.iter().filter(|(s, _)| s == AGGREGATOR).collect();
    assert_eq!(aggregates.len(), 2);
    assert!(aggregates.iter().all(|(_, s)| *s == WorkItemStatus::Successful));
    assert_eq!(
        items
            .iter()
            .filter(|(s, st)| s == TRANSFORMER && *st == WorkItemStatus::Failed)
            .count(),
        1
    );
}

#[tokio::test]
async fn timeout_retries_before_failing() {
    let settings = Settings {
        work_item_retry_limit: 1,
        failable_work_age_minutes: 5,
        default_timeout_seconds: 60,
        ..Settings::default()
    };
    let h = harness(settings).await;
    let job = h.submit(two_step_pipeline(), 1, false).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(catalog.work_item.id, &["s3://g/0.json"]).await;

    let transform = h.take(TRANSFORMER).await;
    h.age_item(transform.work_item.id, 10).await;

    let stats = h.failer.sweep_once().await.unwrap();
    assert_eq!(stats.expired, 1);
    h.updater.process_queued_once().await.unwrap();

    // First timeout retries rather than failing outright.
    let item = h.ctx.work_items.get(transform.work_item.id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Ready);
    assert_eq!(item.retry_count, 1);
    assert_eq!(h.job(&job.id).await.status, JobStatus::Running);

    // Second timeout exhausts the budget and the error policy applies.
    let transform = h.take(TRANSFORMER).await;
    h.age_item(transform.work_item.id, 10).await;
    let stats = h.failer.sweep_once().await.unwrap();
    assert_eq!(stats.expired, 1);
    h.updater.process_queued_once().await.unwrap();

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let item = h.ctx.work_items.get(transform.work_item.id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Failed);
    assert!(item
        .message
        .unwrap()
        .contains("has exceeded the 60000 ms duration threshold"));
}

// ---------------------------------------------------------------------------
// Properties and control surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_terminal_update_has_no_effect() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 1, false).await;

    let catalog = h.take(CATALOG).await;
    let update = WorkItemUpdate::success(catalog.work_item.id, vec!["s3://g/0.json".to_string()]);
    h.updater.process(&update).await.unwrap();

    let before = h.job(&job.id).await;
    let items_before = h.item_statuses(&job.id).await;

    let second = h.updater.process(&update).await.unwrap();
    assert!(matches!(second, UpdateDisposition::Dropped(_)));

    let after = h.job(&job.id).await;
    assert_eq!(before.status, after.status);
    assert_eq!(before.progress, after.progress);
    assert_eq!(before.errors.len(), after.errors.len());
    assert_eq!(items_before, h.item_statuses(&job.id).await);
}

#[tokio::test]
async fn cancel_clears_all_active_work() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 2, false).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(catalog.work_item.id, &["s3://g/0.json", "s3://g/1.json"]).await;
    // One transformer in flight, one still ready.
    let claimed = h.take(TRANSFORMER).await;

    let job = h
        .orchestrator
        .cancel_job(&job.id, None, false)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.message, "Canceled by user.");

    let items = h.item_statuses(&job.id).await;
    assert!(items
        .iter()
        .all(|(_, s)| matches!(s, WorkItemStatus::Successful | WorkItemStatus::Canceled)));
    assert!(h.dispatcher.get_work(TRANSFORMER).await.unwrap().is_none());

    // The in-flight worker's late report is dropped.
    let late = h
        .updater
        .process(&WorkItemUpdate::success(claimed.work_item.id, vec![]))
        .await
        .unwrap();
    assert!(matches!(late, UpdateDisposition::Dropped(_)));

    // And a terminal job refuses further transitions.
    let err = h.orchestrator.pause_job(&job.id).await.unwrap_err();
    assert!(matches!(err, RepositoryError::IllegalStateTransition { .. }));
}

#[tokio::test]
async fn pause_hides_work_and_resume_restores_it() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 1, false).await;

    h.orchestrator.pause_job(&job.id).await.unwrap();
    assert!(h.dispatcher.get_work(CATALOG).await.unwrap().is_none());

    let resumed = h.orchestrator.resume_job(&job.id, None).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    assert!(h.dispatcher.get_work(CATALOG).await.unwrap().is_some());
}

#[tokio::test]
async fn resume_settles_a_finished_job() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 1, false).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(catalog.work_item.id, &["s3://g/0.json"]).await;
    let transform = h.take(TRANSFORMER).await;

    h.orchestrator.pause_job(&job.id).await.unwrap();
    // The in-flight item still completes while the job is paused.
    h.succeed(transform.work_item.id, &["s3://out.json"]).await;
    assert_eq!(h.job(&job.id).await.status, JobStatus::Paused);

    let resumed = h.orchestrator.resume_job(&job.id, None).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Successful);
    assert_eq!(resumed.progress, 100);
}

#[tokio::test]
async fn preview_pauses_after_first_downstream_work() {
    let h = harness(test_settings()).await;
    let job = h
        .orchestrator
        .create_job(JobRequest {
            username: "ada".to_string(),
            request_url: "https://harmony.example.com/req".to_string(),
            ignore_errors: false,
            num_input_granules: 2,
            collection_ids: vec![],
            steps: two_step_pipeline(),
            preview: true,
        })
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Previewing);

    // The catalog step runs during preview.
    let catalog = h.take(CATALOG).await;
    h.succeed(catalog.work_item.id, &["s3://g/0.json", "s3://g/1.json"]).await;

    // Downstream items exist now, so the job paused itself.
    assert_eq!(h.job(&job.id).await.status, JobStatus::Paused);
    assert!(h.dispatcher.get_work(TRANSFORMER).await.unwrap().is_none());

    let resumed = h.orchestrator.resume_job(&job.id, None).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    assert!(h.dispatcher.get_work(TRANSFORMER).await.unwrap().is_some());
}

#[tokio::test]
async fn skip_preview_refreshes_embedded_tokens() {
    let h = harness(test_settings()).await;
    let job = h
        .orchestrator
        .create_job(JobRequest {
            username: "ada".to_string(),
            request_url: "https://harmony.example.com/req".to_string(),
            ignore_errors: false,
            num_input_granules: 1,
            collection_ids: vec![],
            steps: two_step_pipeline(),
            preview: true,
        })
        .await
        .unwrap();

    let job = h
        .orchestrator
        .skip_preview(&job.id, Some("fresh-token"))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Running);

    for step in h.orchestrator.job_steps(&job.id).await.unwrap() {
        let operation: serde_json::Value = serde_json::from_str(&step.operation).unwrap();
        assert_eq!(operation["accessToken"], "fresh-token");
    }
}

#[tokio::test]
async fn catalog_paging_chains_scroll_ids() {
    let h = harness(test_settings()).await;
    let job = h.submit(two_step_pipeline(), 4, false).await;

    let page_one = h.take(CATALOG).await;
    assert_eq!(page_one.work_item.scroll_id, None);
    let mut update = WorkItemUpdate::success(page_one.work_item.id, vec!["s3://g/0.json".to_string()]);
    update.scroll_id = Some("scroll-1".to_string());
    h.updater.process(&update).await.unwrap();

    // The continuation item carries the cursor.
    let page_two = h.take(CATALOG).await;
    assert_eq!(page_two.work_item.scroll_id.as_deref(), Some("scroll-1"));
    h.succeed(page_two.work_item.id, &["s3://g/1.json"]).await;

    // Two transformer items, one per page output.
    let transformers = h
        .orchestrator
        .job_items(&job.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.service_id == TRANSFORMER)
        .count();
    assert_eq!(transformers, 2);
}

#[tokio::test]
async fn dispatch_rotates_across_users() {
    let h = harness(test_settings()).await;
    for user in ["ada", "grace"] {
        h.orchestrator
            .create_job(JobRequest {
                username: user.to_string(),
                request_url: "https://harmony.example.com/req".to_string(),
                ignore_errors: false,
                num_input_granules: 2,
                collection_ids: vec![],
                steps: two_step_pipeline(),
                preview: false,
            })
            .await
            .unwrap();
    }

    // Seed a second catalog page for each so both users keep ready work.
    for _ in 0..2 {
        let claimed = h.take(CATALOG).await;
        let mut update = WorkItemUpdate::success(claimed.work_item.id, vec![]);
        update.scroll_id = Some("scroll-next".to_string());
        h.updater.process(&update).await.unwrap();
    }

    let first = h.take(CATALOG).await;
    let second = h.take(CATALOG).await;
    assert_ne!(
        first.work_item.job_id, second.work_item.job_id,
        "consecutive claims should rotate between users"
    );
}

#[tokio::test]
async fn scheduler_pump_publishes_to_service_queues() {
    let h = harness(test_settings()).await;
    h.submit(two_step_pipeline(), 1, false).await;

    let published = h.dispatcher.pump_scheduler_once().await.unwrap();
    assert_eq!(published, 1);
    let depth = h
        .ctx
        .queues
        .work_queue(CATALOG)
        .approx_depth()
        .await
        .unwrap();
    assert_eq!(depth, 1);

    // The queued item is handed out RUNNING on the next poll.
    let message = h.take(CATALOG).await;
    let item = h.ctx.work_items.get(message.work_item.id).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Running);
}

#[tokio::test]
async fn failer_backs_off_under_update_queue_pressure() {
    let settings = Settings {
        max_work_items_on_update_queue_failer: 0,
        ..Settings::default()
    };
    let h = harness(settings).await;
    h.submit(two_step_pipeline(), 1, false).await;

    h.updater
        .enqueue(&WorkItemUpdate::failure(999, "placeholder"))
        .await
        .unwrap();
    let stats = h.failer.sweep_once().await.unwrap();
    assert!(stats.skipped);
    assert_eq!(stats.expired, 0);
}

#[tokio::test]
async fn batch_size_cap_splits_batches() {
    let settings = test_settings();
    let h = harness(settings).await;
    let steps = vec![
        WorkflowStep::new(1, CATALOG, "{}").input_producer(),
        WorkflowStep::new(2, TRANSFORMER, "{}"),
        WorkflowStep::new(3, AGGREGATOR, "{}").batched(10, 100),
    ];
    let job = h.submit(steps, 2, false).await;

    let catalog = h.take(CATALOG).await;
    h.succeed(catalog.work_item.id, &["s3://g/0.json", "s3://g/1.json"]).await;

    // Each output is 80 bytes; two together overflow the 100-byte cap.
    for _ in 0..2 {
        let item = h.take(TRANSFORMER).await;
        let mut update = WorkItemUpdate::success(
            item.work_item.id,
            vec![format!("s3://t/{}.json", item.work_item.id)],
        );
        update.output_item_sizes = vec![80];
        h.updater.process(&update).await.unwrap();
    }

    let batches = h.ctx.batches.list_for_job(&job.id).await.unwrap();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|b| b.item_count == 1));
}
