//! Diesel ORM models for database tables.
//!
//! Row structs mirror table layout exactly; `From` conversions produce the
//! domain models. Timestamps are RFC 3339 text, enums are text, JSON array
//! columns hold serialized `Vec`s.

use diesel::prelude::*;

use crate::models::{
    Batch, BatchItem, ErrorCategory, Job, JobError, JobLink, JobStatus, UserWork, WorkItem,
    WorkItemStatus, WorkflowStep,
};
use crate::schema;

use super::{parse_datetime, parse_datetime_opt, parse_i64_vec, parse_string_vec};

/// Job record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobRecord {
    pub id: String,
    pub username: String,
    pub status: String,
    pub message: String,
    pub progress: i32,
    pub request_url: String,
    pub ignore_errors: i32,
    pub num_input_granules: i32,
    pub collection_ids: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<JobRecord> for Job {
    fn from(record: JobRecord) -> Self {
        Job {
            id: record.id,
            username: record.username,
            status: JobStatus::from_str(&record.status).unwrap_or(JobStatus::Accepted),
            message: record.message,
            progress: record.progress,
            request_url: record.request_url,
            ignore_errors: record.ignore_errors != 0,
            num_input_granules: record.num_input_granules,
            collection_ids: parse_string_vec(&record.collection_ids),
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            links: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// New job for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::jobs)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub username: &'a str,
    pub status: &'a str,
    pub message: &'a str,
    pub progress: i32,
    pub request_url: &'a str,
    pub ignore_errors: i32,
    pub num_input_granules: i32,
    pub collection_ids: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Job link record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::job_links)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobLinkRecord {
    pub id: i32,
    pub job_id: String,
    pub href: String,
    pub title: Option<String>,
    pub rel: String,
    pub content_type: Option<String>,
    pub created_at: String,
}

impl From<JobLinkRecord> for JobLink {
    fn from(record: JobLinkRecord) -> Self {
        JobLink {
            id: record.id,
            job_id: record.job_id,
            href: record.href,
            title: record.title,
            rel: record.rel,
            content_type: record.content_type,
            created_at: parse_datetime(&record.created_at),
        }
    }
}

/// New job link for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::job_links)]
pub struct NewJobLink<'a> {
    pub job_id: &'a str,
    pub href: &'a str,
    pub title: Option<&'a str>,
    pub rel: &'a str,
    pub content_type: Option<&'a str>,
    pub created_at: String,
}

/// Job error record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::job_errors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobErrorRecord {
    pub id: i32,
    pub job_id: String,
    pub url: String,
    pub message: String,
    pub category: String,
    pub created_at: String,
}

impl From<JobErrorRecord> for JobError {
    fn from(record: JobErrorRecord) -> Self {
        JobError {
            id: record.id,
            job_id: record.job_id,
            url: record.url,
            message: record.message,
            category: ErrorCategory::from_str(&record.category).unwrap_or(ErrorCategory::Error),
            created_at: parse_datetime(&record.created_at),
        }
    }
}

/// New job error for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::job_errors)]
pub struct NewJobError<'a> {
    pub job_id: &'a str,
    pub url: &'a str,
    pub message: &'a str,
    pub category: &'a str,
    pub created_at: String,
}

/// Workflow step record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::workflow_steps)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WorkflowStepRecord {
    pub id: i32,
    pub job_id: String,
    pub step_index: i32,
    pub service_id: String,
    pub operation: String,
    pub is_input_producer: i32,
    pub is_batched: i32,
    pub max_batch_inputs: Option<i32>,
    pub max_batch_size_in_bytes: Option<i64>,
    pub work_item_count: i32,
    pub ready_count: i32,
    pub running_count: i32,
    pub successful_count: i32,
    pub failed_count: i32,
    pub canceled_count: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl From<WorkflowStepRecord> for WorkflowStep {
    fn from(record: WorkflowStepRecord) -> Self {
        WorkflowStep {
            id: record.id,
            job_id: record.job_id,
            step_index: record.step_index,
            service_id: record.service_id,
            operation: record.operation,
            is_input_producer: record.is_input_producer != 0,
            is_batched: record.is_batched != 0,
            max_batch_inputs: record.max_batch_inputs,
            max_batch_size_in_bytes: record.max_batch_size_in_bytes,
            work_item_count: record.work_item_count,
            ready_count: record.ready_count,
            running_count: record.running_count,
            successful_count: record.successful_count,
            failed_count: record.failed_count,
            canceled_count: record.canceled_count,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

/// New workflow step for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::workflow_steps)]
pub struct NewWorkflowStep<'a> {
    pub job_id: &'a str,
    pub step_index: i32,
    pub service_id: &'a str,
    pub operation: &'a str,
    pub is_input_producer: i32,
    pub is_batched: i32,
    pub max_batch_inputs: Option<i32>,
    pub max_batch_size_in_bytes: Option<i64>,
    pub work_item_count: i32,
    pub ready_count: i32,
    pub running_count: i32,
    pub successful_count: i32,
    pub failed_count: i32,
    pub canceled_count: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// Work item record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::work_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WorkItemRecord {
    pub id: i32,
    pub job_id: String,
    pub service_id: String,
    pub workflow_step_index: i32,
    pub status: String,
    pub stac_catalog_location: Option<String>,
    pub batch_id: Option<i32>,
    pub scroll_id: Option<String>,
    pub retry_count: i32,
    pub message: Option<String>,
    pub results: String,
    pub output_item_sizes: String,
    pub total_items_size: i64,
    pub duration_ms: i64,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
}

impl From<WorkItemRecord> for WorkItem {
    fn from(record: WorkItemRecord) -> Self {
        WorkItem {
            id: record.id,
            job_id: record.job_id,
            service_id: record.service_id,
            workflow_step_index: record.workflow_step_index,
            status: WorkItemStatus::from_str(&record.status).unwrap_or(WorkItemStatus::Ready),
            stac_catalog_location: record.stac_catalog_location,
            batch_id: record.batch_id,
            scroll_id: record.scroll_id,
            retry_count: record.retry_count,
            message: record.message,
            results: parse_string_vec(&record.results),
            output_item_sizes: parse_i64_vec(&record.output_item_sizes),
            total_items_size: record.total_items_size,
            duration_ms: record.duration_ms,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            started_at: parse_datetime_opt(record.started_at),
        }
    }
}

/// New work item for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::work_items)]
pub struct NewWorkItem<'a> {
    pub job_id: &'a str,
    pub service_id: &'a str,
    pub workflow_step_index: i32,
    pub status: &'a str,
    pub stac_catalog_location: Option<&'a str>,
    pub batch_id: Option<i32>,
    pub scroll_id: Option<&'a str>,
    pub retry_count: i32,
    pub message: Option<&'a str>,
    pub results: String,
    pub output_item_sizes: String,
    pub total_items_size: i64,
    pub duration_ms: i64,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
}

/// User work counter record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::user_work)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserWorkRecord {
    pub id: i32,
    pub username: String,
    pub service_id: String,
    pub job_id: String,
    pub ready_count: i32,
    pub running_count: i32,
    pub is_async: i32,
    pub last_worked: String,
}

impl From<UserWorkRecord> for UserWork {
    fn from(record: UserWorkRecord) -> Self {
        UserWork {
            id: record.id,
            username: record.username,
            service_id: record.service_id,
            job_id: record.job_id,
            ready_count: record.ready_count,
            running_count: record.running_count,
            is_async: record.is_async != 0,
            last_worked: parse_datetime(&record.last_worked),
        }
    }
}

/// New user work row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::user_work)]
pub struct NewUserWork<'a> {
    pub username: &'a str,
    pub service_id: &'a str,
    pub job_id: &'a str,
    pub ready_count: i32,
    pub running_count: i32,
    pub is_async: i32,
    pub last_worked: String,
}

/// Batch record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::batches)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct BatchRecord {
    pub id: i32,
    pub job_id: String,
    pub step_index: i32,
    pub sort_index: i32,
    pub is_last: i32,
    pub is_sealed: i32,
    pub item_count: i32,
    pub total_size: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<BatchRecord> for Batch {
    fn from(record: BatchRecord) -> Self {
        Batch {
            id: record.id,
            job_id: record.job_id,
            step_index: record.step_index,
            sort_index: record.sort_index,
            is_last: record.is_last != 0,
            is_sealed: record.is_sealed != 0,
            item_count: record.item_count,
            total_size: record.total_size,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

/// New batch for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::batches)]
pub struct NewBatch<'a> {
    pub job_id: &'a str,
    pub step_index: i32,
    pub sort_index: i32,
    pub is_last: i32,
    pub is_sealed: i32,
    pub item_count: i32,
    pub total_size: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Batch item record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::batch_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct BatchItemRecord {
    pub id: i32,
    pub batch_id: i32,
    pub source_work_item_id: i32,
    pub stac_location: String,
    pub item_size: i64,
    pub sort_index: i32,
}

impl From<BatchItemRecord> for BatchItem {
    fn from(record: BatchItemRecord) -> Self {
        BatchItem {
            id: record.id,
            batch_id: record.batch_id,
            source_work_item_id: record.source_work_item_id,
            stac_location: record.stac_location,
            item_size: record.item_size,
            sort_index: record.sort_index,
        }
    }
}

/// New batch item for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::batch_items)]
pub struct NewBatchItem<'a> {
    pub batch_id: i32,
    pub source_work_item_id: i32,
    pub stac_location: &'a str,
    pub item_size: i64,
    pub sort_index: i32,
}
