//! Batch store for aggregating step inputs.
//!
//! Batches are created lazily when the first input arrives, so an unsealed
//! batch always holds at least one input; "no open batch remains" is part
//! of the job completion predicate.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::models::{Batch, BatchItem};
use crate::schema::{batch_items, batches};
use crate::with_conn;

use super::records::{BatchItemRecord, BatchRecord, NewBatch, NewBatchItem};
use super::{RepositoryError, Result, SqliteConn, SqlitePool};

/// SQLite-backed batch store.
#[derive(Clone)]
pub struct BatchRepository {
    pool: SqlitePool,
}

impl BatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The unsealed batch for (job, step), if any.
    pub async fn open_batch_in(
        conn: &mut SqliteConn,
        job_id: &str,
        step_index: i32,
    ) -> Result<Option<Batch>> {
        let record: Option<BatchRecord> = batches::table
            .filter(batches::job_id.eq(job_id))
            .filter(batches::step_index.eq(step_index))
            .filter(batches::is_sealed.eq(0))
            .order(batches::sort_index.desc())
            .first(conn)
            .await
            .optional()?;
        Ok(record.map(Batch::from))
    }

    /// Create the next batch for (job, step) with the following sort index.
    pub async fn create_batch_in(
        conn: &mut SqliteConn,
        job_id: &str,
        step_index: i32,
    ) -> Result<Batch> {
        use diesel::dsl::max;
        let last: Option<i32> = batches::table
            .filter(batches::job_id.eq(job_id))
            .filter(batches::step_index.eq(step_index))
            .select(max(batches::sort_index))
            .first(conn)
            .await?;
        let sort_index = last.map(|i| i + 1).unwrap_or(0);
        let now = Utc::now().to_rfc3339();
        diesel::insert_into(batches::table)
            .values(NewBatch {
                job_id,
                step_index,
                sort_index,
                is_last: 0,
                is_sealed: 0,
                item_count: 0,
                total_size: 0,
                created_at: now.clone(),
                updated_at: now,
            })
            .execute(conn)
            .await?;
        let record: BatchRecord = batches::table
            .filter(batches::job_id.eq(job_id))
            .filter(batches::step_index.eq(step_index))
            .filter(batches::sort_index.eq(sort_index))
            .first(conn)
            .await?;
        Ok(Batch::from(record))
    }

    /// Append one input to a batch and bump its counters.
    pub async fn add_item_in(
        conn: &mut SqliteConn,
        batch: &Batch,
        source_work_item_id: i32,
        stac_location: &str,
        item_size: i64,
    ) -> Result<Batch> {
        if batch.is_sealed {
            return Err(RepositoryError::Conflict(format!(
                "batch {} is sealed",
                batch.id
            )));
        }
        diesel::insert_into(batch_items::table)
            .values(NewBatchItem {
                batch_id: batch.id,
                source_work_item_id,
                stac_location,
                item_size,
                sort_index: batch.item_count,
            })
            .execute(conn)
            .await?;
        diesel::update(batches::table.find(batch.id))
            .set((
                batches::item_count.eq(batch.item_count + 1),
                batches::total_size.eq(batch.total_size + item_size),
                batches::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(conn)
            .await?;
        let record: BatchRecord = batches::table.find(batch.id).first(conn).await?;
        Ok(Batch::from(record))
    }

    /// Seal a batch; a sealed batch accepts no further inputs.
    pub async fn seal_in(conn: &mut SqliteConn, batch_id: i32, is_last: bool) -> Result<()> {
        diesel::update(batches::table.find(batch_id))
            .set((
                batches::is_sealed.eq(1),
                batches::is_last.eq(is_last as i32),
                batches::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Mark the newest sealed batch of (job, step) as the last one.
    ///
    /// Used when the final input exactly filled a batch: the batch was
    /// sealed as ordinary, and upstream completion is only known later.
    pub async fn mark_last_sealed_in(
        conn: &mut SqliteConn,
        job_id: &str,
        step_index: i32,
    ) -> Result<()> {
        let newest: Option<BatchRecord> = batches::table
            .filter(batches::job_id.eq(job_id))
            .filter(batches::step_index.eq(step_index))
            .filter(batches::is_sealed.eq(1))
            .order(batches::sort_index.desc())
            .first(conn)
            .await
            .optional()?;
        if let Some(batch) = newest {
            diesel::update(batches::table.find(batch.id))
                .set((
                    batches::is_last.eq(1),
                    batches::updated_at.eq(Utc::now().to_rfc3339()),
                ))
                .execute(conn)
                .await?;
        }
        Ok(())
    }

    /// Inputs of a batch in insertion order.
    pub async fn items_in(conn: &mut SqliteConn, batch_id: i32) -> Result<Vec<BatchItem>> {
        let records: Vec<BatchItemRecord> = batch_items::table
            .filter(batch_items::batch_id.eq(batch_id))
            .order(batch_items::sort_index.asc())
            .load(conn)
            .await?;
        Ok(records.into_iter().map(BatchItem::from).collect())
    }

    /// Whether any unsealed batch exists for the job.
    pub async fn has_open_batch_in(conn: &mut SqliteConn, job_id: &str) -> Result<bool> {
        use diesel::dsl::count_star;
        let count: i64 = batches::table
            .filter(batches::job_id.eq(job_id))
            .filter(batches::is_sealed.eq(0))
            .select(count_star())
            .first(conn)
            .await?;
        Ok(count > 0)
    }

    /// All batches of a job, for inspection.
    pub async fn list_for_job(&self, job_id: &str) -> Result<Vec<Batch>> {
        with_conn!(self.pool, conn => {
            let records: Vec<BatchRecord> = batches::table
                .filter(batches::job_id.eq(job_id))
                .order((batches::step_index.asc(), batches::sort_index.asc()))
                .load(&mut conn)
                .await?;
            Ok(records.into_iter().map(Batch::from).collect())
        })
    }
}
