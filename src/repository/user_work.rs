//! Materialized (username, service, job) work counters.
//!
//! Dispatch fairness runs entirely off this table: the next job to serve
//! for a service is the one whose user was worked least recently. Rows are
//! maintained inside the same transactions that move work items, so the
//! counters match the item population at every commit boundary.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::models::{JobStatus, UserWork};
use crate::schema::{jobs, user_work};
use crate::with_conn;

use super::records::{NewUserWork, UserWorkRecord};
use super::{Result, SqliteConn, SqlitePool};

/// SQLite-backed user-work counter store.
#[derive(Clone)]
pub struct UserWorkRepository {
    pool: SqlitePool,
}

impl UserWorkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Make sure a row exists for (job, service); returns its id.
    pub async fn ensure_row_in(
        conn: &mut SqliteConn,
        username: &str,
        service_id: &str,
        job_id: &str,
    ) -> Result<i32> {
        let existing: Option<UserWorkRecord> = user_work::table
            .filter(user_work::job_id.eq(job_id))
            .filter(user_work::service_id.eq(service_id))
            .first(conn)
            .await
            .optional()?;
        if let Some(row) = existing {
            return Ok(row.id);
        }
        diesel::insert_into(user_work::table)
            .values(NewUserWork {
                username,
                service_id,
                job_id,
                ready_count: 0,
                running_count: 0,
                is_async: 1,
                last_worked: Utc::now().to_rfc3339(),
            })
            .execute(conn)
            .await?;
        let row: UserWorkRecord = user_work::table
            .filter(user_work::job_id.eq(job_id))
            .filter(user_work::service_id.eq(service_id))
            .first(conn)
            .await?;
        Ok(row.id)
    }

    /// Adjust the ready/running counters for (job, service).
    ///
    /// The row is created on demand so out-of-order maintenance cannot lose
    /// counts. Counters are floored at zero.
    pub async fn adjust_in(
        conn: &mut SqliteConn,
        username: &str,
        service_id: &str,
        job_id: &str,
        ready_delta: i32,
        running_delta: i32,
    ) -> Result<()> {
        let id = Self::ensure_row_in(conn, username, service_id, job_id).await?;
        let row: UserWorkRecord = user_work::table.find(id).first(conn).await?;
        diesel::update(user_work::table.find(id))
            .set((
                user_work::ready_count.eq((row.ready_count + ready_delta).max(0)),
                user_work::running_count.eq((row.running_count + running_delta).max(0)),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Record that dispatch just served this row.
    pub async fn touch_last_worked_in(conn: &mut SqliteConn, id: i32) -> Result<()> {
        diesel::update(user_work::table.find(id))
            .set(user_work::last_worked.eq(Utc::now().to_rfc3339()))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Drop all counter rows for a job (cancellation, completion).
    pub async fn delete_for_job_in(conn: &mut SqliteConn, job_id: &str) -> Result<()> {
        diesel::delete(user_work::table.filter(user_work::job_id.eq(job_id)))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Pick the next (job, user) a service should work for.
    ///
    /// Only jobs in a dispatchable status participate; PAUSED and terminal
    /// jobs keep their ready items but are never selected. Rotation is by
    /// `last_worked` ascending so no user starves others, with job id as
    /// the tie-break.
    pub async fn next_for_service_in(
        conn: &mut SqliteConn,
        service_id: &str,
    ) -> Result<Option<UserWork>> {
        let dispatchable = [
            JobStatus::Running.as_str(),
            JobStatus::RunningWithErrors.as_str(),
            JobStatus::Previewing.as_str(),
        ];
        let record: Option<UserWorkRecord> = user_work::table
            .inner_join(jobs::table)
            .filter(user_work::service_id.eq(service_id))
            .filter(user_work::ready_count.gt(0))
            .filter(jobs::status.eq_any(dispatchable))
            .order((user_work::last_worked.asc(), user_work::job_id.asc()))
            .select(UserWorkRecord::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(record.map(UserWork::from))
    }

    /// Service ids that currently have ready work for some dispatchable job.
    pub async fn services_with_ready_work(&self) -> Result<Vec<String>> {
        let dispatchable = [
            JobStatus::Running.as_str(),
            JobStatus::RunningWithErrors.as_str(),
            JobStatus::Previewing.as_str(),
        ];
        with_conn!(self.pool, conn => {
            let rows: Vec<String> = user_work::table
                .inner_join(jobs::table)
                .filter(user_work::ready_count.gt(0))
                .filter(jobs::status.eq_any(dispatchable))
                .select(user_work::service_id)
                .distinct()
                .load(&mut conn)
                .await?;
            Ok(rows)
        })
    }

    /// All counter rows for a job, for inspection.
    pub async fn list_for_job(&self, job_id: &str) -> Result<Vec<UserWork>> {
        with_conn!(self.pool, conn => {
            let rows: Vec<UserWorkRecord> = user_work::table
                .filter(user_work::job_id.eq(job_id))
                .order(user_work::service_id.asc())
                .load(&mut conn)
                .await?;
            Ok(rows.into_iter().map(UserWork::from).collect())
        })
    }
}
