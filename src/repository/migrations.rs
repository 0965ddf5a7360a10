//! Schema creation.
//!
//! DDL is idempotent and applied at startup; there is no separate migration
//! tool. Foreign keys cascade so deleting a job removes its steps, items,
//! batches, links, errors, and user-work rows.

use diesel_async::SimpleAsyncConnection;

use super::pool::SqlitePool;
use super::Result;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'accepted',
        message TEXT NOT NULL DEFAULT '',
        progress INTEGER NOT NULL DEFAULT 0,
        request_url TEXT NOT NULL,
        ignore_errors INTEGER NOT NULL DEFAULT 0,
        num_input_granules INTEGER NOT NULL DEFAULT 0,
        collection_ids TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS job_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        href TEXT NOT NULL,
        title TEXT,
        rel TEXT NOT NULL DEFAULT 'data',
        content_type TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS job_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        url TEXT NOT NULL,
        message TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'error',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workflow_steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        step_index INTEGER NOT NULL,
        service_id TEXT NOT NULL,
        operation TEXT NOT NULL DEFAULT '{}',
        is_input_producer INTEGER NOT NULL DEFAULT 0,
        is_batched INTEGER NOT NULL DEFAULT 0,
        max_batch_inputs INTEGER,
        max_batch_size_in_bytes INTEGER,
        work_item_count INTEGER NOT NULL DEFAULT 0,
        ready_count INTEGER NOT NULL DEFAULT 0,
        running_count INTEGER NOT NULL DEFAULT 0,
        successful_count INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        canceled_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(job_id, step_index)
    );

    CREATE TABLE IF NOT EXISTS work_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        service_id TEXT NOT NULL,
        workflow_step_index INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'ready',
        stac_catalog_location TEXT,
        batch_id INTEGER REFERENCES batches(id),
        scroll_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        message TEXT,
        results TEXT NOT NULL DEFAULT '[]',
        output_item_sizes TEXT NOT NULL DEFAULT '[]',
        total_items_size INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT
    );

    CREATE TABLE IF NOT EXISTS user_work (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        service_id TEXT NOT NULL,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        ready_count INTEGER NOT NULL DEFAULT 0,
        running_count INTEGER NOT NULL DEFAULT 0,
        is_async INTEGER NOT NULL DEFAULT 1,
        last_worked TEXT NOT NULL,
        UNIQUE(job_id, service_id)
    );

    CREATE TABLE IF NOT EXISTS batches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        step_index INTEGER NOT NULL,
        sort_index INTEGER NOT NULL,
        is_last INTEGER NOT NULL DEFAULT 0,
        is_sealed INTEGER NOT NULL DEFAULT 0,
        item_count INTEGER NOT NULL DEFAULT 0,
        total_size INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(job_id, step_index, sort_index)
    );

    CREATE TABLE IF NOT EXISTS batch_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
        source_work_item_id INTEGER NOT NULL,
        stac_location TEXT NOT NULL,
        item_size INTEGER NOT NULL DEFAULT 0,
        sort_index INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_username_created
        ON jobs(username, created_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_status
        ON jobs(status);
    CREATE INDEX IF NOT EXISTS idx_work_items_job_step
        ON work_items(job_id, workflow_step_index, status);
    CREATE INDEX IF NOT EXISTS idx_work_items_service_status
        ON work_items(service_id, status);
    CREATE INDEX IF NOT EXISTS idx_work_items_status_updated
        ON work_items(status, updated_at);
    CREATE INDEX IF NOT EXISTS idx_workflow_steps_job
        ON workflow_steps(job_id, step_index);
    CREATE INDEX IF NOT EXISTS idx_user_work_service_ready
        ON user_work(service_id) WHERE ready_count > 0;
    CREATE INDEX IF NOT EXISTS idx_batches_job_step
        ON batches(job_id, step_index, sort_index);
    CREATE INDEX IF NOT EXISTS idx_job_errors_job
        ON job_errors(job_id);
    CREATE INDEX IF NOT EXISTS idx_job_links_job
        ON job_links(job_id);
"#;

/// Create all tables and indexes if they do not exist.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let mut conn = pool.get().await?;
    conn.batch_execute(SCHEMA).await?;
    Ok(())
}
