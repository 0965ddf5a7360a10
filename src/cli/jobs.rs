//! Operator commands for inspecting and managing jobs.

use std::sync::Arc;

use clap::Subcommand;
use console::style;

use crate::config::Settings;
use crate::models::JobStatus;
use crate::queue::MemoryQueueProvider;
use crate::repository::{migrations, JobListFilter, SqlitePool};
use crate::services::{CoreContext, Orchestrator};

#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs, optionally filtered by user or status
    List {
        /// Only this user's jobs
        #[arg(short, long)]
        username: Option<String>,
        /// Only jobs in this status
        #[arg(short, long)]
        status: Option<String>,
        /// Page number (1-based)
        #[arg(long, default_value = "1")]
        page: i64,
        /// Jobs per page
        #[arg(long, default_value = "25")]
        per_page: i64,
    },

    /// Show one job with its steps and items
    Show { job_id: String },

    /// Cancel a job (admin surface)
    Cancel {
        job_id: String,
        /// Replace the default cancellation message
        #[arg(short, long)]
        message: Option<String>,
    },
}

pub async fn run(settings: Settings, command: JobCommands) -> anyhow::Result<()> {
    let pool = SqlitePool::new(&settings.resolved_database_url());
    migrations::ensure_schema(&pool).await?;
    let ctx = CoreContext::new(settings, pool, Arc::new(MemoryQueueProvider::new()));
    let orchestrator = Orchestrator::new(ctx);

    match command {
        JobCommands::List {
            username,
            status,
            page,
            per_page,
        } => {
            let mut filter = JobListFilter::page(page, per_page);
            if let Some(status) = &status {
                let status = JobStatus::from_str(status)
                    .ok_or_else(|| anyhow::anyhow!("unknown job status {status:?}"))?;
                filter = filter.with_status(status);
            }
            let listing = match &username {
                Some(username) => orchestrator.list_jobs(username, &filter).await?,
                None => orchestrator.list_all_jobs(&filter).await?,
            };
            println!(
                "{} {} job(s), page {} of {}",
                style("→").cyan(),
                listing.total,
                listing.page,
                (listing.total + listing.per_page - 1) / listing.per_page.max(1),
            );
            for job in &listing.jobs {
                println!(
                    "  {}  {:<22} {:>4}%  {}  {}",
                    job.id,
                    job.status.as_str(),
                    job.progress,
                    job.username,
                    job.message
                );
            }
        }

        JobCommands::Show { job_id } => {
            let job = orchestrator.get_job(&job_id).await?;
            println!("{} job {}", style("→").cyan(), job.id);
            println!("  user      {}", job.username);
            println!("  status    {} ({}%)", job.status.as_str(), job.progress);
            println!("  message   {}", job.message);
            println!("  request   {}", job.request_url);
            println!("  granules  {}", job.num_input_granules);
            for step in orchestrator.job_steps(&job_id).await? {
                println!(
                    "  step {}  {:<40} items={} ready={} running={} ok={} failed={} canceled={}",
                    step.step_index,
                    step.service_id,
                    step.work_item_count,
                    step.ready_count,
                    step.running_count,
                    step.successful_count,
                    step.failed_count,
                    step.canceled_count,
                );
            }
            for error in &job.errors {
                println!(
                    "  {}  {}: {}",
                    style(error.category.as_str()).red(),
                    error.url,
                    error.message
                );
            }
            for link in &job.links {
                println!("  link [{}] {}", link.rel, link.href);
            }
        }

        JobCommands::Cancel { job_id, message } => {
            let job = orchestrator
                .cancel_job(&job_id, message.as_deref(), true)
                .await?;
            println!(
                "{} job {} canceled: {}",
                style("✓").green(),
                job.id,
                job.message
            );
        }
    }
    Ok(())
}
