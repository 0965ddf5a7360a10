//! Configuration for the orchestration engine.
//!
//! Every knob has a compiled default and an environment override. Settings
//! are resolved once at startup and passed by value; nothing reads the
//! environment after that.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Database filename inside the data directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "stacflow.db";

/// Resolved engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database URL (overrides data_dir/DEFAULT_DATABASE_FILENAME if set).
    /// Set via DATABASE_URL env var.
    pub database_url: Option<String>,
    /// Bind address for the work API server.
    pub host: String,
    /// Bind port for the work API server.
    pub port: u16,

    /// Max retries for a single work item before it is terminally failed.
    pub work_item_retry_limit: i32,
    /// Absolute error count that forces a job to FAILED.
    pub max_errors_for_job: i64,
    /// Percent of completed items in error that forces FAILED.
    pub max_percent_errors_for_job: f64,
    /// Completed-item sample size below which the percent check is skipped.
    pub min_completed_work_items_to_check_failure_percentage: i64,

    /// Failer sweep period in seconds.
    pub work_failer_period_sec: u64,
    /// Age in minutes after which a queued or running item is a timeout
    /// candidate.
    pub failable_work_age_minutes: i64,
    /// Failer sweep batch size.
    pub work_failer_batch_size: i64,
    /// Update-queue depth at which the failer pauses; -1 disables the check.
    pub max_work_items_on_update_queue_failer: i64,
    /// Fallback per-item timeout in seconds when too few successful
    /// durations exist to compute an outlier threshold.
    pub default_timeout_seconds: i64,
    /// Per-service overrides of `default_timeout_seconds`, keyed by service
    /// id substring. Aggregation services routinely run far longer than
    /// transformation services.
    pub service_timeout_overrides: HashMap<String, i64>,

    /// Default cap on inputs per batch for batched steps.
    pub max_batch_inputs: i32,
    /// Default cap on total input bytes per batch for batched steps.
    pub max_batch_size_in_bytes: i64,
    /// Page size for catalog-query steps.
    pub cmr_max_page_size: i32,
    /// System-wide per-job cap on granule count.
    pub max_granule_limit: i32,

    /// Number of concurrent update-queue consumers.
    pub update_consumer_count: usize,
    /// Sleep between empty queue polls, milliseconds.
    pub queue_poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_url: None,
            host: "127.0.0.1".to_string(),
            port: 4006,
            work_item_retry_limit: 3,
            max_errors_for_job: 100,
            max_percent_errors_for_job: 10.0,
            min_completed_work_items_to_check_failure_percentage: 50,
            work_failer_period_sec: 60,
            failable_work_age_minutes: 9,
            work_failer_batch_size: 100,
            max_work_items_on_update_queue_failer: 1000,
            default_timeout_seconds: 300,
            service_timeout_overrides: HashMap::from([("aggregator".to_string(), 900)]),
            max_batch_inputs: 300,
            max_batch_size_in_bytes: 1_000_000_000,
            cmr_max_page_size: 2000,
            max_granule_limit: 350_000,
            update_consumer_count: 4,
            queue_poll_interval_ms: 100,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

/// Parse a `svc=secs,svc2=secs` override list.
fn parse_timeout_overrides(raw: &str) -> HashMap<String, i64> {
    raw.split(',')
        .filter_map(|pair| {
            let (service, secs) = pair.split_once('=')?;
            let secs: i64 = secs.trim().parse().ok()?;
            Some((service.trim().to_string(), secs))
        })
        .collect()
}

impl Settings {
    /// Load settings from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_dir = std::env::var("STACFLOW_DATA_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| PathBuf::from(shellexpand::tilde(&s).into_owned()))
            .unwrap_or(defaults.data_dir);

        let service_timeout_overrides = std::env::var("STACFLOW_SERVICE_TIMEOUTS")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| parse_timeout_overrides(&s))
            .unwrap_or(defaults.service_timeout_overrides);

        Self {
            data_dir,
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            host: env_parse("STACFLOW_HOST", defaults.host),
            port: env_parse("STACFLOW_PORT", defaults.port),
            work_item_retry_limit: env_parse(
                "STACFLOW_WORK_ITEM_RETRY_LIMIT",
                defaults.work_item_retry_limit,
            ),
            max_errors_for_job: env_parse("STACFLOW_MAX_ERRORS_FOR_JOB", defaults.max_errors_for_job),
            max_percent_errors_for_job: env_parse(
                "STACFLOW_MAX_PERCENT_ERRORS_FOR_JOB",
                defaults.max_percent_errors_for_job,
            ),
            min_completed_work_items_to_check_failure_percentage: env_parse(
                "STACFLOW_MIN_COMPLETED_ITEMS_FOR_FAIL_CHECK",
                defaults.min_completed_work_items_to_check_failure_percentage,
            ),
            work_failer_period_sec: env_parse(
                "STACFLOW_WORK_FAILER_PERIOD_SEC",
                defaults.work_failer_period_sec,
            ),
            failable_work_age_minutes: env_parse(
                "STACFLOW_FAILABLE_WORK_AGE_MINUTES",
                defaults.failable_work_age_minutes,
            ),
            work_failer_batch_size: env_parse(
                "STACFLOW_WORK_FAILER_BATCH_SIZE",
                defaults.work_failer_batch_size,
            ),
            max_work_items_on_update_queue_failer: env_parse(
                "STACFLOW_MAX_UPDATE_QUEUE_DEPTH_FAILER",
                defaults.max_work_items_on_update_queue_failer,
            ),
            default_timeout_seconds: env_parse(
                "STACFLOW_DEFAULT_TIMEOUT_SECONDS",
                defaults.default_timeout_seconds,
            ),
            service_timeout_overrides,
            max_batch_inputs: env_parse("STACFLOW_MAX_BATCH_INPUTS", defaults.max_batch_inputs),
            max_batch_size_in_bytes: env_parse(
                "STACFLOW_MAX_BATCH_SIZE_IN_BYTES",
                defaults.max_batch_size_in_bytes,
            ),
            cmr_max_page_size: env_parse("STACFLOW_CMR_MAX_PAGE_SIZE", defaults.cmr_max_page_size),
            max_granule_limit: env_parse("STACFLOW_MAX_GRANULE_LIMIT", defaults.max_granule_limit),
            update_consumer_count: env_parse(
                "STACFLOW_UPDATE_CONSUMER_COUNT",
                defaults.update_consumer_count,
            ),
            queue_poll_interval_ms: env_parse(
                "STACFLOW_QUEUE_POLL_INTERVAL_MS",
                defaults.queue_poll_interval_ms,
            ),
        }
    }

    /// Effective database URL, derived from the data dir when unset.
    pub fn resolved_database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            self.data_dir
                .join(DEFAULT_DATABASE_FILENAME)
                .display()
                .to_string()
        })
    }

    /// Timeout in seconds for a service, honoring overrides. Overrides match
    /// on substring so image tags don't defeat them.
    pub fn timeout_seconds_for_service(&self, service_id: &str) -> i64 {
        self.service_timeout_overrides
            .iter()
            .find(|(name, _)| service_id.contains(name.as_str()))
            .map(|(_, secs)| *secs)
            .unwrap_or(self.default_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_override_matches_on_substring() {
        let settings = Settings::default();
        assert_eq!(
            settings.timeout_seconds_for_service("ghcr.io/example/aggregator:4"),
            900
        );
        assert_eq!(
            settings.timeout_seconds_for_service("ghcr.io/example/subsetter:1"),
            settings.default_timeout_seconds
        );
    }

    #[test]
    fn timeout_override_list_parses() {
        let overrides = parse_timeout_overrides("concise=900, subsetter=120");
        assert_eq!(overrides.get("concise"), Some(&900));
        assert_eq!(overrides.get("subsetter"), Some(&120));
        assert!(parse_timeout_overrides("garbage").is_empty());
    }

    #[test]
    fn database_url_falls_back_to_data_dir() {
        let settings = Settings {
            data_dir: PathBuf::from("/tmp/flow"),
            ..Settings::default()
        };
        assert_eq!(settings.resolved_database_url(), "/tmp/flow/stacflow.db");
    }
}
