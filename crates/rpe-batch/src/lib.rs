//! Batch orchestration: load checkpoint, enrich one batch, commit the tail.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rpe_core::ErrorEntry;
use rpe_enrich::{ExaClient, ExaConfig, ProfileSearcher, DEFAULT_BASE_URL};
use rpe_storage::{read_roster, CheckpointStore, CsvCheckpointStore, ErrorLog, OutputSink};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rpe-batch";

pub const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_REQUEST_PAUSE_MS: u64 = 1_000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub input_csv: PathBuf,
    pub checkpoint_csv: PathBuf,
    pub output_csv: PathBuf,
    pub error_log: PathBuf,
    pub batch_size: usize,
    pub request_pause: Duration,
}

impl BatchConfig {
    pub fn from_env() -> Self {
        Self {
            input_csv: env_path("RPE_INPUT_CSV", "members.csv"),
            checkpoint_csv: env_path("RPE_CHECKPOINT_CSV", "remaining.csv"),
            output_csv: env_path("RPE_OUTPUT_CSV", "enriched.csv"),
            error_log: env_path("RPE_ERROR_LOG", "enrichment_errors.log"),
            batch_size: env_parsed("RPE_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            request_pause: Duration::from_millis(env_parsed(
                "RPE_REQUEST_PAUSE_MS",
                DEFAULT_REQUEST_PAUSE_MS,
            )),
        }
    }
}

/// Search-client settings from the environment. `EXA_API_KEY` is the one
/// required secret; a missing or placeholder value fails the run before any
/// file is touched.
pub fn exa_config_from_env() -> Result<ExaConfig> {
    let api_key = std::env::var("EXA_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty() && key != "your_exa_api_key_here")
        .context("EXA_API_KEY must be set to your Exa API key")?;
    Ok(ExaConfig {
        api_key,
        base_url: std::env::var("EXA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        timeout: Duration::from_secs(env_parsed(
            "RPE_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
        )),
        search_hint: std::env::var("RPE_SEARCH_HINT").unwrap_or_default(),
        org_name: std::env::var("RPE_ORG_NAME").unwrap_or_default(),
    })
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batch_len: usize,
    pub found: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: usize,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Checkpoint was already empty: nothing processed, no API calls made.
    Exhausted,
    Completed(RunSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    NotStarted,
    Remaining(usize),
}

/// Remaining-row count without touching the search API or mutating anything.
pub fn checkpoint_status(config: &BatchConfig) -> Result<CheckpointStatus> {
    if !config.checkpoint_csv.exists() {
        return Ok(CheckpointStatus::NotStarted);
    }
    let rows = read_roster(&config.checkpoint_csv)?;
    Ok(CheckpointStatus::Remaining(rows.len()))
}

pub struct BatchRunner {
    config: BatchConfig,
    store: Box<dyn CheckpointStore>,
    searcher: Box<dyn ProfileSearcher>,
    output: OutputSink,
    errors: ErrorLog,
}

impl BatchRunner {
    pub fn new(
        config: BatchConfig,
        store: Box<dyn CheckpointStore>,
        searcher: Box<dyn ProfileSearcher>,
    ) -> Self {
        let output = OutputSink::new(&config.output_csv);
        let errors = ErrorLog::new(&config.error_log);
        Self {
            config,
            store,
            searcher,
            output,
            errors,
        }
    }

    /// Process one batch from the head of the checkpoint. Per-record
    /// enrichment failures are logged and isolated; anything else aborts the
    /// run before the checkpoint commit, leaving it untouched for a rerun.
    pub async fn run_once(&mut self) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let rows = self.store.load().context("loading checkpoint")?;
        if rows.is_empty() {
            return Ok(RunOutcome::Exhausted);
        }

        let batch_len = rows.len().min(self.config.batch_size.max(1));
        let (batch, tail) = rows.split_at(batch_len);
        info!(%run_id, batch = batch_len, remaining = rows.len(), "processing batch");

        let mut found = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;

        for (index, member) in batch.iter().enumerate() {
            if !member.has_fullname() {
                skipped += 1;
                debug!(row = index + 1, "skipping row without a fullname");
                continue;
            }

            info!(
                row = index + 1,
                of = batch_len,
                fullname = member.fullname_trimmed(),
                email = member.email_trimmed(),
                "enriching"
            );
            match self.searcher.enrich(member).await {
                Ok(record) => {
                    self.output
                        .append(&record)
                        .context("appending enriched row")?;
                    found += 1;
                    info!(url = %record.linkedin_url, "profile found");
                }
                Err(err) => {
                    self.errors
                        .append(&ErrorEntry::new(member, err.to_string(), Utc::now()))
                        .context("appending error entry")?;
                    failed += 1;
                    warn!(
                        fullname = member.fullname_trimmed(),
                        error = %err,
                        "enrichment failed"
                    );
                }
            }

            if index + 1 < batch_len && !self.config.request_pause.is_zero() {
                tokio::time::sleep(self.config.request_pause).await;
            }
        }

        self.store.commit(tail).context("committing checkpoint")?;

        Ok(RunOutcome::Completed(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            batch_len,
            found,
            failed,
            skipped,
            remaining: tail.len(),
        }))
    }
}

/// Production wiring: file-backed checkpoint plus the real Exa client, both
/// configured from the environment.
pub async fn run_batch_once_from_env() -> Result<RunOutcome> {
    let config = BatchConfig::from_env();
    let exa = exa_config_from_env()?;
    let store = CsvCheckpointStore::new(&config.input_csv, &config.checkpoint_csv);
    let client = ExaClient::new(exa)?;
    let mut runner = BatchRunner::new(config, Box::new(store), Box::new(client));
    runner.run_once().await
}
