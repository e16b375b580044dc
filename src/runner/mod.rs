//! `pangeo-forge-runner` subprocess driver
//!
//! The runner is invoked with `--json`, which makes it print one JSON
//! record per line. Records carry a human readable `message` and, for the
//! terminal record of each command, a `status`:
//!
//! * `expand-meta` ends with `{"status": "completed", "meta": {...}}`
//! * `bake` reports `{"status": "submitted", "job_name": .., "job_id": ..}`

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::Histogram;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::RunnerSettings;
use crate::models::Meta;

/// Dataflow job names: lowercase letters, digits and hyphens, at most 63
const MAX_JOB_NAME_LEN: usize = 63;
/// Lines of stderr kept when the runner fails without a JSON message
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runner exited with status {code:?}: {message}")]
    Failed { code: Option<i32>, message: String },

    #[error("runner timed out after {0} seconds")]
    Timeout(u64),

    #[error("runner output has no '{0}' record")]
    MissingRecord(String),

    #[error("invalid runner output: {0}")]
    Output(String),

    #[error("failed to write runner config: {0}")]
    Io(#[from] std::io::Error),

    #[error("runner is not configured: {0}")]
    NotConfigured(String),
}

/// Everything a single `bake` invocation needs
#[derive(Debug, Clone)]
pub struct BakeRequest {
    pub repo_url: String,
    pub git_ref: String,
    /// Directory holding `meta.yaml`, when not the runner's default `feedstock/`
    pub feedstock_subdir: Option<String>,
    pub recipe_id: String,
    pub job_name: String,
    /// Traitlets config written to the `-f` file
    pub config: Value,
}

/// Identifiers of a submitted job
#[derive(Debug, Clone, PartialEq)]
pub struct BakeOutcome {
    pub job_name: String,
    pub job_id: String,
}

/// Seam between the webhook tasks and the external runner
#[async_trait]
pub trait RecipeRunner: Send + Sync {
    /// Resolve `meta.yaml` of `repo_url` at `git_ref`
    async fn expand_meta(
        &self,
        repo_url: &str,
        git_ref: &str,
        feedstock_subdir: Option<&str>,
    ) -> Result<Meta, RunnerError>;

    /// Submit one recipe to its bakery
    async fn bake(&self, request: &BakeRequest) -> Result<BakeOutcome, RunnerError>;
}

/// Runs the real `pangeo-forge-runner` executable
pub struct PangeoForgeRunner {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
    duration: Option<Histogram>,
}

impl PangeoForgeRunner {
    /// `settings.bin` may carry leading arguments, e.g. `python -m pangeo_forge_runner`
    pub fn new(settings: &RunnerSettings) -> Result<Self, RunnerError> {
        let mut parts = settings.bin.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| RunnerError::NotConfigured("empty runner command".to_string()))?;
        Ok(Self {
            program,
            base_args: parts.collect(),
            timeout: Duration::from_secs(settings.timeout_secs),
            duration: None,
        })
    }

    /// Observe every invocation's wall time on `histogram`
    pub fn with_duration_histogram(mut self, histogram: Histogram) -> Self {
        self.duration = Some(histogram);
        self
    }

    #[instrument(skip(self), fields(program = %self.program))]
    async fn run(&self, args: &[String]) -> Result<Vec<Value>, RunnerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| RunnerError::Timeout(self.timeout.as_secs()))?
            .map_err(|source| RunnerError::Spawn {
                bin: self.program.clone(),
                source,
            })?;
        if let Some(ref histogram) = self.duration {
            histogram.observe(started.elapsed().as_secs_f64());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let records = parse_records(&stdout);

        if !output.status.success() {
            let message = failure_message(&records, &stderr);
            warn!(code = ?output.status.code(), %message, "Runner failed");
            return Err(RunnerError::Failed {
                code: output.status.code(),
                message,
            });
        }

        Ok(records)
    }
}

#[async_trait]
impl RecipeRunner for PangeoForgeRunner {
    async fn expand_meta(
        &self,
        repo_url: &str,
        git_ref: &str,
        feedstock_subdir: Option<&str>,
    ) -> Result<Meta, RunnerError> {
        let mut args = vec![
            "expand-meta".to_string(),
            format!("--repo={repo_url}"),
            format!("--ref={git_ref}"),
            "--json".to_string(),
        ];
        if let Some(subdir) = feedstock_subdir {
            args.push(format!("--feedstock-subdir={subdir}"));
        }
        let records = self.run(&args).await?;
        let record = find_status(&records, "completed")
            .ok_or_else(|| RunnerError::MissingRecord("completed".to_string()))?;
        let meta = record
            .get("meta")
            .cloned()
            .ok_or_else(|| RunnerError::Output("completed record without meta".to_string()))?;
        Meta::from_json(meta).map_err(|e| RunnerError::Output(e.to_string()))
    }

    async fn bake(&self, request: &BakeRequest) -> Result<BakeOutcome, RunnerError> {
        let config_path =
            std::env::temp_dir().join(format!("pfo-bake-{}.json", uuid::Uuid::new_v4()));
        let config = serde_json::to_vec_pretty(&request.config)
            .map_err(|e| RunnerError::Output(e.to_string()))?;
        tokio::fs::write(&config_path, config).await?;

        let mut args = vec![
            "bake".to_string(),
            format!("--repo={}", request.repo_url),
            format!("--ref={}", request.git_ref),
            "--json".to_string(),
        ];
        if let Some(ref subdir) = request.feedstock_subdir {
            args.push(format!("--feedstock-subdir={subdir}"));
        }
        args.push("-f".to_string());
        args.push(config_path.to_string_lossy().into_owned());
        let result = self.run(&args).await;

        if let Err(e) = tokio::fs::remove_file(&config_path).await {
            debug!(error = %e, path = %config_path.display(), "Failed to remove runner config");
        }

        let records = result?;
        let record = find_status(&records, "submitted")
            .ok_or_else(|| RunnerError::MissingRecord("submitted".to_string()))?;
        let job_id = record
            .get("job_id")
            .and_then(Value::as_str)
            .ok_or_else(|| RunnerError::Output("submitted record without job_id".to_string()))?;
        let job_name = record
            .get("job_name")
            .and_then(Value::as_str)
            .unwrap_or(&request.job_name);

        Ok(BakeOutcome {
            job_name: job_name.to_string(),
            job_id: job_id.to_string(),
        })
    }
}

/// Parse JSON-lines output, relaying each record's message to the log
pub fn parse_records(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(record @ Value::Object(_)) => {
                if let Some(message) = record.get("message").and_then(Value::as_str) {
                    info!(target: "pangeo_forge_runner", "{}", message);
                }
                Some(record)
            }
            _ => {
                debug!(line, "Skipping non-JSON runner output");
                None
            }
        })
        .collect()
}

/// Last record whose `status` equals `status`
pub fn find_status<'a>(records: &'a [Value], status: &str) -> Option<&'a Value> {
    records
        .iter()
        .rev()
        .find(|r| r.get("status").and_then(Value::as_str) == Some(status))
}

/// Best description of why the runner failed
pub fn failure_message(records: &[Value], stderr: &str) -> String {
    if let Some(message) = records
        .iter()
        .rev()
        .find_map(|r| r.get("message").and_then(Value::as_str))
    {
        return message.to_string();
    }

    let lines: Vec<&str> = stderr.lines().collect();
    let tail = &lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..];
    if tail.is_empty() {
        "no output".to_string()
    } else {
        tail.join("\n")
    }
}

/// Deterministic Dataflow job name for a recipe run
///
/// `gh-{owner}-{repo}-{sha7}-{id}`, lowercased, with anything outside
/// `[a-z0-9-]` replaced and the prefix shortened so the id always survives.
pub fn job_name_for(feedstock_spec: &str, head_sha: &str, recipe_run_id: i64) -> String {
    let short_sha: String = head_sha.chars().take(7).collect();
    let suffix = format!("-{}-{}", short_sha, recipe_run_id);

    let mut prefix = String::from("gh-");
    let mut last_dash = true;
    for c in feedstock_spec.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prefix.push(c);
            last_dash = false;
        } else if !last_dash {
            prefix.push('-');
            last_dash = true;
        }
    }

    let max_prefix = MAX_JOB_NAME_LEN.saturating_sub(suffix.len());
    prefix.truncate(max_prefix);
    let prefix = prefix.trim_end_matches('-');

    format!("{prefix}{suffix}")
}
