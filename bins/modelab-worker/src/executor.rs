//! Experiment Executor - High-Level Orchestration
//!
//! **Responsibility:**
//! Expand the suite into (test, model, repeat) units, run them on a bounded
//! pool, and stream finished records to the sinks.
//!
//! **Architecture:**
//! 1. Model collaborator produces the raw output (model.rs)
//! 2. Evaluator scores it (evaluator.rs)
//! 3. A single consumer appends records to `results.jsonl` and Redis
//!
//! This module is the glue layer - it knows nothing about:
//! - How code executes (engine's job)
//! - How scoring works (evaluator's job)

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use futures_util::stream::{self, StreamExt};
use modelab_common::redis as sink;
use modelab_common::store::{self, RecordWriter};
use modelab_common::types::{RunResult, TestCase};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RunConfig;
use crate::engine::HarnessRunner;
use crate::evaluator::{self, EvaluatorContext};
use crate::judge::JudgeSettings;
use crate::model::{ModelInvoker, SamplingConfig};

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default run id: local wall-clock time, `%Y%m%d_%H%M%S`
pub fn generate_run_id() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// `git rev-parse HEAD` of the working directory, if there is one
pub async fn git_commit() -> Option<String> {
    let mut command = tokio::process::Command::new("git");
    command.args(["rev-parse", "HEAD"]).kill_on_drop(true);

    match tokio::time::timeout(GIT_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!commit.is_empty()).then_some(commit)
        }
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!(error = %e, "git unavailable");
            None
        }
        Err(_) => {
            warn!("git rev-parse timed out");
            None
        }
    }
}

/// Identity shared by every record of one run. `timestamp` is the run start.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub git_commit: Option<String>,
}

/// Completed records keyed by (model, test, repeat, sampling)
pub struct OutputCache {
    dir: PathBuf,
}

impl OutputCache {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            dir: out_dir.join(".cache"),
        }
    }

    /// Hex SHA-256 of `model:test_id:repeat_idx:<sampling json>`.
    /// Sampling keys serialize in sorted order.
    pub fn key(model: &str, test_id: &str, repeat_idx: u32, sampling: &SamplingConfig) -> String {
        let sampling = serde_json::to_value(sampling)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let digest = Sha256::digest(format!("{}:{}:{}:{}", model, test_id, repeat_idx, sampling));
        hex::encode(digest)
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn load(&self, key: &str) -> Option<RunResult> {
        let path = self.path(key);
        if !path.exists() {
            return None;
        }
        match store::read_json(&path) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    pub fn save(&self, key: &str, record: &RunResult) {
        if let Err(e) = store::write_json_pretty(&self.path(key), record) {
            warn!(error = %e, "Failed to write cache entry");
        }
    }
}

/// One (test, model, repeat) triple
#[derive(Debug, Clone, Copy)]
pub struct WorkUnit<'a> {
    pub test: &'a TestCase,
    pub model: &'a str,
    pub repeat_idx: u32,
}

/// Expand the suite: for each test, for each model, for each repeat
pub fn plan_units<'a>(suite: &'a [TestCase], models: &'a [String], repeats: u32) -> Vec<WorkUnit<'a>> {
    suite
        .iter()
        .flat_map(|test| {
            models.iter().flat_map(move |model| {
                (0..repeats).map(move |repeat_idx| WorkUnit {
                    test,
                    model: model.as_str(),
                    repeat_idx,
                })
            })
        })
        .collect()
}

/// Where finished records go, in completion order
pub struct RecordSinks<'a> {
    pub writer: RecordWriter,
    pub redis: Option<&'a mut redis::aio::ConnectionManager>,
}

impl RecordSinks<'_> {
    async fn emit(&mut self, record: &RunResult) -> Result<()> {
        self.writer
            .append(record)
            .with_context(|| format!("Failed to record {}", record.test_id))?;

        if let Some(conn) = self.redis.as_deref_mut() {
            if let Err(e) = sink::push_result(conn, record).await {
                // Non-fatal - the JSONL stream stays authoritative
                error!(test_id = %record.test_id, error = %e, "Failed to push result to Redis");
            }
        }
        Ok(())
    }
}

pub struct Executor<'a> {
    config: &'a RunConfig,
    identity: RunIdentity,
    invoker: &'a dyn ModelInvoker,
    sandbox: &'a dyn HarnessRunner,
    judge: JudgeSettings,
    cache: Option<OutputCache>,
}

impl<'a> Executor<'a> {
    pub fn new(
        config: &'a RunConfig,
        identity: RunIdentity,
        out_dir: &Path,
        invoker: &'a dyn ModelInvoker,
        sandbox: &'a dyn HarnessRunner,
    ) -> Self {
        let judge = JudgeSettings {
            model: config.judge_model.clone(),
            sampling: config.judge_sampling.clone(),
            timeout: Duration::from_secs(config.judge_timeout_s),
        };
        let cache = config.cache_outputs.then(|| OutputCache::new(out_dir));

        Self {
            config,
            identity,
            invoker,
            sandbox,
            judge,
            cache,
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    fn evaluator_context(&self) -> EvaluatorContext<'_> {
        EvaluatorContext {
            invoker: self.invoker,
            judge: &self.judge,
            sandbox: self.sandbox,
            default_code_timeout: Duration::from_secs(self.config.sandbox.default_timeout_s),
        }
    }

    /// Produce the record for one unit, from the cache when allowed
    #[instrument(skip_all, fields(model = %unit.model, test_id = %unit.test.id, repeat_idx = unit.repeat_idx))]
    pub async fn run_unit(&self, unit: WorkUnit<'_>) -> RunResult {
        let key = OutputCache::key(unit.model, &unit.test.id, unit.repeat_idx, &self.config.sampling);
        if let Some(cached) = self.cache.as_ref().and_then(|cache| cache.load(&key)) {
            debug!("Reusing cached record");
            return cached;
        }

        let invocation = self
            .invoker
            .invoke(
                &unit.test.prompt,
                unit.model,
                &self.config.sampling,
                Duration::from_secs(self.config.timeout_s),
            )
            .await;

        if let Some(error) = &invocation.error {
            warn!(error = %error, "Model call failed, scoring empty output");
        }

        let ctx = self.evaluator_context();
        let outcome = evaluator::evaluate(unit.test, &invocation.output, &ctx).await;

        let record = RunResult {
            run_id: self.identity.run_id.clone(),
            timestamp: Utc::now(),
            git_commit: self.identity.git_commit.clone(),
            model: unit.model.to_string(),
            test_id: unit.test.id.clone(),
            category: unit.test.category,
            variant_group: unit.test.variant_group().map(String::from),
            repeat_idx: unit.repeat_idx,
            prompt: unit.test.prompt.clone(),
            raw_output: invocation.output,
            score_detail: outcome.score_detail,
            final_score: outcome.final_score,
            failure_tags: outcome.failure_tags,
            latency_ms: invocation.latency_ms,
            error: invocation.error,
        };

        if let Some(cache) = &self.cache {
            cache.save(&key, &record);
        }
        record
    }

    /// Run every unit of the suite with at most `concurrency` in flight.
    ///
    /// Returns the records completed before the pool drained or `shutdown`
    /// resolved; each one has already been appended to the sinks.
    pub async fn run<F>(
        &self,
        suite: &[TestCase],
        sinks: &mut RecordSinks<'_>,
        shutdown: F,
    ) -> Result<Vec<RunResult>>
    where
        F: Future<Output = ()>,
    {
        let units = plan_units(suite, &self.config.models, self.config.repeats);
        let total = units.len();

        info!(
            run_id = %self.identity.run_id,
            models = ?self.config.models,
            tests = suite.len(),
            repeats = self.config.repeats,
            total_units = total,
            concurrency = self.config.concurrency,
            "Starting experiment"
        );

        let mut pending = stream::iter(units)
            .map(|unit| self.run_unit(unit))
            .buffer_unordered(self.config.concurrency.max(1));
        tokio::pin!(shutdown);

        let mut results = Vec::with_capacity(total);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!(completed = results.len(), total, "Stopping before all units completed");
                    break;
                }
                next = pending.next() => {
                    let Some(record) = next else { break };
                    sinks.emit(&record).await?;

                    info!(
                        progress = %format!("{}/{}", results.len() + 1, total),
                        model = %record.model,
                        test_id = %record.test_id,
                        repeat_idx = record.repeat_idx,
                        score = record.final_score,
                        latency_ms = record.latency_ms,
                        "Unit completed"
                    );
                    results.push(record);
                }
            }
        }

        info!(completed = results.len(), path = %sinks.writer.path().display(), "Records written");
        Ok(results)
    }
}
