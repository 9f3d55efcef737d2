mod config;
mod engine;
mod evaluator;
mod executor;
mod harness;
mod judge;
mod model;

use anyhow::Context;
use chrono::Utc;
use config::RunConfig;
use engine::Sandbox;
use executor::{Executor, RecordSinks, RunIdentity};
use model::OllamaClient;
use modelab_analysis::summary::{build_summary, RunMetadata};
use modelab_common::redis;
use modelab_common::store::{self, RecordWriter, RESULTS_JSON, RESULTS_JSONL, SUMMARY_JSON};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber (LOG_FORMAT=json for machine-readable logs)
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Modelab worker booting...");

    let mut config = RunConfig::load_default().map_err(|e| {
        error!("Failed to load run configuration: {:#}", e);
        error!("Make sure config/run_config.json exists or set MODELAB_CONFIG");
        e
    })?;
    config.apply_env_overrides();
    config.validate()?;

    let suite = store::load_suite(&config.suite_path)?;
    if suite.is_empty() {
        warn!(suite = %config.suite_path.display(), "Suite has no tests");
    }

    let run_id = std::env::var("RUN_ID").unwrap_or_else(|_| executor::generate_run_id());
    let out_dir = std::env::var("OUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data").join("runs").join(&run_id));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let identity = RunIdentity {
        run_id: run_id.clone(),
        timestamp: Utc::now(),
        git_commit: executor::git_commit().await,
    };

    info!(
        run_id = %run_id,
        models = ?config.models,
        suite = %config.suite_path.display(),
        tests = suite.len(),
        total_units = config.total_units(suite.len()),
        out_dir = %out_dir.display(),
        "Run configured"
    );

    // Optional Redis sink
    let mut redis_conn = match std::env::var("REDIS_URL") {
        Ok(redis_url) => {
            let client = ::redis::Client::open(redis_url.as_str())?;
            let conn = ::redis::aio::ConnectionManager::new(client).await?;
            info!("Connected to Redis: {}", redis_url);
            Some(conn)
        }
        Err(_) => None,
    };

    let sandbox = Sandbox::from_config(&config.sandbox)?;
    sandbox.prepare().await?;
    info!(backend = sandbox.name(), "Sandbox ready");

    let invoker = OllamaClient::new(&config.ollama_url)?;
    let runner = Executor::new(&config, identity, &out_dir, &invoker, &sandbox);

    let mut sinks = RecordSinks {
        writer: RecordWriter::open(&out_dir.join(RESULTS_JSONL))?,
        redis: redis_conn.as_mut(),
    };

    // Setup graceful shutdown
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, summarizing completed units..."),
            Err(e) => {
                error!(error = %e, "Failed to install CTRL+C signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let results = runner.run(&suite, &mut sinks, shutdown).await?;
    drop(sinks);

    let identity = runner.identity();
    let mut summary = build_summary(
        &results,
        RunMetadata {
            run_id: Some(identity.run_id.clone()),
            timestamp: Some(identity.timestamp),
            git_commit: identity.git_commit.clone(),
        },
    );
    summary.config = Some(serde_json::to_value(&config).context("Failed to serialize run config")?);

    let summary_path = out_dir.join(SUMMARY_JSON);
    store::write_json_pretty(&summary_path, &summary)?;
    store::write_json_pretty(&out_dir.join(RESULTS_JSON), &results)?;

    if let Some(conn) = redis_conn.as_mut() {
        match redis::store_summary(conn, &run_id, &summary).await {
            Ok(_) => info!(run_id = %run_id, "Summary persisted to Redis"),
            // Non-fatal - summary.json is already on disk
            Err(e) => error!(run_id = %run_id, error = %e, "Failed to persist summary"),
        }
    }

    info!(
        run_id = %run_id,
        total_runs = summary.total_runs,
        summary = %summary_path.display(),
        "Experiment complete"
    );
    Ok(())
}
