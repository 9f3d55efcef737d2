mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "modelab-cli")]
#[command(about = "Modelab CLI - Validate test suites and analyze evaluation runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute summary.json from recorded results
    Analyze {
        /// Run directory, results.jsonl or results.json
        #[arg(short, long, required_unless_present = "run_id")]
        results: Option<PathBuf>,

        /// Where to write the summary (defaults to summary.json next to the results)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Read records from Redis instead of a file
        #[arg(long, requires = "run_id")]
        redis_url: Option<String>,

        /// Run id to fetch from Redis
        #[arg(long, requires = "redis_url")]
        run_id: Option<String>,
    },

    /// Validate a test suite file
    CheckSuite {
        /// Suite path (e.g., prompts/suites/core_suite.json)
        #[arg(short, long)]
        suite: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            results,
            out,
            redis_url,
            run_id,
        } => {
            let source = match (redis_url, run_id, results) {
                (Some(url), Some(run_id), _) => commands::ResultSource::Redis { url, run_id },
                (_, _, Some(path)) => commands::ResultSource::File(path),
                _ => anyhow::bail!("Either --results or --redis-url with --run-id is required"),
            };
            commands::analyze(source, out.as_deref()).await?;
        }
        Commands::CheckSuite { suite } => {
            commands::check_suite(&suite)?;
        }
    }

    Ok(())
}
