// CLI commands for inspecting suites and runs
use anyhow::{bail, Context, Result};
use modelab_analysis::summary::{build_summary, RunMetadata, Summary};
use modelab_common::error::ScoreError;
use modelab_common::redis;
use modelab_common::store::{self, SUMMARY_JSON};
use modelab_common::types::{Category, CodeSpec, EvalMethod, RunResult, TestCase};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// Where `analyze` reads records from
#[derive(Debug, Clone)]
pub enum ResultSource {
    /// Run directory, `.jsonl` stream or `.json` array
    File(PathBuf),
    Redis { url: String, run_id: String },
}

impl ResultSource {
    fn describe(&self) -> String {
        match self {
            ResultSource::File(path) => path.display().to_string(),
            ResultSource::Redis { run_id, .. } => redis::results_key(run_id),
        }
    }

    /// summary.json next to the results, or under `data/runs/<run_id>` for Redis
    fn default_summary_path(&self) -> PathBuf {
        match self {
            ResultSource::File(path) if path.is_dir() => path.join(SUMMARY_JSON),
            ResultSource::File(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
                .join(SUMMARY_JSON),
            ResultSource::Redis { run_id, .. } => {
                PathBuf::from("data").join("runs").join(run_id).join(SUMMARY_JSON)
            }
        }
    }

    async fn load(&self) -> Result<Vec<RunResult>> {
        match self {
            ResultSource::File(path) => store::load_results(path),
            ResultSource::Redis { url, run_id } => {
                let client = ::redis::Client::open(url.as_str())
                    .with_context(|| format!("Invalid Redis URL: {}", url))?;
                let mut conn = ::redis::aio::ConnectionManager::new(client)
                    .await
                    .context("Failed to connect to Redis")?;
                redis::fetch_results(&mut conn, run_id)
                    .await
                    .with_context(|| format!("Failed to fetch records of run {}", run_id))
            }
        }
    }
}

/// Recompute the summary document of a recorded run
pub async fn analyze(source: ResultSource, out: Option<&Path>) -> Result<()> {
    println!("📊 Loading results from {}...", source.describe());

    let results = source.load().await?;
    if results.is_empty() {
        bail!("No records found in {}", source.describe());
    }

    let summary = build_summary(&results, RunMetadata::from_results(&results));

    let out_path = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| source.default_summary_path());
    store::write_json_pretty(&out_path, &summary)?;

    print_digest(&summary);
    println!("\n✅ Summary written to {}", out_path.display());
    Ok(())
}

fn print_digest(summary: &Summary) {
    println!(
        "\n📋 Run {} ({} records)\n",
        summary.run_id.as_deref().unwrap_or("unknown"),
        summary.total_runs
    );
    println!("{:<28} {:>6} {:>8} {:>8} {:>12}", "MODEL", "RUNS", "MEAN", "STD", "LATENCY MS");
    println!("{}", "─".repeat(66));
    for (model, stats) in &summary.models {
        println!(
            "{:<28} {:>6} {:>8.3} {:>8.3} {:>12.0}",
            model, stats.total_runs, stats.mean_score, stats.std_score, stats.mean_latency_ms
        );
    }

    if !summary.failure_modes.systematic_failures.is_empty() {
        println!(
            "\n⚠️  {} systematic failure(s), see failure_modes in the summary",
            summary.failure_modes.systematic_failures.len()
        );
    }
}

/// Findings of a suite check. Errors would break scoring; warnings weaken analysis.
#[derive(Debug, Default)]
pub struct SuiteReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SuiteReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn check_expected(case: &TestCase, method: &EvalMethod) -> Result<(), ScoreError> {
    match method {
        EvalMethod::ExactMatch(_) if case.expected.is_null() => Err(ScoreError::MalformedExpected(
            "exact_match test has no expected value".to_string(),
        )),
        EvalMethod::NumericTolerance(_) => {
            let numeric = match &case.expected {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            };
            if numeric {
                Ok(())
            } else {
                Err(ScoreError::MalformedExpected(format!(
                    "expected value {} is not numeric",
                    case.expected
                )))
            }
        }
        EvalMethod::Contains(params)
            if params.required_terms.is_empty() && params.forbidden_terms.is_empty() =>
        {
            Err(ScoreError::MalformedExpected(
                "contains test lists no terms".to_string(),
            ))
        }
        EvalMethod::PythonExec(_) => CodeSpec::from_expected(&case.expected).map(|_| ()),
        _ => Ok(()),
    }
}

/// Check every test of a suite without touching any model.
pub fn validate_suite(suite: &[TestCase]) -> SuiteReport {
    let mut report = SuiteReport::default();
    let mut seen = HashSet::new();
    let mut covered = BTreeSet::new();

    for case in suite {
        covered.insert(case.category);

        if !seen.insert(case.id.as_str()) {
            report.errors.push(format!("{}: duplicate test id", case.id));
        }
        if case.prompt.trim().is_empty() {
            report.warnings.push(format!("{}: empty prompt", case.id));
        }

        match EvalMethod::from_spec(&case.eval) {
            Ok(method) => {
                if let Err(e) = check_expected(case, &method) {
                    report.errors.push(format!("{}: {}", case.id, e));
                }
            }
            Err(e) => report.errors.push(format!("{}: {}", case.id, e)),
        }

        if case.category == Category::Emotion && case.variant_group().is_none() {
            report.warnings.push(format!(
                "{}: emotion test has no prompt_variant_group, consistency cannot group it",
                case.id
            ));
        }
    }

    for category in Category::ALL {
        if !covered.contains(&category) {
            report.warnings.push(format!("category '{}' has no tests", category));
        }
    }

    report
}

/// Validate a suite file and fail when it has errors
pub fn check_suite(path: &Path) -> Result<()> {
    println!("🔍 Checking suite: {}", path.display());

    // Duplicates are reported below instead of failing the load
    let suite: Vec<TestCase> = store::read_json(path)?;
    let report = validate_suite(&suite);

    for warning in &report.warnings {
        println!("  ⚠️  {}", warning);
    }
    for error in &report.errors {
        println!("  ❌ {}", error);
    }

    if !report.is_ok() {
        bail!(
            "Suite {} has {} error(s)",
            path.display(),
            report.errors.len()
        );
    }

    println!(
        "\n✅ {} test(s) OK ({} warning(s))",
        suite.len(),
        report.warnings.len()
    );
    Ok(())
}
