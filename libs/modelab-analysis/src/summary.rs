use chrono::{DateTime, Utc};
use modelab_common::types::{Category, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::thread;
use tracing::{debug, info};

use crate::consistency::{analyze_consistency, ConsistencyReport};
use crate::failure_modes::{analyze_failure_modes, FailureModeReport};
use crate::stats::{mean, std_dev};
use crate::tradeoffs::{analyze_tradeoffs, TradeoffReport};

/// Run identity carried into the summary header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub git_commit: Option<String>,
}

impl RunMetadata {
    /// Run id and commit of the first record; the earliest record timestamp.
    pub fn from_results(results: &[RunResult]) -> Self {
        match results.first() {
            Some(first) => Self {
                run_id: Some(first.run_id.clone()),
                timestamp: results.iter().map(|r| r.timestamp).min(),
                git_commit: first.git_commit.clone(),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreAggregate {
    pub mean_score: f64,
    pub std_score: f64,
    pub total_runs: usize,
}

impl ScoreAggregate {
    fn from_scores(scores: &[f64]) -> Self {
        Self {
            mean_score: mean(scores),
            std_score: std_dev(scores),
            total_runs: scores.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub total_runs: usize,
    pub mean_score: f64,
    pub std_score: f64,
    pub mean_latency_ms: f64,
    pub categories: BTreeMap<Category, ScoreAggregate>,
}

/// Batch-level document: score aggregates plus one section per analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    pub total_runs: usize,
    pub models: BTreeMap<String, ModelSummary>,
    pub categories: BTreeMap<Category, ScoreAggregate>,
    pub overall: Option<ScoreAggregate>,
    pub consistency: ConsistencyReport,
    pub failure_modes: FailureModeReport,
    pub tradeoffs: TradeoffReport,
}

fn score_aggregates(
    results: &[RunResult],
) -> (
    BTreeMap<String, ModelSummary>,
    BTreeMap<Category, ScoreAggregate>,
    Option<ScoreAggregate>,
) {
    let mut per_model: BTreeMap<&str, (Vec<f64>, Vec<f64>, BTreeMap<Category, Vec<f64>>)> =
        BTreeMap::new();
    let mut per_category: BTreeMap<Category, Vec<f64>> = BTreeMap::new();
    let mut all_scores = Vec::with_capacity(results.len());

    for result in results {
        let (scores, latencies, categories) = per_model.entry(result.model.as_str()).or_default();
        scores.push(result.final_score);
        latencies.push(result.latency_ms as f64);
        categories
            .entry(result.category)
            .or_default()
            .push(result.final_score);

        per_category
            .entry(result.category)
            .or_default()
            .push(result.final_score);
        all_scores.push(result.final_score);
    }

    let models = per_model
        .into_iter()
        .map(|(model, (scores, latencies, categories))| {
            let summary = ModelSummary {
                total_runs: scores.len(),
                mean_score: mean(&scores),
                std_score: std_dev(&scores),
                mean_latency_ms: mean(&latencies),
                categories: categories
                    .iter()
                    .map(|(c, s)| (*c, ScoreAggregate::from_scores(s)))
                    .collect(),
            };
            (model.to_string(), summary)
        })
        .collect();

    let categories = per_category
        .iter()
        .map(|(c, s)| (*c, ScoreAggregate::from_scores(s)))
        .collect();

    let overall = if all_scores.is_empty() {
        None
    } else {
        Some(ScoreAggregate::from_scores(&all_scores))
    };

    (models, categories, overall)
}

/// Build the summary over a finalized result set.
///
/// The three analyzers read the same immutable slice and run on scoped
/// threads; each fills its own section.
pub fn build_summary(results: &[RunResult], metadata: RunMetadata) -> Summary {
    info!(records = results.len(), "Building summary");

    let (consistency, failure_modes, tradeoffs) = thread::scope(|scope| {
        let consistency = scope.spawn(|| analyze_consistency(results));
        let failure_modes = scope.spawn(|| analyze_failure_modes(results));
        let tradeoffs = analyze_tradeoffs(results);
        (
            join_or_default(consistency.join(), "consistency"),
            join_or_default(failure_modes.join(), "failure_modes"),
            tradeoffs,
        )
    });

    let (models, categories, overall) = score_aggregates(results);

    debug!(
        models = models.len(),
        systematic = failure_modes.systematic_failures.len(),
        correlations = tradeoffs.correlations.len(),
        "Summary sections computed"
    );

    Summary {
        run_id: metadata.run_id,
        timestamp: metadata.timestamp,
        git_commit: metadata.git_commit,
        config: None,
        total_runs: results.len(),
        models,
        categories,
        overall,
        consistency,
        failure_modes,
        tradeoffs,
    }
}

fn join_or_default<T: Default>(joined: thread::Result<T>, section: &str) -> T {
    match joined {
        Ok(report) => report,
        Err(_) => {
            tracing::error!(section = section, "Analyzer panicked; section left empty");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{result, tagged};
    use modelab_common::types::tags;

    #[test]
    fn test_empty_results() {
        let summary = build_summary(&[], RunMetadata::default());

        assert_eq!(summary.total_runs, 0);
        assert!(summary.models.is_empty());
        assert!(summary.overall.is_none());
        assert!(summary.run_id.is_none());
    }

    #[test]
    fn test_metadata_takes_earliest_record() {
        let mut late = result("a", Category::Code, "c1", 1.0);
        let mut early = result("b", Category::Code, "c1", 0.0);
        late.git_commit = Some("abc123".to_string());
        early.timestamp = late.timestamp - chrono::Duration::seconds(30);

        let metadata = RunMetadata::from_results(&[late.clone(), early.clone()]);

        assert_eq!(metadata.run_id.as_deref(), Some("run"));
        assert_eq!(metadata.timestamp, Some(early.timestamp));
        assert_eq!(metadata.git_commit.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_model_and_category_aggregates() {
        let results = vec![
            result("a", Category::Reasoning, "r1", 1.0),
            result("a", Category::Reasoning, "r1", 0.0),
            result("a", Category::Code, "c1", 0.5),
            tagged("b", Category::Code, "c1", 0.0, &[tags::CODE_EXECUTION_FAILED]),
        ];

        let summary = build_summary(&results, RunMetadata::from_results(&results));

        assert_eq!(summary.run_id.as_deref(), Some("run"));
        assert_eq!(summary.total_runs, 4);

        let a = &summary.models["a"];
        assert_eq!(a.total_runs, 3);
        assert_eq!(a.mean_score, 0.5);
        assert_eq!(a.mean_latency_ms, 100.0);
        assert_eq!(a.categories[&Category::Reasoning].std_score, 0.5);
        assert_eq!(a.categories[&Category::Code].total_runs, 1);

        assert_eq!(summary.categories[&Category::Code].mean_score, 0.25);
        assert_eq!(summary.overall.as_ref().unwrap().mean_score, 0.375);

        assert_eq!(summary.failure_modes.per_model.len(), 2);
        assert_eq!(summary.tradeoffs.per_model.len(), 2);
    }

    #[test]
    fn test_summary_sections_serialize_under_distinct_keys() {
        let results = vec![result("a", Category::Emotion, "e1", 1.0)];
        let summary = build_summary(&results, RunMetadata::from_results(&results));

        let encoded = serde_json::to_value(&summary).unwrap();
        for key in ["models", "categories", "overall", "consistency", "failure_modes", "tradeoffs"] {
            assert!(encoded.get(key).is_some(), "missing key {}", key);
        }
        assert!(encoded.get("config").is_none());
        assert_eq!(encoded["categories"]["emotion"]["total_runs"], 1);
    }
}
