//! Batch analyzers over a finalized set of run results.
//!
//! Every pass takes an immutable slice of records, collects raw score lists
//! keyed by composite (model, category, ...) tuples, then derives statistics
//! once. The passes share nothing and can run concurrently.

pub mod consistency;
pub mod failure_modes;
pub mod stats;
pub mod summary;
pub mod tradeoffs;

pub use consistency::{analyze_consistency, ConsistencyReport};
pub use failure_modes::{analyze_failure_modes, FailureModeReport};
pub use summary::{build_summary, RunMetadata, Summary};
pub use tradeoffs::{analyze_tradeoffs, TradeoffReport};

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use modelab_common::types::{Category, RunResult, ScoreDetail};

    pub fn result(model: &str, category: Category, test_id: &str, score: f64) -> RunResult {
        RunResult {
            run_id: "run".to_string(),
            timestamp: Utc::now(),
            git_commit: None,
            model: model.to_string(),
            test_id: test_id.to_string(),
            category,
            variant_group: None,
            repeat_idx: 0,
            prompt: String::new(),
            raw_output: String::new(),
            score_detail: ScoreDetail::new("exact_match", score),
            final_score: score,
            failure_tags: Vec::new(),
            latency_ms: 100,
            error: None,
        }
    }

    pub fn tagged(
        model: &str,
        category: Category,
        test_id: &str,
        score: f64,
        tags: &[&str],
    ) -> RunResult {
        let mut r = result(model, category, test_id, score);
        r.failure_tags = tags.iter().map(|t| t.to_string()).collect();
        r
    }

    pub fn grouped(model: &str, test_id: &str, group: &str, score: f64) -> RunResult {
        let mut r = result(model, Category::Emotion, test_id, score);
        r.variant_group = Some(group.to_string());
        r
    }
}
