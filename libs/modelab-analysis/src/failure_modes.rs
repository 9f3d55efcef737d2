//! Failure-mode frequencies and classification.
//!
//! Per (model, category) cohort a tag is systematic when it appears in at
//! least 30% of the cohort's runs and sporadic when it appears in under 10%
//! (but some) of them. The band in between is left unclassified.

use modelab_common::types::{Category, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::stats::mean;

pub const SYSTEMATIC_THRESHOLD: f64 = 0.3;
pub const SPORADIC_THRESHOLD: f64 = 0.1;
pub const TOP_TAGS_PER_MODEL: usize = 5;
pub const WORST_TESTS_PER_MODEL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePattern {
    Systematic,
    Sporadic,
}

/// Classify a tag frequency within a cohort.
pub fn classify_frequency(frequency: f64) -> Option<FailurePattern> {
    if frequency >= SYSTEMATIC_THRESHOLD {
        Some(FailurePattern::Systematic)
    } else if frequency > 0.0 && frequency < SPORADIC_THRESHOLD {
        Some(FailurePattern::Sporadic)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagStats {
    pub tag: String,
    pub count: usize,
    pub frequency: f64,
    pub avg_score_when_present: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFailures {
    pub model: String,
    pub total_runs: usize,
    pub total_failures: usize,
    pub failure_rate: f64,
    pub failure_tags: Vec<TagStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryFailures {
    pub category: Category,
    pub total_runs: usize,
    pub total_failures: usize,
    pub failure_rate: f64,
    pub failure_tags: Vec<TagStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailures {
    pub test_id: String,
    pub total_runs: usize,
    pub failure_tags: Vec<TagStats>,
}

/// A classified tag inside one (model, category) cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortFailure {
    pub model: String,
    pub category: Category,
    pub tag: String,
    pub count: usize,
    pub total_runs: usize,
    pub frequency: f64,
    pub pattern: FailurePattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTopTags {
    pub model: String,
    pub tags: Vec<TagCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorstTest {
    pub test_id: String,
    pub avg_score: f64,
    pub runs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWorstTests {
    pub model: String,
    pub tests: Vec<WorstTest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureModeReport {
    pub per_model: Vec<ModelFailures>,
    pub per_category: Vec<CategoryFailures>,
    pub per_test: Vec<TestFailures>,
    pub systematic_failures: Vec<CohortFailure>,
    pub sporadic_failures: Vec<CohortFailure>,
    pub top_failure_tags: Vec<ModelTopTags>,
    pub worst_tests: Vec<ModelWorstTests>,
}

/// Score lists keyed by label, remembering first-seen order.
#[derive(Default)]
struct Tally<'a> {
    order: Vec<&'a str>,
    scores: HashMap<&'a str, Vec<f64>>,
}

impl<'a> Tally<'a> {
    fn record(&mut self, key: &'a str, score: f64) {
        match self.scores.get_mut(key) {
            Some(scores) => scores.push(score),
            None => {
                self.order.push(key);
                self.scores.insert(key, vec![score]);
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&'a str, &[f64])> + '_ {
        self.order
            .iter()
            .map(move |key| (*key, self.scores[key].as_slice()))
    }
}

#[derive(Default)]
struct Cohort<'a> {
    total_runs: usize,
    failed_runs: usize,
    tags: Tally<'a>,
}

impl<'a> Cohort<'a> {
    fn observe(&mut self, result: &'a RunResult) {
        self.total_runs += 1;
        if result.final_score < 1.0 {
            self.failed_runs += 1;
        }
        for (idx, tag) in result.failure_tags.iter().enumerate() {
            // Tags form a set per run
            if result.failure_tags[..idx].contains(tag) {
                continue;
            }
            self.tags.record(tag, result.final_score);
        }
    }

    fn failure_rate(&self) -> f64 {
        ratio(self.failed_runs, self.total_runs)
    }

    fn tag_stats(&self) -> Vec<TagStats> {
        self.tags
            .iter()
            .map(|(tag, scores)| TagStats {
                tag: tag.to_string(),
                count: scores.len(),
                frequency: ratio(scores.len(), self.total_runs),
                avg_score_when_present: mean(scores),
            })
            .collect()
    }
}

fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    count as f64 / total as f64
}

pub fn analyze_failure_modes(results: &[RunResult]) -> FailureModeReport {
    let mut by_model: BTreeMap<&str, Cohort> = BTreeMap::new();
    let mut by_category: BTreeMap<Category, Cohort> = BTreeMap::new();
    let mut by_test: BTreeMap<&str, Cohort> = BTreeMap::new();
    let mut by_cohort: BTreeMap<(&str, Category), Cohort> = BTreeMap::new();
    let mut test_scores: BTreeMap<&str, Tally> = BTreeMap::new();

    for result in results {
        let model = result.model.as_str();
        by_model.entry(model).or_default().observe(result);
        by_category.entry(result.category).or_default().observe(result);
        by_test
            .entry(result.test_id.as_str())
            .or_default()
            .observe(result);
        by_cohort
            .entry((model, result.category))
            .or_default()
            .observe(result);
        test_scores
            .entry(model)
            .or_default()
            .record(&result.test_id, result.final_score);
    }

    let per_model = by_model
        .iter()
        .map(|(model, cohort)| ModelFailures {
            model: model.to_string(),
            total_runs: cohort.total_runs,
            total_failures: cohort.failed_runs,
            failure_rate: cohort.failure_rate(),
            failure_tags: cohort.tag_stats(),
        })
        .collect();

    let per_category = by_category
        .iter()
        .map(|(category, cohort)| CategoryFailures {
            category: *category,
            total_runs: cohort.total_runs,
            total_failures: cohort.failed_runs,
            failure_rate: cohort.failure_rate(),
            failure_tags: cohort.tag_stats(),
        })
        .collect();

    let per_test = by_test
        .iter()
        .filter(|(_, cohort)| !cohort.tags.order.is_empty())
        .map(|(test_id, cohort)| TestFailures {
            test_id: test_id.to_string(),
            total_runs: cohort.total_runs,
            failure_tags: cohort.tag_stats(),
        })
        .collect();

    let mut systematic_failures = Vec::new();
    let mut sporadic_failures = Vec::new();
    for ((model, category), cohort) in &by_cohort {
        for (tag, scores) in cohort.tags.iter() {
            let frequency = ratio(scores.len(), cohort.total_runs);
            let Some(pattern) = classify_frequency(frequency) else {
                continue;
            };
            let entry = CohortFailure {
                model: model.to_string(),
                category: *category,
                tag: tag.to_string(),
                count: scores.len(),
                total_runs: cohort.total_runs,
                frequency,
                pattern,
            };
            match pattern {
                FailurePattern::Systematic => systematic_failures.push(entry),
                FailurePattern::Sporadic => sporadic_failures.push(entry),
            }
        }
    }

    let top_failure_tags = by_model
        .iter()
        .map(|(model, cohort)| {
            let mut tags: Vec<TagCount> = cohort
                .tags
                .iter()
                .map(|(tag, scores)| TagCount {
                    tag: tag.to_string(),
                    count: scores.len(),
                    frequency: ratio(scores.len(), cohort.total_runs),
                })
                .collect();
            // Stable sort keeps first-seen order among equal counts
            tags.sort_by(|a, b| b.count.cmp(&a.count));
            tags.truncate(TOP_TAGS_PER_MODEL);
            ModelTopTags {
                model: model.to_string(),
                tags,
            }
        })
        .collect();

    let worst_tests = test_scores
        .iter()
        .map(|(model, tally)| {
            let mut tests: Vec<WorstTest> = tally
                .iter()
                .map(|(test_id, scores)| WorstTest {
                    test_id: test_id.to_string(),
                    avg_score: mean(scores),
                    runs: scores.len(),
                })
                .collect();
            tests.sort_by(|a, b| a.avg_score.total_cmp(&b.avg_score));
            tests.truncate(WORST_TESTS_PER_MODEL);
            ModelWorstTests {
                model: model.to_string(),
                tests,
            }
        })
        .collect();

    FailureModeReport {
        per_model,
        per_category,
        per_test,
        systematic_failures,
        sporadic_failures,
        top_failure_tags,
        worst_tests,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{result, tagged};
    use modelab_common::types::tags;

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(classify_frequency(0.3), Some(FailurePattern::Systematic));
        assert_eq!(classify_frequency(1.0), Some(FailurePattern::Systematic));
        assert_eq!(classify_frequency(0.29999), None);
        assert_eq!(classify_frequency(0.1), None);
        assert_eq!(classify_frequency(0.2), None);
        assert_eq!(classify_frequency(0.05), Some(FailurePattern::Sporadic));
        assert_eq!(classify_frequency(0.0), None);
    }

    #[test]
    fn test_systematic_at_exact_threshold() {
        // 3 of 10 runs carry the tag: frequency is exactly 0.3
        let mut results = Vec::new();
        for i in 0..10 {
            let id = format!("r-{}", i);
            if i < 3 {
                results.push(tagged("m", Category::Reasoning, &id, 0.0, &[tags::EXACT_MATCH_FAILED]));
            } else {
                results.push(result("m", Category::Reasoning, &id, 1.0));
            }
        }

        let report = analyze_failure_modes(&results);

        assert_eq!(report.systematic_failures.len(), 1);
        let systematic = &report.systematic_failures[0];
        assert_eq!(systematic.tag, tags::EXACT_MATCH_FAILED);
        assert_eq!(systematic.count, 3);
        assert_eq!(systematic.total_runs, 10);
        assert!(report.sporadic_failures.is_empty());
    }

    #[test]
    fn test_sporadic_failures() {
        // 1 of 20 runs: frequency 0.05
        let mut results = vec![tagged("m", Category::Code, "c-0", 0.5, &[tags::PARTIAL_TEST_PASS])];
        for i in 1..20 {
            results.push(result("m", Category::Code, &format!("c-{}", i), 1.0));
        }

        let report = analyze_failure_modes(&results);

        assert!(report.systematic_failures.is_empty());
        assert_eq!(report.sporadic_failures.len(), 1);
        assert_eq!(report.sporadic_failures[0].pattern, FailurePattern::Sporadic);
        assert!((report.sporadic_failures[0].frequency - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_per_model_failure_rate_and_tags() {
        let results = vec![
            tagged("m", Category::Reasoning, "t1", 0.0, &[tags::NUMERIC_MISMATCH]),
            tagged("m", Category::Reasoning, "t2", 0.5, &[tags::NUMERIC_MISMATCH]),
            result("m", Category::Reasoning, "t3", 1.0),
            result("m", Category::Reasoning, "t4", 1.0),
        ];

        let report = analyze_failure_modes(&results);

        assert_eq!(report.per_model.len(), 1);
        let model = &report.per_model[0];
        assert_eq!(model.total_runs, 4);
        assert_eq!(model.total_failures, 2);
        assert_eq!(model.failure_rate, 0.5);
        assert_eq!(model.failure_tags.len(), 1);
        assert_eq!(model.failure_tags[0].count, 2);
        assert_eq!(model.failure_tags[0].frequency, 0.5);
        assert_eq!(model.failure_tags[0].avg_score_when_present, 0.25);

        assert_eq!(report.per_category[0].category, Category::Reasoning);
        assert_eq!(report.per_test.len(), 2);
    }

    #[test]
    fn test_top_tags_limited_and_ordered() {
        let names = ["a", "b", "c", "d", "e", "f"];
        let mut results = Vec::new();
        // "f" appears three times, everything else once
        for name in names {
            results.push(tagged("m", Category::Emotion, name, 0.0, &[name]));
        }
        results.push(tagged("m", Category::Emotion, "x", 0.0, &["f"]));
        results.push(tagged("m", Category::Emotion, "y", 0.0, &["f"]));

        let report = analyze_failure_modes(&results);

        let top = &report.top_failure_tags[0].tags;
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].tag, "f");
        assert_eq!(top[0].count, 3);
        let rest: Vec<&str> = top[1..].iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(rest, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_worst_tests_ties_keep_first_seen_order() {
        let mut results = Vec::new();
        for test_id in ["t1", "t2", "t3", "t4", "t5", "t6"] {
            results.push(result("m", Category::Reasoning, test_id, 0.5));
        }
        results.push(result("m", Category::Reasoning, "t7", 0.1));

        let report = analyze_failure_modes(&results);

        let worst: Vec<&str> = report.worst_tests[0]
            .tests
            .iter()
            .map(|t| t.test_id.as_str())
            .collect();
        assert_eq!(worst, vec!["t7", "t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn test_duplicate_tags_counted_once_per_run() {
        let results = vec![tagged(
            "m",
            Category::Code,
            "c1",
            0.0,
            &[tags::RUNTIME_ERROR, tags::RUNTIME_ERROR],
        )];

        let report = analyze_failure_modes(&results);

        assert_eq!(report.per_model[0].failure_tags[0].count, 1);
        assert_eq!(report.per_model[0].failure_tags[0].frequency, 1.0);
    }
}
