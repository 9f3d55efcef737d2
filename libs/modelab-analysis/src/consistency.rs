//! Consistency across repeats and paraphrase variants.
//!
//! A group needs at least two samples to carry signal; smaller groups are
//! skipped without being reported.

use modelab_common::types::{Category, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::stats::{consistency_score, mean, std_dev};

/// Averaged consistency of every repeated test in a (model, category) cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConsistency {
    pub model: String,
    pub category: Category,
    pub test_count: usize,
    pub avg_std: f64,
    pub avg_consistency: f64,
}

/// Spread of scores inside one (model, variant_group) paraphrase set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantGroupConsistency {
    pub model: String,
    pub variant_group: String,
    pub mean_score: f64,
    pub std_score: f64,
    pub consistency_score: f64,
    pub sample_count: usize,
}

/// Spread of every score a model produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConsistency {
    pub model: String,
    pub std_score: f64,
    pub consistency_score: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub per_model_category: Vec<CategoryConsistency>,
    pub per_variant_group: Vec<VariantGroupConsistency>,
    pub overall_consistency: Vec<ModelConsistency>,
}

pub fn analyze_consistency(results: &[RunResult]) -> ConsistencyReport {
    // Accumulate raw score lists
    let mut per_test: BTreeMap<(&str, Category, &str), Vec<f64>> = BTreeMap::new();
    let mut per_group: BTreeMap<(&str, &str), Vec<f64>> = BTreeMap::new();
    let mut per_model: BTreeMap<&str, Vec<f64>> = BTreeMap::new();

    for result in results {
        per_test
            .entry((result.model.as_str(), result.category, result.test_id.as_str()))
            .or_default()
            .push(result.final_score);

        if let Some(group) = result.variant_group.as_deref().filter(|g| !g.is_empty()) {
            per_group
                .entry((result.model.as_str(), group))
                .or_default()
                .push(result.final_score);
        }

        per_model
            .entry(result.model.as_str())
            .or_default()
            .push(result.final_score);
    }

    // Per test spreads rolled up to (model, category)
    let mut cohort_spreads: BTreeMap<(&str, Category), Vec<f64>> = BTreeMap::new();
    for ((model, category, _test_id), scores) in &per_test {
        if scores.len() < 2 {
            continue;
        }
        cohort_spreads
            .entry((*model, *category))
            .or_default()
            .push(std_dev(scores));
    }

    let per_model_category = cohort_spreads
        .into_iter()
        .map(|((model, category), spreads)| {
            let consistencies: Vec<f64> = spreads.iter().map(|s| consistency_score(*s)).collect();
            CategoryConsistency {
                model: model.to_string(),
                category,
                test_count: spreads.len(),
                avg_std: mean(&spreads),
                avg_consistency: mean(&consistencies),
            }
        })
        .collect();

    let per_variant_group = per_group
        .into_iter()
        .filter(|(_, scores)| scores.len() >= 2)
        .map(|((model, group), scores)| {
            let spread = std_dev(&scores);
            VariantGroupConsistency {
                model: model.to_string(),
                variant_group: group.to_string(),
                mean_score: mean(&scores),
                std_score: spread,
                consistency_score: consistency_score(spread),
                sample_count: scores.len(),
            }
        })
        .collect();

    let overall_consistency = per_model
        .into_iter()
        .filter(|(_, scores)| scores.len() >= 2)
        .map(|(model, scores)| {
            let spread = std_dev(&scores);
            ModelConsistency {
                model: model.to_string(),
                std_score: spread,
                consistency_score: consistency_score(spread),
                sample_count: scores.len(),
            }
        })
        .collect();

    ConsistencyReport {
        per_model_category,
        per_variant_group,
        overall_consistency,
    }
}
