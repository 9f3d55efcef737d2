//! Per-model category profiles and cross-category correlation.

use modelab_common::types::{Category, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::stats::{mean, pearson};

pub const STRENGTH_THRESHOLD: f64 = 0.7;
pub const WEAKNESS_THRESHOLD: f64 = 0.5;
const MAX_LISTED: usize = 2;

/// Qualitative magnitude of a correlation. Sign is not part of the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    #[serde(rename = "no relationship")]
    None,
    #[serde(rename = "weak relationship")]
    Weak,
    #[serde(rename = "moderate relationship")]
    Moderate,
    #[serde(rename = "strong relationship")]
    Strong,
    #[serde(rename = "very strong relationship")]
    VeryStrong,
}

impl Relationship {
    pub fn from_coefficient(r: f64) -> Self {
        let magnitude = r.abs();
        if magnitude < 0.1 {
            Relationship::None
        } else if magnitude < 0.3 {
            Relationship::Weak
        } else if magnitude < 0.5 {
            Relationship::Moderate
        } else if magnitude < 0.7 {
            Relationship::Strong
        } else {
            Relationship::VeryStrong
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Relationship::None => "no relationship",
            Relationship::Weak => "weak relationship",
            Relationship::Moderate => "moderate relationship",
            Relationship::Strong => "strong relationship",
            Relationship::VeryStrong => "very strong relationship",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTradeoffs {
    pub model: String,
    pub category_means: BTreeMap<Category, f64>,
    /// Up to two best categories scoring above 0.7, best first.
    pub strengths: Vec<Category>,
    /// Up to two worst categories scoring below 0.5, worst first.
    pub weaknesses: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCorrelation {
    pub key: String,
    pub category_a: Category,
    pub category_b: Category,
    pub correlation: f64,
    pub model_count: usize,
    pub interpretation: Relationship,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeoffReport {
    pub per_model: Vec<ModelTradeoffs>,
    pub correlations: Vec<CategoryCorrelation>,
}

impl TradeoffReport {
    pub fn correlation(&self, a: Category, b: Category) -> Option<&CategoryCorrelation> {
        self.correlations.iter().find(|c| {
            (c.category_a == a && c.category_b == b) || (c.category_a == b && c.category_b == a)
        })
    }
}

fn strengths_and_weaknesses(means: &BTreeMap<Category, f64>) -> (Vec<Category>, Vec<Category>) {
    let mut ranked: Vec<(Category, f64)> = means.iter().map(|(c, m)| (*c, *m)).collect();

    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let strengths = ranked
        .iter()
        .take(MAX_LISTED)
        .filter(|(_, m)| *m > STRENGTH_THRESHOLD)
        .map(|(c, _)| *c)
        .collect();

    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    let weaknesses = ranked
        .iter()
        .take(MAX_LISTED)
        .filter(|(_, m)| *m < WEAKNESS_THRESHOLD)
        .map(|(c, _)| *c)
        .collect();

    (strengths, weaknesses)
}

pub fn analyze_tradeoffs(results: &[RunResult]) -> TradeoffReport {
    let mut scores: BTreeMap<&str, BTreeMap<Category, Vec<f64>>> = BTreeMap::new();
    for result in results {
        scores
            .entry(result.model.as_str())
            .or_default()
            .entry(result.category)
            .or_default()
            .push(result.final_score);
    }

    let means: BTreeMap<&str, BTreeMap<Category, f64>> = scores
        .into_iter()
        .map(|(model, per_category)| {
            let category_means = per_category
                .into_iter()
                .map(|(category, values)| (category, mean(&values)))
                .collect();
            (model, category_means)
        })
        .collect();

    let per_model = means
        .iter()
        .map(|(model, category_means)| {
            let (strengths, weaknesses) = strengths_and_weaknesses(category_means);
            ModelTradeoffs {
                model: model.to_string(),
                category_means: category_means.clone(),
                strengths,
                weaknesses,
            }
        })
        .collect();

    let mut correlations = Vec::new();
    for (i, a) in Category::ALL.iter().enumerate() {
        for b in &Category::ALL[i + 1..] {
            let (xs, ys): (Vec<f64>, Vec<f64>) = means
                .values()
                .filter_map(|m| Some((*m.get(a)?, *m.get(b)?)))
                .unzip();
            if xs.len() < 2 {
                continue;
            }
            let r = pearson(&xs, &ys);
            correlations.push(CategoryCorrelation {
                key: format!("{}_vs_{}", a, b),
                category_a: *a,
                category_b: *b,
                correlation: r,
                model_count: xs.len(),
                interpretation: Relationship::from_coefficient(r),
            });
        }
    }

    TradeoffReport {
        per_model,
        correlations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::result;

    #[test]
    fn test_relationship_bands() {
        assert_eq!(Relationship::from_coefficient(0.05), Relationship::None);
        assert_eq!(Relationship::from_coefficient(-0.2), Relationship::Weak);
        assert_eq!(Relationship::from_coefficient(0.3), Relationship::Moderate);
        assert_eq!(Relationship::from_coefficient(-0.6), Relationship::Strong);
        assert_eq!(Relationship::from_coefficient(0.7), Relationship::VeryStrong);
        assert_eq!(Relationship::VeryStrong.label(), "very strong relationship");
        assert_eq!(
            serde_json::to_value(Relationship::Weak).unwrap(),
            serde_json::json!("weak relationship")
        );
    }

    #[test]
    fn test_cross_model_correlation() {
        let reasoning = [0.9, 0.5, 0.2];
        let hallucination = [0.8, 0.6, 0.1];
        let mut results = Vec::new();
        for (idx, (a, b)) in reasoning.iter().zip(hallucination.iter()).enumerate() {
            let model = format!("model-{}", idx);
            results.push(result(&model, Category::Reasoning, "r1", *a));
            results.push(result(&model, Category::Hallucination, "h1", *b));
        }

        let report = analyze_tradeoffs(&results);

        assert_eq!(report.correlations.len(), 1);
        let corr = report
            .correlation(Category::Hallucination, Category::Reasoning)
            .unwrap();
        assert_eq!(corr.key, "reasoning_vs_hallucination");
        assert_eq!(corr.model_count, 3);
        assert!(corr.correlation > 0.95);
        assert_eq!(corr.interpretation, Relationship::VeryStrong);
    }

    #[test]
    fn test_identical_category_profiles_are_uncorrelated() {
        let mut results = Vec::new();
        for idx in 0..3 {
            let model = format!("model-{}", idx);
            results.push(result(&model, Category::Reasoning, "r1", 0.7));
            results.push(result(&model, Category::Code, "c1", 0.2));
            results.push(result(&model, Category::Emotion, "e1", 0.1));
        }

        let report = analyze_tradeoffs(&results);

        assert_eq!(report.correlations.len(), 3);
        for corr in &report.correlations {
            assert_eq!(corr.correlation, 0.0, "{}", corr.key);
            assert_eq!(corr.interpretation, Relationship::None);
        }
    }

    #[test]
    fn test_correlation_needs_two_models() {
        let results = vec![
            result("solo", Category::Reasoning, "r1", 0.9),
            result("solo", Category::Code, "c1", 0.2),
        ];

        let report = analyze_tradeoffs(&results);

        assert!(report.correlations.is_empty());
        assert_eq!(report.per_model.len(), 1);
    }

    #[test]
    fn test_strengths_and_weaknesses() {
        let results = vec![
            result("m", Category::Reasoning, "r1", 0.95),
            result("m", Category::Hallucination, "h1", 0.8),
            result("m", Category::Emotion, "e1", 0.75),
            result("m", Category::Code, "c1", 0.1),
        ];

        let report = analyze_tradeoffs(&results);

        let profile = &report.per_model[0];
        assert_eq!(
            profile.strengths,
            vec![Category::Reasoning, Category::Hallucination]
        );
        assert_eq!(profile.weaknesses, vec![Category::Code]);
        assert_eq!(profile.category_means[&Category::Code], 0.1);
    }

    #[test]
    fn test_middling_scores_are_neither() {
        let results = vec![
            result("m", Category::Reasoning, "r1", 0.6),
            result("m", Category::Code, "c1", 0.55),
        ];

        let report = analyze_tradeoffs(&results);

        assert!(report.per_model[0].strengths.is_empty());
        assert!(report.per_model[0].weaknesses.is_empty());
    }
}
