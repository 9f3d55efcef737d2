//! Score Evaluator - turns one (test, output) pair into a bounded score
//!
//! **Core Responsibility:**
//! Dispatch on the test's eval method, run the matching strategy, and return
//! a uniform envelope: score detail, final score in [0, 1], failure tags.
//!
//! **Critical Properties:**
//! - Never fails outward: every `ScoreError` is folded into the envelope
//! - Knows nothing about how harnesses run or how models are reached; both
//!   arrive through `EvaluatorContext`
//!
//! **Strategies:**
//! - exact_match: normalized (default) or raw comparison, 1.0 / 0.0
//! - numeric_tolerance: first number in the output against the expected
//!   value; partial credit `max(0, 1 - |diff| / max(|expected|, 1))` outside
//!   the tolerance
//! - contains: every required term present AND no forbidden term present,
//!   case-insensitive substring test
//! - llm_judge: delegated to the judge adapter
//! - python_exec: extract, synthesize, execute, parse

use modelab_common::error::{ScoreError, ScoreResult};
use modelab_common::types::{
    tags, CodeSpec, ContainsParams, EvalMethod, ExactMatchParams, LlmJudgeParams,
    NumericToleranceParams, PythonExecParams, ScoreDetail, TestCase,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::HarnessRunner;
use crate::harness;
use crate::judge::{self, JudgeSettings};
use crate::model::ModelInvoker;

static FIRST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+\.?\d*").expect("number pattern compiles"));

/// Shared, read-only collaborators for scoring.
pub struct EvaluatorContext<'a> {
    pub invoker: &'a dyn ModelInvoker,
    pub judge: &'a JudgeSettings,
    pub sandbox: &'a dyn HarnessRunner,
    /// Used when a python_exec test sets no `timeout_seconds`
    pub default_code_timeout: Duration,
}

/// Result envelope of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub score_detail: ScoreDetail,
    pub final_score: f64,
    pub failure_tags: Vec<String>,
}

/// Strategy output before clamping and tag de-duplication.
struct Scored {
    detail: ScoreDetail,
    tags: Vec<&'static str>,
}

/// Canonical form for text comparison.
///
/// Lowercases, drops every character that is not alphanumeric, `_` or
/// whitespace, then collapses whitespace runs to single spaces and trims.
/// Idempotent.
pub fn normalize_text(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn expected_text(expected: &Value) -> ScoreResult<String> {
    match expected {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Err(ScoreError::MalformedExpected(
            "exact_match requires an expected value".to_string(),
        )),
        other => Ok(other.to_string()),
    }
}

fn expected_number(expected: &Value) -> ScoreResult<f64> {
    let parsed = match expected {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).ok_or_else(|| {
        ScoreError::MalformedExpected(format!("expected value {} is not numeric", expected))
    })
}

pub fn score_exact_match(output: &str, expected: &str, params: &ExactMatchParams) -> f64 {
    let matched = if params.normalize {
        normalize_text(output) == normalize_text(expected)
    } else if params.case_sensitive {
        output.trim() == expected.trim()
    } else {
        output.trim().to_lowercase() == expected.trim().to_lowercase()
    };
    if matched {
        1.0
    } else {
        0.0
    }
}

/// First signed decimal number appearing in the text.
pub fn extract_number(output: &str) -> Option<f64> {
    FIRST_NUMBER
        .find(output)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Tolerance check with partial credit. Returns the score and the extracted
/// value; no number in the output scores 0.0.
pub fn score_numeric(output: &str, expected: f64, params: &NumericToleranceParams) -> (f64, Option<f64>) {
    let Some(value) = extract_number(output) else {
        return (0.0, None);
    };

    let diff = (value - expected).abs();
    if diff <= params.tolerance {
        return (1.0, Some(value));
    }
    let scale = expected.abs().max(1.0);
    ((1.0 - diff / scale).max(0.0), Some(value))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainsCheck {
    pub score: f64,
    pub missing: Vec<String>,
    pub forbidden_found: Vec<String>,
}

pub fn score_contains(output: &str, params: &ContainsParams) -> ContainsCheck {
    let haystack = output.to_lowercase();

    let missing: Vec<String> = params
        .required_terms
        .iter()
        .filter(|term| !haystack.contains(&term.to_lowercase()))
        .cloned()
        .collect();
    let forbidden_found: Vec<String> = params
        .forbidden_terms
        .iter()
        .filter(|term| haystack.contains(&term.to_lowercase()))
        .cloned()
        .collect();

    let score = if missing.is_empty() && forbidden_found.is_empty() {
        1.0
    } else {
        0.0
    };

    ContainsCheck {
        score,
        missing,
        forbidden_found,
    }
}

fn exact_match(test_case: &TestCase, output: &str, params: &ExactMatchParams) -> ScoreResult<Scored> {
    let expected = expected_text(&test_case.expected)?;
    let score = score_exact_match(output, &expected, params);

    let mut tags = Vec::new();
    if score < 1.0 {
        tags.push(tags::EXACT_MATCH_FAILED);
    }
    Ok(Scored {
        detail: ScoreDetail::new("exact_match", score),
        tags,
    })
}

fn numeric_tolerance(
    test_case: &TestCase,
    output: &str,
    params: &NumericToleranceParams,
) -> ScoreResult<Scored> {
    let expected = expected_number(&test_case.expected)?;
    let (score, extracted) = score_numeric(output, expected, params);

    let mut detail = ScoreDetail::new("numeric_tolerance", score);
    detail.extracted_value = extracted;
    if extracted.is_none() {
        detail.error = Some("no number found in output".to_string());
    }

    let mut tags = Vec::new();
    if score < 1.0 {
        tags.push(tags::NUMERIC_MISMATCH);
    }
    Ok(Scored { detail, tags })
}

fn contains(output: &str, params: &ContainsParams) -> Scored {
    let check = score_contains(output, params);

    let mut detail = ScoreDetail::new("contains", check.score);
    detail.missing_terms = check.missing;
    detail.forbidden_terms_found = check.forbidden_found;

    let mut tags = Vec::new();
    if check.score < 1.0 {
        tags.push(tags::MISSING_REQUIRED_TERMS);
    }
    Scored { detail, tags }
}

async fn llm_judge(
    test_case: &TestCase,
    output: &str,
    params: &LlmJudgeParams,
    ctx: &EvaluatorContext<'_>,
) -> Scored {
    let outcome = judge::judge(ctx.invoker, ctx.judge, test_case, output, &params.judge_prompt).await;
    let score = outcome.score.clamp(0.0, 1.0);

    let mut detail = ScoreDetail::new("llm_judge", score);
    detail.judge_verdict = Some(outcome.verdict);
    detail.judge_output = outcome.judge_output;
    detail.error = outcome.error.map(|e| e.to_string());

    let mut tags = Vec::new();
    if score < 0.5 {
        tags.push(tags::LOW_JUDGE_SCORE);
    }
    if score < 1.0 {
        tags.push(tags::IMPERFECT_RESPONSE);
    }
    Scored { detail, tags }
}

fn code_tags(score: f64) -> Vec<&'static str> {
    if score == 0.0 {
        vec![
            tags::CODE_EXECUTION_FAILED,
            tags::SYNTAX_ERROR,
            tags::RUNTIME_ERROR,
        ]
    } else if score < 1.0 {
        vec![tags::PARTIAL_TEST_PASS]
    } else {
        Vec::new()
    }
}

async fn python_exec(
    test_case: &TestCase,
    output: &str,
    params: &PythonExecParams,
    ctx: &EvaluatorContext<'_>,
) -> ScoreResult<Scored> {
    let spec = CodeSpec::from_expected(&test_case.expected)?;

    let code = harness::extract_code(output);
    if code.is_empty() {
        let mut detail = ScoreDetail::new("python_exec", 0.0);
        detail.error = Some("no code found in output".to_string());
        return Ok(Scored {
            detail,
            tags: code_tags(0.0),
        });
    }

    let source = harness::synthesize(&code, &spec);
    let timeout = params
        .timeout_seconds
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(ctx.default_code_timeout);

    let execution = ctx
        .sandbox
        .run(&source, timeout)
        .await
        .map_err(|e| ScoreError::SandboxUnavailable(format!("{:#}", e)))?;

    let scored = harness::score_execution(&execution, timeout.as_millis() as u64);
    if let Some(error) = &scored.error {
        debug!(error = %error, "Harness did not complete cleanly");
    }

    let mut detail = ScoreDetail::new("python_exec", scored.score);
    detail.tests_passed = scored.passed;
    detail.tests_total = scored.total;
    detail.exit_code = execution.exit_code;
    detail.timed_out = execution.timed_out;
    detail.execution_ms = Some(execution.execution_time_ms);
    detail.error = scored.error.map(|e| e.to_string());

    Ok(Scored {
        tags: code_tags(scored.score),
        detail,
    })
}

async fn score(
    method: &EvalMethod,
    test_case: &TestCase,
    output: &str,
    ctx: &EvaluatorContext<'_>,
) -> ScoreResult<Scored> {
    match method {
        EvalMethod::ExactMatch(params) => exact_match(test_case, output, params),
        EvalMethod::NumericTolerance(params) => numeric_tolerance(test_case, output, params),
        EvalMethod::Contains(params) => Ok(contains(output, params)),
        EvalMethod::LlmJudge(params) => Ok(llm_judge(test_case, output, params, ctx).await),
        EvalMethod::PythonExec(params) => python_exec(test_case, output, params, ctx).await,
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn dedup_tags<I: IntoIterator<Item = String>>(tags: I) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in tags {
        if !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}

fn failed_outcome(method: &str, error: &ScoreError) -> ScoreOutcome {
    let mut detail = ScoreDetail::new(method, 0.0);
    detail.error = Some(error.to_string());

    let failure_tags = match error {
        ScoreError::UnknownMethod(_) => vec![tags::UNKNOWN_EVAL_METHOD.to_string()],
        other => vec![tags::EVALUATION_ERROR.to_string(), other.sub_tag()],
    };

    ScoreOutcome {
        score_detail: detail,
        final_score: 0.0,
        failure_tags,
    }
}

/// Evaluate one model output against its test case.
///
/// Unknown methods score 0.0 with `unknown_eval_method`. Any other scoring
/// failure scores 0.0 with `evaluation_error` plus `error_<kind>`, and the
/// message lands in `score_detail.error`.
#[tracing::instrument(skip_all, fields(test_id = %test_case.id, method = %test_case.eval.method))]
pub async fn evaluate(
    test_case: &TestCase,
    model_output: &str,
    ctx: &EvaluatorContext<'_>,
) -> ScoreOutcome {
    let method = match EvalMethod::from_spec(&test_case.eval) {
        Ok(method) => method,
        Err(e) => {
            warn!(error = %e, "Cannot resolve eval method");
            return failed_outcome(&test_case.eval.method, &e);
        }
    };

    match score(&method, test_case, model_output, ctx).await {
        Ok(Scored { mut detail, tags }) => {
            let final_score = clamp_score(detail.raw_score);
            detail.raw_score = final_score;
            let failure_tags = dedup_tags(tags.into_iter().map(String::from));

            debug!(score = final_score, tags = ?failure_tags, "Evaluated");

            ScoreOutcome {
                score_detail: detail,
                final_score,
                failure_tags,
            }
        }
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "Evaluation failed");
            failed_outcome(method.name(), &e)
        }
    }
}
