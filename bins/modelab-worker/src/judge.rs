//! Judge Adapter - rubric-augmented grading by a second model
//!
//! Builds the grading prompt, hands it to the model collaborator with the
//! judge sampling settings, and reads a score in [0, 1] back out of the reply.
//!
//! **Degradation:**
//! - No number in the reply: keyword fallback ("correct"/"perfect" → 1.0,
//!   "partial" → 0.5, anything else → 0.0)
//! - Collaborator failure (transport error, timeout): neutral 0.5

use modelab_common::error::{ScoreError, ScoreResult};
use modelab_common::types::{JudgeVerdict, TestCase};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::{ModelInvoker, SamplingConfig};

/// Score awarded when the judge itself cannot be reached.
pub const UNAVAILABLE_SCORE: f64 = 0.5;

static VERDICT_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"0?\.\d+|1\.0|\d+\.\d+").expect("verdict pattern compiles"));

/// Judge model and sampling, shared read-only by every evaluation.
#[derive(Debug, Clone)]
pub struct JudgeSettings {
    pub model: String,
    pub sampling: SamplingConfig,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeOutcome {
    pub score: f64,
    pub verdict: JudgeVerdict,
    pub judge_output: Option<String>,
    /// Set when the collaborator call failed.
    pub error: Option<ScoreError>,
}

fn pretty_or_empty(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "{}".to_string(),
        Some(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
    }
}

pub fn build_judge_prompt(test_case: &TestCase, model_output: &str, criteria: &str) -> String {
    format!(
        "You are evaluating a model's response to a test case.\n\
         \n\
         Test Category: {category}\n\
         Test Prompt: {prompt}\n\
         Expected Behavior: {expected}\n\
         Rubric: {rubric}\n\
         \n\
         Model's Response:\n\
         {output}\n\
         \n\
         Evaluation Criteria:\n\
         {criteria}\n\
         \n\
         Please provide a score from 0.0 to 1.0, where:\n\
         - 1.0 = Perfect response\n\
         - 0.5 = Partially correct or acceptable\n\
         - 0.0 = Incorrect or inappropriate response\n\
         \n\
         Respond with ONLY a number between 0.0 and 1.0, nothing else.",
        category = test_case.category,
        prompt = test_case.prompt,
        expected = pretty_or_empty(Some(&test_case.expected)),
        rubric = pretty_or_empty(test_case.rubric.as_ref()),
        output = model_output,
        criteria = criteria,
    )
}

/// Read a score out of a judge reply.
///
/// The first decimal fraction (or "1.0") wins and is clamped to [0, 1].
/// Without one, keywords decide; a reply with neither is `JudgeUnparseable`.
pub fn parse_verdict(reply: &str) -> ScoreResult<(f64, JudgeVerdict)> {
    if let Some(m) = VERDICT_NUMBER.find(reply) {
        if let Ok(value) = m.as_str().parse::<f64>() {
            return Ok((value.clamp(0.0, 1.0), JudgeVerdict::Numeric));
        }
    }

    let lower = reply.to_lowercase();
    if lower.contains("correct") || lower.contains("perfect") || reply.contains("1.0") {
        Ok((1.0, JudgeVerdict::Keyword))
    } else if lower.contains("partial") || reply.contains("0.5") {
        Ok((0.5, JudgeVerdict::Keyword))
    } else {
        Err(ScoreError::JudgeUnparseable)
    }
}

/// Grade one output. Never fails; see module docs for the degradation rules.
#[tracing::instrument(skip_all, fields(test_id = %test_case.id, judge = %settings.model))]
pub async fn judge(
    invoker: &dyn ModelInvoker,
    settings: &JudgeSettings,
    test_case: &TestCase,
    model_output: &str,
    criteria: &str,
) -> JudgeOutcome {
    let prompt = build_judge_prompt(test_case, model_output, criteria);
    let invocation = invoker
        .invoke(&prompt, &settings.model, &settings.sampling, settings.timeout)
        .await;

    if let Some(error) = invocation.error {
        warn!(error = %error, "Judge unavailable, using neutral score");
        return JudgeOutcome {
            score: UNAVAILABLE_SCORE,
            verdict: JudgeVerdict::Unavailable,
            judge_output: None,
            error: Some(ScoreError::JudgeUnavailable(error)),
        };
    }

    let (score, verdict) = match parse_verdict(&invocation.output) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(reason = %e, "Judge reply had no signal");
            (0.0, JudgeVerdict::Keyword)
        }
    };

    debug!(score, verdict = ?verdict, latency_ms = invocation.latency_ms, "Judge verdict");

    JudgeOutcome {
        score,
        verdict,
        judge_output: Some(invocation.output),
        error: None,
    }
}
