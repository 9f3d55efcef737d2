use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ScoreError;

/// Behavioral axis a test case probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Reasoning,
    Hallucination,
    Emotion,
    Code,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Reasoning,
        Category::Hallucination,
        Category::Emotion,
        Category::Code,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Reasoning => "reasoning",
            Category::Hallucination => "hallucination",
            Category::Emotion => "emotion",
            Category::Code => "code",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy attached to imperfect runs.
pub mod tags {
    pub const EXACT_MATCH_FAILED: &str = "exact_match_failed";
    pub const NUMERIC_MISMATCH: &str = "numeric_mismatch";
    pub const MISSING_REQUIRED_TERMS: &str = "missing_required_terms";
    pub const LOW_JUDGE_SCORE: &str = "low_judge_score";
    pub const IMPERFECT_RESPONSE: &str = "imperfect_response";
    pub const CODE_EXECUTION_FAILED: &str = "code_execution_failed";
    pub const SYNTAX_ERROR: &str = "syntax_error";
    pub const RUNTIME_ERROR: &str = "runtime_error";
    pub const PARTIAL_TEST_PASS: &str = "partial_test_pass";
    pub const UNKNOWN_EVAL_METHOD: &str = "unknown_eval_method";
    pub const EVALUATION_ERROR: &str = "evaluation_error";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_variant_group: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A single declarative test, loaded once per run and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub category: Category,
    pub prompt: String,
    #[serde(default)]
    pub expected: Value,
    pub eval: EvalSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_group: Option<String>,
    #[serde(default)]
    pub meta: TestMeta,
}

impl TestCase {
    /// Paraphrase group, read from the top level or from `meta.prompt_variant_group`.
    pub fn variant_group(&self) -> Option<&str> {
        self.variant_group
            .as_deref()
            .or(self.meta.prompt_variant_group.as_deref())
            .filter(|g| !g.is_empty())
    }
}

/// Raw evaluation block as written in a suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSpec {
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_tolerance() -> f64 {
    0.01
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactMatchParams {
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericToleranceParams {
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainsParams {
    #[serde(default)]
    pub required_terms: Vec<String>,
    #[serde(default)]
    pub forbidden_terms: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmJudgeParams {
    #[serde(default)]
    pub judge_prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PythonExecParams {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Closed set of scoring strategies with their typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalMethod {
    ExactMatch(ExactMatchParams),
    NumericTolerance(NumericToleranceParams),
    Contains(ContainsParams),
    LlmJudge(LlmJudgeParams),
    PythonExec(PythonExecParams),
}

impl EvalMethod {
    pub const NAMES: [&'static str; 5] = [
        "exact_match",
        "numeric_tolerance",
        "contains",
        "llm_judge",
        "python_exec",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EvalMethod::ExactMatch(_) => "exact_match",
            EvalMethod::NumericTolerance(_) => "numeric_tolerance",
            EvalMethod::Contains(_) => "contains",
            EvalMethod::LlmJudge(_) => "llm_judge",
            EvalMethod::PythonExec(_) => "python_exec",
        }
    }

    /// Resolve a suite-file eval block into a typed strategy.
    pub fn from_spec(spec: &EvalSpec) -> Result<Self, ScoreError> {
        let params = Value::Object(spec.params.clone());
        let method = match spec.method.as_str() {
            "exact_match" => EvalMethod::ExactMatch(parse_params(&spec.method, params)?),
            "numeric_tolerance" => {
                EvalMethod::NumericTolerance(parse_params(&spec.method, params)?)
            }
            "contains" => EvalMethod::Contains(parse_params(&spec.method, params)?),
            "llm_judge" => EvalMethod::LlmJudge(parse_params(&spec.method, params)?),
            "python_exec" => EvalMethod::PythonExec(parse_params(&spec.method, params)?),
            other => return Err(ScoreError::UnknownMethod(other.to_string())),
        };
        Ok(method)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T, ScoreError> {
    serde_json::from_value(params).map_err(|e| {
        ScoreError::MalformedExpected(format!("invalid params for {}: {}", method, e))
    })
}

/// How one test vector feeds the entrypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum CallInput {
    /// The whole value is passed as the single positional argument.
    Positional(Value),
    /// `{"args": [...], "kwargs": {...}}` expanded into the call.
    Expanded {
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
}

impl From<Value> for CallInput {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.contains_key("args") || map.contains_key("kwargs") => {
                let args = match map.remove("args") {
                    Some(Value::Array(items)) => items,
                    Some(Value::Null) | None => Vec::new(),
                    Some(single) => vec![single],
                };
                let kwargs = match map.remove("kwargs") {
                    Some(Value::Object(kw)) => kw,
                    _ => Map::new(),
                };
                CallInput::Expanded { args, kwargs }
            }
            other => CallInput::Positional(other),
        }
    }
}

impl From<CallInput> for Value {
    fn from(input: CallInput) -> Self {
        match input {
            CallInput::Positional(value) => value,
            CallInput::Expanded { args, kwargs } => {
                let mut map = Map::new();
                map.insert("args".to_string(), Value::Array(args));
                map.insert("kwargs".to_string(), Value::Object(kwargs));
                Value::Object(map)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVector {
    pub input: CallInput,
    #[serde(default)]
    pub output: Value,
}

/// `expected` block of a code-execution test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSpec {
    pub entrypoint: String,
    pub tests: Vec<TestVector>,
}

impl CodeSpec {
    /// Parse and validate the structured `expected` value of a python_exec test.
    pub fn from_expected(expected: &Value) -> Result<Self, ScoreError> {
        let spec: CodeSpec = serde_json::from_value(expected.clone())
            .map_err(|e| ScoreError::MalformedExpected(format!("code spec: {}", e)))?;

        if !is_identifier(&spec.entrypoint) {
            return Err(ScoreError::MalformedExpected(format!(
                "entrypoint '{}' is not a valid identifier",
                spec.entrypoint
            )));
        }
        if spec.tests.is_empty() {
            return Err(ScoreError::MalformedExpected(
                "code spec has no test vectors".to_string(),
            ));
        }
        Ok(spec)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Where a judge score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeVerdict {
    Numeric,
    Keyword,
    Unavailable,
}

/// Method-specific scoring diagnostics. `method` and `raw_score` are always present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDetail {
    pub method: String,
    pub raw_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_terms_found: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_verdict: Option<JudgeVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_total: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<u64>,
}

impl ScoreDetail {
    pub fn new(method: impl Into<String>, raw_score: f64) -> Self {
        Self {
            method: method.into(),
            raw_score,
            ..Default::default()
        }
    }
}

/// One scored (model, test, repeat) observation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub git_commit: Option<String>,
    pub model: String,
    pub test_id: String,
    pub category: Category,
    #[serde(default)]
    pub variant_group: Option<String>,
    pub repeat_idx: u32,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub raw_output: String,
    pub score_detail: ScoreDetail,
    pub final_score: f64,
    #[serde(default)]
    pub failure_tags: Vec<String>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}
