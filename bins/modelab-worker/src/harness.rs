//! Test harness for generated Python code
//!
//! extract → synthesize → (engine executes) → parse → score
//!
//! Test vectors travel into the harness as one embedded JSON document, so no
//! Python literal rendering happens on this side. Each vector runs inside its
//! own try/except: one raising call counts as one failure, never as a total
//! abort. The harness ends by printing `PASSED: k/n`.

use modelab_common::error::ScoreError;
use modelab_common::types::{CallInput, CodeSpec};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::engine::RawExecution;

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+\-]*[ \t]*\n?(.*?)```").expect("fence pattern compiles")
});

static SUMMARY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"PASSED: (\d+)/(\d+)").expect("summary pattern compiles"));

const STDERR_PREVIEW_CHARS: usize = 400;

const DEFINITION_PREFIXES: [&str; 6] = ["def ", "async def ", "class ", "import ", "from ", "@"];

fn starts_definition(line: &str) -> bool {
    let trimmed = line.trim_start();
    DEFINITION_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

/// Pull candidate source code out of free-form model output.
///
/// 1. First fenced block (any language tag)
/// 2. From the first definition-like line up to the first later line that is
///    unindented and not itself a definition, comment, or blank
/// 3. The whole output
pub fn extract_code(output: &str) -> String {
    if let Some(block) = FENCED_BLOCK.captures(output).and_then(|c| c.get(1)) {
        return block.as_str().trim().to_string();
    }

    let mut code_lines: Vec<&str> = Vec::new();
    for line in output.lines() {
        if code_lines.is_empty() {
            if starts_definition(line) {
                code_lines.push(line);
            }
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        let trimmed = line.trim();
        if trimmed.is_empty() || indented || trimmed.starts_with('#') || starts_definition(line) {
            code_lines.push(line);
        } else {
            break;
        }
    }

    if !code_lines.is_empty() {
        return code_lines.join("\n").trim().to_string();
    }

    output.trim().to_string()
}

fn vector_document(spec: &CodeSpec) -> Value {
    let cases: Vec<Value> = spec
        .tests
        .iter()
        .map(|vector| match &vector.input {
            CallInput::Positional(value) => json!({
                "expanded": false,
                "input": value,
                "output": vector.output,
            }),
            CallInput::Expanded { args, kwargs } => json!({
                "expanded": true,
                "args": args,
                "kwargs": kwargs,
                "output": vector.output,
            }),
        })
        .collect();
    Value::Array(cases)
}

/// A JSON string literal is also a valid Python string literal.
fn python_str_literal(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

/// Append the test harness to extracted code.
pub fn synthesize(code: &str, spec: &CodeSpec) -> String {
    let cases = python_str_literal(&vector_document(spec).to_string());
    let entrypoint = python_str_literal(&spec.entrypoint);

    format!(
        r#"{code}


def __modelab_harness():
    import json
    cases = json.loads({cases})
    target = globals().get({entrypoint})
    results = []
    for i, case in enumerate(cases):
        try:
            if case["expanded"]:
                got = target(*case["args"], **case["kwargs"])
            else:
                got = target(case["input"])
            ok = got == case["output"]
            results.append(ok)
            if not ok:
                print(f"Test {{i}} failed: expected {{case['output']!r}}, got {{got!r}}")
        except Exception as e:
            results.append(False)
            print(f"Test {{i}} error: {{e}}")
    print(f"PASSED: {{sum(results)}}/{{len(results)}}")


__modelab_harness()
"#
    )
}

/// Last `PASSED: k/n` line in the output, if any.
///
/// The last one wins so that a summary printed by the candidate code itself
/// cannot shadow the harness.
pub fn parse_summary(stdout: &str) -> Option<(u32, u32)> {
    let caps = SUMMARY_LINE.captures_iter(stdout).last()?;
    let passed = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    Some((passed, total))
}

fn stderr_preview(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_PREVIEW_CHARS).collect()
}

/// Fractional pass rate of one harness execution.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessScore {
    pub score: f64,
    pub passed: Option<u32>,
    pub total: Option<u32>,
    pub error: Option<ScoreError>,
}

impl HarnessScore {
    fn failed(error: ScoreError) -> Self {
        Self {
            score: 0.0,
            passed: None,
            total: None,
            error: Some(error),
        }
    }
}

/// Turn a raw execution into a score.
///
/// - timeout → 0.0, partial output ignored
/// - non-zero exit → 0.0
/// - `PASSED: k/n` with n > 0 → k/n
/// - clean exit without a summary → 1.0 unless stdout mentions "error" or "failed"
pub fn score_execution(execution: &RawExecution, limit_ms: u64) -> HarnessScore {
    if execution.timed_out {
        return HarnessScore::failed(ScoreError::SandboxTimeout { limit_ms });
    }

    if execution.exit_code != Some(0) {
        return HarnessScore::failed(ScoreError::SandboxRuntimeError {
            exit_code: execution.exit_code,
            stderr_preview: stderr_preview(&execution.stderr),
        });
    }

    if let Some((passed, total)) = parse_summary(&execution.stdout) {
        if total > 0 {
            return HarnessScore {
                score: (passed as f64 / total as f64).clamp(0.0, 1.0),
                passed: Some(passed),
                total: Some(total),
                error: None,
            };
        }
    }

    let lower = execution.stdout.to_lowercase();
    if !lower.contains("error") && !lower.contains("failed") {
        HarnessScore {
            score: 1.0,
            passed: None,
            total: None,
            error: None,
        }
    } else {
        HarnessScore::failed(ScoreError::ParseFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_spec() -> CodeSpec {
        CodeSpec::from_expected(&json!({
            "entrypoint": "add",
            "tests": [
                {"input": {"args": [1, 2]}, "output": 3},
                {"input": {"args": [5, 7]}, "output": 12}
            ]
        }))
        .unwrap()
    }

    fn exited(code: i64, stdout: &str) -> RawExecution {
        RawExecution {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(code),
            timed_out: false,
            output_truncated: false,
            execution_time_ms: 12,
        }
    }

    #[test]
    fn test_extract_fenced_block() {
        let output = "Sure!\n```python\ndef add(a, b):\n    return a + b\n```\nDone.";
        assert_eq!(extract_code(output), "def add(a, b):\n    return a + b");

        let bare = "```\nx = 1\n```";
        assert_eq!(extract_code(bare), "x = 1");
    }

    #[test]
    fn test_extract_heuristic_stops_at_prose() {
        let output = "Here you go:\nimport math\n\ndef area(r):\n    # circle\n    return math.pi * r * r\nThis computes the area.";
        assert_eq!(
            extract_code(output),
            "import math\n\ndef area(r):\n    # circle\n    return math.pi * r * r"
        );
    }

    #[test]
    fn test_extract_falls_back_to_full_text() {
        assert_eq!(extract_code("  lambda x: x  \n"), "lambda x: x");
    }

    #[test]
    fn test_synthesize_embeds_code_and_vectors() {
        let script = synthesize("def add(a, b):\n    return a + b", &add_spec());

        assert!(script.starts_with("def add(a, b):\n    return a + b\n"));
        assert!(script.contains("globals().get(\"add\")"));
        assert!(script.contains(r#"\"expanded\":true"#));
        assert!(script.contains("print(f\"PASSED: {sum(results)}/{len(results)}\")"));
        assert!(script.trim_end().ends_with("__modelab_harness()"));
    }

    #[test]
    fn test_python_str_literal_escapes() {
        assert_eq!(python_str_literal("a\"b\\c\nd"), r#""a\"b\\c\nd""#);
    }

    #[test]
    fn test_parse_summary_takes_last_line() {
        assert_eq!(parse_summary("PASSED: 2/2\n"), Some((2, 2)));
        assert_eq!(
            parse_summary("PASSED: 9/9\nTest 1 failed: expected 12, got -2\nPASSED: 1/2\n"),
            Some((1, 2))
        );
        assert_eq!(parse_summary("nothing here"), None);
    }

    #[test]
    fn test_score_full_and_partial() {
        let full = score_execution(&exited(0, "PASSED: 2/2\n"), 10_000);
        assert_eq!(full.score, 1.0);
        assert_eq!((full.passed, full.total), (Some(2), Some(2)));

        let partial = score_execution(&exited(0, "Test 0 failed\nPASSED: 1/4\n"), 10_000);
        assert_eq!(partial.score, 0.25);

        let none = score_execution(&exited(0, "Test 0 failed\nTest 1 failed\nPASSED: 0/2\n"), 10_000);
        assert_eq!(none.score, 0.0);
        assert!(none.error.is_none());
    }

    #[test]
    fn test_score_non_zero_exit() {
        let mut execution = exited(1, "PASSED: 2/2\n");
        execution.stderr = "Traceback...\nSyntaxError: invalid syntax".to_string();

        let scored = score_execution(&execution, 10_000);

        assert_eq!(scored.score, 0.0);
        match scored.error {
            Some(ScoreError::SandboxRuntimeError { exit_code, stderr_preview }) => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr_preview.ends_with("SyntaxError: invalid syntax"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_score_timeout_ignores_partial_output() {
        let execution = RawExecution {
            stdout: "PASSED: 2/2\n".to_string(),
            stderr: String::new(),
            exit_code: None,
            timed_out: true,
            output_truncated: false,
            execution_time_ms: 10_001,
        };

        let scored = score_execution(&execution, 10_000);

        assert_eq!(scored.score, 0.0);
        assert_eq!(scored.error, Some(ScoreError::SandboxTimeout { limit_ms: 10_000 }));
    }

    #[test]
    fn test_score_without_summary_uses_keywords() {
        assert_eq!(score_execution(&exited(0, "all good\n"), 1).score, 1.0);

        let flagged = score_execution(&exited(0, "Something FAILED\n"), 1);
        assert_eq!(flagged.score, 0.0);
        assert_eq!(flagged.error, Some(ScoreError::ParseFailure));
    }

    #[test]
    fn test_stderr_preview_keeps_tail() {
        let long = format!("{}END", "x".repeat(1000));
        let preview = stderr_preview(&long);
        assert_eq!(preview.chars().count(), STDERR_PREVIEW_CHARS);
        assert!(preview.ends_with("END"));
    }
}
