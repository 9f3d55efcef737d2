//! Error kinds produced while scoring a single (test, output) pair.
//!
//! None of these escape the evaluator: each one is folded into a score and a
//! set of failure tags before the record is built.

/// Scoring failure kinds.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    #[error("unknown eval method: {0}")]
    UnknownMethod(String),

    #[error("malformed expected value: {0}")]
    MalformedExpected(String),

    #[error("judge unavailable: {0}")]
    JudgeUnavailable(String),

    #[error("judge response carried no numeric or keyword signal")]
    JudgeUnparseable,

    #[error("sandbox execution timed out after {limit_ms}ms")]
    SandboxTimeout { limit_ms: u64 },

    #[error("sandbox execution failed (exit code {exit_code:?}): {stderr_preview}")]
    SandboxRuntimeError {
        exit_code: Option<i64>,
        stderr_preview: String,
    },

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("no PASSED summary line in harness output")]
    ParseFailure,
}

impl ScoreError {
    /// Stable snake_case name of the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ScoreError::UnknownMethod(_) => "unknown_method",
            ScoreError::MalformedExpected(_) => "malformed_expected",
            ScoreError::JudgeUnavailable(_) => "judge_unavailable",
            ScoreError::JudgeUnparseable => "judge_unparseable",
            ScoreError::SandboxTimeout { .. } => "sandbox_timeout",
            ScoreError::SandboxRuntimeError { .. } => "sandbox_runtime_error",
            ScoreError::SandboxUnavailable(_) => "sandbox_unavailable",
            ScoreError::ParseFailure => "parse_failure",
        }
    }

    /// Failure tag paired with `evaluation_error`.
    pub fn sub_tag(&self) -> String {
        format!("error_{}", self.kind())
    }
}

pub type ScoreResult<T> = std::result::Result<T, ScoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_tags_are_prefixed() {
        let errors = [
            ScoreError::UnknownMethod("x".into()),
            ScoreError::MalformedExpected("x".into()),
            ScoreError::JudgeUnavailable("x".into()),
            ScoreError::JudgeUnparseable,
            ScoreError::SandboxTimeout { limit_ms: 10 },
            ScoreError::SandboxRuntimeError {
                exit_code: Some(1),
                stderr_preview: String::new(),
            },
            ScoreError::SandboxUnavailable("x".into()),
            ScoreError::ParseFailure,
        ];
        for error in &errors {
            assert_eq!(error.sub_tag(), format!("error_{}", error.kind()));
        }
        assert_eq!(
            ScoreError::SandboxTimeout { limit_ms: 10 }.sub_tag(),
            "error_sandbox_timeout"
        );
    }

    #[test]
    fn test_display_messages() {
        let err = ScoreError::SandboxTimeout { limit_ms: 10_000 };
        assert_eq!(err.to_string(), "sandbox execution timed out after 10000ms");
    }
}
