// Run configuration for the modelab worker
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::SamplingConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/run_config.json";

fn default_repeats() -> u32 {
    1
}

fn default_timeout_s() -> u64 {
    90
}

fn default_judge_model() -> String {
    "mistral:7b".to_string()
}

fn default_judge_sampling() -> SamplingConfig {
    SamplingConfig {
        temperature: 0.0,
        seed: None,
        max_tokens: Some(512),
        top_p: None,
    }
}

fn default_judge_timeout_s() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

fn default_ollama_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

/// Where generated code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Process,
    Docker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxKind,
    /// Interpreter for the process backend
    pub python: String,
    /// Image for the docker backend
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub default_timeout_s: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxKind::Process,
            python: "python3".to_string(),
            image: "python:3.11-slim".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            default_timeout_s: 10,
        }
    }
}

/// Experiment configuration, read from `config/run_config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub models: Vec<String>,
    pub suite_path: PathBuf,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default = "default_repeats")]
    pub repeats: u32,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    #[serde(default = "default_judge_sampling")]
    pub judge_sampling: SamplingConfig,
    #[serde(default = "default_judge_timeout_s")]
    pub judge_timeout_s: u64,
    #[serde(default)]
    pub cache_outputs: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl RunConfig {
    /// Load and validate a run configuration
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Run config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: RunConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `MODELAB_CONFIG`, falling back to the default path
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("MODELAB_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            bail!("Run config must name at least one model");
        }
        if self.models.iter().any(|m| m.trim().is_empty()) {
            bail!("Model names must not be empty");
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = self.models.iter().find(|m| !seen.insert(m.as_str())) {
            bail!("Model '{}' is listed more than once", duplicate);
        }
        if self.repeats == 0 {
            bail!("repeats must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.timeout_s == 0 || self.judge_timeout_s == 0 || self.sandbox.default_timeout_s == 0 {
            bail!("timeouts must be non-zero");
        }
        if self.sandbox.cpu_limit <= 0.0 || self.sandbox.memory_limit_mb == 0 {
            bail!("sandbox limits must be positive");
        }
        Ok(())
    }

    /// Apply `MODELS` (comma list) and `SUITE_PATH` overrides
    pub fn apply_overrides(&mut self, models: Option<&str>, suite_path: Option<&str>) {
        if let Some(models) = models {
            let parsed: Vec<String> = models
                .split(',')
                .map(|m| m.trim())
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                self.models = parsed;
            }
        }
        if let Some(path) = suite_path.filter(|p| !p.is_empty()) {
            self.suite_path = PathBuf::from(path);
        }
    }

    pub fn apply_env_overrides(&mut self) {
        let models = std::env::var("MODELS").ok();
        let suite = std::env::var("SUITE_PATH").ok();
        self.apply_overrides(models.as_deref(), suite.as_deref());
    }

    /// Total (test, model, repeat) units for a suite of `test_count` tests
    pub fn total_units(&self, test_count: usize) -> usize {
        test_count * self.models.len() * self.repeats as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let file = write_config(
            r#"{
                "models": ["llama3:8b"],
                "suite_path": "prompts/suites/core_suite.json",
                "sampling": {"temperature": 0.7, "seed": 42},
                "repeats": 3
            }"#,
        );

        let config = RunConfig::load(file.path()).unwrap();

        assert_eq!(config.repeats, 3);
        assert_eq!(config.timeout_s, 90);
        assert_eq!(config.judge_model, "mistral:7b");
        assert_eq!(config.judge_sampling.temperature, 0.0);
        assert_eq!(config.judge_timeout_s, 30);
        assert_eq!(config.concurrency, 4);
        assert!(!config.cache_outputs);
        assert_eq!(config.sampling.seed, Some(42));
        assert_eq!(config.sandbox, SandboxConfig::default());
        assert_eq!(config.total_units(10), 30);
    }

    #[test]
    fn test_sandbox_section_is_partial() {
        let file = write_config(
            r#"{
                "models": ["m"],
                "suite_path": "s.json",
                "sandbox": {"backend": "docker", "memory_limit_mb": 512}
            }"#,
        );

        let config = RunConfig::load(file.path()).unwrap();

        assert_eq!(config.sandbox.backend, SandboxKind::Docker);
        assert_eq!(config.sandbox.memory_limit_mb, 512);
        assert_eq!(config.sandbox.image, "python:3.11-slim");
        assert_eq!(config.sandbox.default_timeout_s, 10);
    }

    #[test]
    fn test_missing_file() {
        let err = RunConfig::load(Path::new("does/not/exist.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let file = write_config(r#"{"models": [], "suite_path": "s.json"}"#);
        assert!(RunConfig::load(file.path()).is_err());

        let file = write_config(r#"{"models": ["m"], "suite_path": "s.json", "repeats": 0}"#);
        assert!(RunConfig::load(file.path()).is_err());

        let file = write_config(r#"{"models": ["m"], "suite_path": "s.json", "concurrency": 0}"#);
        assert!(RunConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let file = write_config(r#"{"models": ["a"], "suite_path": "s.json"}"#);
        let mut config = RunConfig::load(file.path()).unwrap();

        config.apply_overrides(Some(" b , c ,"), Some("other.json"));
        assert_eq!(config.models, vec!["b", "c"]);
        assert_eq!(config.suite_path, PathBuf::from("other.json"));

        config.apply_overrides(Some(" , "), None);
        assert_eq!(config.models, vec!["b", "c"]);
    }

    #[test]
    fn test_rejects_duplicate_models() {
        let file = write_config(r#"{"models": ["llama3:8b", "llama3:8b"], "suite_path": "s.json"}"#);
        let err = RunConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let file = write_config(r#"{"models": ["a"], "suite_path": "s.json"}"#);
        let mut config = RunConfig::load(file.path()).unwrap();
        config.apply_overrides(Some("a, b ,a"), None);
        assert!(config.validate().is_err());

        config.apply_overrides(Some("a,b"), None);
        assert!(config.validate().is_ok());
        assert_eq!(config.total_units(1), 2);
    }

    #[test]
    fn test_rejects_blank_model_name() {
        let file = write_config(r#"{"models": ["m", ""], "suite_path": "s.json"}"#);
        assert!(RunConfig::load(file.path()).is_err());

        let file = write_config(r#"{"models": ["  "], "suite_path": "s.json"}"#);
        assert!(RunConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_bundled_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(DEFAULT_CONFIG_PATH);
        let config = RunConfig::load(&path).unwrap();

        assert_eq!(config.models.len(), 2);
        assert_eq!(config.sandbox.backend, SandboxKind::Process);
        assert_eq!(config.judge_sampling.temperature, 0.0);
        assert_eq!(config.total_units(7), 42);
    }
}
