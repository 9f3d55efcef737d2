// File-backed suite loading and the append-only record stream
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::types::{RunResult, TestCase};

pub const RESULTS_JSONL: &str = "results.jsonl";
pub const RESULTS_JSON: &str = "results.json";
pub const SUMMARY_JSON: &str = "summary.json";

/// Load a test suite (a JSON array of test cases).
///
/// Rejects duplicate test ids, since records are keyed by
/// (model, test_id, repeat_idx).
pub fn load_suite(path: &Path) -> Result<Vec<TestCase>> {
    let suite: Vec<TestCase> = read_json(path)?;

    let mut seen = HashSet::new();
    for case in &suite {
        if !seen.insert(case.id.as_str()) {
            bail!("Duplicate test id '{}' in {}", case.id, path.display());
        }
    }
    Ok(suite)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let payload = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    fs::write(path, payload).with_context(|| format!("Failed to write {}", path.display()))
}

/// Read newline-delimited JSON records, skipping blank lines.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record at {}:{}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Resolve a results location: a run directory (JSONL preferred) or a file.
pub fn resolve_results_path(location: &Path) -> Result<PathBuf> {
    if location.is_dir() {
        for name in [RESULTS_JSONL, RESULTS_JSON] {
            let candidate = location.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        bail!("No results file found in {}", location.display());
    }
    if !location.exists() {
        bail!("Results file not found: {}", location.display());
    }
    Ok(location.to_path_buf())
}

/// Load run results from a run directory, a `.jsonl` stream or a `.json` array.
pub fn load_results(location: &Path) -> Result<Vec<RunResult>> {
    let path = resolve_results_path(location)?;
    let is_jsonl = path.extension().map(|ext| ext == "jsonl").unwrap_or(false);
    if is_jsonl {
        read_jsonl(&path)
    } else {
        read_json(&path)
    }
}

/// Append-only JSONL writer. Each record is flushed as one complete line.
pub struct RecordWriter {
    path: PathBuf,
    file: File,
}

impl RecordWriter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize record")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .with_context(|| format!("Failed to append to {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, ScoreDetail};
    use chrono::Utc;
    use serde_json::json;

    fn make_result(test_id: &str, repeat_idx: u32, score: f64) -> RunResult {
        RunResult {
            run_id: "20260101_000000".to_string(),
            timestamp: Utc::now(),
            git_commit: None,
            model: "model-a".to_string(),
            test_id: test_id.to_string(),
            category: Category::Reasoning,
            variant_group: None,
            repeat_idx,
            prompt: "prompt".to_string(),
            raw_output: "output".to_string(),
            score_detail: ScoreDetail::new("exact_match", score),
            final_score: score,
            failure_tags: Vec::new(),
            latency_ms: 12,
            error: None,
        }
    }

    #[test]
    fn test_jsonl_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_JSONL);

        let mut writer = RecordWriter::open(&path).unwrap();
        writer.append(&make_result("t1", 0, 1.0)).unwrap();
        writer.append(&make_result("t1", 1, 0.0)).unwrap();
        drop(writer);

        // Reopening appends instead of truncating
        let mut writer = RecordWriter::open(&path).unwrap();
        writer.append(&make_result("t2", 0, 0.5)).unwrap();

        let loaded = load_results(dir.path()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].test_id, "t2");
        assert_eq!(loaded[1].final_score, 0.0);
    }

    #[test]
    fn test_load_results_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_JSON);
        write_json_pretty(&path, &vec![make_result("t1", 0, 1.0)]).unwrap();

        let loaded = load_results(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].test_id, "t1");
    }

    #[test]
    fn test_missing_results_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_results(dir.path()).is_err());
    }

    #[test]
    fn test_load_suite_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.json");
        let case = json!({
            "id": "reasoning-001",
            "category": "reasoning",
            "prompt": "2+2?",
            "expected": 4,
            "eval": {"method": "numeric_tolerance", "params": {"tolerance": 0.01}}
        });
        write_json_pretty(&path, &json!([case.clone()])).unwrap();
        assert_eq!(load_suite(&path).unwrap().len(), 1);

        write_json_pretty(&path, &json!([case.clone(), case])).unwrap();
        let err = load_suite(&path).unwrap_err();
        assert!(err.to_string().contains("Duplicate test id"));
    }
}
