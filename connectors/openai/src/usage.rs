//! Append-only LLM usage log (`llm_usage.jsonl`) and its aggregation.
//!
//! One record is written per attempt, success or error. Writes are
//! best-effort: a failing log write never fails the LLM call.

use crate::models::TokenUsage;
use crate::rotation::ApiFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Default record cap when aggregating without an explicit limit
pub const DEFAULT_USAGE_LIMIT: usize = 5_000;
/// Hard cap on the aggregation limit
pub const MAX_USAGE_LIMIT: usize = 200_000;

/// One attempt against one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub ts: String,
    /// `success` or `error`
    pub event: String,
    pub stage: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiFailure>,
}

impl UsageRecord {
    pub fn success(stage: &str, model: &str, usage: Option<TokenUsage>) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            event: "success".to_string(),
            stage: stage.to_string(),
            model: model.to_string(),
            usage,
            rotate: None,
            reason: None,
            error: None,
        }
    }

    pub fn error(stage: &str, model: &str, rotate: bool, reason: &str, error: ApiFailure) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            event: "error".to_string(),
            stage: stage.to_string(),
            model: model.to_string(),
            usage: None,
            rotate: Some(rotate),
            reason: Some(reason.to_string()),
            error: Some(error),
        }
    }
}

/// Serialized appender for a `llm_usage.jsonl` file. The directory is
/// created lazily on first write.
pub struct UsageLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl UsageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    /// A log that drops every record.
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one record. Best-effort: IO failures are logged at debug and
    /// swallowed.
    pub fn append(&self, record: &UsageRecord) {
        let Some(path) = &self.path else {
            return;
        };
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                debug!("Failed to serialize usage record: {}", e);
                return;
            }
        };
        let _guard = self.lock.lock().expect("usage log lock poisoned");
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = result {
            debug!("Failed to append usage record to {}: {}", path.display(), e);
        }
    }
}

/// Read up to `limit` records from a usage log file. Blank and unparsable
/// lines are skipped.
pub fn read_usage_records(path: &Path, limit: usize) -> Vec<UsageRecord> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let reader = std::io::BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        if records.len() >= limit {
            break;
        }
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<UsageRecord>(line) {
            records.push(record);
        }
    }
    records
}

/// Per-model or per-stage aggregation bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTotals {
    pub requests: u64,
    pub errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Aggregated usage over a set of records.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub total_errors: u64,
    pub totals_by_model: BTreeMap<String, UsageTotals>,
    pub totals_by_stage: BTreeMap<String, UsageTotals>,
}

/// Aggregate records by model and by stage. A record counts as an error when
/// its event is `error` or it carries no usage payload.
pub fn aggregate_usage(records: &[UsageRecord]) -> UsageSummary {
    let mut summary = UsageSummary::default();

    for record in records {
        let usage = record.usage.clone().unwrap_or_default();
        let (prompt, completion, total) = (
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.effective_total(),
        );
        let is_error = record.event == "error" || record.usage.is_none();

        summary.total_requests += 1;
        if is_error {
            summary.total_errors += 1;
        }

        for bucket in [
            summary
                .totals_by_model
                .entry(record.model.clone())
                .or_default(),
            summary
                .totals_by_stage
                .entry(record.stage.clone())
                .or_default(),
        ] {
            bucket.requests += 1;
            if is_error {
                bucket.errors += 1;
            }
            bucket.prompt_tokens += prompt;
            bucket.completion_tokens += completion;
            bucket.total_tokens += total;
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("llm_usage.jsonl");
        let log = UsageLog::new(path.clone());

        log.append(&UsageRecord::success(
            "json_structure",
            "m1",
            Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 0,
            }),
        ));
        log.append(&UsageRecord::error(
            "json_structure",
            "m1",
            true,
            "rate_limit_or_quota",
            ApiFailure::api(429, None, "too many requests"),
        ));

        let records = read_usage_records(&path, 100);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "success");
        assert_eq!(records[1].rotate, Some(true));
        assert_eq!(records[1].reason.as_deref(), Some("rate_limit_or_quota"));
    }

    #[test]
    fn read_respects_limit_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("llm_usage.jsonl");
        let log = UsageLog::new(path.clone());
        for _ in 0..5 {
            log.append(&UsageRecord::success("fallback", "m1", None));
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();
        log.append(&UsageRecord::success("fallback", "m1", None));

        assert_eq!(read_usage_records(&path, 3).len(), 3);
        assert_eq!(read_usage_records(&path, 100).len(), 6);
    }

    #[test]
    fn aggregation_normalizes_totals() {
        let records = vec![
            UsageRecord::success(
                "json_structure",
                "m1",
                Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 0,
                }),
            ),
            UsageRecord::success(
                "reasoning",
                "m1",
                Some(TokenUsage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 3,
                }),
            ),
            UsageRecord::error(
                "reasoning",
                "m2",
                false,
                "non_rotatable",
                ApiFailure::api(401, None, "bad key"),
            ),
        ];

        let summary = aggregate_usage(&records);
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_errors, 1);

        let m1 = &summary.totals_by_model["m1"];
        assert_eq!(m1.requests, 2);
        assert_eq!(m1.total_tokens, 15 + 3);

        let reasoning = &summary.totals_by_stage["reasoning"];
        assert_eq!(reasoning.requests, 2);
        assert_eq!(reasoning.errors, 1);
    }

    #[test]
    fn disabled_log_drops_records() {
        let log = UsageLog::disabled();
        log.append(&UsageRecord::success("fallback", "m1", None));
        assert!(log.path().is_none());
    }
}
