//! Append-only log of terminated question cycles.
//!
//! Records land in `<dir>/<YYYY>/<MM>/cycles.jsonl`. Text fields are scrubbed
//! of credential-looking tokens first; every scrub is noted in `audit.jsonl`.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::events::CycleStatus;

pub const CYCLE_LOG_FILE: &str = "cycles.jsonl";
pub const AUDIT_LOG_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

/// One terminated cycle as written to `cycles.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleLogEntry {
    pub session_id: String,
    pub question: String,
    pub status: CycleStatus,
    pub iterations: u32,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub objections: Vec<String>,
}

#[derive(Serialize)]
struct CycleLogRecord<'a> {
    timestamp: String,
    #[serde(flatten)]
    entry: &'a CycleLogEntry,
    redactions: &'a BTreeSet<&'static str>,
}

#[derive(Serialize)]
struct AuditLogRecord<'a> {
    timestamp: String,
    session_id: &'a str,
    redactions: &'a BTreeSet<&'static str>,
}

#[derive(Debug, Clone)]
pub struct CycleLog {
    base_dir: PathBuf,
    retention_days: u64,
    /// Shared by clones: retention runs on the first record of a process only.
    pruned: Arc<AtomicBool>,
}

impl CycleLog {
    /// `retention_days == 0` keeps files forever.
    pub fn new(base_dir: impl Into<PathBuf>, retention_days: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention_days,
            pruned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn record(&self, entry: &CycleLogEntry) -> Result<PathBuf> {
        let timestamp = Utc::now();
        let mut redactions = BTreeSet::new();
        let entry = sanitize_entry(entry, &mut redactions);

        let month_dir = self
            .base_dir
            .join(format!("{:04}", timestamp.year()))
            .join(format!("{:02}", timestamp.month()));
        let log_path = month_dir.join(CYCLE_LOG_FILE);

        let record = CycleLogRecord {
            timestamp: timestamp.to_rfc3339(),
            entry: &entry,
            redactions: &redactions,
        };
        append_json_line(&log_path, &record)?;

        if !redactions.is_empty() {
            let audit = AuditLogRecord {
                timestamp: record.timestamp.clone(),
                session_id: &entry.session_id,
                redactions: &redactions,
            };
            append_json_line(&month_dir.join(AUDIT_LOG_FILE), &audit)?;
            warn!(
                session_id = %entry.session_id,
                fields = ?redactions,
                "redacted potential secrets from cycle log"
            );
        }

        self.enforce_retention()?;
        Ok(log_path)
    }

    fn enforce_retention(&self) -> Result<()> {
        if self.retention_days == 0 || self.pruned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.base_dir.exists() {
            return Ok(());
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(self.retention_days.saturating_mul(86_400)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        prune_directory(&self.base_dir, cutoff)
    }
}

fn sanitize_entry(entry: &CycleLogEntry, redactions: &mut BTreeSet<&'static str>) -> CycleLogEntry {
    CycleLogEntry {
        session_id: entry.session_id.clone(),
        question: sanitize_text(&entry.question, redactions),
        status: entry.status,
        iterations: entry.iterations,
        answer: entry
            .answer
            .as_deref()
            .map(|answer| sanitize_text(answer, redactions)),
        citations: entry
            .citations
            .iter()
            .map(|url| sanitize_text(url, redactions))
            .collect(),
        objections: entry
            .objections
            .iter()
            .map(|objection| sanitize_text(objection, redactions))
            .collect(),
    }
}

pub(crate) fn sanitize_text(input: &str, redactions: &mut BTreeSet<&'static str>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .into_owned();
        if matched {
            redactions.insert(*name);
        }
    }
    output
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{line}")
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}
