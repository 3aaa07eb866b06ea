use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use crate::events::CycleStatus;
use crate::logging::CycleLogEntry;

/// Aggregates over a `cycles.jsonl` file.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EvaluationMetrics {
    pub total_cycles: usize,
    pub approved: usize,
    pub failed: usize,
    pub mean_iterations: f64,
    /// Session ids of failed cycles, in log order.
    pub failures: Vec<String>,
}

impl EvaluationMetrics {
    pub fn record(&mut self, entry: &CycleLogEntry) {
        self.total_cycles += 1;
        self.mean_iterations += (f64::from(entry.iterations) - self.mean_iterations)
            / self.total_cycles as f64;
        match entry.status {
            CycleStatus::Approved => self.approved += 1,
            CycleStatus::Failed => {
                self.failed += 1;
                self.failures.push(entry.session_id.clone());
            }
            CycleStatus::Cancelled => {}
        }
    }

    pub fn approval_rate(&self) -> f64 {
        if self.total_cycles == 0 {
            0.0
        } else {
            self.approved as f64 / self.total_cycles as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cycle(s) • {} approved • {} failed • approval rate {:.0}% • mean iterations {:.2}",
            self.total_cycles,
            self.approved,
            self.failed,
            self.approval_rate() * 100.0,
            self.mean_iterations
        )
    }
}

pub struct EvaluationHarness;

impl EvaluationHarness {
    pub fn analyze_log(path: impl AsRef<Path>) -> Result<EvaluationMetrics> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("failed to open log file {}", path.as_ref().display()))?;
        let mut metrics = EvaluationMetrics::default();

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CycleLogEntry>(&line) {
                Ok(entry) => metrics.record(&entry),
                Err(err) => {
                    tracing::debug!(%err, "skipping malformed cycle log entry");
                }
            }
        }

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn evaluation_harness_aggregates_outcomes() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"{{"timestamp":"2026-01-01T00:00:00Z","session_id":"a","question":"q1","status":"approved","iterations":1,"redactions":[]}}"#
        )
        .unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(
            file,
            r#"{{"session_id":"b","question":"q2","status":"failed","iterations":5,"objections":["wrong"]}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"session_id":"c","question":"q3","status":"approved","iterations":3}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let metrics = EvaluationHarness::analyze_log(file.path()).expect("metrics");

        assert_eq!(metrics.total_cycles, 3);
        assert_eq!(metrics.approved, 2);
        assert_eq!(metrics.failed, 1);
        assert!((metrics.mean_iterations - 3.0).abs() < 1e-9);
        assert_eq!(metrics.failures, vec!["b".to_string()]);
        assert!(metrics.summary().contains("approval rate 67%"));
    }

    #[test]
    fn missing_log_is_an_error() {
        assert!(EvaluationHarness::analyze_log("/nonexistent/cycles.jsonl").is_err());
    }
}
