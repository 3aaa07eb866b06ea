//! Citation reachability checks.
//!
//! [`LinkValidator`] is the seam; [`HttpLinkValidator`] probes URLs over the
//! network. Validators never fail: every outcome is a [`LinkVerdict`].

mod extract;
mod http;

pub use extract::extract_urls;
pub use http::{HttpLinkValidator, LinkCheckSettings};

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Why a URL was judged the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkReason {
    Reachable,
    Timeout,
    NotFound,
    HttpError,
    Malformed,
    ConnectionError,
}

impl LinkReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkReason::Reachable => "reachable",
            LinkReason::Timeout => "timeout",
            LinkReason::NotFound => "not_found",
            LinkReason::HttpError => "http_error",
            LinkReason::Malformed => "malformed",
            LinkReason::ConnectionError => "connection_error",
        }
    }

    /// Failures that may clear up on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkReason::Timeout | LinkReason::ConnectionError)
    }
}

/// Outcome of validating a single URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkVerdict {
    pub url: String,
    pub reachable: bool,
    pub reason: LinkReason,
    /// Final HTTP status, when a response was received.
    pub status: Option<u16>,
    pub detail: Option<String>,
}

impl LinkVerdict {
    pub fn reachable(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            reachable: true,
            reason: LinkReason::Reachable,
            status: Some(status),
            detail: None,
        }
    }

    pub fn unreachable(url: impl Into<String>, reason: LinkReason, detail: impl Into<String>) -> Self {
        debug_assert!(reason != LinkReason::Reachable);
        Self {
            url: url.into(),
            reachable: false,
            reason,
            status: None,
            detail: Some(detail.into()),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Determines whether a URL is reachable. Must not fail; failures are verdicts.
#[async_trait]
pub trait LinkValidator: Send + Sync {
    async fn validate(&self, url: &str) -> LinkVerdict;
}

pub type DynLinkValidator = Arc<dyn LinkValidator>;

/// Aggregate verdicts for every citation of one answer, in citation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    pub verdicts: Vec<LinkVerdict>,
}

impl LinkReport {
    pub fn all_links_valid(&self) -> bool {
        self.verdicts.iter().all(|verdict| verdict.reachable)
    }

    pub fn invalid(&self) -> impl Iterator<Item = &LinkVerdict> {
        self.verdicts.iter().filter(|verdict| !verdict.reachable)
    }

    /// `LINKS CORRECT`, or one `LINK INCORRECT - <url> (<reason>)` line per failure.
    pub fn summary(&self) -> String {
        if self.all_links_valid() {
            return "LINKS CORRECT".to_string();
        }
        let mut output = String::new();
        for verdict in self.invalid() {
            if !output.is_empty() {
                output.push('\n');
            }
            let _ = write!(
                output,
                "LINK INCORRECT - {} ({})",
                verdict.url,
                verdict.reason.as_str()
            );
        }
        output
    }

    /// Feedback for the Answerer naming every failing URL.
    pub fn feedback(&self) -> String {
        let failing: Vec<String> = self
            .invalid()
            .map(|verdict| {
                let detail = verdict.detail.as_deref().unwrap_or(verdict.reason.as_str());
                format!("- {} ({detail})", verdict.url)
            })
            .collect();
        format!(
            "The following cited links could not be verified as reachable. Remove or replace them with working sources:\n{}",
            failing.join("\n")
        )
    }
}

/// Validate `urls` concurrently (bounded by `max_concurrent`), keeping input order.
///
/// Each URL gets at most `per_link_timeout`; a validator that overruns it is
/// reported as a [`LinkReason::Timeout`] for that URL alone.
pub async fn check_all(
    validator: &dyn LinkValidator,
    urls: &[String],
    max_concurrent: usize,
    per_link_timeout: Duration,
) -> LinkReport {
    let verdicts = stream::iter(urls.iter())
        .map(|url| async move {
            match tokio::time::timeout(per_link_timeout, validator.validate(url)).await {
                Ok(verdict) => verdict,
                Err(_) => {
                    warn!(%url, timeout_ms = per_link_timeout.as_millis() as u64, "link check overran its budget");
                    LinkVerdict::unreachable(
                        url.as_str(),
                        LinkReason::Timeout,
                        format!("no verdict within {} ms", per_link_timeout.as_millis()),
                    )
                }
            }
        })
        .buffered(max_concurrent.max(1))
        .collect::<Vec<_>>()
        .await;

    for verdict in &verdicts {
        crate::metrics::record_link_verdict(verdict);
    }

    LinkReport { verdicts }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: Duration = Duration::from_secs(5);

    /// Marks URLs containing "dead" unreachable. The sleep depends on the URL so
    /// completion order differs from submission order.
    struct StaggeredValidator;

    #[async_trait]
    impl LinkValidator for StaggeredValidator {
        async fn validate(&self, url: &str) -> LinkVerdict {
            let delay = 40u64.saturating_sub(url.len() as u64 % 40);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if url.contains("dead") {
                LinkVerdict::unreachable(url, LinkReason::NotFound, "HTTP 404").with_status(404)
            } else {
                LinkVerdict::reachable(url, 200)
            }
        }
    }

    fn urls() -> Vec<String> {
        vec![
            "https://example.com/a".to_string(),
            "https://example.com/dead-link".to_string(),
            "https://example.com/some/longer/path".to_string(),
            "https://example.com/dead".to_string(),
        ]
    }

    #[tokio::test]
    async fn concurrent_checks_match_sequential_results() {
        let urls = urls();
        let concurrent = check_all(&StaggeredValidator, &urls, 4, BUDGET).await;

        let mut sequential = Vec::new();
        for url in urls.iter().rev() {
            sequential.push(StaggeredValidator.validate(url).await);
        }

        let mut concurrent_sorted = concurrent.verdicts.clone();
        concurrent_sorted.sort_by(|a, b| a.url.cmp(&b.url));
        sequential.sort_by(|a, b| a.url.cmp(&b.url));
        assert_eq!(concurrent_sorted, sequential);
        assert_eq!(
            concurrent.all_links_valid(),
            sequential.iter().all(|verdict| verdict.reachable)
        );
        let order: Vec<&str> = concurrent.verdicts.iter().map(|v| v.url.as_str()).collect();
        assert_eq!(order, urls.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn summary_names_each_failing_link() {
        let report = check_all(&StaggeredValidator, &urls(), 2, BUDGET).await;
        assert!(!report.all_links_valid());
        let summary = report.summary();
        assert_eq!(summary.lines().count(), 2);
        assert!(summary.contains("LINK INCORRECT - https://example.com/dead-link (not_found)"));
        assert!(report.feedback().contains("https://example.com/dead"));
    }

    #[tokio::test]
    async fn empty_citation_list_is_valid() {
        let report = check_all(&StaggeredValidator, &[], 4, BUDGET).await;
        assert!(report.all_links_valid());
        assert_eq!(report.summary(), "LINKS CORRECT");
    }

    /// Never answers for URLs containing "slow".
    struct StallingValidator;

    #[async_trait]
    impl LinkValidator for StallingValidator {
        async fn validate(&self, url: &str) -> LinkVerdict {
            if url.contains("slow") {
                std::future::pending::<()>().await;
            }
            LinkVerdict::reachable(url, 200)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_link_times_out_without_losing_other_verdicts() {
        let urls = vec![
            "https://example.com/fast".to_string(),
            "https://example.com/slow".to_string(),
        ];
        let report = check_all(&StallingValidator, &urls, 4, Duration::from_secs(3)).await;

        assert!(report.verdicts[0].reachable);
        let stalled = &report.verdicts[1];
        assert!(!stalled.reachable);
        assert_eq!(stalled.reason, LinkReason::Timeout);
        assert_eq!(report.summary(), "LINK INCORRECT - https://example.com/slow (timeout)");
        assert!(report.feedback().contains("https://example.com/slow (no verdict within 3000 ms)"));
    }
}
