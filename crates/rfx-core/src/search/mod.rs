//! Web search seam.
//!
//! The Answerer resolves its `web_search` tool calls through a
//! [`SearchProvider`]. Results are scoped by the session's [`SiteFilters`].

mod bing;

pub use bing::{BingSearchProvider, BingSettings, DEFAULT_BING_ENDPOINT};

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::scope::SiteFilters;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    /// Prefer the most recent results.
    #[serde(default)]
    pub up_to_date: bool,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            up_to_date: false,
        }
    }

    pub fn up_to_date(mut self, up_to_date: bool) -> Self {
        self.up_to_date = up_to_date;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Ranked results for `query`; an empty `filters` set means unrestricted.
    async fn search(
        &self,
        query: &SearchQuery,
        filters: &SiteFilters,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

pub type DynSearchProvider = Arc<dyn SearchProvider>;

/// Stand-in used when no search credentials are configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledSearch;

#[async_trait]
impl SearchProvider for DisabledSearch {
    async fn search(
        &self,
        _query: &SearchQuery,
        _filters: &SiteFilters,
    ) -> Result<Vec<SearchResult>, SearchError> {
        Err(SearchError::Unavailable(
            "no search API key is configured".to_string(),
        ))
    }
}

/// Render results as numbered lines for the model.
pub fn format_results(results: &[SearchResult]) -> String {
    let mut output = String::new();
    for (index, result) in results.iter().enumerate() {
        if index > 0 {
            output.push('\n');
        }
        let _ = write!(
            output,
            "{}. content: {}, source_title: {}, source_url: {}",
            index + 1,
            result.snippet,
            result.title,
            result.url
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_render_as_numbered_lines() {
        let results = vec![
            SearchResult {
                title: "What is Microsoft Fabric?".to_string(),
                url: "https://learn.microsoft.com/en-us/fabric/get-started/microsoft-fabric-overview".to_string(),
                snippet: "Fabric is an end-to-end analytics platform.".to_string(),
            },
            SearchResult {
                title: "Fabric licenses".to_string(),
                url: "https://learn.microsoft.com/en-us/fabric/enterprise/licenses".to_string(),
                snippet: "Capacity and per-user licensing.".to_string(),
            },
        ];
        let rendered = format_results(&results);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("1. content: Fabric is an end-to-end analytics platform., source_title: What is Microsoft Fabric?"));
        assert!(lines[1].ends_with("source_url: https://learn.microsoft.com/en-us/fabric/enterprise/licenses"));
    }

    #[tokio::test]
    async fn disabled_search_reports_unavailable() {
        let err = DisabledSearch
            .search(&SearchQuery::new("anything"), &SiteFilters::unrestricted())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Unavailable(_)));
    }
}
