use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{SearchProvider, SearchQuery, SearchResult};
use crate::error::SearchError;
use crate::scope::SiteFilters;
use crate::security::SecretValue;
use crate::RfxError;

pub const DEFAULT_BING_ENDPOINT: &str = "https://api.bing.microsoft.com/v7.0/search";

#[derive(Debug, Clone)]
pub struct BingSettings {
    pub endpoint: String,
    pub api_key: SecretValue,
    /// Results requested per selected site filter.
    pub count_per_context: u32,
    pub timeout: Duration,
}

/// Bing Web Search v7 client.
pub struct BingSearchProvider {
    client: Client,
    settings: BingSettings,
}

impl BingSearchProvider {
    pub fn new(settings: BingSettings) -> Result<Self, RfxError> {
        if settings.count_per_context == 0 {
            return Err(RfxError::InvalidConfiguration(
                "search.count_per_context must be at least 1".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| {
                RfxError::InvalidConfiguration(format!("failed to build search client: {err}"))
            })?;
        Ok(Self { client, settings })
    }

    fn result_count(&self, filters: &SiteFilters) -> u32 {
        let contexts = u32::try_from(filters.len().max(1)).unwrap_or(u32::MAX);
        contexts.saturating_mul(self.settings.count_per_context)
    }
}

fn scoped_query(query: &SearchQuery, filters: &SiteFilters) -> String {
    match filters.to_query_clause() {
        Some(clause) => format!("{} {clause}", query.text),
        None => query.text.clone(),
    }
}

#[async_trait]
impl SearchProvider for BingSearchProvider {
    #[instrument(skip(self, filters), fields(up_to_date = query.up_to_date, filters = filters.len()))]
    async fn search(
        &self,
        query: &SearchQuery,
        filters: &SiteFilters,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let q = scoped_query(query, filters);
        let count = self.result_count(filters).to_string();
        let mut params: Vec<(&str, &str)> = vec![("q", q.as_str()), ("count", count.as_str())];
        if query.up_to_date {
            params.push(("sortby", "Date"));
        }

        let response = self
            .client
            .get(&self.settings.endpoint)
            .header("Ocp-Apim-Subscription-Key", self.settings.api_key.expose())
            .query(&params)
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, "search request failed");
                SearchError::Transport(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "search endpoint returned an error status");
            return Err(SearchError::Status(status.as_u16()));
        }

        let payload: BingResponse = response
            .json()
            .await
            .map_err(|err| SearchError::Malformed(err.to_string()))?;

        let pages = payload.web_pages.map(|pages| pages.value).unwrap_or_default();
        let returned = pages.len();
        // The site: clause is advisory to Bing; keep only in-scope pages.
        let results: Vec<SearchResult> = pages
            .into_iter()
            .filter(|page| filters.allows(&page.url))
            .map(|page| SearchResult {
                title: page.name,
                url: page.url,
                snippet: page.snippet,
            })
            .collect();

        debug!(returned, results = results.len(), "search completed");
        if results.is_empty() {
            return Err(SearchError::NoResults);
        }
        Ok(results)
    }
}

#[derive(Deserialize)]
struct BingResponse {
    #[serde(rename = "webPages")]
    web_pages: Option<BingWebPages>,
}

#[derive(Deserialize)]
struct BingWebPages {
    #[serde(default)]
    value: Vec<BingPage>,
}

#[derive(Deserialize)]
struct BingPage {
    name: String,
    url: String,
    #[serde(default)]
    snippet: String,
}
