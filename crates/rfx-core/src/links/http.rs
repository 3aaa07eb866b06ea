use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode, redirect};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{LinkReason, LinkValidator, LinkVerdict};
use crate::RfxError;

const MAX_BODY_BYTES: usize = 512 * 1024;

/// Error-page markers served with a 2xx status ("soft 404s"). Title and
/// heading markers must open with a not-found phrase, so pages that merely
/// document errors stay reachable.
static SOFT_404_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    const NOT_FOUND: &str = r"(?:(?:error\s*)?404\b|(?:page\s+)?not\s+found\b|(?:this\s+)?page\s+does\s+not\s+exist)";
    [
        format!(r"<title>\s*{NOT_FOUND}[^<]*</title>"),
        format!(r"<h1[^>]*>\s*{NOT_FOUND}[^<]*</h1>"),
        format!(r"<h2[^>]*>\s*{NOT_FOUND}[^<]*</h2>"),
        r"404 - Page not found".to_string(),
        r"Sorry, the page you requested cannot be found".to_string(),
        r"The page you're looking for isn't available".to_string(),
        r"The resource you are looking for has been removed".to_string(),
        r"The page cannot be found".to_string(),
        r"We can't find the page you're looking for".to_string(),
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){pattern}")).expect("invalid soft-404 regex"))
    .collect()
});

/// Tunables for [`HttpLinkValidator`].
#[derive(Debug, Clone)]
pub struct LinkCheckSettings {
    /// Per-request timeout.
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Pause before the single retry of a transient failure.
    pub retry_backoff: Duration,
    pub max_concurrent: usize,
    pub accept_invalid_certs: bool,
    pub user_agent: String,
}

impl Default for LinkCheckSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_redirects: 5,
            retry_backoff: Duration::from_millis(250),
            max_concurrent: 8,
            accept_invalid_certs: false,
            user_agent: format!("Mozilla/5.0 (compatible; rfx-link-validator/{})", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl LinkCheckSettings {
    /// Worst case for one URL: HEAD and GET, retried once after the backoff.
    pub fn verdict_budget(&self) -> Duration {
        self.timeout * 4 + self.retry_backoff
    }
}

/// Network reachability probe: HEAD first, GET when the server refuses HEAD.
pub struct HttpLinkValidator {
    client: Client,
    settings: LinkCheckSettings,
}

impl HttpLinkValidator {
    pub fn new(settings: LinkCheckSettings) -> Result<Self, RfxError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .redirect(redirect::Policy::limited(settings.max_redirects))
            .user_agent(settings.user_agent.clone())
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(|err| {
                RfxError::InvalidConfiguration(format!("failed to build link-check client: {err}"))
            })?;
        Ok(Self { client, settings })
    }

    async fn probe(&self, url: &Url) -> LinkVerdict {
        match self.client.head(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                if is_ok_status(status) {
                    return LinkVerdict::reachable(url.as_str(), status.as_u16());
                }
                if !matches!(status.as_u16(), 403 | 404 | 405) {
                    return status_verdict(url.as_str(), status);
                }
                debug!(%url, status = status.as_u16(), "HEAD refused, retrying with GET");
            }
            Err(err) if err.is_timeout() => {
                return transport_verdict(url.as_str(), &err);
            }
            Err(err) => {
                debug!(%url, error = %err, "HEAD failed, retrying with GET");
            }
        }

        match self.client.get(url.clone()).send().await {
            Ok(response) => self.inspect_get(url, response).await,
            Err(err) => transport_verdict(url.as_str(), &err),
        }
    }

    async fn inspect_get(&self, url: &Url, response: Response) -> LinkVerdict {
        let status = response.status();
        if !is_ok_status(status) {
            return status_verdict(url.as_str(), status);
        }

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false);

        if is_html {
            let body = read_body_prefix(response).await;
            if looks_like_error_page(&body) {
                return LinkVerdict::unreachable(
                    url.as_str(),
                    LinkReason::NotFound,
                    format!("soft 404: error page served with status {}", status.as_u16()),
                )
                .with_status(status.as_u16());
            }
        }

        LinkVerdict::reachable(url.as_str(), status.as_u16())
    }
}

#[async_trait]
impl LinkValidator for HttpLinkValidator {
    #[instrument(name = "link.validate", skip(self))]
    async fn validate(&self, url: &str) -> LinkVerdict {
        let parsed = match parse_url(url) {
            Ok(parsed) => parsed,
            Err(detail) => {
                debug!(%url, %detail, "malformed citation");
                return LinkVerdict::unreachable(url, LinkReason::Malformed, detail);
            }
        };

        let mut verdict = self.probe(&parsed).await;
        if is_transient(&verdict) {
            debug!(
                %url,
                reason = verdict.reason.as_str(),
                backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                "transient link failure, retrying once"
            );
            tokio::time::sleep(self.settings.retry_backoff).await;
            verdict = self.probe(&parsed).await;
        }

        // Report the URL as cited, not as normalised by the parser.
        verdict.url = url.to_string();

        if !verdict.reachable {
            warn!(
                %url,
                reason = verdict.reason.as_str(),
                status = verdict.status,
                "citation unreachable"
            );
        }
        verdict
    }
}

fn parse_url(raw: &str) -> Result<Url, String> {
    let parsed = Url::parse(raw.trim()).map_err(|err| format!("malformed URL: {err}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme `{}`", parsed.scheme()));
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(parsed),
        _ => Err("URL has no host".to_string()),
    }
}

fn is_ok_status(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

fn is_transient(verdict: &LinkVerdict) -> bool {
    verdict.reason.is_transient() || matches!(verdict.status, Some(502..=504))
}

fn status_verdict(url: &str, status: StatusCode) -> LinkVerdict {
    let reason = match status.as_u16() {
        404 | 410 => LinkReason::NotFound,
        _ => LinkReason::HttpError,
    };
    LinkVerdict::unreachable(url, reason, format!("HTTP {}", status.as_u16()))
        .with_status(status.as_u16())
}

fn transport_verdict(url: &str, err: &reqwest::Error) -> LinkVerdict {
    if err.is_timeout() {
        LinkVerdict::unreachable(url, LinkReason::Timeout, "request timed out")
    } else if err.is_redirect() {
        LinkVerdict::unreachable(url, LinkReason::HttpError, format!("redirect error: {err}"))
    } else {
        LinkVerdict::unreachable(url, LinkReason::ConnectionError, format!("connection error: {err}"))
    }
}

async fn read_body_prefix(mut response: Response) -> String {
    let mut buffer = Vec::new();
    while buffer.len() < MAX_BODY_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "stopped reading body early");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

fn looks_like_error_page(body: &str) -> bool {
    SOFT_404_PATTERNS.iter().any(|pattern| pattern.is_match(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn validator() -> HttpLinkValidator {
        HttpLinkValidator::new(LinkCheckSettings {
            timeout: Duration::from_millis(300),
            retry_backoff: Duration::from_millis(10),
            ..LinkCheckSettings::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn head_success_is_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/docs"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/docs", server.uri());
        let verdict = validator().validate(&url).await;
        assert!(verdict.reachable);
        assert_eq!(verdict.reason, LinkReason::Reachable);
        assert_eq!(verdict.status, Some(200));
        assert_eq!(verdict.url, url);
    }

    #[tokio::test]
    async fn falls_back_to_get_when_head_is_not_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("plain text", "text/plain"))
            .expect(1)
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/page", server.uri())).await;
        assert!(verdict.reachable);
    }

    #[tokio::test]
    async fn missing_page_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/gone", server.uri())).await;
        assert!(!verdict.reachable);
        assert_eq!(verdict.reason, LinkReason::NotFound);
        assert_eq!(verdict.status, Some(404));
    }

    #[tokio::test]
    async fn soft_404_page_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/moved"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><head><title>Page not found - Docs</title></head><body></body></html>",
                "text/html; charset=utf-8",
            ))
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/moved", server.uri())).await;
        assert!(!verdict.reachable);
        assert_eq!(verdict.reason, LinkReason::NotFound);
        assert!(verdict.detail.unwrap_or_default().contains("soft 404"));
    }

    #[tokio::test]
    async fn page_documenting_errors_is_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/rest"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><head><title>Troubleshoot errors in Azure OpenAI REST API reference</title></head>\
                 <body><h1>Chat completions</h1><h2 id=\"error-response\">Error response</h2>\
                 <p>Returns 404 Not Found when the deployment does not exist.</p></body></html>",
                "text/html; charset=utf-8",
            ))
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/rest", server.uri())).await;
        assert!(verdict.reachable, "{verdict:?}");
        assert_eq!(verdict.status, Some(200));
    }

    #[test]
    fn error_page_markers_need_a_leading_not_found_phrase() {
        assert!(looks_like_error_page("<title>404 - Docs</title>"));
        assert!(looks_like_error_page("<h1 class=\"x\">Error 404: missing</h1>"));
        assert!(looks_like_error_page("<h2>This page does not exist</h2>"));
        assert!(!looks_like_error_page("<title>Error handling in Fabric</title>"));
        assert!(!looks_like_error_page("<h2 id=\"e\">Error response</h2>"));
        assert!(!looks_like_error_page("<h1>Resolve 'resource not found' errors</h1>"));
    }

    #[tokio::test]
    async fn redirects_are_followed() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("Location", format!("{}/new", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/old", server.uri())).await;
        assert!(verdict.reachable);
        assert_eq!(verdict.status, Some(200));
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/broken", server.uri())).await;
        assert_eq!(verdict.reason, LinkReason::HttpError);
        assert_eq!(verdict.status, Some(500));
    }

    #[tokio::test]
    async fn unavailable_service_is_retried_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/busy", server.uri())).await;
        assert!(!verdict.reachable);
        assert_eq!(verdict.status, Some(503));
    }

    #[tokio::test]
    async fn slow_response_times_out_after_one_retry() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .expect(2)
            .mount(&server)
            .await;

        let verdict = validator().validate(&format!("{}/slow", server.uri())).await;
        assert!(!verdict.reachable);
        assert_eq!(verdict.reason, LinkReason::Timeout);
    }

    #[tokio::test]
    async fn malformed_urls_never_touch_the_network() {
        let validator = validator();
        for url in ["not a url", "ftp://example.com/file", "https://", "mailto:a@b.c"] {
            let verdict = validator.validate(url).await;
            assert!(!verdict.reachable, "{url} should be rejected");
            assert_eq!(verdict.reason, LinkReason::Malformed, "{url}");
        }
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let verdict = validator().validate(&format!("http://127.0.0.1:{port}/")).await;
        assert!(!verdict.reachable);
        assert_eq!(verdict.reason, LinkReason::ConnectionError);
    }

    #[tokio::test]
    async fn repeated_validation_is_stable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let validator = validator();
        let url = format!("{}/stable", server.uri());
        let first = validator.validate(&url).await;
        let second = validator.validate(&url).await;
        assert_eq!(first, second);
    }

    #[test]
    fn soft_404_patterns_are_case_insensitive() {
        assert!(looks_like_error_page("<h1>PAGE NOT FOUND</h1>"));
        assert!(!looks_like_error_page("<title>Azure AI Foundry documentation</title>"));
    }
}
