use once_cell::sync::Lazy;
use regex::Regex;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s)\]"'>]+"#).expect("invalid url regex"));

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '*', '`'];

/// Extract every http(s) URL in `text`, deduplicated in first-seen order.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for found in URL_PATTERN.find_iter(text) {
        let url = trim_url(found.as_str());
        if url.len() <= "https://".len() {
            continue;
        }
        if !urls.iter().any(|seen| seen == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

fn trim_url(raw: &str) -> &str {
    raw.trim_end_matches(TRAILING_PUNCTUATION)
}
