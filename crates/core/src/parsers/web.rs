use super::{FormatParser, ParserKind};
use crate::error::IngestError;
use crate::models::{Metadata, Segment};
use async_trait::async_trait;
use htmd::HtmlToMarkdown;
use regex::Regex;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Elements whose content never reaches the index.
const SKIPPED_TAGS: [&str; 8] = [
    "script", "style", "nav", "footer", "iframe", "frame", "noscript", "head",
];

/// Downloads pages for ingestion.
#[derive(Debug, Clone)]
pub struct WebFetcher {
    client: Client,
}

impl WebFetcher {
    pub fn new(timeout: Duration) -> Result<Self, IngestError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Only `http` and `https` URLs are fetched; non-2xx responses are errors.
    pub async fn fetch(&self, url: &str) -> Result<String, IngestError> {
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(IngestError::InvalidArgument(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }

        info!(url, "fetching page");
        let body = self
            .client
            .get(parsed)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        debug!(url, bytes = body.len(), "page fetched");
        Ok(body)
    }
}

pub fn page_title(html: &str) -> Option<String> {
    let pattern = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok()?;
    let raw = pattern.captures(html)?.get(1)?.as_str();
    let title = HtmlToMarkdown::new()
        .convert(raw)
        .unwrap_or_else(|_| raw.to_string());
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

/// HTML rendered to markdown with boilerplate elements removed.
pub fn html_to_text(html: &str) -> Result<String, IngestError> {
    let converter = HtmlToMarkdown::builder()
        .skip_tags(SKIPPED_TAGS.to_vec())
        .build();
    Ok(converter.convert(html)?)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebParser;

#[async_trait]
impl FormatParser for WebParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Web
    }

    async fn extract(
        &self,
        bytes: &[u8],
        _mime_type: &str,
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError> {
        let html = String::from_utf8_lossy(bytes);
        let text = html_to_text(&html)?;

        let url = metadata
            .get("url")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        let title = page_title(&html).or_else(|| {
            url.as_deref()
                .and_then(|url| Url::parse(url).ok())
                .and_then(|url| url.host_str().map(str::to_string))
        });

        let mut metadata = metadata.clone();
        metadata.insert("source".to_string(), json!("web"));
        metadata.insert("format".to_string(), json!("html"));
        if let Some(title) = title {
            metadata.insert("title".to_string(), json!(title));
        }
        Ok(vec![Segment::new(text, metadata)])
    }
}
