use crate::config::Settings;
use crate::error::IngestError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Text recognition for scanned pages and images.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(
        &self,
        bytes: &[u8],
        mime_type: &str,
        source: &str,
    ) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest<'a> {
    content_base64: String,
    mime_type: &'a str,
    source_path: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Posts base64 content to a multimodal OCR endpoint that answers with
/// `{pages: [{page, text}]}` or a form-feed separated `{text}`.
#[derive(Debug, Clone)]
pub struct HttpOcrEngine {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrEngine {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }

    /// `None` when no OCR endpoint is configured.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let endpoint = settings.ocr_endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        let api_key = settings
            .ocr_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        Some(Self::new(endpoint, api_key))
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn recognize(
        &self,
        bytes: &[u8],
        mime_type: &str,
        source: &str,
    ) -> Result<Vec<PageText>, IngestError> {
        let payload = OcrRequest {
            content_base64: STANDARD.encode(bytes),
            mime_type,
            source_path: source,
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "OCR request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json().await?;
        let pages = payload_to_pages(&payload, source)?;
        debug!(source, pages = pages.len(), "ocr finished");
        Ok(pages)
    }
}

fn payload_to_pages(payload: &OcrResponse, source: &str) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref()?.trim();
                (!text.is_empty()).then(|| PageText {
                    number: page.page.unwrap_or(1),
                    text: text.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let text = chunk.trim();
                (!text.is_empty()).then(|| PageText {
                    number: (index + 1) as u32,
                    text: text.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "OCR response was empty for {source}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_pages_keep_only_nonempty_text() -> Result<(), IngestError> {
        let response = OcrResponse {
            pages: Some(vec![
                OcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                OcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, "scan.pdf")?;
        assert_eq!(
            pages,
            vec![PageText {
                number: 3,
                text: "Page 3".to_string()
            }]
        );
        Ok(())
    }

    #[test]
    fn plain_text_is_split_on_form_feeds() -> Result<(), IngestError> {
        let response = OcrResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response, "scan.pdf")?;
        assert_eq!(pages.len(), 2);
        assert_eq!((pages[0].number, pages[0].text.as_str()), (1, "First"));
        assert_eq!((pages[1].number, pages[1].text.as_str()), (2, "Second"));
        Ok(())
    }

    #[test]
    fn empty_response_is_an_error() {
        let response = OcrResponse {
            pages: Some(Vec::new()),
            text: Some(" \u{000C} ".to_string()),
        };
        assert!(matches!(
            payload_to_pages(&response, "photo.png"),
            Err(IngestError::OcrFailed(_))
        ));
    }

    #[test]
    fn engine_requires_an_endpoint() -> Result<(), crate::error::ConfigError> {
        let settings = Settings::from_lookup(|_| None)?;
        assert!(HttpOcrEngine::from_settings(&settings).is_none());

        let settings = Settings::from_lookup(|key| match key {
            "LLM_OCR_ENDPOINT" => Some("http://localhost:9000/ocr".to_string()),
            "LLM_OCR_API_KEY" => Some("  ".to_string()),
            _ => None,
        })?;
        let engine = HttpOcrEngine::from_settings(&settings);
        assert!(engine.is_some_and(|engine| engine.api_key.is_none()));
        Ok(())
    }
}
