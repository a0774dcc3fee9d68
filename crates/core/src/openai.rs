//! Wire client shared by the OpenAI and Azure OpenAI chat and embedding providers.

use crate::config::{LlmProviderKind, Settings};
use crate::error::ProviderError;
use crate::traits::LanguageModel;
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where requests go and how they authenticate.
#[derive(Debug, Clone)]
pub enum OpenAiEndpoint {
    OpenAi {
        base_url: String,
        api_key: String,
    },
    Azure {
        endpoint: String,
        api_key: String,
        api_version: String,
    },
}

impl OpenAiEndpoint {
    pub fn openai(settings: &Settings) -> Result<Self, ProviderError> {
        let api_key = required(settings.openai_api_key.as_deref(), "openai", "OPENAI_API_KEY")?;
        Ok(Self::OpenAi {
            base_url: settings.openai_base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn azure(settings: &Settings) -> Result<Self, ProviderError> {
        let api_key = required(
            settings.azure_openai_api_key.as_deref(),
            "azure",
            "AZURE_OPENAI_API_KEY",
        )?;
        let endpoint = required(
            settings.azure_openai_endpoint.as_deref(),
            "azure",
            "AZURE_OPENAI_ENDPOINT",
        )?;
        Ok(Self::Azure {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            api_version: settings.azure_openai_api_version.clone(),
        })
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Azure { .. } => "azure",
        }
    }

    /// `target` is the model name for OpenAI and the deployment name for Azure.
    pub fn url(&self, target: &str, operation: &str) -> String {
        match self {
            Self::OpenAi { base_url, .. } => format!("{base_url}/{operation}"),
            Self::Azure {
                endpoint,
                api_version,
                ..
            } => format!(
                "{endpoint}/openai/deployments/{target}/{operation}?api-version={api_version}"
            ),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::OpenAi { api_key, .. } => request.bearer_auth(api_key),
            Self::Azure { api_key, .. } => request.header("api-key", api_key),
        }
    }
}

fn required(value: Option<&str>, provider: &str, setting: &str) -> Result<String, ProviderError> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MissingCredentials {
            provider: provider.to_string(),
            setting: setting.to_string(),
        })
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: OpenAiEndpoint,
}

impl OpenAiClient {
    pub fn new(endpoint: OpenAiEndpoint) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &OpenAiEndpoint {
        &self.endpoint
    }

    pub fn provider(&self) -> &'static str {
        self.endpoint.provider()
    }

    pub(crate) async fn post<B, R>(
        &self,
        target: &str,
        operation: &str,
        body: &B,
    ) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint.url(target, operation);
        debug!(provider = self.provider(), %url, "posting request");

        let response = self
            .endpoint
            .authorize(self.http.post(&url))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|parsed| parsed.error.message)
                .unwrap_or(text);
            return Err(ProviderError::Api {
                provider: self.provider().to_string(),
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|error| ProviderError::InvalidResponse {
                provider: self.provider().to_string(),
                details: error.to_string(),
            })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Chat-completions model at temperature zero.
#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    client: OpenAiClient,
    /// Model name for OpenAI, deployment name for Azure.
    target: String,
    label: String,
}

impl OpenAiChatModel {
    pub fn new(client: OpenAiClient, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            label: format!("{}:{target}", client.provider()),
            client,
            target,
        }
    }

    pub fn from_settings(kind: LlmProviderKind, settings: &Settings) -> Result<Self, ProviderError> {
        match kind {
            LlmProviderKind::OpenAi => Ok(Self::new(
                OpenAiClient::new(OpenAiEndpoint::openai(settings)?),
                settings.openai_model.clone(),
            )),
            LlmProviderKind::Azure => {
                let endpoint = OpenAiEndpoint::azure(settings)?;
                let deployment = required(
                    settings.azure_openai_deployment.as_deref(),
                    "azure",
                    "AZURE_OPENAI_DEPLOYMENT",
                )?;
                Ok(Self::new(OpenAiClient::new(endpoint), deployment))
            }
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let model = match self.client.endpoint() {
            OpenAiEndpoint::OpenAi { .. } => Some(self.target.as_str()),
            OpenAiEndpoint::Azure { .. } => None,
        };
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
        };

        let response: ChatResponse = self
            .client
            .post(&self.target, "chat/completions", &request)
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.client.provider().to_string(),
                details: "response contained no message content".to_string(),
            })
    }
}
