//! Process settings, read once at startup from the environment.

use crate::chunking::{BreakpointThreshold, ChunkingConfig, ChunkingStrategy};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    OpenAi,
    Azure,
}

impl LlmProviderKind {
    /// The provider tried when the configured one fails to initialise.
    pub fn other(self) -> Self {
        match self {
            Self::OpenAi => Self::Azure,
            Self::Azure => Self::OpenAi,
        }
    }
}

impl FromStr for LlmProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            other => Err(format!("unknown provider '{other}', expected 'openai' or 'azure'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    OpenAi,
    Azure,
    /// Deterministic character n-gram hashing; needs no network.
    Local,
}

impl FromStr for EmbeddingProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "local" => Ok(Self::Local),
            other => Err(format!(
                "unknown embedding provider '{other}', expected 'openai', 'azure' or 'local'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackendKind {
    Qdrant,
    Memory,
}

impl FromStr for VectorBackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "qdrant" => Ok(Self::Qdrant),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown vector backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub chunking_strategy: ChunkingStrategy,
    pub chunk_separators: Vec<String>,
    pub semantic_breakpoint: BreakpointThreshold,
    pub min_chunk_size: usize,

    pub llm_provider: LlmProviderKind,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub azure_openai_api_key: Option<String>,
    pub azure_openai_endpoint: Option<String>,
    pub azure_openai_deployment: Option<String>,
    pub azure_openai_api_version: String,

    pub embedding_provider: EmbeddingProviderKind,
    pub embedding_model: String,
    pub azure_embedding_deployment: Option<String>,
    pub embedding_dimensions: usize,

    pub vector_backend: VectorBackendKind,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,

    /// Logical collection name to physical collection name.
    pub collections: BTreeMap<String, String>,
    pub max_retrieved_documents: usize,

    pub scraping_timeout_secs: u64,
    pub max_upload_size: usize,
    pub supported_document_types: Vec<String>,
    pub supported_image_types: Vec<String>,

    pub ocr_endpoint: Option<String>,
    pub ocr_api_key: Option<String>,

    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            chunking_strategy: ChunkingStrategy::Recursive,
            chunk_separators: ChunkingConfig::default_separators(),
            semantic_breakpoint: BreakpointThreshold::Percentile,
            min_chunk_size: 100,
            llm_provider: LlmProviderKind::OpenAi,
            openai_api_key: None,
            openai_model: "gpt-4o".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            azure_openai_api_key: None,
            azure_openai_endpoint: None,
            azure_openai_deployment: None,
            azure_openai_api_version: "2023-05-15".to_string(),
            embedding_provider: EmbeddingProviderKind::OpenAi,
            embedding_model: "text-embedding-3-large".to_string(),
            azure_embedding_deployment: None,
            embedding_dimensions: 3_072,
            vector_backend: VectorBackendKind::Qdrant,
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_api_key: None,
            collections: [
                ("documents", "documents"),
                ("images", "images"),
                ("web_pages", "web_pages"),
            ]
            .into_iter()
            .map(|(logical, physical)| (logical.to_string(), physical.to_string()))
            .collect(),
            max_retrieved_documents: 5,
            scraping_timeout_secs: 30,
            max_upload_size: 10 * 1024 * 1024,
            supported_document_types: ["pdf", "docx", "txt", "md", "csv", "xlsx", "json", "html"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            supported_image_types: ["jpg", "jpeg", "png", "gif", "bmp", "webp"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            ocr_endpoint: None,
            ocr_api_key: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut settings = Self::default();

        if let Some(value) = get("CHUNK_SIZE") {
            settings.chunk_size = parse_number("CHUNK_SIZE", &value)?;
        }
        if let Some(value) = get("CHUNK_OVERLAP") {
            settings.chunk_overlap = parse_number("CHUNK_OVERLAP", &value)?;
        }
        if let Some(value) = get("CHUNKING_STRATEGY") {
            settings.chunking_strategy = ChunkingStrategy::parse_lenient(&value);
        }
        if let Some(value) = get("CHUNK_SEPARATORS") {
            settings.chunk_separators = parse_json("CHUNK_SEPARATORS", &value)?;
        }
        if let Some(value) = get("SEMANTIC_BREAKPOINT_TYPE") {
            settings.semantic_breakpoint = parse_enum("SEMANTIC_BREAKPOINT_TYPE", &value)?;
        }
        if let Some(value) = get("MIN_CHUNK_SIZE") {
            settings.min_chunk_size = parse_number("MIN_CHUNK_SIZE", &value)?;
        }

        if let Some(value) = get("LLM_PROVIDER") {
            settings.llm_provider = parse_enum("LLM_PROVIDER", &value)?;
        }
        settings.openai_api_key = get("OPENAI_API_KEY");
        if let Some(value) = get("OPENAI_MODEL") {
            settings.openai_model = value;
        }
        if let Some(value) = get("OPENAI_BASE_URL") {
            settings.openai_base_url = value.trim_end_matches('/').to_string();
        }
        settings.azure_openai_api_key = get("AZURE_OPENAI_API_KEY");
        settings.azure_openai_endpoint = get("AZURE_OPENAI_ENDPOINT");
        settings.azure_openai_deployment = get("AZURE_OPENAI_DEPLOYMENT");
        if let Some(value) = get("AZURE_OPENAI_API_VERSION") {
            settings.azure_openai_api_version = value;
        }

        if let Some(value) = get("EMBEDDING_PROVIDER") {
            settings.embedding_provider = parse_enum("EMBEDDING_PROVIDER", &value)?;
        }
        if let Some(value) = get("EMBEDDING_MODEL") {
            settings.embedding_model = value;
        }
        settings.azure_embedding_deployment = get("AZURE_EMBEDDING_DEPLOYMENT");
        if let Some(value) = get("EMBEDDING_MODEL_DIMENSIONS") {
            settings.embedding_dimensions = parse_number("EMBEDDING_MODEL_DIMENSIONS", &value)?;
        }

        if let Some(value) = get("VECTOR_BACKEND") {
            settings.vector_backend = parse_enum("VECTOR_BACKEND", &value)?;
        }
        if let Some(value) = get("QDRANT_URL") {
            settings.qdrant_url = value.trim_end_matches('/').to_string();
        }
        settings.qdrant_api_key = get("QDRANT_API_KEY");

        if let Some(value) = get("COLLECTIONS") {
            settings.collections = parse_json("COLLECTIONS", &value)?;
        }
        if let Some(value) = get("MAX_RETRIEVED_DOCUMENTS") {
            settings.max_retrieved_documents = parse_number("MAX_RETRIEVED_DOCUMENTS", &value)?;
        }
        if let Some(value) = get("SCRAPING_TIMEOUT") {
            settings.scraping_timeout_secs = parse_number("SCRAPING_TIMEOUT", &value)?;
        }
        if let Some(value) = get("MAX_UPLOAD_SIZE") {
            settings.max_upload_size = parse_number("MAX_UPLOAD_SIZE", &value)?;
        }
        if let Some(value) = get("SUPPORTED_DOCUMENT_TYPES") {
            settings.supported_document_types = parse_list(&value);
        }
        if let Some(value) = get("SUPPORTED_IMAGE_TYPES") {
            settings.supported_image_types = parse_list(&value);
        }

        settings.ocr_endpoint = get("LLM_OCR_ENDPOINT");
        settings.ocr_api_key = get("LLM_OCR_API_KEY");
        if let Some(value) = get("DATA_DIR") {
            settings.data_dir = PathBuf::from(value);
        }

        settings.chunking_config().validate()?;
        if settings.max_retrieved_documents == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_RETRIEVED_DOCUMENTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(settings)
    }

    pub fn chunking_config(&self) -> ChunkingConfig {
        ChunkingConfig {
            strategy: self.chunking_strategy,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            separators: self.chunk_separators.clone(),
            breakpoint_threshold: self.semantic_breakpoint,
            min_chunk_size: self.min_chunk_size,
            tokenizer_model: self.tokenizer_model(),
        }
    }

    /// Tokenizer model family for token-bounded chunking. Azure deployments are
    /// free-form names, so they are mapped onto a base model.
    pub fn tokenizer_model(&self) -> String {
        match (self.llm_provider, &self.azure_openai_deployment) {
            (LlmProviderKind::Azure, Some(deployment)) => map_azure_deployment(deployment),
            _ => self.openai_model.clone(),
        }
    }

    /// Physical name for a logical collection; unknown names pass through.
    pub fn collection(&self, logical: &str) -> String {
        self.collections
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }

    pub fn all_collections(&self) -> Vec<String> {
        self.collections.values().cloned().collect()
    }

    pub fn supported_extensions(&self) -> Vec<String> {
        self.supported_document_types
            .iter()
            .chain(self.supported_image_types.iter())
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect()
    }
}

pub fn map_azure_deployment(deployment: &str) -> String {
    let lowered = deployment.to_ascii_lowercase();
    let model = if lowered.contains("gpt-4o") || lowered.contains("gpt4o") {
        "gpt-4o"
    } else if lowered.contains("gpt-4-turbo") || lowered.contains("gpt4-turbo") {
        "gpt-4-turbo"
    } else if lowered.contains("gpt-4-32k") || lowered.contains("gpt4-32k") {
        "gpt-4-32k"
    } else if lowered.contains("gpt-4") || lowered.contains("gpt4") {
        "gpt-4"
    } else if lowered.contains("gpt-35") || lowered.contains("gpt-3.5") {
        "gpt-3.5-turbo"
    } else {
        "gpt-4"
    };
    model.to_string()
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|error: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: error.to_string(),
    })
}

fn parse_enum<T: FromStr<Err = String>>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|message| ConfigError::Invalid {
        key: key.to_string(),
        message,
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_str(value).map_err(|error| ConfigError::Invalid {
        key: key.to_string(),
        message: error.to_string(),
    })
}

/// Accepts either a JSON list or a comma separated string.
fn parse_list(value: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(value).unwrap_or_else(|_| {
        value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}
