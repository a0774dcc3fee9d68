use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rag_pipeline_core::config::VectorBackendKind;
use rag_pipeline_core::{
    mime_for_path, ExtractionRequest, ExtractionStrategy, MetadataFilter, QueryRequest,
    RagPipeline, Settings, SourceMetadata,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rag-pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Vector backend: qdrant or memory
    #[arg(long, env = "VECTOR_BACKEND")]
    vector_backend: Option<String>,

    /// Directory holding document records and stored uploads
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Parse, chunk and index one file.
    Ingest {
        /// File to ingest.
        path: PathBuf,
        /// MIME type; guessed from the extension when omitted.
        #[arg(long)]
        mime_type: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Reuse an id to replace an earlier ingest of the same document.
        #[arg(long)]
        document_id: Option<String>,
    },
    /// Fetch a web page and index its text.
    IngestUrl {
        url: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        document_id: Option<String>,
    },
    /// Ingest every supported file below a folder.
    IngestFolder {
        folder: PathBuf,
    },
    /// Search the index, optionally answering with the language model.
    Query {
        query: String,
        /// Collections to search; all configured collections when omitted.
        #[arg(long = "collection")]
        collections: Vec<String>,
        /// Restrict results to these documents.
        #[arg(long = "document-id")]
        document_ids: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Metadata filter as JSON, e.g. '{"format": "pdf"}'.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, default_value_t = false)]
        generate: bool,
    },
    /// Extract schema fields from a stored document.
    Extract {
        document_id: String,
        /// Schema as JSON, e.g. '{"title": "string"}'.
        #[arg(long, conflicts_with = "schema_file")]
        schema: Option<String>,
        #[arg(long)]
        schema_file: Option<PathBuf>,
        #[arg(long, default_value = "auto")]
        strategy: ExtractionStrategy,
        /// Prompt template with {schema_instructions} and {document_text}.
        #[arg(long)]
        prompt_template_file: Option<PathBuf>,
    },
    /// Remove a document from the index, object store and records.
    Delete {
        document_id: String,
    },
    /// Print the active configuration.
    Status,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(url) = &cli.qdrant_url {
        settings.qdrant_url = url.trim_end_matches('/').to_string();
    }
    if let Some(backend) = &cli.vector_backend {
        settings.vector_backend = backend
            .parse::<VectorBackendKind>()
            .map_err(anyhow::Error::msg)?;
    }
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    Ok(settings)
}

async fn read_schema(
    schema: Option<String>,
    schema_file: Option<PathBuf>,
) -> anyhow::Result<Map<String, Value>> {
    let raw = match (schema, schema_file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => anyhow::bail!("either --schema or --schema-file is required"),
    };
    match serde_json::from_str::<Value>(&raw).context("schema is not valid JSON")? {
        Value::Object(schema) => Ok(schema),
        _ => anyhow::bail!("schema must be a JSON object"),
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            return Err(error).context("failed to load .env");
        }
    }

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    if settings.vector_backend == VectorBackendKind::Memory {
        warn!("in-memory vector backend: the index is lost when the process exits");
    }

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "rag-pipeline boot"
    );
    let pipeline = RagPipeline::from_settings(&settings).await?;

    match cli.command {
        Command::Ingest {
            path,
            mime_type,
            description,
            document_id,
        } => {
            let mime_type = match mime_type {
                Some(mime_type) => mime_type,
                None => mime_for_path(&path)
                    .with_context(|| format!("cannot guess MIME type of {}", path.display()))?
                    .to_string(),
            };
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let source = SourceMetadata {
                filename: file_name(&path),
                description,
                document_id,
                source_path: Some(path.to_string_lossy().into_owned()),
                ..SourceMetadata::default()
            };
            let receipt = pipeline.ingest(&bytes, &mime_type, source).await?;
            print_json(&receipt)?;
        }
        Command::IngestUrl {
            url,
            description,
            document_id,
        } => {
            let source = SourceMetadata {
                description,
                document_id,
                ..SourceMetadata::default()
            };
            let receipt = pipeline.ingest_url(&url, source).await?;
            print_json(&receipt)?;
        }
        Command::IngestFolder { folder } => {
            let report = pipeline.ingest_folder(&folder).await?;
            for file in &report.ingested {
                println!(
                    "{} {} chunks={} status={:?}",
                    file.path.display(),
                    file.receipt.document_id,
                    file.receipt.chunk_count,
                    file.receipt.status
                );
            }
            for path in &report.unchanged {
                println!("{} unchanged", path.display());
            }
            if !report.skipped_files.is_empty() {
                warn!(
                    skipped = report.skipped_files.len(),
                    folder = %folder.display(),
                    "some files were skipped"
                );
                for skipped in &report.skipped_files {
                    println!("{} skipped: {}", skipped.path.display(), skipped.reason);
                }
            }
            println!(
                "{} ingested, {} unchanged, {} skipped at {}",
                report.ingested.len(),
                report.unchanged.len(),
                report.skipped_files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Query {
            query,
            collections,
            document_ids,
            top_k,
            filter,
            generate,
        } => {
            let filter = match filter {
                Some(raw) => {
                    let value: Value =
                        serde_json::from_str(&raw).context("filter is not valid JSON")?;
                    Some(
                        MetadataFilter::from_json(&value)
                            .context("filter must be a JSON object")?,
                    )
                }
                None => None,
            };
            let mut request = QueryRequest::new(query);
            request.retrieval.collections = collections;
            request.retrieval.document_ids = document_ids;
            request.retrieval.top_k = top_k;
            request.retrieval.filter = filter;
            request.generate = generate;

            print_json(&pipeline.query(&request).await)?;
        }
        Command::Extract {
            document_id,
            schema,
            schema_file,
            strategy,
            prompt_template_file,
        } => {
            let schema = read_schema(schema, schema_file).await?;
            let prompt_template = match prompt_template_file {
                Some(path) => Some(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => None,
            };
            let result = pipeline
                .extract_structured(&ExtractionRequest {
                    document_id,
                    schema,
                    strategy,
                    prompt_template,
                })
                .await;
            print_json(&result)?;
        }
        Command::Delete { document_id } => {
            pipeline.delete_document(&document_id).await?;
            println!("document {document_id} deleted");
        }
        Command::Status => {
            print_json(&pipeline.describe())?;
        }
    }

    Ok(())
}
