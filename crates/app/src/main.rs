use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use polyrag_core::models::{
    DEFAULT_ANSWER_MODEL, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_COLLECTION,
    DEFAULT_EMBEDDING_MODEL, DEFAULT_OCR_LANGUAGE, DEFAULT_TOP_K,
};
use polyrag_core::services::DEFAULT_OLLAMA_URL;
use polyrag_core::{
    discover_documents, recommend_for, Answerer, BuildOptions, Collaborators, DevicePreference,
    Document, HttpOcrEngine, HttpSummarizer, HttpTranslator, LeadSummarizer, NoOcr, OcrEngine,
    OllamaAnswerer, PassthroughTranslator, Pipeline, PipelineConfig, PipelineError, QueryRequest,
    RetryPolicy, Summarizer, Translator, WhatlangDetector, DEFAULT_EMBEDDING_DIMENSIONS,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "polyrag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding persisted collections
    #[arg(long, env = "POLYRAG_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Collection name inside the data directory
    #[arg(long, env = "POLYRAG_COLLECTION", default_value = DEFAULT_COLLECTION, global = true)]
    collection: String,

    /// OCR service endpoint; image-only pages stay empty without it
    #[arg(long, env = "POLYRAG_OCR_URL", global = true)]
    ocr_url: Option<String>,

    /// Translation service endpoint; text is indexed untranslated without it
    #[arg(long, env = "POLYRAG_TRANSLATE_URL", global = true)]
    translate_url: Option<String>,

    /// Summarization service endpoint; falls back to the leading words of each page
    #[arg(long, env = "POLYRAG_SUMMARIZE_URL", global = true)]
    summarize_url: Option<String>,

    /// Bearer token sent to the OCR, translation and summarization services
    #[arg(long, env = "POLYRAG_SERVICE_API_KEY", global = true, hide_env_values = true)]
    service_api_key: Option<String>,

    /// Ollama base URL used for answering and `ollama/` embedding models
    #[arg(long, env = "POLYRAG_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL, global = true)]
    ollama_url: String,

    /// Per-document timeout for extraction and normalization
    #[arg(long, env = "POLYRAG_STEP_TIMEOUT_SECS", default_value = "300", global = true)]
    step_timeout_secs: u64,

    /// How long to wait for a concurrent build or restore
    #[arg(long, env = "POLYRAG_LOCK_WAIT_SECS", default_value = "30", global = true)]
    lock_wait_secs: u64,

    #[arg(long, env = "POLYRAG_EMBEDDING_DIM", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS, global = true)]
    embedding_dimensions: usize,

    #[arg(long, env = "POLYRAG_DEVICE", value_enum, default_value = "auto", global = true)]
    device: Device,

    /// Attempts for storage operations that hit a locked file
    #[arg(long, env = "POLYRAG_STORAGE_RETRIES", default_value = "5", global = true)]
    storage_retries: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum Device {
    Auto,
    Cpu,
    Accelerator,
}

impl From<Device> for DevicePreference {
    fn from(value: Device) -> Self {
        match value {
            Device::Auto => DevicePreference::Auto,
            Device::Cpu => DevicePreference::Cpu,
            Device::Accelerator => DevicePreference::Accelerator,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Extract, normalize, chunk and embed documents, replacing the stored index.
    Build {
        /// PDF or CSV files, or folders searched recursively.
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = DEFAULT_CHUNK_OVERLAP)]
        chunk_overlap: usize,
        #[arg(long, default_value = DEFAULT_EMBEDDING_MODEL)]
        embedding_model: String,
        /// Language of the documents; `eng` detects it per page.
        #[arg(long, default_value = DEFAULT_OCR_LANGUAGE)]
        ocr_language: String,
    },
    /// Retrieve the nearest chunks and answer a question about them.
    Query {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        /// Answering model served by Ollama.
        #[arg(long, default_value = DEFAULT_ANSWER_MODEL)]
        model: String,
        /// Only print the retrieved chunks.
        #[arg(long, default_value_t = false)]
        retrieve_only: bool,
    },
    /// Print whether an index is loaded and how many chunks it holds.
    Status,
    /// Suggest chunk size and overlap from the total size of the given files.
    Recommend {
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
    },
    /// Write the stored collection to a zip archive.
    Export {
        #[arg(long)]
        output: PathBuf,
    },
    /// Replace the stored collection with a zip archive and load it.
    Import {
        #[arg(long)]
        archive: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %cli.data_dir.display(),
        collection = %cli.collection,
        "polyrag boot"
    );

    // Sizing advice needs no index.
    if let Command::Recommend { files } = &cli.command {
        let outcome = load_documents(files).map(|documents| json!(recommend_for(&documents)));
        return render(outcome);
    }

    let config = PipelineConfig {
        data_dir: cli.data_dir.clone(),
        collection: cli.collection.clone(),
        step_timeout: Duration::from_secs(cli.step_timeout_secs),
        lock_wait: Duration::from_secs(cli.lock_wait_secs),
        embedding_dimensions: cli.embedding_dimensions,
        device: cli.device.into(),
        ollama_url: cli.ollama_url.clone(),
        retry: RetryPolicy {
            attempts: cli.storage_retries,
            ..RetryPolicy::default()
        },
    };

    let pipeline = match collaborators(&cli) {
        Ok(collaborators) => Pipeline::open(config, collaborators).await,
        Err(error) => Err(error),
    };
    let pipeline = match pipeline {
        Ok(pipeline) => pipeline,
        Err(error) => return render(Err(error)),
    };

    let outcome = run(&pipeline, cli.command).await;
    pipeline.shutdown().await;
    render(outcome)
}

fn collaborators(cli: &Cli) -> Result<Collaborators, PipelineError> {
    let api_key = cli.service_api_key.clone();

    let ocr: Arc<dyn OcrEngine> = match &cli.ocr_url {
        Some(url) => Arc::new(HttpOcrEngine::new(url, api_key.clone())?),
        None => Arc::new(NoOcr),
    };
    let translator: Arc<dyn Translator> = match &cli.translate_url {
        Some(url) => Arc::new(HttpTranslator::new(url, api_key.clone())?),
        None => {
            warn!("no translation endpoint configured, non-english pages are indexed as-is");
            Arc::new(PassthroughTranslator)
        }
    };
    let summarizer: Arc<dyn Summarizer> = match &cli.summarize_url {
        Some(url) => Arc::new(HttpSummarizer::new(url, api_key)?),
        None => Arc::new(LeadSummarizer),
    };
    let answerer: Arc<dyn Answerer> = Arc::new(OllamaAnswerer::new(&cli.ollama_url)?);

    Ok(Collaborators {
        detector: Arc::new(WhatlangDetector),
        ocr,
        translator,
        summarizer,
        answerer,
    })
}

async fn run(pipeline: &Pipeline, command: Command) -> Result<Value, PipelineError> {
    match command {
        Command::Build {
            files,
            chunk_size,
            chunk_overlap,
            embedding_model,
            ocr_language,
        } => {
            let documents = load_documents(&files)?;
            let options = BuildOptions {
                chunk_size,
                chunk_overlap,
                embedding_model,
                ocr_language,
            };
            let report = pipeline.build(documents, options).await?;
            info!(num_chunks = report.num_chunks, "build finished");
            Ok(json!(report))
        }
        Command::Query {
            prompt,
            top_k,
            model,
            retrieve_only,
        } => {
            if retrieve_only {
                let chunks = pipeline.retrieve(&prompt, top_k).await?;
                return Ok(json!({ "retrieved_chunks": chunks }));
            }
            let response = pipeline
                .query(QueryRequest {
                    prompt,
                    top_k,
                    model,
                })
                .await?;
            Ok(json!(response))
        }
        Command::Status => Ok(json!(pipeline.status())),
        Command::Export { output } => {
            let archive = pipeline.export_snapshot().await?;
            tokio::fs::write(&output, &archive).await?;
            Ok(json!({
                "collection": pipeline.store().collection(),
                "archive": output.display().to_string(),
                "bytes": archive.len(),
            }))
        }
        Command::Import { archive } => {
            let bytes = tokio::fs::read(&archive).await?;
            Ok(json!(pipeline.import_snapshot(bytes).await?))
        }
        Command::Recommend { files } => {
            let documents = load_documents(&files)?;
            Ok(json!(recommend_for(&documents)))
        }
    }
}

/// Reads every file, expanding folders into the PDFs and CSVs they contain.
fn load_documents(paths: &[PathBuf]) -> Result<Vec<Document>, PipelineError> {
    let mut documents = Vec::new();
    for path in paths {
        if path.is_dir() {
            for file in discover_documents(path) {
                documents.push(Document::from_path(&file)?);
            }
        } else {
            documents.push(Document::from_path(path)?);
        }
    }
    Ok(documents)
}

fn render(outcome: Result<Value, PipelineError>) -> anyhow::Result<ExitCode> {
    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            warn!(kind = error.kind().as_str(), %error, "operation failed");
            println!("{}", serde_json::to_string_pretty(&error.report())?);
            Ok(ExitCode::FAILURE)
        }
    }
}
