pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod language;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod services;
pub mod snapshot;

pub use chunking::{chunk, chunk_with, recommend_for, recommend_settings, ChunkingConfig};
pub use embeddings::{
    CharacterNgramEmbedder, ComputeDevice, DevicePreference, EmbeddingProvider, EmbeddingRegistry,
    OllamaEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ErrorKind, ErrorReport, PipelineError};
pub use extractor::{discover_documents, TextExtractor};
pub use index::{IndexEntry, VectorIndex};
pub use language::{resolve_language, Language, LanguageDetector, WhatlangDetector};
pub use models::{
    BuildOptions, BuildReport, Document, DocumentFormat, ExtractedUnit, IndexMetadata,
    IndexStatus, Page, QueryRequest, QueryResponse, RecommendedSettings,
};
pub use normalizer::{PageInput, PageNormalizer};
pub use orchestrator::{Collaborators, HandlePhase, Pipeline, PipelineConfig};
pub use services::{
    Answerer, HttpOcrEngine, HttpSummarizer, HttpTranslator, LeadSummarizer, NoOcr, OcrEngine,
    OcrRequest, OllamaAnswerer, PassthroughTranslator, Summarizer, Translator,
};
pub use snapshot::{RetryPolicy, SnapshotStore};
