use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;
pub const DEFAULT_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_OCR_LANGUAGE: &str = "eng";
pub const DEFAULT_ANSWER_MODEL: &str = "qwen3:1.7b";
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_COLLECTION: &str = "rag_db";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Csv,
}

impl DocumentFormat {
    /// Resolves the format from the file extension, falling back to the PDF magic bytes.
    pub fn infer(name: &str, bytes: &[u8]) -> Result<Self, PipelineError> {
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("pdf") => Ok(Self::Pdf),
            Some("csv") => Ok(Self::Csv),
            None if bytes.starts_with(b"%PDF-") => Ok(Self::Pdf),
            _ => Err(PipelineError::UnsupportedFormat(format!(
                "unsupported file type: {name}"
            ))),
        }
    }
}

/// A named upload. Lives only for the duration of one build.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub bytes: Vec<u8>,
    pub format: Option<DocumentFormat>,
}

impl Document {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            format: None,
        }
    }

    pub fn with_format(mut self, format: DocumentFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                PipelineError::InvalidArgument(format!("path has no file name: {}", path.display()))
            })?;
        let bytes = std::fs::read(path)?;
        Ok(Self::new(name, bytes))
    }

    pub fn resolve_format(&self) -> Result<DocumentFormat, PipelineError> {
        match self.format {
            Some(format) => Ok(format),
            None => DocumentFormat::infer(&self.name, &self.bytes),
        }
    }
}

/// Raw text of one extracted unit, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedUnit {
    pub unit_index: usize,
    pub text: String,
    /// The page on its own as a one-page PDF, kept only when it has no text layer.
    pub page_pdf: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    pub source: String,
    /// 1-based position inside the source document.
    pub page_number: u32,
    /// 1-based position across every document of the build.
    pub ordinal: u32,
    pub original_language: String,
    pub content_original: String,
    pub content_en: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
    pub ocr_language: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            ocr_language: DEFAULT_OCR_LANGUAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildReport {
    pub status: String,
    pub num_chunks: usize,
    pub preview: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub prompt: String,
    pub top_k: usize,
    pub model: String,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            top_k: DEFAULT_TOP_K,
            model: DEFAULT_ANSWER_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResponse {
    pub answer: String,
    pub retrieved_chunks: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IndexStatus {
    pub ready: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RecommendedSettings {
    pub recommended_chunk_size: usize,
    pub recommended_chunk_overlap: usize,
    pub total_size_kb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMetadata {
    pub build_id: Uuid,
    pub collection: String,
    pub embedding_model: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
}
