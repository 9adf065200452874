use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable tag carried by every structured error payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    InvalidChunkConfig,
    EmptyInput,
    NoContent,
    IndexNotReady,
    CorruptIndex,
    TransientResourceBusy,
    ExternalServiceFailure,
    InvalidArgument,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::InvalidChunkConfig => "invalid_chunk_config",
            ErrorKind::EmptyInput => "empty_input",
            ErrorKind::NoContent => "no_content",
            ErrorKind::IndexNotReady => "index_not_ready",
            ErrorKind::CorruptIndex => "corrupt_index",
            ErrorKind::TransientResourceBusy => "transient_resource_busy",
            ErrorKind::ExternalServiceFailure => "external_service_failure",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("nothing to index: {0}")]
    EmptyInput(String),

    #[error("no usable text in any document: {0}")]
    NoContent(String),

    #[error("index not ready: {0}")]
    IndexNotReady(String),

    #[error("corrupt index snapshot: {0}")]
    CorruptIndex(String),

    #[error("resource busy: {0}")]
    TransientResourceBusy(String),

    #[error("{service} call failed: {details}")]
    ExternalService { service: String, details: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn external(service: impl Into<String>, details: impl ToString) -> Self {
        Self::ExternalService {
            service: service.into(),
            details: details.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            PipelineError::InvalidChunkConfig(_) => ErrorKind::InvalidChunkConfig,
            PipelineError::EmptyInput(_) => ErrorKind::EmptyInput,
            PipelineError::NoContent(_) => ErrorKind::NoContent,
            PipelineError::IndexNotReady(_) => ErrorKind::IndexNotReady,
            PipelineError::CorruptIndex(_) | PipelineError::Archive(_) => ErrorKind::CorruptIndex,
            PipelineError::TransientResourceBusy(_) => ErrorKind::TransientResourceBusy,
            PipelineError::ExternalService { .. }
            | PipelineError::Http(_)
            | PipelineError::Url(_) => ErrorKind::ExternalServiceFailure,
            PipelineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PipelineError::PdfParse(_) | PipelineError::Csv(_) => ErrorKind::UnsupportedFormat,
            PipelineError::Io(_)
            | PipelineError::Serialization(_)
            | PipelineError::Regex(_)
            | PipelineError::Task(_) => ErrorKind::Internal,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            detail: self.to_string(),
        }
    }
}

/// Structured failure payload returned by every operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&PipelineError> for ErrorReport {
    fn from(value: &PipelineError) -> Self {
        value.report()
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
