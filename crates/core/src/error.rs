use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("page {page} extraction failed: {reason}")]
    PageExtraction { page: u32, reason: String },

    #[error("image rasterization failed: {0}")]
    ImageRaster(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<image::ImageError> for IngestError {
    fn from(error: image::ImageError) -> Self {
        Self::ImageRaster(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding service returned {status}")]
    Status { status: u16 },

    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("unsupported chunk kind: {0}")]
    UnsupportedChunkKind(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("index has no embedded chunks")]
    EmptyIndex,

    #[error("query chunk has no embedding")]
    MissingQueryEmbedding,

    #[error("query vector has zero magnitude")]
    ZeroQueryVector,

    #[error("chunk {chunk_id} has {actual} dimensions, query has {expected}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("query encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("index store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid index key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    PageExtractionFailure,
    EncodingFailure,
    UnsupportedChunkKind,
    StoreFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::PageExtractionFailure => "page_extraction_failure",
            Self::EncodingFailure => "encoding_failure",
            Self::UnsupportedChunkKind => "unsupported_chunk_kind",
            Self::StoreFailure => "store_failure",
        };
        f.write_str(label)
    }
}

/// One isolated failure, reported next to whatever did succeed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub document_id: Option<String>,
    pub path: Option<PathBuf>,
    pub page_no: Option<u32>,
    pub chunk_id: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            document_id: None,
            path: None,
            page_no: None,
            chunk_id: None,
            message: message.into(),
        }
    }

    pub fn document(mut self, document_id: &str, path: impl Into<PathBuf>) -> Self {
        self.document_id = Some(document_id.to_string());
        self.path = Some(path.into());
        self
    }

    pub fn page(mut self, page_no: u32) -> Self {
        self.page_no = Some(page_no);
        self
    }

    pub fn chunk(mut self, chunk_id: &str) -> Self {
        self.chunk_id = Some(chunk_id.to_string());
        self
    }

    pub fn from_encode_error(error: &EncodeError) -> Self {
        let kind = match error {
            EncodeError::UnsupportedChunkKind(_) => FailureKind::UnsupportedChunkKind,
            _ => FailureKind::EncodingFailure,
        };
        Self::new(kind, error.to_string())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(path) = &self.path {
            write!(f, " {}", path.display())?;
        }
        if let Some(page_no) = self.page_no {
            write!(f, " page={page_no}")?;
        }
        if let Some(chunk_id) = &self.chunk_id {
            write!(f, " chunk={chunk_id}")?;
        }
        write!(f, ": {}", self.message)
    }
}
