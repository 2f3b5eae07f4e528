use crate::embeddings::{EmbeddingEncoder, EncodeOptions, EncodingReport};
use crate::error::{Failure, FailureKind, IngestError, SearchError};
use crate::ingest::{digest_file, ExtractionCoordinator, ExtractionReport};
use crate::models::{ChunkRef, Document};
use crate::similarity::{search, ScoredChunk};
use crate::store::{index_key, ChunkIndex};
use crate::traits::{EmbeddingService, IndexStore};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Extract,
    Print,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "/extract",
            Self::Print => "/print",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "/extract" | "extract" => Ok(Self::Extract),
            "/print" | "print" => Ok(Self::Print),
            other => Err(format!("unknown endpoint `{other}`")),
        }
    }
}

pub async fn handle_batch(
    coordinator: &ExtractionCoordinator,
    endpoint: Endpoint,
    documents: Vec<Document>,
    cancel: &CancellationToken,
) -> Result<ExtractionReport, IngestError> {
    match endpoint {
        Endpoint::Extract => Ok(coordinator.extract_batch(documents, cancel).await),
        Endpoint::Print => {
            let first = documents.into_iter().next().ok_or_else(|| {
                IngestError::InvalidArgument("print needs at least one document".to_string())
            })?;
            debug!(
                id = %first.id,
                path = %first.path.display(),
                title = ?first.title,
                chunks = first.chunk_count(),
                "print endpoint"
            );
            Ok(ExtractionReport {
                documents: vec![first],
                failures: Vec::new(),
                cancelled: false,
            })
        }
    }
}

#[derive(Debug)]
pub struct IndexOutcome {
    pub key: String,
    pub index: ChunkIndex,
    pub cached: bool,
    pub cancelled: bool,
    pub failures: Vec<Failure>,
}

pub struct Pipeline<S, I> {
    coordinator: ExtractionCoordinator,
    encoder: EmbeddingEncoder<S>,
    store: I,
    encode_options: EncodeOptions,
}

impl<S, I> Pipeline<S, I>
where
    S: EmbeddingService,
    I: IndexStore,
{
    pub fn new(coordinator: ExtractionCoordinator, encoder: EmbeddingEncoder<S>, store: I) -> Self {
        Self {
            coordinator,
            encoder,
            store,
            encode_options: EncodeOptions::default(),
        }
    }

    pub fn with_encode_options(mut self, options: EncodeOptions) -> Self {
        self.encode_options = options;
        self
    }

    pub async fn handle(
        &self,
        endpoint: Endpoint,
        documents: Vec<Document>,
        cancel: &CancellationToken,
    ) -> Result<ExtractionReport, IngestError> {
        handle_batch(&self.coordinator, endpoint, documents, cancel).await
    }

    pub async fn encode(
        &self,
        documents: &mut [Document],
        cancel: &CancellationToken,
    ) -> EncodingReport {
        self.encoder
            .encode_batch(documents, self.encode_options, cancel)
            .await
    }

    /// Loads the index for these PDFs if one was persisted, otherwise extracts,
    /// encodes and persists it. A loaded index gets its missing embeddings
    /// filled in. Store errors are reported as failures, never fatal.
    pub async fn index_documents(
        &self,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<IndexOutcome, SearchError> {
        let mut failures = Vec::new();
        let mut readable = Vec::with_capacity(paths.len());
        let mut digests = Vec::with_capacity(paths.len());

        for path in paths {
            match digest_file(path) {
                Ok(digest) => {
                    readable.push(path.clone());
                    digests.push(digest);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "pdf unreadable");
                    let mut failure = Failure::new(FailureKind::SourceUnavailable, error.to_string());
                    failure.path = Some(path.clone());
                    failures.push(failure);
                }
            }
        }

        let key = index_key(&digests, self.coordinator.options());

        let persisted = match self.store.load(&key).await {
            Ok(persisted) => persisted,
            Err(error) => {
                warn!(key = %key, %error, "persisted index unusable, rebuilding");
                failures.push(Failure::new(FailureKind::StoreFailure, error.to_string()));
                None
            }
        };

        if let Some(mut index) = persisted {
            info!(key = %key, chunks = index.len(), "using persisted index");
            failures.extend(index.failures.iter().cloned());
            let stored = index.chunks().find_map(|chunk| chunk.embedding().map(<[f32]>::len));
            if let Some(len) = stored {
                if let Err(error) = self.encoder.lock_dimensions(len) {
                    warn!(key = %key, %error, "persisted embeddings disagree with the encoder");
                    failures.push(Failure::from_encode_error(&error));
                }
            }

            let report = self.encode(&mut index.documents, cancel).await;
            if report.encoded > 0 {
                self.persist_or_report(&key, &index, &mut failures).await;
            }
            failures.extend(report.failures);
            return Ok(IndexOutcome {
                key,
                index,
                cached: true,
                cancelled: report.cancelled,
                failures,
            });
        }

        let documents = readable.into_iter().map(Document::new).collect();
        let extraction = self.coordinator.extract_batch(documents, cancel).await;
        let mut index = ChunkIndex::new(extraction.documents);
        index.failures = extraction.failures;
        failures.extend(index.failures.iter().cloned());

        if extraction.cancelled {
            return Ok(IndexOutcome {
                key,
                index,
                cached: false,
                cancelled: true,
                failures,
            });
        }

        let report = self.encode(&mut index.documents, cancel).await;
        failures.extend(report.failures);
        self.persist_or_report(&key, &index, &mut failures).await;

        Ok(IndexOutcome {
            key,
            index,
            cached: false,
            cancelled: report.cancelled,
            failures,
        })
    }

    async fn persist_or_report(&self, key: &str, index: &ChunkIndex, failures: &mut Vec<Failure>) {
        if let Err(error) = self.store.persist(key, index).await {
            warn!(key = %key, %error, "index not persisted");
            failures.push(Failure::new(FailureKind::StoreFailure, error.to_string()));
        }
    }

    pub async fn query<'a>(
        &self,
        index: &'a ChunkIndex,
        text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk<'a>>, SearchError> {
        let query = self.encoder.encode_query(text).await?;
        search(ChunkRef::Text(&query), index, k)
    }
}
