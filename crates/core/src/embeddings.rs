use crate::error::{EncodeError, Failure};
use crate::models::{Document, ImageChunk, MediaType, TextChunk};
use crate::traits::EmbeddingService;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_ENCODE_CONCURRENCY: usize = 8;
pub const DEFAULT_ENCODE_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_ENDPOINT: &str = "/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum EmbedPayload {
    Text { text: String },
    Url { url: String },
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub endpoint: Url,
    pub token: Option<String>,
    pub concurrency: usize,
    pub timeout: Duration,
    pub dimensions: Option<usize>,
}

impl EmbeddingConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            token: None,
            concurrency: DEFAULT_ENCODE_CONCURRENCY,
            timeout: DEFAULT_ENCODE_TIMEOUT,
            dimensions: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    data: [&'a EmbedPayload; 1],
    #[serde(rename = "execEndpoint")]
    exec_endpoint: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddedItem>,
}

#[derive(Deserialize)]
struct EmbeddedItem {
    embedding: Vec<f32>,
}

fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

pub struct HttpEmbeddingService {
    client: Client,
    endpoint: Url,
    authorization: Option<String>,
}

impl HttpEmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EncodeError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            authorization: config.token.as_deref().map(bearer),
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, payload: &EmbedPayload) -> Result<Vec<f32>, EncodeError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&EmbedRequest {
            data: [payload],
            exec_endpoint: EXEC_ENDPOINT,
        });
        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EncodeError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let parsed: EmbedResponse = serde_json::from_slice(&body)
            .map_err(|error| EncodeError::MalformedResponse(error.to_string()))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| EncodeError::MalformedResponse("empty data array".to_string()))?;

        if embedding.is_empty() {
            return Err(EncodeError::MalformedResponse("empty embedding".to_string()));
        }
        Ok(embedding)
    }
}

pub trait Encodable: Send {
    fn chunk_id(&self) -> &str;
    fn payload(&self) -> Result<EmbedPayload, EncodeError>;
    fn has_embedding(&self) -> bool;
    fn set_embedding(&mut self, embedding: Vec<f32>);
}

impl Encodable for TextChunk {
    fn chunk_id(&self) -> &str {
        &self.id
    }

    fn payload(&self) -> Result<EmbedPayload, EncodeError> {
        match self.tags.media_type {
            MediaType::Text | MediaType::Table => Ok(EmbedPayload::Text {
                text: self.text.clone(),
            }),
            other => Err(EncodeError::UnsupportedChunkKind(format!(
                "{other} chunk carries text"
            ))),
        }
    }

    fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    fn set_embedding(&mut self, embedding: Vec<f32>) {
        self.embedding = Some(embedding);
    }
}

impl Encodable for ImageChunk {
    fn chunk_id(&self) -> &str {
        &self.id
    }

    fn payload(&self) -> Result<EmbedPayload, EncodeError> {
        match self.tags.media_type {
            MediaType::Image => Ok(EmbedPayload::Url {
                url: self.url.clone(),
            }),
            other => Err(EncodeError::UnsupportedChunkKind(format!(
                "{other} chunk carries an image"
            ))),
        }
    }

    fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    fn set_embedding(&mut self, embedding: Vec<f32>) {
        self.embedding = Some(embedding);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub include_images: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            include_images: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct EncodingReport {
    pub encoded: usize,
    pub skipped: usize,
    pub failures: Vec<Failure>,
    pub cancelled: bool,
}

impl EncodingReport {
    fn merge(&mut self, other: EncodingReport) {
        self.encoded += other.encoded;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }
}

enum Outcome {
    Encoded,
    Skipped,
    Failed(Failure),
}

pub struct EmbeddingEncoder<S> {
    service: S,
    concurrency: usize,
    // set from config, or by the first vector accepted
    dimensions: OnceLock<usize>,
}

impl EmbeddingEncoder<HttpEmbeddingService> {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EncodeError> {
        Ok(Self::new(HttpEmbeddingService::new(config)?, config))
    }
}

impl<S: EmbeddingService> EmbeddingEncoder<S> {
    pub fn new(service: S, config: &EmbeddingConfig) -> Self {
        Self {
            service,
            concurrency: config.concurrency.max(1),
            dimensions: config.dimensions.map(OnceLock::from).unwrap_or_default(),
        }
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions.get().copied()
    }

    /// Fixes the vector length every later embedding must have.
    pub fn lock_dimensions(&self, len: usize) -> Result<(), EncodeError> {
        let expected = *self.dimensions.get_or_init(|| len);
        if expected != len {
            return Err(EncodeError::DimensionMismatch {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    pub async fn encode_chunk(&self, chunk: &mut dyn Encodable) -> Result<(), EncodeError> {
        let payload = chunk.payload()?;
        let embedding = self.service.embed(&payload).await?;
        self.lock_dimensions(embedding.len())?;
        chunk.set_embedding(embedding);
        Ok(())
    }

    pub async fn encode_query(&self, text: &str) -> Result<TextChunk, EncodeError> {
        let mut query = TextChunk::query(text);
        self.encode_chunk(&mut query).await?;
        Ok(query)
    }

    pub async fn encode_document(
        &self,
        document: &mut Document,
        options: EncodeOptions,
    ) -> EncodingReport {
        let Document {
            id,
            path,
            texts,
            tables,
            images,
            ..
        } = document;
        let mut report = EncodingReport::default();

        let mut targets: Vec<&mut dyn Encodable> = Vec::with_capacity(texts.len() + tables.len());
        targets.extend(texts.iter_mut().map(|chunk| chunk as &mut dyn Encodable));
        targets.extend(tables.iter_mut().map(|chunk| chunk as &mut dyn Encodable));
        if options.include_images {
            targets.extend(images.iter_mut().map(|chunk| chunk as &mut dyn Encodable));
        } else {
            report.skipped += images.len();
        }

        info!(path = %path.display(), chunks = targets.len(), "encoding document");

        let outcomes = stream::iter(targets)
            .map(|chunk| async move {
                if chunk.has_embedding() {
                    return Outcome::Skipped;
                }
                let chunk_id = chunk.chunk_id().to_string();
                match self.encode_chunk(chunk).await {
                    Ok(()) => Outcome::Encoded,
                    Err(error) => {
                        warn!(chunk_id = %chunk_id, %error, "chunk not encoded");
                        Outcome::Failed(Failure::from_encode_error(&error).chunk(&chunk_id))
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Encoded => report.encoded += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed(failure) => report.failures.push(failure.document(id, path.as_path())),
            }
        }
        report
    }

    pub async fn encode_batch(
        &self,
        documents: &mut [Document],
        options: EncodeOptions,
        cancel: &CancellationToken,
    ) -> EncodingReport {
        let mut report = EncodingReport::default();
        for document in documents.iter_mut() {
            if cancel.is_cancelled() {
                info!("encoding cancelled");
                report.cancelled = true;
                break;
            }
            report.merge(self.encode_document(document, options).await);
        }

        info!(
            encoded = report.encoded,
            skipped = report.skipped,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "encoding batch finished"
        );
        report
    }
}
