use crate::error::{Failure, StoreError};
use crate::models::{ChunkRef, ContentKind, Document, ExtractionOptions};
use crate::traits::IndexStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkIndex {
    pub created_at: DateTime<Utc>,
    pub documents: Vec<Document>,
    /// Extraction failures from the build, reported again on every load.
    #[serde(default)]
    pub failures: Vec<Failure>,
}

impl ChunkIndex {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            created_at: Utc::now(),
            documents,
            failures: Vec::new(),
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkRef<'_>> {
        self.documents.iter().flat_map(Document::chunks)
    }

    pub fn len(&self) -> usize {
        self.documents.iter().map(Document::chunk_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn embedded_len(&self) -> usize {
        self.documents.iter().map(Document::embedded_count).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn index_key(digests: &[String], options: &ExtractionOptions) -> String {
    let mut sorted = digests.iter().map(String::as_str).collect::<Vec<_>>();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for digest in sorted {
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    for kind in &options.kinds {
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b",");
    }
    if options.enabled(ContentKind::Image) {
        hasher.update(options.raster_dpi.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct FileIndexStore {
    dir: PathBuf,
}

impl FileIndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl IndexStore for FileIndexStore {
    async fn persist(&self, key: &str, index: &ChunkIndex) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let bytes = index.to_bytes()?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &path).await?;

        info!(
            path = %path.display(),
            chunks = index.len(),
            embedded = index.embedded_len(),
            "index persisted"
        );
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<ChunkIndex>, StoreError> {
        let path = self.path_for(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted index");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        let index = ChunkIndex::from_bytes(&bytes)?;
        info!(path = %path.display(), chunks = index.len(), "index loaded");
        Ok(Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::models::{ImageChunk, ImageTensor, MediaType, Tags, TextChunk};
    use tempfile::tempdir;

    fn sample_index() -> ChunkIndex {
        let mut document = Document::new("/data/report.pdf");
        document.title = Some("Report".to_string());
        document.creation_date = Some("D:20230405101500Z".to_string());

        let mut text = TextChunk::new(&document, MediaType::Text, 1, "First page".to_string());
        text.embedding = Some(vec![0.1, -0.2, 0.3]);
        let table = TextChunk::new(&document, MediaType::Table, 2, "\"a\",1\r\n".to_string());
        let image = ImageChunk {
            id: "image-1".to_string(),
            tags: Tags::for_page(&document, MediaType::Image, 1),
            url: "/tmp/pdf_chunk_x.png".to_string(),
            tensor: ImageTensor {
                width: 2,
                height: 1,
                channels: 3,
                data: vec![1, 2, 3, 250, 251, 252],
            },
            ocr_caption: Some("a chart".to_string()),
            embedding: Some(vec![f32::MIN_POSITIVE, 1.0e-7, 3.4e38]),
        };

        document.texts.push(text);
        document.tables.push(table);
        document.images.push(image);
        let mut index = ChunkIndex::new(vec![document, Document::new("/data/empty.pdf")]);
        index.failures.push(
            Failure::new(FailureKind::PageExtractionFailure, "bad stream")
                .document("doc-1", "/data/report.pdf")
                .page(3),
        );
        index
    }

    #[tokio::test]
    async fn persist_then_load_is_identical() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = FileIndexStore::new(dir.path().join("indexes"));
        let index = sample_index();

        store.persist("abc123", &index).await?;
        let loaded = store.load("abc123").await?.ok_or("index missing")?;

        assert_eq!(loaded, index);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.embedded_len(), 2);
        let ids = loaded.chunks().map(ChunkRef::id).collect::<Vec<_>>();
        let expected = index.chunks().map(ChunkRef::id).collect::<Vec<_>>();
        assert_eq!(ids, expected);
        Ok(())
    }

    #[tokio::test]
    async fn missing_index_is_not_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = FileIndexStore::new(dir.path());
        assert!(store.load("nothing-here").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_directory() {
        let store = FileIndexStore::new("/tmp");
        let result = store.load("../etc/passwd").await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn key_depends_on_inputs_not_their_order() {
        let digests = vec!["aa".to_string(), "bb".to_string()];
        let reversed = vec!["bb".to_string(), "aa".to_string()];
        let all = ExtractionOptions::default();
        let text_only = ExtractionOptions::with_kinds([ContentKind::Text]);

        assert_eq!(index_key(&digests, &all), index_key(&reversed, &all));
        assert_ne!(index_key(&digests, &all), index_key(&digests, &text_only));
        assert_ne!(
            index_key(&digests, &all),
            index_key(&digests[..1], &all)
        );
    }
}
