use crate::chunking::{
    extract_image_chunks, extract_metadata, extract_table_chunks, extract_text_chunks,
};
use crate::error::{Failure, FailureKind, IngestError};
use crate::models::{ContentKind, Document, ExtractionOptions, UNTITLED};
use crate::traits::PdfBackend;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug)]
pub struct ExtractionReport {
    pub documents: Vec<Document>,
    pub failures: Vec<Failure>,
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct ExtractionCoordinator {
    backend: Arc<dyn PdfBackend>,
    options: ExtractionOptions,
}

impl ExtractionCoordinator {
    pub fn new(backend: Arc<dyn PdfBackend>, options: ExtractionOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    /// Extracts one document. An unreadable source is the only error; page and
    /// image problems come back as failures next to the chunks that worked.
    pub fn extract(&self, document: &mut Document) -> Result<Vec<Failure>, IngestError> {
        let source = self.backend.open(&document.path)?;
        let mut failures = Vec::new();

        info!(
            path = %document.path.display(),
            pages = source.page_count(),
            "extracting document"
        );

        if self.options.enabled(ContentKind::Text) {
            let extracted = extract_text_chunks(document, source.as_ref());
            document.texts.extend(extracted.chunks);
            failures.extend(extracted.failures);
        }

        if self.options.enabled(ContentKind::Table) {
            let extracted = extract_table_chunks(document, source.as_ref());
            document.tables.extend(extracted.chunks);
            failures.extend(extracted.failures);
        }

        if self.options.enabled(ContentKind::Image) {
            let extracted = extract_image_chunks(document, source.as_ref(), &self.options);
            document.images.extend(extracted.chunks);
            failures.extend(extracted.failures);
        }

        if self.options.enabled(ContentKind::Metadata) {
            info!(path = %document.path.display(), "extracting metadata");
            match extract_metadata(source.as_ref()) {
                Ok(metadata) => metadata.apply(document),
                Err(error) => {
                    warn!(path = %document.path.display(), %error, "metadata unavailable");
                    document.title = Some(UNTITLED.to_string());
                    failures.push(
                        Failure::new(FailureKind::PageExtractionFailure, error.to_string())
                            .document(&document.id, &document.path),
                    );
                }
            }
        }

        Ok(failures)
    }

    pub async fn extract_batch(
        &self,
        documents: Vec<Document>,
        cancel: &CancellationToken,
    ) -> ExtractionReport {
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut slots = Vec::with_capacity(documents.len());
        let mut cancelled = false;

        for document in documents {
            let permit = if cancelled || cancel.is_cancelled() {
                None
            } else {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                }
            };

            let Some(permit) = permit else {
                cancelled = true;
                slots.push(Slot::Untouched(document));
                continue;
            };

            let coordinator = self.clone();
            let fallback = document.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut document = document;
                let result = coordinator.extract(&mut document);
                (document, result)
            });
            slots.push(Slot::Running { handle, fallback });
        }

        let mut report = ExtractionReport {
            documents: Vec::with_capacity(slots.len()),
            failures: Vec::new(),
            cancelled,
        };

        for slot in slots {
            match slot {
                Slot::Untouched(document) => report.documents.push(document),
                Slot::Running { handle, fallback } => match handle.await {
                    Ok((document, Ok(failures))) => {
                        report.failures.extend(failures);
                        report.documents.push(document);
                    }
                    Ok((document, Err(error))) => {
                        report.failures.push(document_failure(&document, &error));
                        report.documents.push(document);
                    }
                    Err(join_error) => {
                        warn!(path = %fallback.path.display(), %join_error, "extraction worker died");
                        report.failures.push(
                            Failure::new(FailureKind::SourceUnavailable, join_error.to_string())
                                .document(&fallback.id, &fallback.path),
                        );
                        report.documents.push(fallback);
                    }
                },
            }
        }

        info!(
            documents = report.documents.len(),
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "extraction batch finished"
        );
        report
    }
}

enum Slot {
    Untouched(Document),
    Running {
        handle: tokio::task::JoinHandle<(Document, Result<Vec<Failure>, IngestError>)>,
        fallback: Document,
    },
}

fn document_failure(document: &Document, error: &IngestError) -> Failure {
    let kind = match error {
        IngestError::SourceUnavailable { .. } => FailureKind::SourceUnavailable,
        _ => FailureKind::PageExtractionFailure,
    };
    warn!(path = %document.path.display(), %error, "document skipped");
    Failure::new(kind, error.to_string()).document(&document.id, &document.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::tests::{FakeBackend, FakePdf};
    use crate::extractor::tests::{three_page_fixture, write_fixture_pdf};
    use crate::extractor::LopdfBackend;
    use crate::models::MediaType;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn options_in(dir: &Path) -> ExtractionOptions {
        ExtractionOptions {
            image_dir: dir.to_path_buf(),
            workers: 2,
            ..ExtractionOptions::default()
        }
    }

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(base.join("notes.txt"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn three_page_scenario() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = ExtractionCoordinator::new(
            FakeBackend::with("three.pdf", FakePdf::three_pages()),
            options_in(dir.path()),
        );
        let mut document = Document::new("three.pdf");

        let failures = coordinator.extract(&mut document)?;

        assert!(failures.is_empty());
        let text_pages = document.texts.iter().map(|c| c.tags.page_no).collect::<Vec<_>>();
        assert_eq!(text_pages, vec![1, 2, 3]);
        assert_eq!(document.tables.len(), 1);
        assert_eq!(document.tables[0].tags.page_no, 2);
        assert_eq!(document.images.len(), 1);
        assert_eq!(document.images[0].tags.page_no, 1);
        assert_eq!(document.title.as_deref(), Some("Untitled"));
        assert!(document
            .chunks()
            .all(|chunk| chunk.tags().parent_id == document.id && chunk.tags().filename == "three.pdf"));
        Ok(())
    }

    #[test]
    fn disabled_kinds_are_not_extracted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let options = ExtractionOptions {
            image_dir: dir.path().to_path_buf(),
            ..ExtractionOptions::with_kinds([ContentKind::Table])
        };
        let coordinator = ExtractionCoordinator::new(
            FakeBackend::with("three.pdf", FakePdf::three_pages()),
            options,
        );
        let mut document = Document::new("three.pdf");

        coordinator.extract(&mut document)?;

        assert!(document.texts.is_empty());
        assert!(document.images.is_empty());
        assert_eq!(document.tables.len(), 1);
        assert_eq!(document.title, None);
        Ok(())
    }

    #[test]
    fn unreadable_source_fails_the_document() {
        let coordinator = ExtractionCoordinator::new(
            Arc::new(FakeBackend::default()),
            ExtractionOptions::default(),
        );
        let mut document = Document::new("missing.pdf");

        let result = coordinator.extract(&mut document);
        assert!(matches!(result, Err(IngestError::SourceUnavailable { .. })));
        assert_eq!(document.chunk_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_isolates_bad_documents_and_keeps_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = ExtractionCoordinator::new(
            FakeBackend::with("three.pdf", FakePdf::three_pages()),
            options_in(dir.path()),
        );
        let batch = vec![
            Document::new("missing.pdf"),
            Document::new("three.pdf"),
        ];
        let ids = batch.iter().map(|doc| doc.id.clone()).collect::<Vec<_>>();

        let report = coordinator
            .extract_batch(batch, &CancellationToken::new())
            .await;

        assert!(!report.cancelled);
        assert_eq!(
            report.documents.iter().map(|doc| doc.id.clone()).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(report.documents[0].chunk_count(), 0);
        assert_eq!(report.documents[1].chunk_count(), 5);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::SourceUnavailable);
        assert_eq!(report.failures[0].document_id.as_deref(), Some(ids[0].as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_batch_returns_documents_untouched() {
        let coordinator = ExtractionCoordinator::new(
            FakeBackend::with("three.pdf", FakePdf::three_pages()),
            ExtractionOptions::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = coordinator
            .extract_batch(vec![Document::new("three.pdf"), Document::new("three.pdf")], &cancel)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.documents.len(), 2);
        assert!(report.documents.iter().all(|doc| doc.chunk_count() == 0));
        assert!(report.failures.is_empty());
    }

    #[test]
    fn lopdf_backend_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("fixture.pdf");
        write_fixture_pdf(&path, &three_page_fixture(), None)?;
        let images = dir.path().join("images");
        let coordinator = ExtractionCoordinator::new(Arc::new(LopdfBackend), options_in(&images));
        let mut document = Document::new(&path);

        let failures = coordinator.extract(&mut document)?;

        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(document.texts.len(), 3);
        assert_eq!(document.tables.len(), 1);
        assert_eq!(document.tables[0].tags.page_no, 2);
        assert_eq!(document.images.len(), 1);
        assert_eq!(document.images[0].tags.media_type, MediaType::Image);
        // 200pt x 100pt at 200 DPI
        assert_eq!(
            (document.images[0].tensor.width, document.images[0].tensor.height),
            (556, 278)
        );
        assert_eq!(document.title.as_deref(), Some("Untitled"));
        assert_eq!(document.creation_date.as_deref(), Some("D:20230405101500Z"));
        Ok(())
    }
}
