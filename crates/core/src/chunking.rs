use crate::error::{Failure, FailureKind, IngestError};
use crate::models::{Document, ExtractionOptions, ImageChunk, MediaType, TextChunk, UNTITLED};
use crate::raster::RasterFile;
use crate::table::table_to_csv;
use crate::traits::{CropBox, PageImage, PageSource};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Extracted<T> {
    pub chunks: Vec<T>,
    pub failures: Vec<Failure>,
}

impl<T> Default for Extracted<T> {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> Extracted<T> {
    fn skip(&mut self, document: &Document, page_no: u32, error: &IngestError) {
        warn!(path = %document.path.display(), page_no, %error, "skipping page content");
        self.failures.push(
            Failure::new(FailureKind::PageExtractionFailure, error.to_string())
                .document(&document.id, &document.path)
                .page(page_no),
        );
    }
}

pub fn extract_text_chunks(document: &Document, source: &dyn PageSource) -> Extracted<TextChunk> {
    info!(path = %document.path.display(), "extracting text");
    let mut extracted = Extracted::default();

    for page_no in 1..=source.page_count() {
        match source.page_text(page_no) {
            Ok(text) => extracted
                .chunks
                .push(TextChunk::new(document, MediaType::Text, page_no, text)),
            Err(error) => extracted.skip(document, page_no, &error),
        }
    }

    extracted
}

pub fn extract_table_chunks(document: &Document, source: &dyn PageSource) -> Extracted<TextChunk> {
    info!(path = %document.path.display(), "extracting tables");
    let mut extracted = Extracted::default();

    for page_no in 1..=source.page_count() {
        let tables = match source.page_tables(page_no) {
            Ok(tables) => tables,
            Err(error) => {
                extracted.skip(document, page_no, &error);
                continue;
            }
        };

        for table in tables {
            match table_to_csv(&table) {
                Ok(csv_text) => extracted
                    .chunks
                    .push(TextChunk::new(document, MediaType::Table, page_no, csv_text)),
                Err(error) => extracted.skip(document, page_no, &error),
            }
        }
    }

    extracted
}

pub fn extract_image_chunks(
    document: &Document,
    source: &dyn PageSource,
    options: &ExtractionOptions,
) -> Extracted<ImageChunk> {
    info!(path = %document.path.display(), "extracting images");
    let mut extracted = Extracted::default();

    if let Err(error) = std::fs::create_dir_all(&options.image_dir) {
        let error = IngestError::Io(error);
        warn!(dir = %options.image_dir.display(), %error, "image directory unavailable");
        extracted.failures.push(
            Failure::new(FailureKind::PageExtractionFailure, error.to_string())
                .document(&document.id, &document.path),
        );
        return extracted;
    }

    for page_no in 1..=source.page_count() {
        let located = source
            .page_images(page_no)
            .and_then(|images| Ok((images, source.page_size(page_no)?)));
        let (images, (page_width, page_height)) = match located {
            Ok(found) => found,
            Err(error) => {
                extracted.skip(document, page_no, &error);
                continue;
            }
        };

        for image in &images {
            let crop = CropBox::from_page_image(image, page_width, page_height);
            match crop_to_chunk(document, source, page_no, image, &crop, options) {
                Ok(chunk) => extracted.chunks.push(chunk),
                Err(error) => extracted.skip(document, page_no, &error),
            }
        }
    }

    extracted
}

fn crop_to_chunk(
    document: &Document,
    source: &dyn PageSource,
    page_no: u32,
    image: &PageImage,
    crop: &CropBox,
    options: &ExtractionOptions,
) -> Result<ImageChunk, IngestError> {
    if crop.is_empty() {
        return Err(IngestError::ImageRaster(format!(
            "image {} lies outside the page",
            image.name
        )));
    }

    let raster = source.render_image(page_no, image, crop, options.raster_dpi)?;
    let file = RasterFile::write(&raster, &options.image_dir)?;
    let chunk = ImageChunk::load(document, page_no, file.path())?;
    file.keep()?;
    Ok(chunk)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub title: String,
    pub creation_date: Option<String>,
    pub mod_date: Option<String>,
}

impl DocumentMetadata {
    pub fn apply(self, document: &mut Document) {
        document.title = Some(self.title);
        document.creation_date = self.creation_date;
        document.mod_date = self.mod_date;
    }
}

pub fn extract_metadata(source: &dyn PageSource) -> Result<DocumentMetadata, IngestError> {
    let mut metadata = source.metadata()?;
    Ok(DocumentMetadata {
        title: metadata
            .remove("Title")
            .unwrap_or_else(|| UNTITLED.to_string()),
        creation_date: metadata.remove("CreationDate"),
        mod_date: metadata.remove("ModDate"),
    })
}
