use crate::embeddings::EmbedPayload;
use crate::error::{EncodeError, IngestError, StoreError};
use crate::store::ChunkIndex;
use crate::table::{detect_tables, TableGrid};
use async_trait::async_trait;
use image::DynamicImage;
use std::collections::BTreeMap;
use std::path::Path;

pub type PdfMetadata = BTreeMap<String, String>;

/// An embedded raster image on a page, in PDF user space (origin bottom-left).
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub name: String,
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl CropBox {
    pub fn from_page_image(image: &PageImage, page_width: f32, page_height: f32) -> Self {
        let clamp_x = |value: f32| value.clamp(0.0, page_width);
        let clamp_y = |value: f32| value.clamp(0.0, page_height);
        Self {
            left: clamp_x(image.x0.min(image.x1)),
            top: clamp_y(page_height - image.y1.max(image.y0)),
            right: clamp_x(image.x1.max(image.x0)),
            bottom: clamp_y(page_height - image.y0.min(image.y1)),
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn pixel_size(&self, dpi: u32) -> (u32, u32) {
        let scale = dpi as f32 / 72.0;
        let width = (self.width() * scale).round().max(1.0) as u32;
        let height = (self.height() * scale).round().max(1.0) as u32;
        (width, height)
    }
}

pub trait PdfBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PageSource>, IngestError>;
}

/// Page-level view over one opened PDF. Pages are 1-based.
pub trait PageSource {
    fn page_count(&self) -> u32;

    fn page_size(&self, page_no: u32) -> Result<(f32, f32), IngestError>;

    fn page_text(&self, page_no: u32) -> Result<String, IngestError>;

    fn page_tables(&self, page_no: u32) -> Result<Vec<TableGrid>, IngestError> {
        detect_tables(&self.page_text(page_no)?)
    }

    fn page_images(&self, page_no: u32) -> Result<Vec<PageImage>, IngestError>;

    fn render_image(
        &self,
        page_no: u32,
        image: &PageImage,
        crop: &CropBox,
        dpi: u32,
    ) -> Result<DynamicImage, IngestError>;

    fn metadata(&self) -> Result<PdfMetadata, IngestError>;
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, payload: &EmbedPayload) -> Result<Vec<f32>, EncodeError>;
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn persist(&self, key: &str, index: &ChunkIndex) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing was persisted under `key`.
    async fn load(&self, key: &str) -> Result<Option<ChunkIndex>, StoreError>;
}
