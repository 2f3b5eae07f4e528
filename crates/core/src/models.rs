use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_RASTER_DPI: u32 = 200;
pub const UNTITLED: &str = "Untitled";

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Text,
    Table,
    Image,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tags {
    pub media_type: MediaType,
    pub filename: String,
    pub page_no: u32,
    pub parent_id: String,
}

impl Tags {
    pub fn for_page(document: &Document, media_type: MediaType, page_no: u32) -> Self {
        Self {
            media_type,
            filename: document.filename(),
            page_no,
            parent_id: document.id.clone(),
        }
    }
}

/// Payload shared by text and table chunks. Table chunks hold CSV.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextChunk {
    pub id: String,
    pub tags: Tags,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl TextChunk {
    pub fn new(document: &Document, media_type: MediaType, page_no: u32, text: String) -> Self {
        Self {
            id: new_id(),
            tags: Tags::for_page(document, media_type, page_no),
            text,
            embedding: None,
        }
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            tags: Tags {
                media_type: MediaType::Text,
                filename: String::from("query"),
                page_no: 0,
                parent_id: String::new(),
            },
            text: text.into(),
            embedding: None,
        }
    }
}

#[serde_as]
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageTensor {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
}

impl ImageTensor {
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            width,
            height,
            channels: 3,
            data: rgb.into_raw(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, image::ImageError> {
        let image = image::open(path)?;
        Ok(Self::from_image(&image))
    }
}

impl fmt::Debug for ImageTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTensor")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageChunk {
    pub id: String,
    pub tags: Tags,
    pub url: String,
    pub tensor: ImageTensor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ImageChunk {
    pub fn load(document: &Document, page_no: u32, url: &Path) -> Result<Self, image::ImageError> {
        let tensor = ImageTensor::load(url)?;
        Ok(Self {
            id: new_id(),
            tags: Tags::for_page(document, MediaType::Image, page_no),
            url: url.to_string_lossy().to_string(),
            tensor,
            ocr_caption: None,
            embedding: None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ChunkRef<'a> {
    Text(&'a TextChunk),
    Table(&'a TextChunk),
    Image(&'a ImageChunk),
}

impl<'a> ChunkRef<'a> {
    pub fn id(self) -> &'a str {
        match self {
            Self::Text(chunk) | Self::Table(chunk) => &chunk.id,
            Self::Image(chunk) => &chunk.id,
        }
    }

    pub fn tags(self) -> &'a Tags {
        match self {
            Self::Text(chunk) | Self::Table(chunk) => &chunk.tags,
            Self::Image(chunk) => &chunk.tags,
        }
    }

    pub fn embedding(self) -> Option<&'a [f32]> {
        match self {
            Self::Text(chunk) | Self::Table(chunk) => chunk.embedding.as_deref(),
            Self::Image(chunk) => chunk.embedding.as_deref(),
        }
    }

    pub fn content(self) -> &'a str {
        match self {
            Self::Text(chunk) | Self::Table(chunk) => &chunk.text,
            Self::Image(chunk) => &chunk.url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub creation_date: Option<String>,
    #[serde(default)]
    pub mod_date: Option<String>,
    #[serde(default)]
    pub texts: Vec<TextChunk>,
    #[serde(default)]
    pub tables: Vec<TextChunk>,
    #[serde(default)]
    pub images: Vec<ImageChunk>,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            id: new_id(),
            path: path.into(),
            title: None,
            creation_date: None,
            mod_date: None,
            texts: Vec::new(),
            tables: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn filename(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkRef<'_>> {
        self.texts
            .iter()
            .map(ChunkRef::Text)
            .chain(self.tables.iter().map(ChunkRef::Table))
            .chain(self.images.iter().map(ChunkRef::Image))
    }

    pub fn chunk_count(&self) -> usize {
        self.texts.len() + self.tables.len() + self.images.len()
    }

    pub fn embedded_count(&self) -> usize {
        self.chunks().filter(|chunk| chunk.embedding().is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Table,
    Image,
    Metadata,
}

impl ContentKind {
    pub const ALL: [ContentKind; 4] = [Self::Text, Self::Table, Self::Image, Self::Metadata];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Image => "image",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            "image" => Ok(Self::Image),
            "metadata" => Ok(Self::Metadata),
            other => Err(format!("unknown content kind: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub kinds: BTreeSet<ContentKind>,
    pub image_dir: PathBuf,
    pub raster_dpi: u32,
    pub workers: usize,
}

impl ExtractionOptions {
    pub fn with_kinds(kinds: impl IntoIterator<Item = ContentKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn enabled(&self, kind: ContentKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            kinds: ContentKind::ALL.into_iter().collect(),
            image_dir: std::env::temp_dir(),
            raster_dpi: DEFAULT_RASTER_DPI,
            workers: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_follow_parent_document() {
        let document = Document::new("/tmp/report.pdf");
        let chunk = TextChunk::new(&document, MediaType::Table, 2, "\"a\",1\n".to_string());

        assert_eq!(chunk.tags.parent_id, document.id);
        assert_eq!(chunk.tags.filename, "/tmp/report.pdf");
        assert_eq!(chunk.tags.page_no, 2);
        assert_eq!(chunk.tags.media_type, MediaType::Table);
        assert!(chunk.embedding.is_none());
    }

    #[test]
    fn ids_are_unique() {
        let first = Document::new("a.pdf");
        let second = Document::new("a.pdf");
        assert_ne!(first.id, second.id);
        assert_eq!(first.id.len(), 32);
    }

    #[test]
    fn chunks_iterate_texts_then_tables_then_images() {
        let mut document = Document::new("a.pdf");
        let table = TextChunk::new(&document, MediaType::Table, 1, "1".to_string());
        let text = TextChunk::new(&document, MediaType::Text, 1, "hello".to_string());
        document.tables.push(table);
        document.texts.push(text);

        let kinds = document
            .chunks()
            .map(|chunk| chunk.tags().media_type)
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![MediaType::Text, MediaType::Table]);
        assert_eq!(document.chunk_count(), 2);
        assert_eq!(document.embedded_count(), 0);
    }

    #[test]
    fn content_kind_parses_case_insensitively() {
        assert_eq!("Table".parse::<ContentKind>(), Ok(ContentKind::Table));
        assert_eq!(" metadata ".parse::<ContentKind>(), Ok(ContentKind::Metadata));
        assert!("video".parse::<ContentKind>().is_err());
    }

    #[test]
    fn default_options_enable_every_kind() {
        let options = ExtractionOptions::default();
        for kind in ContentKind::ALL {
            assert!(options.enabled(kind));
        }
        assert_eq!(options.raster_dpi, 200);
        assert!(options.workers >= 1);
    }

    #[test]
    fn text_chunk_serializes_its_media_type() -> Result<(), Box<dyn std::error::Error>> {
        let document = Document::new("a.pdf");
        let mut text = TextChunk::new(&document, MediaType::Table, 1, "\"a\",1\r\n".to_string());
        text.embedding = Some(vec![0.5, -0.25]);

        let value = serde_json::to_value(&text)?;
        assert_eq!(value["tags"]["media_type"], "table");

        let back: TextChunk = serde_json::from_value(value)?;
        assert_eq!(back, text);
        assert_eq!(ChunkRef::Table(&back).content(), "\"a\",1\r\n");
        Ok(())
    }
}
