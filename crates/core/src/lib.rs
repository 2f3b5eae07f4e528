pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod raster;
pub mod similarity;
pub mod store;
pub mod table;
pub mod traits;

pub use chunking::{
    extract_image_chunks, extract_metadata, extract_table_chunks, extract_text_chunks,
    DocumentMetadata, Extracted,
};
pub use embeddings::{
    EmbedPayload, Encodable, EmbeddingConfig, EmbeddingEncoder, EncodeOptions, EncodingReport,
    HttpEmbeddingService,
};
pub use error::{EncodeError, Failure, FailureKind, IngestError, SearchError, StoreError};
pub use extractor::LopdfBackend;
pub use ingest::{discover_pdf_files, digest_file, ExtractionCoordinator, ExtractionReport};
pub use models::{
    ChunkRef, ContentKind, Document, ExtractionOptions, ImageChunk, ImageTensor,
    MediaType, Tags, TextChunk,
};
pub use orchestrator::{handle_batch, Endpoint, IndexOutcome, Pipeline};
pub use raster::RasterFile;
pub use similarity::{cosine_similarity, rank, search, ScoredChunk};
pub use store::{index_key, ChunkIndex, FileIndexStore};
pub use table::{detect_tables, parse_table_csv, table_to_csv, Cell, TableGrid};
pub use traits::{CropBox, EmbeddingService, IndexStore, PageImage, PageSource, PdfBackend};
