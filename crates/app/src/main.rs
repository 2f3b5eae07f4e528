use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pdf_chunk_core::{
    discover_pdf_files, handle_batch, ContentKind, Document, EmbeddingConfig, EmbeddingEncoder,
    EncodeOptions, Endpoint, ExtractionCoordinator, ExtractionOptions, Failure, FileIndexStore,
    HttpEmbeddingService, LopdfBackend, Pipeline,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser)]
#[command(name = "pdf-chunk", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Content kinds to extract, comma separated.
    #[arg(long, global = true, value_delimiter = ',', default_value = "text,table,image,metadata")]
    kinds: Vec<ContentKind>,

    /// Directory for image crops. Defaults to the system temp dir.
    #[arg(long, global = true)]
    image_dir: Option<PathBuf>,

    /// Rasterization resolution for image crops.
    #[arg(long, global = true, default_value_t = 200)]
    dpi: u32,

    /// Documents extracted in parallel. Defaults to one per core.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Embedding service URL.
    #[arg(long, global = true, env = "EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<Url>,

    /// Bearer token for the embedding service.
    #[arg(long, global = true, env = "JINA_TOKEN", hide_env_values = true)]
    embedding_token: Option<String>,

    /// Embedding requests in flight.
    #[arg(long, global = true, default_value_t = 8)]
    concurrency: usize,

    /// Per-request timeout in seconds.
    #[arg(long, global = true, default_value_t = 30)]
    timeout_secs: u64,

    /// Expected embedding length; other lengths are rejected.
    #[arg(long, global = true)]
    dimensions: Option<usize>,

    /// Do not send image chunks to the embedding service.
    #[arg(long, global = true, default_value_t = false)]
    skip_images: bool,

    /// Where built indexes are persisted.
    #[arg(long, global = true, env = "PDF_CHUNK_INDEX_DIR", default_value = ".pdf-chunk-index")]
    index_dir: PathBuf,
}

#[derive(Args)]
struct Inputs {
    /// PDF file; repeat for several.
    #[arg(long = "pdf")]
    pdfs: Vec<PathBuf>,

    /// Folder searched recursively for PDFs.
    #[arg(long)]
    folder: Option<PathBuf>,
}

impl Inputs {
    fn paths(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut paths = self.pdfs.clone();
        if let Some(folder) = &self.folder {
            paths.extend(discover_pdf_files(folder));
        }
        if paths.is_empty() {
            bail!("no PDFs given; use --pdf or --folder");
        }
        Ok(paths)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Extract chunks and print the batch as JSON.
    Extract {
        #[command(flatten)]
        inputs: Inputs,
        /// `/extract` or `/print`.
        #[arg(long, default_value = "/extract")]
        endpoint: Endpoint,
        /// Write JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Extract, embed and persist an index, or load a persisted one.
    Index {
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Rank indexed chunks against a free-text query.
    Query {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long)]
        query: String,
        /// Number of matches to print.
        #[arg(long, default_value = "5")]
        top_k: usize,
    },
}

impl Cli {
    fn extraction_options(&self) -> ExtractionOptions {
        let mut options = ExtractionOptions::with_kinds(self.kinds.iter().copied());
        if let Some(dir) = &self.image_dir {
            options.image_dir = dir.clone();
        }
        if let Some(workers) = self.workers {
            options.workers = workers;
        }
        options.raster_dpi = self.dpi;
        options
    }

    fn embedding_config(&self) -> anyhow::Result<EmbeddingConfig> {
        let endpoint = self
            .embedding_endpoint
            .clone()
            .context("embedding endpoint missing; set --embedding-endpoint or EMBEDDING_ENDPOINT")?;
        let mut config = EmbeddingConfig::new(endpoint);
        config.token = self.embedding_token.clone();
        config.concurrency = self.concurrency;
        config.timeout = Duration::from_secs(self.timeout_secs);
        config.dimensions = self.dimensions;
        Ok(config)
    }

    fn pipeline(
        &self,
        coordinator: ExtractionCoordinator,
    ) -> anyhow::Result<Pipeline<HttpEmbeddingService, FileIndexStore>> {
        let encoder = EmbeddingEncoder::from_config(&self.embedding_config()?)?;
        Ok(Pipeline::new(coordinator, encoder, FileIndexStore::new(&self.index_dir))
            .with_encode_options(EncodeOptions {
                include_images: !self.skip_images,
            }))
    }
}

fn report_failures(failures: &[Failure]) {
    for failure in failures {
        warn!(kind = %failure.kind, "{failure}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-chunk boot"
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current document");
            on_interrupt.cancel();
        }
    });

    let coordinator = ExtractionCoordinator::new(Arc::new(LopdfBackend), cli.extraction_options());

    match &cli.command {
        Command::Extract {
            inputs,
            endpoint,
            output,
        } => {
            let documents = inputs.paths()?.into_iter().map(Document::new).collect();
            let report = handle_batch(&coordinator, *endpoint, documents, &cancel).await?;
            report_failures(&report.failures);

            let body = serde_json::to_vec_pretty(&json!({
                "endpoint": endpoint.as_str(),
                "documents": report.documents,
                "failures": report.failures,
                "cancelled": report.cancelled,
            }))?;
            match output {
                Some(path) => {
                    tokio::fs::write(path, &body)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{} document(s) written to {}", report.documents.len(), path.display());
                }
                None => println!("{}", String::from_utf8_lossy(&body)),
            }
        }
        Command::Index { inputs } => {
            let pipeline = cli.pipeline(coordinator)?;
            let outcome = pipeline.index_documents(&inputs.paths()?, &cancel).await?;
            report_failures(&outcome.failures);

            println!(
                "index {} {}: {} document(s), {} chunk(s), {} embedded, {} failure(s){}",
                outcome.key,
                if outcome.cached { "loaded" } else { "built" },
                outcome.index.documents.len(),
                outcome.index.len(),
                outcome.index.embedded_len(),
                outcome.failures.len(),
                if outcome.cancelled { " (cancelled)" } else { "" },
            );
        }
        Command::Query {
            inputs,
            query,
            top_k,
        } => {
            let pipeline = cli.pipeline(coordinator)?;
            let outcome = pipeline.index_documents(&inputs.paths()?, &cancel).await?;
            report_failures(&outcome.failures);

            let hits = pipeline.query(&outcome.index, query, *top_k).await?;
            println!("query: {query}");
            for hit in hits {
                let tags = hit.chunk.tags();
                println!(
                    "[{}] score={:.4} chunk={} file={} page={}",
                    tags.media_type,
                    hit.score,
                    hit.chunk.id(),
                    tags.filename,
                    tags.page_no
                );
                println!("  {}", hit.chunk.content());
            }
        }
    }

    Ok(())
}
