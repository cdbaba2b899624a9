//! PropBot ingestion tool
//!
//! Builds the retrieval index the gateway serves from:
//! 1. Extracts the text of a PDF
//! 2. Writes the raw text alongside the index
//! 3. Splits it into overlapping chunks
//! 4. Embeds the chunks and saves the vector index

mod chunker;
mod errors;
mod pdf;
mod processor;

use clap::Parser;
use chunker::ChunkingConfig;
use errors::IngestionError;
use processor::IngestionProcessor;
use propbot_common::{config::AppConfig, embeddings::create_embedder, VERSION};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(version, about = "Build the PropBot retrieval index from a PDF", long_about = None)]
struct Cli {
    /// PDF document to ingest
    pdf: PathBuf,

    /// Where to write the extracted text [default: ingestion.text_output_path]
    #[arg(long)]
    text_out: Option<PathBuf>,

    /// Where to write the vector index [default: retrieval.index_path]
    #[arg(long)]
    index_out: Option<PathBuf>,

    /// Maximum chunk size in characters [default: ingestion.chunk_size]
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between chunks in characters [default: ingestion.chunk_overlap]
    #[arg(long)]
    chunk_overlap: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), IngestionError> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting PropBot ingestion v{}", VERSION);

    let chunking = ChunkingConfig {
        chunk_size: cli.chunk_size.unwrap_or(config.ingestion.chunk_size),
        chunk_overlap: cli.chunk_overlap.unwrap_or(config.ingestion.chunk_overlap),
    };
    let text_out = cli
        .text_out
        .unwrap_or_else(|| PathBuf::from(&config.ingestion.text_output_path));
    let index_out = cli
        .index_out
        .unwrap_or_else(|| PathBuf::from(&config.retrieval.index_path));

    let embedder = create_embedder(&config.embedding)
        .map_err(|e| IngestionError::ConfigError(e.to_string()))?;
    let processor = IngestionProcessor::new(embedder, chunking);

    let summary = processor.process_pdf(&cli.pdf, &text_out, &index_out).await?;

    info!(
        pdf = %cli.pdf.display(),
        characters = summary.characters,
        chunks = summary.chunks,
        duration_ms = summary.duration_ms,
        "Ingestion complete"
    );
    Ok(())
}
