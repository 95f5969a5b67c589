use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "visual-matcher")]
#[command(about = "Visual product similarity search over a precomputed catalog", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Embed every catalog image and write embeddings.bin + valid_products.json.
    Build {
        /// Input catalog manifest (JSON array of products).
        #[arg(long, default_value = "products.json")]
        catalog: PathBuf,
        /// Artifact output directory. Default: the configured artifacts dir.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Base directory for relative image paths. Default: the catalog's directory.
        #[arg(long)]
        image_root: Option<PathBuf>,
        /// ONNX model (MobileNetV2 without classification head).
        #[arg(long)]
        model: Option<PathBuf>,
        /// Parallel decode workers (0 = all cores).
        #[arg(long, default_value_t = 0)]
        jobs: usize,
        /// Never draw a progress bar.
        #[arg(long)]
        no_progress: bool,
        /// Optional JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Serve GET / and POST /api/search.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        bind: Option<String>,
        /// Directory holding the artifact pair.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        #[arg(long)]
        model: Option<PathBuf>,
        /// Frontend origin allowed for cross-origin requests ("*" for any).
        #[arg(long)]
        allowed_origin: Option<String>,
        /// Directory catalog images are served from.
        #[arg(long)]
        static_root: Option<PathBuf>,
        #[arg(long)]
        top_k: Option<usize>,
        /// HTTP worker threads.
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run one search locally and print the JSON response.
    Query {
        /// Image file path or http(s) URL.
        image: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        artifacts: Option<PathBuf>,
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
