//! Visual product similarity search.
//!
//! An offline [`builder`] embeds every catalog image with a pretrained CNN and
//! writes a row-aligned artifact pair; the online [`service`] loads that pair
//! once, embeds query images with the same [`extractor`], and ranks the
//! catalog by cosine similarity. [`server`] exposes the service over HTTP.

pub mod builder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fetch;
pub mod logging;
pub mod server;
pub mod service;
pub mod similarity;
pub mod types;

pub use builder::{BuildReport, EmbeddingBuilder, SkippedProduct};
pub use catalog::{ArtifactPaths, Catalog, CatalogEntry};
pub use config::MatcherConfig;
pub use error::{MatcherError, Result};
pub use extractor::{ExtractorConfig, FeatureExtractor, TensorLayout};
pub use fetch::{FetchPolicy, ImageFetcher};
pub use server::{ServerHandle, ServerOptions};
pub use service::{ImageSource, SearchService};
pub use types::{ErrorResponse, Product, ProductId, SearchResponse, SimilarityResult};

#[cfg(feature = "onnx")]
pub use extractor::OnnxExtractor;
