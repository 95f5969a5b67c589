//! The search context shared by every request handler.

use std::sync::Arc;
use std::time::Instant;

use crate::catalog::Catalog;
use crate::extractor::FeatureExtractor;
use crate::fetch::ImageFetcher;
use crate::types::SimilarityResult;
use crate::{MatcherError, Result};

/// Default number of results per query.
pub const DEFAULT_TOP_K: usize = 5;

/// Where a query image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Upload(Vec<u8>),
    Url(String),
}

impl ImageSource {
    /// Pick the query source from the optional request parts. An upload wins
    /// over a URL; neither is `MissingInput`.
    pub fn select(upload: Option<Vec<u8>>, url: Option<String>) -> Result<Self> {
        match (upload, url) {
            (Some(bytes), _) => Ok(ImageSource::Upload(bytes)),
            (None, Some(url)) if !url.trim().is_empty() => Ok(ImageSource::Url(url)),
            _ => Err(MatcherError::MissingInput),
        }
    }
}

/// Extractor, catalog and fetcher loaded once at startup.
pub struct SearchService {
    extractor: Arc<dyn FeatureExtractor>,
    catalog: Catalog,
    fetcher: ImageFetcher,
    default_top_k: usize,
}

impl SearchService {
    /// Assemble a service, rejecting a catalog produced by a different extractor.
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        catalog: Catalog,
        fetcher: ImageFetcher,
        default_top_k: usize,
    ) -> Result<Self> {
        if catalog.model() != extractor.model() {
            return Err(MatcherError::config(format!(
                "catalog was built with '{}' but the extractor is '{}'",
                catalog.model(),
                extractor.model()
            )));
        }
        if !catalog.is_empty() && catalog.dimension() != extractor.dimension() {
            return Err(MatcherError::config(format!(
                "catalog dimension {} does not match extractor dimension {}",
                catalog.dimension(),
                extractor.dimension()
            )));
        }
        if default_top_k == 0 {
            return Err(MatcherError::config("top_k must be at least 1"));
        }
        Ok(Self {
            extractor,
            catalog,
            fetcher,
            default_top_k,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Embed the query image and return the closest catalog products.
    pub fn search(&self, source: ImageSource, top_k: Option<usize>) -> Result<Vec<SimilarityResult>> {
        let top_k = match top_k {
            Some(0) => return Err(MatcherError::invalid_request("top_k must be at least 1")),
            Some(k) => k,
            None => self.default_top_k,
        };

        let started = Instant::now();
        let bytes = match source {
            ImageSource::Upload(bytes) => bytes,
            ImageSource::Url(url) => self.fetcher.fetch(&url)?,
        };
        let query = self.extractor.extract_bytes(&bytes)?;
        let results = self.catalog.search(&query, top_k)?;

        tracing::debug!(
            top_k,
            hits = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );
        Ok(results)
    }
}
