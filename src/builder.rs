//! Offline embedding builder.
//!
//! Reads the catalog manifest, embeds every product image with the shared
//! [`FeatureExtractor`], and writes the row-aligned artifact pair. Per-product
//! failures only shrink the output; they never abort the run.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{ArtifactPaths, Catalog};
use crate::extractor::FeatureExtractor;
use crate::fetch::{ImageFetcher, is_remote};
use crate::types::{Product, ProductId};
use crate::{MatcherError, Result};

/// A catalog entry left out of the artifacts, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedProduct {
    pub id: ProductId,
    pub image: String,
    pub reason: String,
}

/// Outcome of one builder run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    /// Records in the input manifest.
    pub total: usize,
    /// Rows written.
    pub embedded: usize,
    pub skipped: Vec<SkippedProduct>,
}

/// Read the input catalog manifest (a JSON array of products).
pub fn load_catalog_manifest(path: &Path) -> Result<Vec<Product>> {
    let raw = fs::read(path).map_err(|e| MatcherError::io(e, path))?;
    let products: Vec<Product> = serde_json::from_slice(&raw)?;
    Ok(products)
}

pub struct EmbeddingBuilder {
    extractor: Arc<dyn FeatureExtractor>,
    fetcher: Option<ImageFetcher>,
    image_root: PathBuf,
    jobs: usize,
    progress: bool,
}

impl EmbeddingBuilder {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, image_root: impl Into<PathBuf>) -> Self {
        Self {
            extractor,
            fetcher: None,
            image_root: image_root.into(),
            jobs: 0,
            progress: false,
        }
    }

    /// Enable URL image references.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: ImageFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Worker threads for decoding; 0 picks the available parallelism.
    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Embed `products` in order, returning the surviving catalog and a report.
    pub fn build(&self, products: Vec<Product>) -> (Catalog, BuildReport) {
        let started = Instant::now();
        let mut report = BuildReport {
            total: products.len(),
            ..BuildReport::default()
        };

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(products.len());
        for product in products {
            if seen.insert(product.id.clone()) {
                unique.push(product);
            } else {
                tracing::warn!(product_id = %product.id, "duplicate product id, skipping");
                report.skipped.push(SkippedProduct {
                    id: product.id.clone(),
                    image: product.image.clone(),
                    reason: "duplicate product id".into(),
                });
            }
        }

        let bar = self.progress_bar(unique.len() as u64);
        let embed_one = |product: &Product| {
            let result = self.embed(product);
            bar.inc(1);
            result
        };

        let threads = match self.jobs {
            0 => std::thread::available_parallelism()
                .map(|v| v.get())
                .unwrap_or(4),
            n => n,
        };
        let embeddings: Vec<Result<Vec<f32>>> = ThreadPoolBuilder::new()
            .num_threads(threads.min(unique.len().max(1)))
            .build()
            .map(|pool| pool.install(|| unique.par_iter().map(embed_one).collect()))
            .unwrap_or_else(|_| unique.iter().map(embed_one).collect());
        bar.finish_and_clear();

        let mut catalog = Catalog::new(self.extractor.model(), self.extractor.dimension());
        for (product, embedding) in unique.into_iter().zip(embeddings) {
            let outcome = embedding.and_then(|vector| catalog.push(product.clone(), vector));
            if let Err(err) = outcome {
                tracing::warn!(
                    product_id = %product.id,
                    image = %product.image,
                    error = %err,
                    "skipping product"
                );
                report.skipped.push(SkippedProduct {
                    id: product.id,
                    image: product.image,
                    reason: err.to_string(),
                });
            }
        }

        report.embedded = catalog.len();
        tracing::info!(
            total = report.total,
            rows = report.embedded,
            skipped = report.skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding build finished"
        );
        (catalog, report)
    }

    /// Load the manifest at `catalog_path`, build, and persist to `paths`.
    pub fn run(&self, catalog_path: &Path, paths: &ArtifactPaths) -> Result<BuildReport> {
        let products = load_catalog_manifest(catalog_path)?;
        tracing::info!(
            catalog = %catalog_path.display(),
            products = products.len(),
            model = %self.extractor.model(),
            "building embeddings"
        );
        let (catalog, report) = self.build(products);
        catalog.save(paths)?;
        Ok(report)
    }

    fn embed(&self, product: &Product) -> Result<Vec<f32>> {
        if is_remote(&product.image) {
            let fetcher = self.fetcher.as_ref().ok_or_else(|| {
                MatcherError::config("remote image references need a fetcher")
            })?;
            let bytes = fetcher.fetch(&product.image)?;
            return self.extractor.extract_bytes(&bytes);
        }

        let path = self.resolve(&product.image);
        if !path.is_file() {
            return Err(MatcherError::io(
                std::io::Error::new(std::io::ErrorKind::NotFound, "image not found"),
                path,
            ));
        }
        self.extractor.extract_file(&path)
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.image_root.join(path)
        }
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} images",
        ) {
            bar.set_style(style);
        }
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    /// Embeds an image as its mean RGB.
    struct MeanColor;

    impl FeatureExtractor for MeanColor {
        fn model(&self) -> &str {
            "mean-color"
        }

        fn dimension(&self) -> usize {
            3
        }

        fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>> {
            let rgb = image.to_rgb8();
            let mut sums = [0.0_f32; 3];
            for pixel in rgb.pixels() {
                for c in 0..3 {
                    sums[c] += f32::from(pixel[c]);
                }
            }
            let n = (rgb.width() * rgb.height()).max(1) as f32;
            Ok(sums.iter().map(|s| s / n + 1.0).collect())
        }
    }

    fn write_png(dir: &Path, name: &str, rgb: [u8; 3]) {
        image::RgbImage::from_pixel(4, 4, image::Rgb(rgb))
            .save(dir.join(name))
            .expect("save png");
    }

    #[test]
    fn survivors_keep_input_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(dir.path(), "a.png", [200, 0, 0]);
        write_png(dir.path(), "c.png", [0, 0, 200]);
        std::fs::write(dir.path().join("broken.png"), b"not a png").expect("write");

        let products = vec![
            Product::new(1, "A", "x", "a.png"),
            Product::new(2, "B", "x", "missing.png"),
            Product::new(3, "C", "x", "c.png"),
            Product::new(4, "D", "x", "broken.png"),
            Product::new(1, "A again", "x", "a.png"),
        ];

        let builder = EmbeddingBuilder::new(Arc::new(MeanColor), dir.path()).with_jobs(2);
        let (catalog, report) = builder.build(products);

        let ids: Vec<String> = catalog.products().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(report.total, 5);
        assert_eq!(report.embedded, 2);
        let skipped: Vec<String> = report.skipped.iter().map(|s| s.id.to_string()).collect();
        assert_eq!(skipped.len(), 3);
        assert!(skipped.contains(&"2".to_string()));
        assert!(skipped.contains(&"4".to_string()));
        assert!(report.skipped.iter().any(|s| s.reason == "duplicate product id"));
    }

    #[test]
    fn remote_reference_without_fetcher_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let builder = EmbeddingBuilder::new(Arc::new(MeanColor), dir.path());
        let (catalog, report) =
            builder.build(vec![Product::new(9, "R", "x", "https://cdn.example.com/9.jpg")]);
        assert!(catalog.is_empty());
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn empty_catalog_builds_valid_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = dir.path().join("products.json");
        std::fs::write(&manifest, "[]").expect("write");
        let paths = ArtifactPaths::in_dir(dir.path());

        let report = EmbeddingBuilder::new(Arc::new(MeanColor), dir.path())
            .run(&manifest, &paths)
            .expect("run");
        assert_eq!(report.embedded, 0);
        let loaded = Catalog::load(&paths).expect("load");
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimension(), 3);
    }

    #[test]
    fn unreadable_manifest_fails_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let builder = EmbeddingBuilder::new(Arc::new(MeanColor), dir.path());
        let err = builder
            .run(&dir.path().join("nope.json"), &ArtifactPaths::in_dir(dir.path()))
            .unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
