//! The searchable catalog and its on-disk artifacts.
//!
//! In memory the catalog is a single list of `(product, embedding)` entries.
//! On disk it is two sibling files: a bincode embedding matrix and a JSON
//! manifest of the products, row-aligned. The matrix header records a blake3
//! checksum of the manifest bytes, so a manifest regenerated without its
//! matrix (or the reverse) is rejected at load time instead of silently
//! pairing rows with the wrong products.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::similarity;
use crate::types::{Product, SimilarityResult};
use crate::{MatcherError, Result};

/// Default file name of the embedding matrix.
pub const EMBEDDINGS_FILE: &str = "embeddings.bin";

/// Default file name of the filtered product manifest.
pub const MANIFEST_FILE: &str = "valid_products.json";

const FORMAT_VERSION: u32 = 1;

/// Matrix decode limit (1 GiB).
const MATRIX_DECODE_LIMIT: usize = 1 << 30;

type MatrixConfig =
    bincode::config::Configuration<bincode::config::LittleEndian, bincode::config::Fixint>;

fn matrix_config() -> MatrixConfig {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

/// Serialized form of the embedding matrix.
#[derive(Debug, Serialize, Deserialize)]
struct MatrixFile {
    format_version: u32,
    /// Extractor fingerprint the rows were produced with.
    model: String,
    dimension: u32,
    rows: u64,
    /// blake3 of the manifest file contents.
    manifest_checksum: [u8; 32],
    /// Row-major, `rows * dimension` values.
    data: Vec<f32>,
}

/// Locations of a persisted artifact pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub embeddings: PathBuf,
    pub manifest: PathBuf,
}

impl ArtifactPaths {
    /// The default pair inside `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            embeddings: dir.join(EMBEDDINGS_FILE),
            manifest: dir.join(MANIFEST_FILE),
        }
    }
}

/// A product together with the embedding of its canonical image.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub product: Product,
    pub embedding: Vec<f32>,
}

/// Immutable-after-load set of embedded products.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    model: String,
    dimension: usize,
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// An empty catalog for vectors of `dimension` produced by `model`.
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            entries: Vec::new(),
        }
    }

    /// Append an entry, enforcing a uniform dimension.
    pub fn push(&mut self, product: Product, embedding: Vec<f32>) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(MatcherError::Extraction {
                cause: format!(
                    "embedding for product {} has {} dimensions, catalog expects {}",
                    product.id,
                    embedding.len(),
                    self.dimension
                ),
            });
        }
        self.entries.push(CatalogEntry { product, embedding });
        Ok(())
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn products(&self) -> impl Iterator<Item = &Product> + '_ {
        self.entries.iter().map(|e| &e.product)
    }

    /// Rank every entry by cosine similarity to `query` and return the best `top_k`.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SimilarityResult>> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(MatcherError::Extraction {
                cause: format!(
                    "query embedding has {} dimensions, catalog has {}",
                    query.len(),
                    self.dimension
                ),
            });
        }

        let ranked = similarity::rank(
            query,
            self.entries.iter().map(|e| e.embedding.as_slice()),
            top_k,
        );
        Ok(ranked
            .into_iter()
            .map(|hit| SimilarityResult::from_product(&self.entries[hit.index].product, hit.score))
            .collect())
    }

    /// Persist the catalog as an embedding matrix plus filtered manifest,
    /// replacing any previous pair at the same location.
    pub fn save(&self, paths: &ArtifactPaths) -> Result<()> {
        let products: Vec<&Product> = self.products().collect();
        let manifest_bytes = serde_json::to_vec_pretty(&products)?;
        let manifest_checksum = *blake3::hash(&manifest_bytes).as_bytes();

        let mut data = Vec::with_capacity(self.entries.len() * self.dimension);
        for entry in &self.entries {
            data.extend_from_slice(&entry.embedding);
        }

        let matrix = MatrixFile {
            format_version: FORMAT_VERSION,
            model: self.model.clone(),
            dimension: u32::try_from(self.dimension)
                .map_err(|_| MatcherError::config("embedding dimension exceeds u32"))?,
            rows: self.entries.len() as u64,
            manifest_checksum,
            data,
        };
        let matrix_bytes = bincode::serde::encode_to_vec(&matrix, matrix_config())?;

        write_atomic(&paths.embeddings, &matrix_bytes)?;
        write_atomic(&paths.manifest, &manifest_bytes)?;

        tracing::info!(
            rows = self.entries.len(),
            dims = self.dimension,
            embeddings = %paths.embeddings.display(),
            manifest = %paths.manifest.display(),
            "artifacts written"
        );
        Ok(())
    }

    /// Load and cross-check an artifact pair.
    pub fn load(paths: &ArtifactPaths) -> Result<Self> {
        let matrix_bytes = read_artifact(&paths.embeddings)?;
        let manifest_bytes = read_artifact(&paths.manifest)?;

        let (matrix, read) = bincode::serde::decode_from_slice::<MatrixFile, _>(
            &matrix_bytes,
            matrix_config().with_limit::<MATRIX_DECODE_LIMIT>(),
        )
        .map_err(|e| MatcherError::artifact(&paths.embeddings, format!("decode failed: {e}")))?;

        if read != matrix_bytes.len() {
            return Err(MatcherError::artifact(
                &paths.embeddings,
                format!("expected {} bytes, read {read}", matrix_bytes.len()),
            ));
        }
        if matrix.format_version != FORMAT_VERSION {
            return Err(MatcherError::artifact(
                &paths.embeddings,
                format!("unsupported format version {}", matrix.format_version),
            ));
        }
        if *blake3::hash(&manifest_bytes).as_bytes() != matrix.manifest_checksum {
            return Err(MatcherError::artifact(
                &paths.manifest,
                "manifest does not match the embedding matrix (checksum mismatch); rebuild both artifacts",
            ));
        }

        let products: Vec<Product> = serde_json::from_slice(&manifest_bytes).map_err(|e| {
            MatcherError::artifact(&paths.manifest, format!("invalid manifest: {e}"))
        })?;

        let dimension = matrix.dimension as usize;
        let rows = usize::try_from(matrix.rows)
            .map_err(|_| MatcherError::artifact(&paths.embeddings, "row count overflows usize"))?;
        if rows != products.len() {
            return Err(MatcherError::artifact(
                &paths.embeddings,
                format!(
                    "matrix has {rows} rows but manifest lists {} products",
                    products.len()
                ),
            ));
        }
        if matrix.data.len() != rows.saturating_mul(dimension) {
            return Err(MatcherError::artifact(
                &paths.embeddings,
                format!(
                    "matrix holds {} values, expected {rows} x {dimension}",
                    matrix.data.len()
                ),
            ));
        }
        if rows > 0 && dimension == 0 {
            return Err(MatcherError::artifact(
                &paths.embeddings,
                "non-empty matrix with zero dimension",
            ));
        }

        let entries = products
            .into_iter()
            .zip(matrix.data.chunks_exact(dimension.max(1)))
            .map(|(product, row)| CatalogEntry {
                product,
                embedding: row.to_vec(),
            })
            .collect();

        Ok(Self {
            model: matrix.model,
            dimension,
            entries,
        })
    }

    /// Load a pair and require that it was built with the extractor `model`.
    pub fn load_for_model(paths: &ArtifactPaths, model: &str) -> Result<Self> {
        let catalog = Self::load(paths)?;
        if catalog.model != model {
            return Err(MatcherError::artifact(
                &paths.embeddings,
                format!(
                    "embeddings were built with extractor '{}' but the service runs '{model}'",
                    catalog.model
                ),
            ));
        }
        Ok(catalog)
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| MatcherError::artifact(path, format!("cannot read: {e}")))
}

/// Write to a temporary sibling and rename over the destination.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| MatcherError::io(e, parent))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| MatcherError::io(e, &tmp))?;
    fs::rename(&tmp, path).map_err(|e| MatcherError::io(e, path))?;
    Ok(())
}
