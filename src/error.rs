use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MatcherError>;

/// Canonical error surface for the builder and the search service.
#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("Failed to decode image{}: {cause}", source_suffix(.path))]
    ImageDecode { path: Option<PathBuf>, cause: String },

    #[error("No image provided")]
    MissingInput,

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: Cow<'static, str> },

    #[error("Failed to fetch image from {url}: {cause}")]
    Fetch { url: String, cause: String },

    #[error("Feature extraction failed: {cause}")]
    Extraction { cause: String },

    #[error("Failed to load artifacts from {path:?}: {reason}")]
    ArtifactLoad { path: PathBuf, reason: Cow<'static, str> },

    #[error("Failed to load model at {path:?}: {cause}")]
    ModelLoad { path: PathBuf, cause: String },

    #[error("Configuration error: {reason}")]
    Config { reason: Cow<'static, str> },

    #[error("I/O error: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    #[error("Serialization error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn source_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" at {}", path.display()),
        None => String::new(),
    }
}

impl MatcherError {
    /// Stable identifier reported to HTTP clients alongside the message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MatcherError::ImageDecode { .. } => "image_decode",
            MatcherError::MissingInput => "missing_input",
            MatcherError::InvalidRequest { .. } => "invalid_request",
            MatcherError::Fetch { .. } => "fetch",
            MatcherError::Extraction { .. } => "extraction",
            MatcherError::ArtifactLoad { .. } => "artifact_load",
            MatcherError::ModelLoad { .. } => "model_load",
            MatcherError::Config { .. } => "config",
            MatcherError::Io { .. } => "io",
            MatcherError::Encode(_) | MatcherError::Decode(_) => "serialization",
            MatcherError::Json(_) => "json",
        }
    }

    /// Whether the failure was caused by the caller's input rather than the service.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MatcherError::MissingInput | MatcherError::InvalidRequest { .. }
        )
    }

    /// HTTP status the search endpoint answers with for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        if self.is_client_error() { 400 } else { 500 }
    }

    pub(crate) fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MatcherError::Io {
            source,
            path: Some(path.into()),
        }
    }

    pub(crate) fn invalid_request(reason: impl Into<Cow<'static, str>>) -> Self {
        MatcherError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn artifact(path: impl Into<PathBuf>, reason: impl Into<Cow<'static, str>>) -> Self {
        MatcherError::ArtifactLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<Cow<'static, str>>) -> Self {
        MatcherError::Config {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for MatcherError {
    fn from(source: std::io::Error) -> Self {
        MatcherError::Io { source, path: None }
    }
}
