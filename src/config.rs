//! Process configuration: defaults, then an optional JSON file, then
//! environment variables. CLI flags are applied last by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::ArtifactPaths;
use crate::extractor::ExtractorConfig;
use crate::fetch::FetchPolicy;
use crate::server::ServerOptions;
use crate::service::DEFAULT_TOP_K;
use crate::{MatcherError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub bind: String,
    pub port: u16,
    pub top_k: usize,
    /// Directory holding `embeddings.bin` and `valid_products.json`.
    pub artifacts_dir: PathBuf,
    pub server: ServerOptions,
    pub extractor: ExtractorConfig,
    pub fetch: FetchPolicy,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
            top_k: DEFAULT_TOP_K,
            artifacts_dir: PathBuf::from("."),
            server: ServerOptions::default(),
            extractor: ExtractorConfig::default(),
            fetch: FetchPolicy::default(),
        }
    }
}

impl MatcherConfig {
    /// Read a JSON config file. Absent keys keep their defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| MatcherError::io(e, path))?;
        serde_json::from_str(&data)
            .map_err(|e| MatcherError::config(format!("{}: {e}", path.display())))
    }

    /// Defaults, then `file` if given, then the process environment.
    pub fn resolve(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(env_optional)?;
        Ok(config)
    }

    /// Overlay values found by `lookup` (normally the process environment).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("PORT") {
            self.port = parse_var("PORT", &port)?;
        }
        if let Some(bind) = lookup("BIND") {
            self.bind = bind;
        }
        if let Some(dir) = lookup("MATCHER_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(dir);
        }
        if let Some(model) = lookup("MATCHER_MODEL_PATH") {
            self.extractor.model_path = PathBuf::from(model);
        }
        if let Some(layout) = lookup("MATCHER_TENSOR_LAYOUT") {
            self.extractor.layout = layout.parse()?;
        }
        if let Some(origin) = lookup("MATCHER_ALLOWED_ORIGIN") {
            self.server.allowed_origin = Some(origin);
        }
        if let Some(root) = lookup("MATCHER_STATIC_ROOT") {
            self.server.static_root = Some(PathBuf::from(root));
        }
        if let Some(top_k) = lookup("MATCHER_TOP_K") {
            self.top_k = parse_var("MATCHER_TOP_K", &top_k)?;
        }
        if let Some(workers) = lookup("MATCHER_WORKERS") {
            self.server.workers = parse_var("MATCHER_WORKERS", &workers)?;
        }
        if let Some(secs) = lookup("MATCHER_FETCH_TIMEOUT_SECS") {
            self.fetch.timeout_secs = parse_var("MATCHER_FETCH_TIMEOUT_SECS", &secs)?;
        }
        if let Some(bytes) = lookup("MATCHER_FETCH_MAX_BYTES") {
            self.fetch.max_bytes = parse_var("MATCHER_FETCH_MAX_BYTES", &bytes)?;
        }
        if let Some(hosts) = lookup("MATCHER_FETCH_ALLOWED_HOSTS") {
            self.fetch.allowed_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(MatcherError::config("top_k must be at least 1"));
        }
        if self.server.workers == 0 {
            return Err(MatcherError::config("workers must be at least 1"));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(MatcherError::config("fetch timeout must be at least 1 second"));
        }
        if self.fetch.max_bytes == 0 || self.server.max_upload_bytes == 0 {
            return Err(MatcherError::config("size limits must be positive"));
        }
        if self.extractor.input_size == 0 {
            return Err(MatcherError::config("extractor input size must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    #[must_use]
    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::in_dir(&self.artifacts_dir)
    }
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| MatcherError::config(format!("invalid {name}: '{value}'")))
}
