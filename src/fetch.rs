//! Remote image retrieval for `image_url` queries and URL catalog entries.

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{MatcherError, Result};

/// Limits applied to every remote fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    pub timeout_secs: u64,
    pub max_bytes: u64,
    /// Host names allowed as fetch targets; subdomains match too. Empty allows any host.
    pub allowed_hosts: Vec<String>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_bytes: 16 * 1024 * 1024,
            allowed_hosts: Vec::new(),
        }
    }
}

impl FetchPolicy {
    /// Parse `raw` and check it against scheme and host rules.
    ///
    /// Violations are the caller's fault and surface as `InvalidRequest`.
    pub fn check(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw.trim())
            .map_err(|e| MatcherError::invalid_request(format!("invalid image_url '{raw}': {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(MatcherError::invalid_request(format!(
                "unsupported image_url scheme '{}'",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| MatcherError::invalid_request("image_url has no host"))?
            .to_ascii_lowercase();

        if !self.allowed_hosts.is_empty() && !self.host_allowed(&host) {
            return Err(MatcherError::invalid_request(format!(
                "image_url host '{host}' is not allowed"
            )));
        }
        Ok(url)
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.trim().trim_start_matches('.').to_ascii_lowercase();
            !allowed.is_empty()
                && (host == allowed
                    || host
                        .strip_suffix(allowed.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.')))
        })
    }
}

/// Blocking HTTP client bound to a [`FetchPolicy`].
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
    policy: FetchPolicy,
}

impl ImageFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("visual-matcher/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(policy.timeout_secs.max(1)))
            .build()
            .map_err(|e| MatcherError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, policy })
    }

    #[must_use]
    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Download the body at `raw_url`, bounded by the policy's size cap.
    pub fn fetch(&self, raw_url: &str) -> Result<Vec<u8>> {
        let url = self.policy.check(raw_url)?;
        let fetch_error = |cause: String| MatcherError::Fetch {
            url: url.to_string(),
            cause,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| fetch_error(e.to_string()))?
            .error_for_status()
            .map_err(|e| fetch_error(e.to_string()))?;

        let limit = self.policy.max_bytes;
        if let Some(len) = response.content_length() {
            if len > limit {
                return Err(fetch_error(format!(
                    "response is {len} bytes, limit is {limit}"
                )));
            }
        }

        let mut body = Vec::new();
        response
            .take(limit.saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|e| fetch_error(format!("read body: {e}")))?;
        if body.len() as u64 > limit {
            return Err(fetch_error(format!("response exceeds {limit} bytes")));
        }

        tracing::debug!(url = %url, bytes = body.len(), "fetched remote image");
        Ok(body)
    }
}

/// Whether an image reference should go through the fetcher rather than the filesystem.
#[must_use]
pub fn is_remote(reference: &str) -> bool {
    let lower = reference.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
