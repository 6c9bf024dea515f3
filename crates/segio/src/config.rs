// Engine and per-download configuration.

use std::collections::HashMap;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{EngineError, Result};

pub const DEFAULT_USER_AGENT: &str = concat!("segio/", env!("CARGO_PKG_VERSION"));

/// Default number of segment downloads allowed in flight per download.
pub const DEFAULT_SEGMENT_CONCURRENCY: usize = 5;

/// Configuration consumed per `download` call.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Headers sent with every HTTP request of this download, playlist and
    /// probe requests included.
    pub headers: HashMap<String, String>,
    /// Semaphore permit count for concurrent segment fetches.
    pub max_concurrent_segments: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            max_concurrent_segments: DEFAULT_SEGMENT_CONCURRENCY,
        }
    }
}

/// Engine-level configuration, used when the engine builds its own HTTP
/// client. The engine configures no timeouts; embed them into a custom
/// client handed to [`crate::DownloadEngine::with_client`] when needed.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

pub(crate) fn build_client(config: &EngineConfig) -> Result<Client> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(EngineError::from)
}

/// Converts per-download string headers into a reqwest header map.
pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| EngineError::InvalidHeader { name: name.clone() })?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| EngineError::InvalidHeader { name: name.clone() })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_conversion() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer token".to_string());
        headers.insert("X-Custom".to_string(), "1".to_string());

        let map = header_map(&headers).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("authorization").unwrap(), "Bearer token");
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad name".to_string(), "v".to_string());
        assert!(matches!(
            header_map(&headers),
            Err(EngineError::InvalidHeader { .. })
        ));
    }
}
