use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid relay URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{0:?} does not name a relay host")]
    InvalidHost(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub api_scheme: String,
    pub api_port: Option<u16>,
    pub link_scheme: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            api_scheme: "https".to_string(),
            api_port: None,
            link_scheme: "ws".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Points the relay at a test server for this run.
    ///
    /// Accepts `http://host:port` or a bare `host[:port]`. Test servers are
    /// always reached over plain http.
    pub fn with_host_override(&self, input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        let parsed = Url::parse(input)
            .ok()
            .filter(|url| url.host_str().is_some())
            .or_else(|| {
                Url::parse(&format!("http://{input}"))
                    .ok()
                    .filter(|url| url.host_str().is_some())
            })
            .ok_or_else(|| ConfigError::InvalidHost(input.to_string()))?;

        let Some(host) = parsed.host_str() else {
            return Err(ConfigError::InvalidHost(input.to_string()));
        };

        // Url drops a port equal to its scheme's default. Only http's default
        // matches the scheme the override talks.
        let api_port = if parsed.scheme() == "http" {
            parsed.port()
        } else {
            parsed.port_or_known_default()
        };

        Ok(Self {
            host: host.to_string(),
            api_scheme: "http".to_string(),
            api_port,
            link_scheme: self.link_scheme.clone(),
        })
    }

    /// URL of an API resource, with query pairs percent-encoded.
    pub fn api_url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ConfigError> {
        let base = match self.api_port {
            Some(port) => format!("{}://{}:{port}", self.api_scheme, self.host),
            None => format!("{}://{}", self.api_scheme, self.host),
        };
        let mut url = Url::parse(&base).map_err(|e| ConfigError::InvalidUrl {
            url: base.clone(),
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }
        url.set_path(path);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// URL of a room's link port on the relay.
    pub fn link_url(&self, port: u16) -> Result<Url, ConfigError> {
        let raw = format!("{}://{}:{port}", self.link_scheme, self.host);
        Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl {
            reason: e.to_string(),
            url: raw,
        })
    }
}
