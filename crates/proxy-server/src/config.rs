use std::collections::BTreeMap;
use std::path::Path;

use axum::http::header::{HeaderName, HeaderValue};
use axum::http::HeaderMap;
use serde::Deserialize;
use splice_esi::EsiConfig;
use url::Url;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub esi: EsiSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
}

/// The `[esi]` section, handed to the processor at startup.
#[derive(Debug, Deserialize)]
pub struct EsiSection {
    #[serde(default = "default_minimum_cache_ttl")]
    pub minimum_cache_ttl: u64,
    #[serde(default)]
    pub cache_ttl_jitter: u64,
    /// Resolve fragment URLs against this base instead of the request URL,
    /// e.g. an internal endpoint that bypasses CDN/WAF rules.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Custom headers set on every fragment request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
            },
            esi: EsiSection::default(),
        }
    }
}

impl EsiSection {
    /// Build the processor configuration. Unparseable base URLs and header
    /// names are logged and skipped rather than failing startup.
    pub fn to_esi_config(&self) -> EsiConfig {
        let base_url = self.base_url.as_ref().and_then(|raw| match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(base_url = %raw, error = %e, "ignoring unparseable esi.base_url");
                None
            }
        });

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(header = %name, "ignoring invalid esi.headers entry");
                }
            }
        }

        EsiConfig {
            minimum_cache_ttl: self.minimum_cache_ttl,
            cache_ttl_jitter: self.cache_ttl_jitter,
            base_url,
            headers,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for EsiSection {
    fn default() -> Self {
        Self {
            minimum_cache_ttl: default_minimum_cache_ttl(),
            cache_ttl_jitter: 0,
            base_url: None,
            headers: BTreeMap::new(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_minimum_cache_ttl() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:8081"

            [upstream]
            url = "http://origin:3000"

            [esi]
            minimum_cache_ttl = 60
            cache_ttl_jitter = 10
            base_url = "http://fragments.internal:9000"

            [esi.headers]
            X-Fragment-Source = "edge"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:8081");
        assert_eq!(config.server.metrics_addr, "0.0.0.0:9090");
        assert_eq!(config.upstream.url, "http://origin:3000");

        let esi = config.esi.to_esi_config();
        assert_eq!(esi.minimum_cache_ttl, 60);
        assert_eq!(esi.cache_ttl_jitter, 10);
        assert_eq!(
            esi.base_url.unwrap().as_str(),
            "http://fragments.internal:9000/"
        );
        assert_eq!(esi.headers.get("x-fragment-source").unwrap(), "edge");
    }

    #[test]
    fn minimum_ttl_defaults_to_300() {
        let config: Config = toml::from_str("[upstream]\nurl = \"http://o\"").unwrap();
        assert_eq!(config.esi.minimum_cache_ttl, 300);
        assert_eq!(config.esi.cache_ttl_jitter, 0);
    }

    #[test]
    fn bad_base_url_is_skipped() {
        let section = EsiSection {
            base_url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(section.to_esi_config().base_url.is_none());
    }
}
