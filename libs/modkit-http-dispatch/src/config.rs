use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default User-Agent sent by the hyper transport.
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-http-dispatch/", env!("CARGO_PKG_VERSION"));

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "HTTP_DISPATCH__";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Failed to load dispatch configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid URL '{url}' for {owner}: {reason}")]
    InvalidUrl {
        owner: String,
        url: String,
        reason: String,
    },
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    #[serde(rename = "webpki")]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// Whether plain `http://` endpoints may be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Require TLS for all connections
    #[default]
    TlsOnly,
    /// Allow insecure HTTP (mock servers and local development only)
    AllowInsecureHttp,
}

/// Settings shared by every transport the registry creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Per-request timeout (default: 30s)
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,

    /// Maximum response body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    pub user_agent: String,

    pub transport: TransportSecurity,

    pub tls_roots: TlsRootConfig,

    /// Idle connections are dropped from the pool after this long (default: 90s)
    #[serde(with = "humantime_duration")]
    pub pool_idle_timeout: Duration,

    pub pool_max_idle_per_host: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            transport: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Static endpoints of one named service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub urls: Vec<String>,
}

/// Top-level configuration of the dispatch engine.
///
/// ```yaml
/// http:
///   request_timeout: 5s
///   transport: allow_insecure_http
/// local_server_url: http://127.0.0.1:8080
/// services:
///   users:
///     urls: [http://users-1:8080, http://users-2:8080]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub http: HttpClientConfig,
    /// Base URL used for service identifiers that are plain paths.
    pub local_server_url: Option<String>,
    pub services: BTreeMap<String, ServiceConfig>,
}

impl DispatchConfig {
    /// Defaults, then the YAML file (if given and present), then
    /// `HTTP_DISPATCH__*` environment variables.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// # Errors
    /// Returns [`ConfigError::Load`] if any layer fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::figment(path)
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Parses configuration from a YAML document on top of the defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::Load`] for malformed YAML or mistyped values.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
