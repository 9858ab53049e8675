//! NLP Trigger Configuration
//!
//! Configuration is read from an optional TOML file and then overridden by
//! environment variables. The downstream NLP service URL is the only required
//! setting; [`RelayConfig::load`] fails before anything else starts when it is
//! missing.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NT_CONFIG_PATH` | - | Optional TOML config file |
//! | `API_NLP_SERVICE_URL` | - | NLP service base URL (required) |
//! | `PORT` / `NT_PORT` | `8080` | HTTP listen port |
//! | `NT_HOST` | `0.0.0.0` | HTTP listen address |
//! | `NT_AUDIT_BACKEND` | `mongo` | Audit store: `mongo`, `memory` |
//! | `NT_MONGO_URI` | `mongodb://localhost:27017` | MongoDB connection URI |
//! | `NT_MONGO_DB` | `nlp_trigger` | MongoDB database for audit records |
//! | `NT_AUDIT_COLLECTION` | `system_logs` | Audit collection |
//! | `NT_AUTH_PROVIDER` | `auto` | `auto`, `metadata`, `service-account`, `static` |
//! | `GOOGLE_APPLICATION_CREDENTIALS` | - | Service-account key file |
//! | `NT_STATIC_TOKEN` | - | Fixed bearer token (`static` provider) |
//! | `NT_METADATA_URL` | `http://metadata.google.internal` | Metadata server |
//! | `NT_DISPATCH_TIMEOUT_SECS` | `300` | NLP request timeout |
//! | `NT_CONNECT_TIMEOUT_SECS` | `10` | NLP connect timeout |
//! | `NT_SOURCE_MODE` | `push` | `push` (HTTP CloudEvents) or `change-stream` |
//! | `NT_WATCH_DB` | `nlp_trigger` | Database watched in change-stream mode |
//! | `NT_WATCH_COLLECTION` | `monitor_results` | Collection watched in change-stream mode |
//! | `NT_CHECKPOINT_COLLECTION` | `stream_checkpoints` | Resume token storage |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { key, message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL of the NLP service; also the audience of issued identity tokens
    pub nlp_service_url: String,
    pub server: ServerConfig,
    pub audit: AuditConfig,
    pub auth: AuthConfig,
    pub dispatch: DispatchConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditBackendKind {
    Mongo,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub backend: AuditBackendKind,
    pub mongo_uri: String,
    pub database: String,
    pub collection: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthProviderKind {
    /// Service-account key file when one is configured, metadata server otherwise
    Auto,
    Metadata,
    ServiceAccount,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub provider: AuthProviderKind,
    pub credentials_path: Option<PathBuf>,
    pub static_token: Option<String>,
    pub metadata_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    /// CloudEvents pushed to the HTTP endpoint
    Push,
    /// MongoDB change stream on the watched collection
    ChangeStream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub mode: SourceMode,
    pub watch_database: String,
    pub watch_collection: String,
    pub checkpoint_collection: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            nlp_service_url: String::new(),
            server: ServerConfig::default(),
            audit: AuditConfig::default(),
            auth: AuthConfig::default(),
            dispatch: DispatchConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: AuditBackendKind::Mongo,
            mongo_uri: "mongodb://localhost:27017".to_string(),
            database: "nlp_trigger".to_string(),
            collection: "system_logs".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: AuthProviderKind::Auto,
            credentials_path: None,
            static_token: None,
            metadata_url: "http://metadata.google.internal".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::Push,
            watch_database: "nlp_trigger".to_string(),
            watch_collection: "monitor_results".to_string(),
            checkpoint_collection: "stream_checkpoints".to_string(),
        }
    }
}

impl FromStr for AuditBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::invalid("NT_AUDIT_BACKEND", format!("unknown backend '{}'", other))),
        }
    }
}

impl FromStr for AuthProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "metadata" => Ok(Self::Metadata),
            "service-account" | "service_account" => Ok(Self::ServiceAccount),
            "static" => Ok(Self::Static),
            other => Err(ConfigError::invalid("NT_AUTH_PROVIDER", format!("unknown provider '{}'", other))),
        }
    }
}

impl FromStr for SourceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "change-stream" | "change_stream" => Ok(Self::ChangeStream),
            other => Err(ConfigError::invalid("NT_SOURCE_MODE", format!("unknown mode '{}'", other))),
        }
    }
}

impl RelayConfig {
    /// Load from `NT_CONFIG_PATH` (if set) and the process environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("NT_CONFIG_PATH").ok().map(PathBuf::from);
        Self::from_sources(path.as_deref(), |key| std::env::var(key).ok())
    }

    /// Load from an optional file and an environment lookup, then validate.
    pub fn from_sources<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!(path = %path.display(), "Loaded configuration file");
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };

        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Override fields with any environment values that are present
    pub fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("API_NLP_SERVICE_URL") {
            self.nlp_service_url = url;
        }

        if let Some(host) = get("NT_HOST") {
            self.server.host = host;
        }
        // NT_PORT wins over the platform-provided PORT
        if let Some(port) = get("NT_PORT").or_else(|| get("PORT")) {
            self.server.port = parse_number("NT_PORT", &port)?;
        }

        if let Some(backend) = get("NT_AUDIT_BACKEND") {
            self.audit.backend = backend.parse()?;
        }
        if let Some(uri) = get("NT_MONGO_URI") {
            self.audit.mongo_uri = uri;
        }
        if let Some(db) = get("NT_MONGO_DB") {
            self.audit.database = db;
        }
        if let Some(collection) = get("NT_AUDIT_COLLECTION") {
            self.audit.collection = collection;
        }

        if let Some(provider) = get("NT_AUTH_PROVIDER") {
            self.auth.provider = provider.parse()?;
        }
        if let Some(path) = get("GOOGLE_APPLICATION_CREDENTIALS") {
            self.auth.credentials_path = Some(PathBuf::from(path));
        }
        if let Some(token) = get("NT_STATIC_TOKEN") {
            self.auth.static_token = Some(token);
        }
        if let Some(url) = get("NT_METADATA_URL") {
            self.auth.metadata_url = url;
        }

        if let Some(secs) = get("NT_DISPATCH_TIMEOUT_SECS") {
            self.dispatch.request_timeout_secs = parse_number("NT_DISPATCH_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = get("NT_CONNECT_TIMEOUT_SECS") {
            self.dispatch.connect_timeout_secs = parse_number("NT_CONNECT_TIMEOUT_SECS", &secs)?;
        }

        if let Some(mode) = get("NT_SOURCE_MODE") {
            self.source.mode = mode.parse()?;
        }
        if let Some(db) = get("NT_WATCH_DB") {
            self.source.watch_database = db;
        }
        if let Some(collection) = get("NT_WATCH_COLLECTION") {
            self.source.watch_collection = collection;
        }
        if let Some(collection) = get("NT_CHECKPOINT_COLLECTION") {
            self.source.checkpoint_collection = collection;
        }

        Ok(())
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let url = self.nlp_service_url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(ConfigError::Missing("API_NLP_SERVICE_URL"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "API_NLP_SERVICE_URL",
                format!("'{}' is not an http(s) URL", url),
            ));
        }
        self.nlp_service_url = url.to_string();

        if self.dispatch.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("NT_DISPATCH_TIMEOUT_SECS", "must be greater than zero"));
        }

        if self.auth.provider == AuthProviderKind::Static && self.auth.static_token.is_none() {
            return Err(ConfigError::Missing("NT_STATIC_TOKEN"));
        }
        if self.auth.provider == AuthProviderKind::ServiceAccount && self.auth.credentials_path.is_none() {
            return Err(ConfigError::Missing("GOOGLE_APPLICATION_CREDENTIALS"));
        }

        if self.source.mode == SourceMode::ChangeStream && self.audit.backend != AuditBackendKind::Mongo {
            return Err(ConfigError::invalid(
                "NT_SOURCE_MODE",
                "change-stream mode requires the mongo audit backend",
            ));
        }

        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a valid number", value)))
}
