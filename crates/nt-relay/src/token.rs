//! Identity token providers
//!
//! The NLP service validates the audience claim of the bearer token against
//! its own URL, so every token is requested for the configured service URL.
//!
//! Backends:
//! - Metadata server (default on managed runtimes)
//! - Service-account key file (`GOOGLE_APPLICATION_CREDENTIALS`)
//! - Static token (local development)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use nt_config::{AuthConfig, AuthProviderKind};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::AuthError;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Issue a bearer identity token for `audience`
    async fn fetch_token(&self, audience: &str) -> Result<String, AuthError>;

    /// Provider name
    fn name(&self) -> &str;
}

/// Create a provider based on configuration
///
/// Only configuration problems fail here. Key files are read on first use, so
/// a missing or unusable key fails the invocation that needs it.
pub fn create_provider(config: &AuthConfig) -> Result<Arc<dyn TokenProvider>, AuthError> {
    match config.provider {
        AuthProviderKind::Static => {
            let token = config.static_token.clone().ok_or_else(|| {
                AuthError::MissingCredentials("static provider requires a token".to_string())
            })?;
            info!("Using static identity token provider");
            Ok(Arc::new(StaticTokenProvider::new(token)))
        }
        AuthProviderKind::ServiceAccount => {
            let path = config.credentials_path.as_deref().ok_or_else(|| {
                AuthError::MissingCredentials("service-account provider requires a key file".to_string())
            })?;
            info!(path = %path.display(), "Using service-account identity token provider");
            Ok(Arc::new(KeyFileTokenProvider::new(path)))
        }
        AuthProviderKind::Metadata => {
            info!(url = %config.metadata_url, "Using metadata server identity token provider");
            Ok(Arc::new(MetadataTokenProvider::new(&config.metadata_url)?))
        }
        AuthProviderKind::Auto => match config.credentials_path.as_deref() {
            Some(path) => {
                info!(path = %path.display(), "Credentials file configured, using service-account provider");
                Ok(Arc::new(KeyFileTokenProvider::new(path)))
            }
            None => {
                info!(url = %config.metadata_url, "No credentials file, using metadata server provider");
                Ok(Arc::new(MetadataTokenProvider::new(&config.metadata_url)?))
            }
        },
    }
}

fn http_client() -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| AuthError::Transport(format!("failed to build HTTP client: {}", e)))
}

async fn read_rejection(response: reqwest::Response) -> AuthError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    AuthError::Rejected { status, body }
}

// ============================================================================
// Metadata Server
// ============================================================================

pub struct MetadataTokenProvider {
    client: reqwest::Client,
    base_url: String,
}

impl MetadataTokenProvider {
    pub fn new(base_url: &str) -> Result<Self, AuthError> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn fetch_token(&self, audience: &str) -> Result<String, AuthError> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/identity",
            self.base_url
        );
        debug!(url = %url, audience = %audience, "Requesting identity token from metadata server");

        let response = self.client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .query(&[("audience", audience), ("format", "full")])
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(read_rejection(response).await);
        }

        let token = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(token.to_string())
    }

    fn name(&self) -> &str {
        "metadata"
    }
}

// ============================================================================
// Service-Account Key File
// ============================================================================

/// The fields of a service-account JSON key this provider needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    target_audience: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct IdTokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

pub struct ServiceAccountTokenProvider {
    client: reqwest::Client,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
}

impl ServiceAccountTokenProvider {
    pub fn new(key: ServiceAccountKey) -> Result<Self, AuthError> {
        if key.key_type != "service_account" {
            return Err(AuthError::Credentials {
                path: key.client_email.clone(),
                message: format!("credentials of type '{}' cannot issue identity tokens", key.key_type),
            });
        }
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;

        Ok(Self {
            client: http_client()?,
            key,
            encoding_key,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let credentials_error = |message: String| AuthError::Credentials {
            path: path.display().to_string(),
            message,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| credentials_error(e.to_string()))?;
        let key: ServiceAccountKey =
            serde_json::from_str(&contents).map_err(|e| credentials_error(e.to_string()))?;
        Self::new(key)
    }

    /// Signed JWT assertion asking the token endpoint for an ID token
    fn assertion(&self, audience: &str) -> Result<String, AuthError> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            sub: &self.key.client_email,
            aud: &self.key.token_uri,
            target_audience: audience,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding_key)?)
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    async fn fetch_token(&self, audience: &str) -> Result<String, AuthError> {
        let assertion = self.assertion(audience)?;
        debug!(token_uri = %self.key.token_uri, audience = %audience, "Exchanging assertion for identity token");

        let response = self.client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(read_rejection(response).await);
        }

        let body: IdTokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Transport(format!("invalid token response: {}", e)))?;

        body.id_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::EmptyToken)
    }

    fn name(&self) -> &str {
        "service-account"
    }
}

/// Service-account provider backed by a key file path.
///
/// The file is loaded and validated on the first token request and cached
/// once it loads; a failed load is retried on the next request.
pub struct KeyFileTokenProvider {
    path: PathBuf,
    loaded: OnceCell<ServiceAccountTokenProvider>,
}

impl KeyFileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: OnceCell::new(),
        }
    }

    async fn provider(&self) -> Result<&ServiceAccountTokenProvider, AuthError> {
        self.loaded
            .get_or_try_init(|| async { ServiceAccountTokenProvider::from_file(&self.path) })
            .await
    }
}

#[async_trait]
impl TokenProvider for KeyFileTokenProvider {
    async fn fetch_token(&self, audience: &str) -> Result<String, AuthError> {
        self.provider().await?.fetch_token(audience).await
    }

    fn name(&self) -> &str {
        "service-account"
    }
}

// ============================================================================
// Static Token
// ============================================================================

pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self, _audience: &str) -> Result<String, AuthError> {
        if self.token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(self.token.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}
