//! Bearer-token acquisition for the push gateway.
//!
//! A long-lived service credential (issuer identity + RSA private key) is
//! exchanged for short-lived bearer tokens via the OAuth2 JWT-bearer grant.
//! Tokens are cached in memory with a safety margin under the provider's
//! expiry, and the refresh path is single-flight: concurrent callers racing
//! on a stale cache produce exactly one exchange.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// The JWT-bearer grant type, verbatim from RFC 7523.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Time source, injected so expiry behavior is testable.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_epoch(&self) -> u64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Service credential material: who we sign as, and with what key.
///
/// Loaded once per process from a local secret file; the key never leaves
/// the process and is only used to sign assertions.
#[derive(Clone, Deserialize)]
pub struct ServiceCredential {
    /// Issuer identity placed in the assertion's `iss` claim.
    pub client_email: String,
    /// PKCS#8 PEM-encoded RSA private key.
    pub private_key: String,
}

impl std::fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.debug_struct("ServiceCredential")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl ServiceCredential {
    /// Load a credential from a JSON secret file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialLoad`] if the file cannot be read or
    /// parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| Error::CredentialLoad {
            path: PathBuf::from(path),
            message: err.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|err| Error::CredentialLoad {
            path: PathBuf::from(path),
            message: err.to_string(),
        })
    }
}

/// Token endpoint response; only the access token is consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// The bearer token to attach to gateway requests.
    pub access_token: String,
}

/// The token endpoint as a trait, so tests can count exchanges without a
/// network.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// POST the signed assertion and parse the bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenExchangeFailed`] on a non-200 response.
    async fn exchange(&self, assertion: &str) -> Result<TokenResponse>;
}

/// HTTP token endpoint.
#[derive(Debug)]
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenEndpoint {
    /// Create an endpoint client for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange(&self, assertion: &str) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.url)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Cached bearer token with its local expiry.
#[derive(Debug, Clone)]
struct CachedToken {
    bearer_token: String,
    expires_at_epoch: u64,
}

/// Parameters for assertion construction and caching.
#[derive(Debug, Clone)]
pub struct TokenProviderConfig {
    /// OAuth2 scope requested in the assertion.
    pub scope: String,
    /// The assertion's `aud` claim (the token endpoint URL).
    pub audience: String,
    /// Assertion validity window in seconds.
    pub assertion_lifetime_secs: u64,
    /// How long a fetched token is served from cache. Kept under the
    /// provider-side lifetime so a token is refreshed before the gateway
    /// would reject it.
    pub cache_lifetime_secs: u64,
}

/// Mints and caches bearer tokens from the service credential.
pub struct AccessTokenProvider {
    issuer: String,
    signing_key: SigningKey<Sha256>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    config: TokenProviderConfig,
    // The mutex doubles as the single-flight guard: it is held across the
    // exchange, so racing callers wait and then hit the fresh cache.
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for AccessTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenProvider")
            .field("issuer", &self.issuer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AccessTokenProvider {
    /// Build a provider from credential material.
    ///
    /// The private key is parsed once here; signing never re-reads it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the PEM cannot be parsed.
    pub fn new(
        credential: &ServiceCredential,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
        config: TokenProviderConfig,
    ) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(&credential.private_key)
            .map_err(|err| Error::InvalidKey(err.to_string()))?;
        Ok(Self {
            issuer: credential.client_email.clone(),
            signing_key: SigningKey::<Sha256>::new(key),
            endpoint,
            clock,
            config,
            cached: tokio::sync::Mutex::new(None),
        })
    }

    /// Get a bearer token, reusing the cached one while it is fresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenExchangeFailed`] if the endpoint rejects the
    /// assertion; nothing is cached on failure.
    pub async fn access_token(&self) -> Result<String> {
        let mut cache = self.cached.lock().await;
        let now = self.clock.now_epoch();

        if let Some(token) = cache.as_ref() {
            if token.expires_at_epoch > now {
                debug!("using cached access token");
                return Ok(token.bearer_token.clone());
            }
        }

        let assertion = self.sign_assertion(now);
        let response = match self.endpoint.exchange(&assertion).await {
            Ok(response) => response,
            Err(err) => {
                warn!("token exchange failed: {err}");
                return Err(err);
            }
        };

        *cache = Some(CachedToken {
            bearer_token: response.access_token.clone(),
            expires_at_epoch: now + self.config.cache_lifetime_secs,
        });
        debug!(
            cache_lifetime_secs = self.config.cache_lifetime_secs,
            "access token refreshed"
        );
        Ok(response.access_token)
    }

    /// Build the three-part RS256 assertion: `b64url(header).b64url(claims)`
    /// signed with the credential's key.
    fn sign_assertion(&self, now_epoch: u64) -> String {
        let header = json!({"alg": "RS256", "typ": "JWT"});
        let claims = json!({
            "iss": self.issuer,
            "scope": self.config.scope,
            "aud": self.config.audience,
            "iat": now_epoch,
            "exp": now_epoch + self.config.assertion_lifetime_secs,
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = self.signing_key.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }
}
