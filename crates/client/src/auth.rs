//! Credential acquisition for the collector: OAuth client-credentials grant,
//! verified against a configured JSON Web Key Set.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Claim carrying the registered client's token id.
pub const CLIENT_TOKEN_ID_CLAIM: &str = "https://altconsole.register.com/clientTokenId";

/// Tokens are refreshed this long before the advertised expiry.
const EXPIRY_SLACK: Duration = Duration::from_secs(30);
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth config: {0}")]
    Config(String),
    #[error("token request failed: {0}")]
    Request(String),
    #[error("unexpected token response: {0}")]
    Response(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// A bearer credential accepted by the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub client_token_id: Option<String>,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self { token: token.into(), client_token_id: None }
    }
}

/// Source of bearer credentials for delivery requests.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self) -> Result<Credential, AuthError>;
}

#[derive(Clone)]
pub struct AuthConfig {
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
    pub issuer: String,
    pub key_set: JwkSet,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("keys", &self.key_set.keys.len())
            .finish()
    }
}

fn decode_b64(name: &str, value: &str) -> Result<Vec<u8>, AuthError> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| AuthError::Config(format!("{} is not valid base64: {}", name, e)))
}

fn decode_b64_string(name: &str, value: &str) -> Result<String, AuthError> {
    String::from_utf8(decode_b64(name, value)?).map_err(|e| AuthError::Config(format!("{} is not utf-8: {}", name, e)))
}

impl AuthConfig {
    /// Build from deployment values where the key set, issuer and audience are
    /// base64 encoded.
    pub fn from_encoded(
        token_uri: &str,
        client_id: &str,
        client_secret: &str,
        key_set_b64: &str,
        issuer_b64: &str,
        audience_b64: &str,
    ) -> Result<Self, AuthError> {
        if token_uri.trim().is_empty() {
            return Err(AuthError::Config("token uri must not be empty".into()));
        }
        let key_set: JwkSet = serde_json::from_slice(&decode_b64("key set", key_set_b64)?)
            .map_err(|e| AuthError::Config(format!("key set is not a JWKS document: {}", e)))?;
        if key_set.keys.is_empty() {
            return Err(AuthError::Config("key set has no keys".into()));
        }
        Ok(Self {
            token_uri: token_uri.trim().to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            audience: decode_b64_string("audience", audience_b64)?,
            issuer: decode_b64_string("issuer", issuer_b64)?,
            key_set,
        })
    }
}

/// Verifies token signature, issuer, audience and expiry.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    key_set: JwkSet,
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    pub fn new(key_set: JwkSet, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self { key_set, issuer: issuer.into(), audience: audience.into() }
    }

    /// Returns the verified claims.
    pub fn verify(&self, token: &str) -> Result<Value, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let jwk = match header.kid.as_deref() {
            Some(kid) => self.key_set.find(kid),
            None if self.key_set.keys.len() == 1 => self.key_set.keys.first(),
            None => None,
        }
        .ok_or_else(|| AuthError::InvalidToken(format!("no key in key set for kid {:?}", header.kid)))?;
        let key = DecodingKey::from_jwk(jwk).map_err(|e| AuthError::InvalidToken(format!("invalid jwk: {}", e)))?;
        let alg = match key_algorithm(jwk)? {
            Some(alg) if alg != header.alg => {
                return Err(AuthError::InvalidToken(format!("token alg {:?} does not match key alg {:?}", header.alg, alg)))
            }
            Some(alg) => alg,
            None => header.alg,
        };

        let mut validation = Validation::new(alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        decode::<Value>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Signing algorithm pinned by the key itself, if it names one.
fn key_algorithm(jwk: &Jwk) -> Result<Option<Algorithm>, AuthError> {
    let Some(alg) = jwk.common.key_algorithm.as_ref() else { return Ok(None) };
    serde_json::to_value(alg)
        .and_then(serde_json::from_value::<Algorithm>)
        .map(Some)
        .map_err(|_| AuthError::InvalidToken(format!("key algorithm {:?} cannot sign tokens", alg)))
}

pub fn client_token_id(claims: &Value) -> Option<String> {
    claims.get(CLIENT_TOKEN_ID_CLAIM).and_then(Value::as_str).map(str::to_string)
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    audience: &'a str,
    grant_type: &'static str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

struct Cached {
    credential: Credential,
    refresh_at: Instant,
}

impl Cached {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

/// Refresh deadline for a verified token: the earlier of its `exp` claim and
/// the advertised `expires_in`, less [`EXPIRY_SLACK`].
fn refresh_deadline(claims: &Value, expires_in: Option<u64>) -> Instant {
    let unix_now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
    let by_claim = claims
        .get("exp")
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .map(|exp| Duration::from_secs(exp.saturating_sub(unix_now)));
    let lifetime = match (by_claim, expires_in.map(Duration::from_secs)) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => Duration::ZERO,
    };
    Instant::now() + lifetime.saturating_sub(EXPIRY_SLACK)
}

/// Client-credentials grant with a cached, verified token.
pub struct ClientCredentials {
    config: AuthConfig,
    verifier: TokenVerifier,
    http: reqwest::Client,
    cache: RwLock<Option<Cached>>,
}

impl ClientCredentials {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build auth http client: {}", e)))?;
        let verifier = TokenVerifier::new(config.key_set.clone(), config.issuer.clone(), config.audience.clone());
        Ok(Self { config, verifier, http, cache: RwLock::new(None) })
    }

    async fn request_token(&self) -> Result<Cached, AuthError> {
        debug!(uri = %self.config.token_uri, "requesting token");
        let payload = TokenRequest {
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            audience: &self.config.audience,
            grant_type: "client_credentials",
        };
        let resp = self
            .http
            .post(&self.config.token_uri)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Response(format!("status {}: {}", status, body)));
        }
        let body: TokenResponse = resp.json().await.map_err(|e| AuthError::Response(e.to_string()))?;
        if let Some(kind) = body.token_type.as_deref() {
            if !kind.eq_ignore_ascii_case("bearer") {
                return Err(AuthError::Response(format!("unsupported token type {}", kind)));
            }
        }
        let claims = self.verifier.verify(&body.access_token)?;
        let refresh_at = refresh_deadline(&claims, body.expires_in);
        Ok(Cached {
            credential: Credential { token: body.access_token, client_token_id: client_token_id(&claims) },
            refresh_at,
        })
    }
}

#[async_trait::async_trait]
impl CredentialSource for ClientCredentials {
    async fn acquire(&self) -> Result<Credential, AuthError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.credential.clone());
            }
        }
        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.credential.clone());
            }
        }
        let fresh = self.request_token().await?;
        info!(client_token_id = ?fresh.credential.client_token_id, "acquired collector token");
        let credential = fresh.credential.clone();
        *cache = Some(fresh);
        Ok(credential)
    }
}
