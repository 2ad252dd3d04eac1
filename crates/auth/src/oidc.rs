use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{AuthError, Principal, bearer_token};

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: Option<String>,
    pub jwks_url: Option<String>,
    /// Inline JWKS; takes precedence over `jwks_url` and is never refreshed.
    pub jwks_json: Option<String>,
    pub jwks_timeout: Duration,
    pub jwks_refresh_ttl: Duration,
    pub clock_skew: Duration,
    pub principal_id_claim: String,
}

/// Decoded signing keys by `kid`.
type KeyRing = HashMap<String, DecodingKey>;

enum KeySource {
    Pinned(KeyRing),
    Remote(RemoteKeys),
}

struct RemoteKeys {
    url: String,
    client: reqwest::Client,
    refresh_ttl: Duration,
    ring: RwLock<FetchedRing>,
}

struct FetchedRing {
    keys: KeyRing,
    fetched_at: Instant,
}

/// Validates RS256 bearer tokens and reads the principal from one claim.
#[derive(Clone)]
pub struct OidcAuthenticator {
    source: Arc<KeySource>,
    validation: Validation,
    principal_claim: String,
}

impl OidcAuthenticator {
    pub async fn new(config: OidcConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError::Config("oidc issuer must be non-empty".to_string()));
        }
        if config.principal_id_claim.trim().is_empty() {
            return Err(AuthError::Config(
                "oidc principal claim must be non-empty".to_string(),
            ));
        }

        let source = KeySource::load(&config).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(std::slice::from_ref(&config.issuer));
        match config.audience.as_ref() {
            Some(audience) => validation.set_audience(std::slice::from_ref(audience)),
            None => validation.validate_aud = false,
        }
        validation.leeway = config.clock_skew.as_secs();

        Ok(Self {
            source: Arc::new(source),
            validation,
            principal_claim: config.principal_id_claim.trim().to_string(),
        })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let header = decode_header(token)
            .map_err(|_| AuthError::Rejected("invalid JWT header".to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::Rejected(
                "unsupported JWT alg (expected RS256)".to_string(),
            ));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Rejected("JWT header missing kid".to_string()))?;

        let key = self.source.key(&kid).await?;
        let token = decode::<Value>(token, &key, &self.validation)
            .map_err(|_| AuthError::Rejected("JWT validation failed".to_string()))?;

        principal_from_claims(&token.claims, &self.principal_claim)
    }
}

impl KeySource {
    async fn load(config: &OidcConfig) -> Result<Self, AuthError> {
        if let Some(jwks_json) = config.jwks_json.as_deref() {
            let set = serde_json::from_str::<JwkSet>(jwks_json).map_err(|_| {
                AuthError::Config("TABLEGATE_OIDC_JWKS_JSON is not valid JWKS JSON".to_string())
            })?;
            let keys = key_ring(&set);
            if keys.is_empty() {
                return Err(AuthError::Config(
                    "TABLEGATE_OIDC_JWKS_JSON has no usable keys with a kid".to_string(),
                ));
            }
            return Ok(KeySource::Pinned(keys));
        }

        let Some(url) = config.jwks_url.clone() else {
            return Err(AuthError::Config(
                "oidc requires jwks_url or jwks_json".to_string(),
            ));
        };
        let client = reqwest::Client::builder()
            .timeout(config.jwks_timeout)
            .build()
            .map_err(|_| AuthError::Config("failed to build the JWKS http client".to_string()))?;

        let keys = fetch_ring(&client, &url).await?;
        Ok(KeySource::Remote(RemoteKeys {
            url,
            client,
            refresh_ttl: config.jwks_refresh_ttl,
            ring: RwLock::new(FetchedRing {
                keys,
                fetched_at: Instant::now(),
            }),
        }))
    }

    async fn key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        match self {
            KeySource::Pinned(keys) => keys.get(kid).cloned().ok_or_else(unknown_kid),
            KeySource::Remote(remote) => remote.key(kid).await,
        }
    }
}

impl RemoteKeys {
    /// An unknown `kid` triggers at most one refetch per refresh window.
    async fn key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let ring = self.ring.read().await;
            if let Some(key) = ring.keys.get(kid) {
                return Ok(key.clone());
            }
            if ring.fetched_at.elapsed() <= self.refresh_ttl {
                return Err(unknown_kid());
            }
        }

        let mut ring = self.ring.write().await;
        if ring.fetched_at.elapsed() > self.refresh_ttl {
            ring.keys = fetch_ring(&self.client, &self.url).await?;
            ring.fetched_at = Instant::now();
        }
        ring.keys.get(kid).cloned().ok_or_else(unknown_kid)
    }
}

async fn fetch_ring(client: &reqwest::Client, url: &str) -> Result<KeyRing, AuthError> {
    let set = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|_| AuthError::Unavailable("failed to fetch JWKS".to_string()))?
        .json::<JwkSet>()
        .await
        .map_err(|_| AuthError::Unavailable("JWKS endpoint returned invalid JSON".to_string()))?;
    Ok(key_ring(&set))
}

/// Keys without a `kid` or that do not decode are skipped; tokens must name their key.
fn key_ring(set: &JwkSet) -> KeyRing {
    set.keys
        .iter()
        .filter_map(|jwk| {
            let kid = jwk.common.key_id.clone()?;
            let key = DecodingKey::from_jwk(jwk).ok()?;
            Some((kid, key))
        })
        .collect()
}

fn unknown_kid() -> AuthError {
    AuthError::Rejected("JWT kid not found in JWKS".to_string())
}

fn principal_from_claims(claims: &Value, claim: &str) -> Result<Principal, AuthError> {
    claims
        .get(claim)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Principal {
            principal_id: s.to_string(),
        })
        .ok_or_else(|| {
            AuthError::Rejected(format!(
                "required claim `{}` is missing or not a string",
                claim
            ))
        })
}
