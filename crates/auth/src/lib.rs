//! Identity Context Extractor: turns request headers into an opaque principal.
//!
//! Two modes exist. `Local` trusts a principal header (optionally behind a shared
//! secret) and is meant for development; `Oidc` validates an RS256 bearer token.
//! Either way the rest of the system only ever sees [`Principal`].

use http::HeaderMap;
use http::header;
use tablegate_contracts::{ErrorKind, Failure};

mod oidc;

pub use oidc::{OidcAuthenticator, OidcConfig};

pub const PRINCIPAL_ID_HEADER: &str = "x-tablegate-principal-id";
pub const LOCAL_AUTH_SECRET_HEADER: &str = "x-tablegate-local-auth-secret";

/// The caller as the mapping layer sees it: an opaque id and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was presented.
    Missing(String),
    /// A credential was presented and refused.
    Rejected(String),
    /// Signing keys could not be obtained from the identity provider.
    Unavailable(String),
    Config(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Missing(_) => "ERR_AUTH_REQUIRED",
            AuthError::Rejected(_) => "ERR_AUTH_INVALID",
            AuthError::Unavailable(_) => "ERR_AUTH_UNAVAILABLE",
            AuthError::Config(_) => "ERR_INVALID_CONFIG",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AuthError::Missing(m)
            | AuthError::Rejected(m)
            | AuthError::Unavailable(m)
            | AuthError::Config(m) => m,
        }
    }

    /// Credential problems are the caller's; everything else is ours.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Missing(_) | AuthError::Rejected(_) => ErrorKind::Unauthorized,
            AuthError::Unavailable(_) | AuthError::Config(_) => ErrorKind::Unavailable,
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for AuthError {}

impl From<AuthError> for Failure {
    fn from(err: AuthError) -> Self {
        let kind = err.kind();
        let message = match err {
            AuthError::Missing(m)
            | AuthError::Rejected(m)
            | AuthError::Unavailable(m)
            | AuthError::Config(m) => m,
        };
        Failure::new(kind, message)
    }
}

#[derive(Clone)]
pub enum Authenticator {
    Local(LocalAuthenticator),
    Oidc(OidcAuthenticator),
}

impl Authenticator {
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        match self {
            Authenticator::Local(local) => local.authenticate(headers),
            Authenticator::Oidc(oidc) => oidc.authenticate(headers).await,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Authenticator::Local(_) => "local",
            Authenticator::Oidc(_) => "oidc",
        }
    }
}

/// Development mode: the principal is whatever the header says.
#[derive(Debug, Clone, Default)]
pub struct LocalAuthenticator {
    shared_secret: Option<String>,
}

impl LocalAuthenticator {
    pub fn new(shared_secret: Option<String>) -> Self {
        Self {
            shared_secret: shared_secret.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        if let Some(expected) = self.shared_secret.as_deref() {
            match header_value(headers, LOCAL_AUTH_SECRET_HEADER) {
                None => return Err(AuthError::Missing("missing local auth secret".to_string())),
                Some(provided) if provided != expected => {
                    return Err(AuthError::Rejected("invalid local auth secret".to_string()));
                }
                Some(_) => {}
            }
        }

        let principal_id = header_value(headers, PRINCIPAL_ID_HEADER)
            .ok_or_else(|| AuthError::Missing(format!("missing {} header", PRINCIPAL_ID_HEADER)))?;
        Ok(Principal {
            principal_id: principal_id.to_string(),
        })
    }
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extracts the token from `Authorization: Bearer <token>`; the scheme is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = header_value(headers, header::AUTHORIZATION.as_str())
        .ok_or_else(|| AuthError::Missing("missing Authorization header".to_string()))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            if token.is_empty() {
                Err(AuthError::Rejected("Bearer token is empty".to_string()))
            } else {
                Ok(token)
            }
        }
        _ => Err(AuthError::Rejected(
            "Authorization must be a Bearer token".to_string(),
        )),
    }
}
