use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tablegate_auth::{AuthError, Authenticator, LocalAuthenticator, OidcAuthenticator};
use tablegate_contracts::ErrorKind;
use tablegate_mapping::{RouteTable, error_body};
use tablegate_storage::{MemoryEngine, PgEngine, Storage};
use ulid::Ulid;

use crate::config::{AuthMode, GatewayConfig, StartupError, StorageBackend};

mod dispatch;

pub use tablegate_auth::{LOCAL_AUTH_SECRET_HEADER, PRINCIPAL_ID_HEADER};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    auth: Authenticator,
    storage: Storage,
    routes: Arc<RouteTable>,
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let storage = connect_storage(&config).await?;
    router_with_storage(config, storage).await
}

/// Builds the router over an already-constructed storage backend.
pub async fn router_with_storage(
    config: GatewayConfig,
    storage: Storage,
) -> Result<Router, StartupError> {
    let auth = match config.auth_mode {
        AuthMode::Local => Authenticator::Local(LocalAuthenticator::new(
            config.local_auth_shared_secret.clone(),
        )),
        AuthMode::Oidc => {
            let oidc_config = config.oidc.clone().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc auth mode requires oidc config".to_string(),
            })?;
            let oidc = OidcAuthenticator::new(oidc_config)
                .await
                .map_err(|err| StartupError {
                    code: err.code(),
                    message: err.message().to_string(),
                })?;
            Authenticator::Oidc(oidc)
        }
    };

    let routes = RouteTable::pets().map_err(|err| StartupError {
        code: "ERR_INVALID_ROUTE_TABLE",
        message: err.to_string(),
    })?;

    tracing::info!(
        backend = storage.backend_name(),
        auth_mode = auth.mode(),
        operations = routes.descriptors().count(),
        "gateway.routes_loaded"
    );

    let state = AppState {
        config,
        auth,
        storage,
        routes: Arc::new(routes),
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .fallback(dispatch::dispatch)
        .with_state(state))
}

async fn connect_storage(config: &GatewayConfig) -> Result<Storage, StartupError> {
    match config.storage_backend {
        StorageBackend::Memory => Ok(Storage::Memory(MemoryEngine::with_throughput(
            config.memory_throughput_limit,
            Duration::from_millis(config.memory_throughput_window_ms),
        ))),
        StorageBackend::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "missing required config key TABLEGATE_DB_URL".to_string(),
            })?;
            let engine = PgEngine::connect_and_migrate(db_url, config.storage_timeout())
                .await
                .map_err(|err| StartupError {
                    code: "ERR_STORAGE_UNAVAILABLE",
                    message: format!("failed to initialize storage: {}", err),
                })?;
            Ok(Storage::Postgres(engine))
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("storage", state.storage.ping().await);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.config.metrics_require_auth
        && let Err(err) = state.auth.authenticate(&headers).await
    {
        let request_id = extract_request_id(&headers);
        return auth_error_response(&err, &request_id);
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

fn auth_error_response(err: &AuthError, request_id: &str) -> Response {
    let status = match err.kind() {
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    json_error(status, err.message(), request_id)
}

fn json_error(status: StatusCode, message: &str, request_id: &str) -> Response {
    json_response(status, error_body(message, request_id), request_id)
}

fn json_response(status: StatusCode, body: serde_json::Value, request_id: &str) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn request_id_is_sanitized_or_minted() {
        let id = extract_request_id(&headers(&[(REQUEST_ID_HEADER, "abc-123_x.y")]));
        assert_eq!(id, "abc-123_x.y");

        let id = extract_request_id(&headers(&[(REQUEST_ID_HEADER, "a b<c>")]));
        assert_eq!(id, "abc");

        let long = "x".repeat(200);
        let id = extract_request_id(&headers(&[(REQUEST_ID_HEADER, long.as_str())]));
        assert_eq!(id.len(), 64);

        let minted = extract_request_id(&headers(&[(REQUEST_ID_HEADER, "<>")]));
        assert!(minted.parse::<Ulid>().is_ok());
        assert!(extract_request_id(&HeaderMap::new()).parse::<Ulid>().is_ok());
    }

    #[test]
    fn auth_errors_map_to_401_or_503() {
        let invalid = AuthError::Rejected("JWT validation failed".to_string());
        let response = auth_error_response(&invalid, "req-1");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-1");

        let unavailable = AuthError::Unavailable("failed to fetch JWKS".to_string());
        let response = auth_error_response(&unavailable, "req-1");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
