use std::collections::BTreeMap;
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use serde_json::Value;
use tablegate_contracts::{ErrorKind, Failure, StorageCommand, StorageOutput};
use tablegate_mapping::{
    ID_PARAM, Minted, OperationDescriptor, RequestInput, ResponseContext, RouteMiss,
    ownership_probe, render_failure, render_request, render_response,
};
use tracing::Instrument;

use super::{
    AppState, auth_error_response, extract_request_id, json_error, json_response,
};

const UNMATCHED_ROUTE: &str = "unmatched";

/// Serves every resource route declared in the route table.
pub(super) async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let request_id = extract_request_id(&parts.headers);

    let routes = state.routes.clone();
    let resolved = match routes.resolve(&parts.method, parts.uri.path()) {
        Ok(resolved) => resolved,
        Err(miss) => {
            let response = route_miss_response(miss, &request_id);
            crate::metrics::observe_http_request(
                UNMATCHED_ROUTE,
                parts.method.as_str(),
                response.status().as_u16(),
                started.elapsed(),
            );
            return response;
        }
    };
    let descriptor = resolved.descriptor;

    let span = tracing::info_span!(
        "gateway.request",
        request_id = %request_id,
        operation = descriptor.name,
        principal_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
        status = tracing::field::Empty,
    );

    let response = async {
        let (response, outcome) = handle(
            &state,
            descriptor,
            &resolved.path_params,
            &parts.headers,
            body,
            &request_id,
        )
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", outcome);
        tracing::Span::current().record("status", response.status().as_u16());
        response
    }
    .instrument(span)
    .await;

    crate::metrics::observe_http_request(
        descriptor.path,
        descriptor.method.as_str(),
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

async fn handle(
    state: &AppState,
    descriptor: &OperationDescriptor,
    path_params: &BTreeMap<String, String>,
    headers: &HeaderMap,
    body: Body,
    request_id: &str,
) -> (Response, &'static str) {
    let principal = match state.auth.authenticate(headers).await {
        Ok(principal) => principal,
        Err(err) if err.kind() != ErrorKind::Unauthorized => {
            return (auth_error_response(&err, request_id), err.code());
        }
        Err(err) => {
            let failure = Failure::from(err);
            let rendered = render_failure(Some(descriptor.action), &failure, request_id);
            return (
                json_response(rendered.status, rendered.body, request_id),
                failure.kind.as_str(),
            );
        }
    };
    tracing::Span::current().record("principal_id", principal.principal_id.as_str());

    let rendered_command = read_body(descriptor, body, state.config.max_body_bytes)
        .await
        .and_then(|body| {
            render_request(
                descriptor,
                RequestInput {
                    path_params,
                    body: body.as_ref(),
                    principal: &principal.principal_id,
                },
                Minted::fresh,
            )
        });

    let outcome = match rendered_command {
        Ok(command) => execute(state, command).await,
        Err(failure) => {
            probe_then_fail(state, descriptor, path_params, &principal.principal_id, failure).await
        }
    };

    let requested_id = path_params.get(ID_PARAM).map(String::as_str);
    if descriptor.requires_ownership
        && let Err(failure) = &outcome
        && failure.kind == ErrorKind::ConditionFailed
    {
        crate::metrics::inc_ownership_denial();
        tracing::warn!(
            operation = descriptor.name,
            principal_id = %principal.principal_id,
            target_id = requested_id.unwrap_or("-"),
            "gateway.ownership_denied"
        );
    }

    let label = match &outcome {
        Ok(_) => "ok",
        Err(failure) => failure.kind.as_str(),
    };
    let rendered = render_response(
        descriptor,
        &outcome,
        ResponseContext {
            request_id,
            requested_id,
        },
    );
    (
        json_response(rendered.status, rendered.body, request_id),
        label,
    )
}

/// Bodies are only read for actions that declare fields; an empty body reads as absent.
async fn read_body(
    descriptor: &OperationDescriptor,
    body: Body,
    limit: usize,
) -> Result<Option<Value>, Failure> {
    if !descriptor.action.takes_body() {
        return Ok(None);
    }

    let bytes = to_bytes(body, limit).await.map_err(|_| {
        Failure::malformed(format!(
            "request body is unreadable or larger than {} bytes",
            limit
        ))
    })?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice::<Value>(&bytes)
        .map(Some)
        .map_err(|_| Failure::malformed("request body is not valid JSON"))
}

/// A guarded mutation with an unusable body still answers the ownership question
/// first, so a non-owner is denied regardless of what it sent.
async fn probe_then_fail(
    state: &AppState,
    descriptor: &OperationDescriptor,
    path_params: &BTreeMap<String, String>,
    principal: &str,
    failure: Failure,
) -> Result<StorageOutput, Failure> {
    if failure.kind != ErrorKind::MalformedRequest {
        return Err(failure);
    }
    let Some(probe) = ownership_probe(descriptor, path_params, principal) else {
        return Err(failure);
    };

    match execute(state, probe).await {
        Ok(_) => Err(failure),
        Err(denied) => Err(denied),
    }
}

async fn execute(state: &AppState, command: StorageCommand) -> Result<StorageOutput, Failure> {
    let action = command.action_label();
    let outcome = state
        .storage
        .execute(command, state.config.storage_timeout())
        .await;

    let label = match &outcome {
        Ok(_) => "ok",
        Err(failure) => failure.kind.as_str(),
    };
    crate::metrics::observe_storage_call(action, label);
    outcome
}

fn route_miss_response(miss: RouteMiss, request_id: &str) -> Response {
    match miss {
        RouteMiss::NotFound => {
            let rendered = render_failure(
                None,
                &Failure::new(ErrorKind::NotFound, "no route matches this path"),
                request_id,
            );
            json_response(rendered.status, rendered.body, request_id)
        }
        RouteMiss::MethodNotAllowed { allowed } => {
            let mut response =
                json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed", request_id);
            let allow = allowed
                .iter()
                .map(|method| method.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                response.headers_mut().insert(header::ALLOW, value);
            }
            response
        }
    }
}
