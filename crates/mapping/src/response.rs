use http::StatusCode;
use serde_json::Value;
use tablegate_contracts::{ErrorKind, Failure, StorageOutput};

use crate::route::{Action, OperationDescriptor};

pub const NOT_FOUND_MESSAGE: &str = "not found";

#[derive(Debug, Clone, Copy)]
pub struct ResponseContext<'a> {
    pub request_id: &'a str,
    /// The `{id}` path parameter, echoed back by Update and Delete.
    pub requested_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResponse {
    pub status: StatusCode,
    pub body: Value,
}

pub fn render_response(
    descriptor: &OperationDescriptor,
    outcome: &Result<StorageOutput, Failure>,
    ctx: ResponseContext<'_>,
) -> RenderedResponse {
    match outcome {
        Ok(output) => render_success(descriptor.action, output, ctx),
        Err(failure) => render_failure(Some(descriptor.action), failure, ctx.request_id),
    }
}

fn render_success(
    action: Action,
    output: &StorageOutput,
    ctx: ResponseContext<'_>,
) -> RenderedResponse {
    let body = match (action, output) {
        (Action::Create, StorageOutput::Written { id }) => serde_json::json!({ "id": id }),
        (Action::Read, StorageOutput::Item(record)) => {
            serde_json::json!({ "item": record.to_json() })
        }
        (Action::List | Action::Query, StorageOutput::Items(records)) => {
            let items = records.iter().map(|r| r.to_json()).collect::<Vec<_>>();
            serde_json::json!({ "items": items })
        }
        (Action::Update | Action::Delete, StorageOutput::Written { id }) => {
            serde_json::json!({ "id": ctx.requested_id.unwrap_or(id.as_str()) })
        }
        _ => {
            let failure = Failure::new(
                ErrorKind::Unknown,
                format!(
                    "storage returned an unexpected result for {}",
                    action.as_str()
                ),
            );
            return render_failure(Some(action), &failure, ctx.request_id);
        }
    };

    RenderedResponse {
        status: StatusCode::OK,
        body,
    }
}

/// Maps a tagged failure to its status code. `action` is `None` when no
/// operation was resolved.
pub fn render_failure(
    action: Option<Action>,
    failure: &Failure,
    request_id: &str,
) -> RenderedResponse {
    let status = match failure.kind {
        ErrorKind::MalformedRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::ConditionFailed if action == Some(Action::Create) => StatusCode::CONFLICT,
        ErrorKind::ConditionFailed => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Throttled | ErrorKind::Unavailable | ErrorKind::Unknown => {
            StatusCode::BAD_GATEWAY
        }
    };

    let message = match failure.kind {
        ErrorKind::NotFound => NOT_FOUND_MESSAGE,
        _ => failure.message.as_str(),
    };

    RenderedResponse {
        status,
        body: error_body(message, request_id),
    }
}

pub fn error_body(message: &str, request_id: &str) -> Value {
    serde_json::json!({
        "error": message,
        "requestId": request_id,
    })
}
