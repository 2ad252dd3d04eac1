use std::collections::BTreeMap;

use serde_json::{Number, Value};
use tablegate_contracts::{
    AttrValue, Attributes, Failure, OwnershipCondition, Record, StorageCommand,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use ulid::Ulid;

use crate::route::{Action, FieldKind, FieldSpec, ID_PARAM, OperationDescriptor, ScanScope};

/// Everything the renderer reads from the inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestInput<'a> {
    pub path_params: &'a BTreeMap<String, String>,
    pub body: Option<&'a Value>,
    pub principal: &'a str,
}

/// Server-assigned values for a record being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Minted {
    pub id: String,
    pub created_at: String,
}

impl Minted {
    pub fn fresh() -> Self {
        Self {
            id: Ulid::new().to_string(),
            created_at: now_rfc3339(),
        }
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// `mint` is only called for a Create whose body rendered cleanly.
pub fn render_request(
    descriptor: &OperationDescriptor,
    input: RequestInput<'_>,
    mint: impl FnOnce() -> Minted,
) -> Result<StorageCommand, Failure> {
    let principal = input.principal.trim();
    if principal.is_empty() {
        return Err(Failure::unauthorized("missing caller principal"));
    }

    match descriptor.action {
        Action::Create => {
            let attributes = render_fields(descriptor.required_fields, input.body)?;
            let minted = mint();
            Ok(StorageCommand::PutItem {
                record: Record {
                    id: minted.id,
                    owner_id: principal.to_string(),
                    created_at: minted.created_at,
                    attributes,
                },
            })
        }
        Action::Read => Ok(StorageCommand::GetItem {
            id: path_id(input.path_params)?,
        }),
        Action::List | Action::Query => Ok(match descriptor.scan_scope {
            ScanScope::All => StorageCommand::Scan,
            ScanScope::ByOwner => StorageCommand::QueryByOwner {
                owner_id: principal.to_string(),
            },
        }),
        Action::Update => {
            let id = path_id(input.path_params)?;
            let attributes = render_fields(descriptor.required_fields, input.body)?;
            Ok(StorageCommand::ConditionalUpdate {
                id,
                attributes,
                condition: ownership(descriptor, principal)?,
            })
        }
        Action::Delete => Ok(StorageCommand::ConditionalDelete {
            id: path_id(input.path_params)?,
            condition: ownership(descriptor, principal)?,
        }),
    }
}

/// Read-only ownership check issued when a guarded mutation cannot be rendered,
/// so a non-owner learns nothing beyond the denial.
pub fn ownership_probe(
    descriptor: &OperationDescriptor,
    path_params: &BTreeMap<String, String>,
    principal: &str,
) -> Option<StorageCommand> {
    let principal = principal.trim();
    if !descriptor.requires_ownership || principal.is_empty() {
        return None;
    }

    let id = path_id(path_params).ok()?;
    Some(StorageCommand::ConditionCheck {
        id,
        condition: OwnershipCondition::new(principal),
    })
}

fn ownership(
    descriptor: &OperationDescriptor,
    principal: &str,
) -> Result<OwnershipCondition, Failure> {
    if !descriptor.requires_ownership {
        return Err(Failure::malformed(format!(
            "operation `{}` mutates without an ownership guard",
            descriptor.name
        )));
    }
    Ok(OwnershipCondition::new(principal))
}

fn path_id(path_params: &BTreeMap<String, String>) -> Result<String, Failure> {
    path_params
        .get(ID_PARAM)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| Failure::malformed("missing `id` path parameter"))
}

fn render_fields(fields: &[FieldSpec], body: Option<&Value>) -> Result<Attributes, Failure> {
    let Some(obj) = body.and_then(Value::as_object) else {
        return Err(Failure::malformed("request body must be a JSON object"));
    };

    let mut unexpected = obj
        .keys()
        .filter(|key| !fields.iter().any(|field| field.name == key.as_str()))
        .map(String::as_str)
        .collect::<Vec<_>>();
    if !unexpected.is_empty() {
        unexpected.sort_unstable();
        return Err(Failure::malformed(format!(
            "unexpected field(s): {}",
            unexpected.join(", ")
        )));
    }

    let mut attributes = Attributes::new();
    for field in fields {
        let value = obj
            .get(field.name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                Failure::malformed(format!("missing required field `{}`", field.name))
            })?;
        attributes.insert(field.name.to_string(), coerce(field, value)?);
    }

    Ok(attributes)
}

fn coerce(field: &FieldSpec, value: &Value) -> Result<AttrValue, Failure> {
    let coerced = match (field.kind, value) {
        (FieldKind::String, Value::String(s)) => Some(AttrValue::S(s.clone())),
        (FieldKind::Number, Value::Number(n)) => Some(AttrValue::N(n.clone())),
        (FieldKind::Number, Value::String(s)) => parse_number(s).map(AttrValue::N),
        _ => None,
    };

    coerced.ok_or_else(|| {
        Failure::malformed(format!(
            "field `{}` must be a {}",
            field.name,
            field.kind.as_str()
        ))
    })
}

/// Numeric text as it arrives in form-ish bodies: integers stay integers.
fn parse_number(raw: &str) -> Option<Number> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Some(Number::from(v));
    }
    if let Ok(v) = raw.parse::<u64>() {
        return Some(Number::from(v));
    }
    raw.parse::<f64>().ok().and_then(Number::from_f64)
}
