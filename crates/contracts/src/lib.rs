use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub const ATTR_ID: &str = "id";
pub const ATTR_OWNER_ID: &str = "ownerId";
pub const ATTR_CREATED_AT: &str = "createdAt";

/// Attribute names owned by the system; callers can never supply them.
pub const SYSTEM_ATTRIBUTES: [&str; 3] = [ATTR_ID, ATTR_OWNER_ID, ATTR_CREATED_AT];

/// A typed attribute value as the storage engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    S(String),
    N(Number),
}

impl AttrValue {
    pub fn to_json(&self) -> Value {
        match self {
            AttrValue::S(s) => Value::String(s.clone()),
            AttrValue::N(n) => Value::Number(n.clone()),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::S(value.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::N(Number::from(value))
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// The stored entity. `id` is the partition key, `owner_id` the secondary index key.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub owner_id: String,
    pub created_at: String,
    pub attributes: Attributes,
}

impl Record {
    /// Flat JSON shape served to clients: system attributes next to caller attributes.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::with_capacity(self.attributes.len() + SYSTEM_ATTRIBUTES.len());
        for (name, value) in &self.attributes {
            obj.insert(name.clone(), value.to_json());
        }
        obj.insert(ATTR_ID.to_string(), Value::String(self.id.clone()));
        obj.insert(ATTR_OWNER_ID.to_string(), Value::String(self.owner_id.clone()));
        obj.insert(
            ATTR_CREATED_AT.to_string(),
            Value::String(self.created_at.clone()),
        );
        Value::Object(obj)
    }
}

/// The predicate `ownerId == owner_id`, evaluated by the storage engine inside the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipCondition {
    pub owner_id: String,
}

impl OwnershipCondition {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }

    pub fn holds_for(&self, record: &Record) -> bool {
        record.owner_id == self.owner_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageCommand {
    /// Insert guarded by "no item with this id exists yet".
    PutItem {
        record: Record,
    },
    GetItem {
        id: String,
    },
    Scan,
    QueryByOwner {
        owner_id: String,
    },
    ConditionalUpdate {
        id: String,
        attributes: Attributes,
        condition: OwnershipCondition,
    },
    ConditionalDelete {
        id: String,
        condition: OwnershipCondition,
    },
    /// Evaluates the ownership predicate against the stored item without writing.
    ConditionCheck {
        id: String,
        condition: OwnershipCondition,
    },
}

impl StorageCommand {
    pub fn action_label(&self) -> &'static str {
        match self {
            StorageCommand::PutItem { .. } => "put_item",
            StorageCommand::GetItem { .. } => "get_item",
            StorageCommand::Scan => "scan",
            StorageCommand::QueryByOwner { .. } => "query_by_owner",
            StorageCommand::ConditionalUpdate { .. } => "update_if_owner",
            StorageCommand::ConditionalDelete { .. } => "delete_if_owner",
            StorageCommand::ConditionCheck { .. } => "check_owner",
        }
    }

    /// Partition key targeted by point operations.
    pub fn key(&self) -> Option<&str> {
        match self {
            StorageCommand::PutItem { record } => Some(record.id.as_str()),
            StorageCommand::GetItem { id }
            | StorageCommand::ConditionalUpdate { id, .. }
            | StorageCommand::ConditionalDelete { id, .. }
            | StorageCommand::ConditionCheck { id, .. } => Some(id.as_str()),
            StorageCommand::Scan | StorageCommand::QueryByOwner { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageOutput {
    Written { id: String },
    Checked { id: String },
    Item(Record),
    Items(Vec<Record>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedRequest,
    Unauthorized,
    ConditionFailed,
    NotFound,
    Throttled,
    Unavailable,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "ERR_MALFORMED_REQUEST",
            ErrorKind::Unauthorized => "ERR_UNAUTHORIZED",
            ErrorKind::ConditionFailed => "ERR_CONDITION_FAILED",
            ErrorKind::NotFound => "ERR_NOT_FOUND",
            ErrorKind::Throttled => "ERR_THROTTLED",
            ErrorKind::Unavailable => "ERR_UNAVAILABLE",
            ErrorKind::Unknown => "ERR_UNKNOWN",
        }
    }

    /// Failures raised by the storage engine rather than by the caller.
    pub fn is_storage_side(self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled | ErrorKind::Unavailable | ErrorKind::Unknown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for Failure {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fluffy() -> Record {
        Record {
            id: "01J0000000000000000000000X".to_string(),
            owner_id: "P1".to_string(),
            created_at: "2026-10-16T00:00:00Z".to_string(),
            attributes: Attributes::from([
                ("name".to_string(), AttrValue::from("Fluffy")),
                ("type".to_string(), AttrValue::from("Cat")),
                ("age".to_string(), AttrValue::from(3)),
            ]),
        }
    }

    #[test]
    fn record_json_is_flat_and_keeps_number_types() {
        let json = fluffy().to_json();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "01J0000000000000000000000X",
                "ownerId": "P1",
                "createdAt": "2026-10-16T00:00:00Z",
                "name": "Fluffy",
                "type": "Cat",
                "age": 3,
            })
        );
        assert!(json.get("age").is_some_and(|v| v.is_number()));
    }

    #[test]
    fn system_attributes_win_over_colliding_attribute_names() {
        let mut record = fluffy();
        record
            .attributes
            .insert("ownerId".to_string(), AttrValue::from("spoofed"));

        let json = record.to_json();
        assert_eq!(json.get("ownerId"), Some(&Value::String("P1".to_string())));
    }

    #[test]
    fn attr_value_deserializes_untagged_json() {
        let s: AttrValue = serde_json::from_value(serde_json::json!("Cat")).unwrap();
        let n: AttrValue = serde_json::from_value(serde_json::json!(2.5)).unwrap();
        assert_eq!(s, AttrValue::from("Cat"));
        assert_eq!(n.to_json(), serde_json::json!(2.5));
        assert!(serde_json::from_value::<AttrValue>(serde_json::json!(true)).is_err());
    }

    #[test]
    fn ownership_condition_compares_owner_only() {
        let record = fluffy();
        assert!(OwnershipCondition::new("P1").holds_for(&record));
        assert!(!OwnershipCondition::new("P2").holds_for(&record));
    }

    #[test]
    fn command_key_and_labels() {
        let update = StorageCommand::ConditionalUpdate {
            id: "abc".to_string(),
            attributes: Attributes::new(),
            condition: OwnershipCondition::new("P1"),
        };
        assert_eq!(update.key(), Some("abc"));
        assert_eq!(update.action_label(), "update_if_owner");
        assert_eq!(StorageCommand::Scan.key(), None);
    }

    #[test]
    fn storage_side_kinds() {
        assert!(ErrorKind::Throttled.is_storage_side());
        assert!(ErrorKind::Unknown.is_storage_side());
        assert!(!ErrorKind::ConditionFailed.is_storage_side());
        assert_eq!(ErrorKind::NotFound.as_str(), "ERR_NOT_FOUND");
    }
}
