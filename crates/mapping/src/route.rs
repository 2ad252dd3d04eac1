use std::collections::{BTreeMap, HashSet};

use http::Method;
use tablegate_contracts::SYSTEM_ATTRIBUTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Read,
    List,
    Query,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::List => "list",
            Action::Query => "query",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    pub fn takes_body(self) -> bool {
        matches!(self, Action::Create | Action::Update)
    }

    pub fn targets_id(self) -> bool {
        matches!(self, Action::Read | Action::Update | Action::Delete)
    }

    pub fn is_guarded_mutation(self) -> bool {
        matches!(self, Action::Update | Action::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    All,
    ByOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn string(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::String,
        }
    }

    pub const fn number(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Number,
        }
    }
}

/// Static description of one (method, path) endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: &'static str,
    pub method: Method,
    pub path: &'static str,
    pub action: Action,
    pub requires_ownership: bool,
    pub required_fields: &'static [FieldSpec],
    pub scan_scope: ScanScope,
}

pub const ID_PARAM: &str = "id";

const PET_FIELDS: &[FieldSpec] = &[
    FieldSpec::string("name"),
    FieldSpec::string("type"),
    FieldSpec::number("age"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTableError {
    pub descriptor: &'static str,
    pub message: String,
}

impl std::fmt::Display for RouteTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid operation `{}`: {}", self.descriptor, self.message)
    }
}

impl std::error::Error for RouteTableError {}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(&'static str),
    Param(&'static str),
}

#[derive(Debug, Clone)]
struct Route {
    descriptor: OperationDescriptor,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a> {
    pub descriptor: &'a OperationDescriptor,
    pub path_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMiss {
    NotFound,
    MethodNotAllowed { allowed: Vec<Method> },
}

impl RouteTable {
    pub fn new(descriptors: Vec<OperationDescriptor>) -> Result<Self, RouteTableError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            validate_descriptor(&descriptor)?;
            let segments = parse_pattern(&descriptor)?;

            if !seen.insert((descriptor.method.clone(), segments.clone())) {
                return Err(RouteTableError {
                    descriptor: descriptor.name,
                    message: format!(
                        "duplicate route {} {}",
                        descriptor.method, descriptor.path
                    ),
                });
            }

            routes.push(Route {
                descriptor,
                segments,
            });
        }

        Ok(Self { routes })
    }

    /// The pets resource: `name` and `type` as strings, `age` as a number.
    pub fn pets() -> Result<Self, RouteTableError> {
        Self::new(vec![
            OperationDescriptor {
                name: "pets.create",
                method: Method::POST,
                path: "/pets",
                action: Action::Create,
                requires_ownership: false,
                required_fields: PET_FIELDS,
                scan_scope: ScanScope::All,
            },
            OperationDescriptor {
                name: "pets.list",
                method: Method::GET,
                path: "/pets",
                action: Action::List,
                requires_ownership: false,
                required_fields: &[],
                scan_scope: ScanScope::All,
            },
            OperationDescriptor {
                name: "pets.read",
                method: Method::GET,
                path: "/pets/{id}",
                action: Action::Read,
                requires_ownership: false,
                required_fields: &[],
                scan_scope: ScanScope::All,
            },
            OperationDescriptor {
                name: "pets.update",
                method: Method::PUT,
                path: "/pets/{id}",
                action: Action::Update,
                requires_ownership: true,
                required_fields: PET_FIELDS,
                scan_scope: ScanScope::All,
            },
            OperationDescriptor {
                name: "pets.delete",
                method: Method::DELETE,
                path: "/pets/{id}",
                action: Action::Delete,
                requires_ownership: true,
                required_fields: &[],
                scan_scope: ScanScope::All,
            },
            OperationDescriptor {
                name: "pets.query_mine",
                method: Method::GET,
                path: "/my-pets",
                action: Action::Query,
                requires_ownership: false,
                required_fields: &[],
                scan_scope: ScanScope::ByOwner,
            },
        ])
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.routes.iter().map(|route| &route.descriptor)
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Result<Resolved<'_>, RouteMiss> {
        let Some(request_segments) = split_path(path) else {
            return Err(RouteMiss::NotFound);
        };

        let mut allowed = Vec::new();
        for route in &self.routes {
            let Some(path_params) = match_segments(&route.segments, &request_segments) else {
                continue;
            };

            if route.descriptor.method == *method {
                return Ok(Resolved {
                    descriptor: &route.descriptor,
                    path_params,
                });
            }
            allowed.push(route.descriptor.method.clone());
        }

        if allowed.is_empty() {
            Err(RouteMiss::NotFound)
        } else {
            Err(RouteMiss::MethodNotAllowed { allowed })
        }
    }
}

fn validate_descriptor(descriptor: &OperationDescriptor) -> Result<(), RouteTableError> {
    let fail = |message: String| {
        Err(RouteTableError {
            descriptor: descriptor.name,
            message,
        })
    };
    let action = descriptor.action;

    if descriptor.requires_ownership != action.is_guarded_mutation() {
        return fail(format!(
            "requires_ownership must be {} for {}",
            action.is_guarded_mutation(),
            action.as_str()
        ));
    }

    if action.takes_body() && descriptor.required_fields.is_empty() {
        return fail(format!("{} requires at least one field", action.as_str()));
    }
    if !action.takes_body() && !descriptor.required_fields.is_empty() {
        return fail(format!("{} does not take body fields", action.as_str()));
    }

    let mut names = HashSet::new();
    for field in descriptor.required_fields {
        if field.name.trim().is_empty() {
            return fail("field names must be non-empty".to_string());
        }
        if SYSTEM_ATTRIBUTES.contains(&field.name) {
            return fail(format!(
                "field `{}` collides with a system attribute",
                field.name
            ));
        }
        if !names.insert(field.name) {
            return fail(format!("field `{}` is declared twice", field.name));
        }
    }

    let expected_scope = if action == Action::Query {
        ScanScope::ByOwner
    } else {
        ScanScope::All
    };
    if descriptor.scan_scope != expected_scope {
        return fail(format!(
            "scan_scope {:?} is not valid for {}",
            descriptor.scan_scope,
            action.as_str()
        ));
    }

    Ok(())
}

fn parse_pattern(descriptor: &OperationDescriptor) -> Result<Vec<Segment>, RouteTableError> {
    let fail = |message: String| RouteTableError {
        descriptor: descriptor.name,
        message,
    };

    if !descriptor.path.starts_with('/') {
        return Err(fail(format!(
            "path `{}` must start with `/`",
            descriptor.path
        )));
    }

    let mut segments = Vec::new();
    let trimmed = descriptor.path.trim_end_matches('/');
    for raw in trimmed.split('/').skip(1) {
        if raw.is_empty() {
            return Err(fail(format!(
                "path `{}` has an empty segment",
                descriptor.path
            )));
        }
        match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) if !name.is_empty() => segments.push(Segment::Param(name)),
            Some(_) => {
                return Err(fail(format!(
                    "path `{}` has an unnamed parameter",
                    descriptor.path
                )));
            }
            None => segments.push(Segment::Literal(raw)),
        }
    }

    let has_id = segments.contains(&Segment::Param(ID_PARAM));
    if descriptor.action.targets_id() && !has_id {
        return Err(fail(format!(
            "{} requires an `{{{}}}` path parameter",
            descriptor.action.as_str(),
            ID_PARAM
        )));
    }

    Ok(segments)
}

fn split_path(path: &str) -> Option<Vec<&str>> {
    let path = path.strip_prefix('/')?;
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        return Some(Vec::new());
    }

    let segments = path.split('/').collect::<Vec<_>>();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

fn match_segments(pattern: &[Segment], request: &[&str]) -> Option<BTreeMap<String, String>> {
    if pattern.len() != request.len() {
        return None;
    }

    let mut params = BTreeMap::new();
    for (segment, value) in pattern.iter().zip(request) {
        match segment {
            Segment::Literal(lit) if lit == value => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert((*name).to_string(), (*value).to_string());
            }
        }
    }
    Some(params)
}
