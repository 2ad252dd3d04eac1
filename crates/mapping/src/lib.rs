//! Declarative translation between HTTP requests and storage commands.
//!
//! Everything here is pure: the route table is fixed at configuration time and
//! both renderers are functions of their inputs. Transport and storage live in
//! other crates.

pub mod request;
pub mod response;
pub mod route;

pub use request::{Minted, RequestInput, ownership_probe, render_request};
pub use response::{
    NOT_FOUND_MESSAGE, RenderedResponse, ResponseContext, error_body, render_failure,
    render_response,
};
pub use route::{
    Action, FieldKind, FieldSpec, ID_PARAM, OperationDescriptor, Resolved, RouteMiss, RouteTable,
    RouteTableError, ScanScope,
};
