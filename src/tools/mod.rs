//! Client-facing tool surface: schemas, registry, handlers, transport.

pub mod handlers;
pub mod registry;
pub mod schema;
pub mod transport;

pub use handlers::{build_registry, ServerState};
pub use registry::{ToolDef, ToolHandler, ToolRegistry};
pub use schema::{sanitize, validate};
pub use transport::{serve, serve_stdio, Request, Response};
