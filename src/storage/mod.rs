//! SQLite persistence: schema, typed store, and the read-only surface.

pub mod readonly;
pub mod schema;
pub mod store;

pub use readonly::{execute, QueryOptions, QueryResult};
pub use schema::SCHEMA_VERSION;
pub use store::{Store, MAX_BOUND_PARAMS};
