//! Persistence layer: libSQL-backed storage for routing config, messages and deliveries.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
