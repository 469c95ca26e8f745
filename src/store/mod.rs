//! Persistence layer: libSQL-backed storage for events, rules, action logs
//! and the durable task queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
