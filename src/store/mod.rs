//! Persistence layer: libSQL storage for the ledger, inbox, message cache, rules and diagnostics.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, Diagnostic};
