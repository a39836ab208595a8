//! Persistence layer — decisions, companies, and correlation lookups.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{CompanyRecord, Database, PriorMessage, StoredDecision};
