//! mailsift storage - persistence contract and adapters
//!
//! The pipeline talks to storage only through [`MailStore`] and
//! [`StoreSession`]. A PostgreSQL adapter backs production use and an
//! in-memory adapter backs tests and dry runs.

pub mod db;
pub mod memory;
pub mod postgres;
pub mod store;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use postgres::PgMailStore;
pub use store::{MailStore, StoreSession};
