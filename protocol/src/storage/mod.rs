//! # Storage Module
//!
//! Persistent storage for the credit engine.
//!
//! ```text
//! db.rs     sled persistence: one named tree per entity, bincode values
//! store.rs  CreditStore: the typed credit view the engine mutates
//! ```
//!
//! Bincode is for storage; JSON is for the API and for certificate bytes,
//! which must stay byte-identical across reads.

pub mod db;
pub mod store;

pub use db::{CreditDb, DbError, DbResult, Sequence};
pub use store::CreditStore;
