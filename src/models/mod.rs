//! Core data models for the deploy file store.
//!
//! Objects and jobs serialize as JSON via `serde`; deploy records also map
//! to SQLite rows via `sqlx::FromRow`.

pub mod deploy;
pub mod job;
pub mod object;
pub mod receipts;
pub mod stats;

pub use deploy::Deploy;
pub use job::Job;
pub use object::{RemoteObject, StoredObject};
