//! Database models.
//!
//! These map directly to the schema and decode the JSON columns.

pub mod cache;
pub mod job;

pub use cache::*;
pub use job::*;
