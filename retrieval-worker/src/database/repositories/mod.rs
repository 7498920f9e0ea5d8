//! Repository layer for database access.

pub mod cache;
pub mod job;

pub use cache::*;
pub use job::*;
