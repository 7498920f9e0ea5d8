//! retrieval-worker library crate.
//!
//! Runs scheduled data-retrieval jobs against a shared result cache and
//! maintains that cache. The binaries in `src/bin` and `src/main.rs` are thin
//! wrappers over this crate.

pub mod adaptor;
pub mod cache;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod janitor;
pub mod logging;
pub mod scheduler;
pub mod utils;
pub mod volume;
pub mod workdir;
pub mod worker;

pub use error::{Error, Result};
