//! Cache maintenance.
//!
//! - [`Janitor`] keeps every cache location under a size ceiling and clears
//!   abandoned claims and staging directories.
//! - [`expire_cache_entries`] retires entries by collection and creation
//!   time.
//!
//! Both run as separate, periodically scheduled processes alongside live
//! workers. Each deletion is idempotent, so an interrupted run is simply
//! resumed by the next one.

pub mod expire;
pub mod sweep;

pub use expire::{ExpireOptions, expire_cache_entries};
pub use sweep::{Janitor, SweepReport};
