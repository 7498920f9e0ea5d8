//! Result cache: key derivation, execution claims and the memoizing wrapper.
//!
//! The durable index lives in [`crate::database::repositories::cache`].

pub mod claim;
pub mod key;
pub mod memo;

pub use claim::{ClaimConfig, ClaimGuard, ClaimInfo, acquire, claim_path, marker_age, try_claim};
pub use key::{cache_key, normalize, normalize_object};
pub use memo::{CacheWrapper, Memoized, publish};
