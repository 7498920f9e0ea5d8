//! Execution claims around compute-or-fetch.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use retrieval_worker::Error;
use retrieval_worker::cache::{CacheWrapper, claim_path};
use retrieval_worker::database::repositories::SqliteCacheStore;
use retrieval_worker::volume::{CacheDepth, Volume};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    wrapper: CacheWrapper,
    volume: Volume,
    store: Arc<SqliteCacheStore>,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(common::cache_store(dir.path()).await);
    let wrapper = CacheWrapper::new(
        store.clone(),
        common::quick_claims(),
        CacheDepth::Root,
        common::identity(),
    );
    let volume = Volume::parse(&dir.path().join("volume").to_string_lossy()).unwrap();
    Fixture {
        dir,
        wrapper,
        volume,
        store,
    }
}

async fn row_count(fixture: &Fixture) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_entry")
        .fetch_one(fixture.store.pool())
        .await
        .unwrap();
    count
}

#[tokio::test]
async fn claim_is_released_after_success() {
    let fx = fixture().await;
    let scratch = fx.dir.path().join("scratch");

    let memo = fx
        .wrapper
        .compute_or_fetch(&fx.volume, "k-ok", Some("era5"), || async {
            Ok(common::artifact(&scratch, "out.grib", 16).await)
        })
        .await
        .unwrap();

    assert!(memo.computed);
    assert_eq!(memo.entry.size, 16);
    assert_eq!(memo.entry.tag.as_deref(), Some("era5"));
    assert!(memo.entry.artifact_path().ends_with("k-ok.grib"));
    assert!(memo.entry.artifact_path().exists());
    assert!(!claim_path(&fx.volume.local_root().unwrap(), "k-ok").exists());
}

#[tokio::test]
async fn claim_is_released_after_failure() {
    let fx = fixture().await;

    let result = fx
        .wrapper
        .compute_or_fetch(&fx.volume, "k-fail", None, || async {
            Err(Error::adaptor("RuntimeError", "upstream refused the request"))
        })
        .await;

    assert!(matches!(result, Err(Error::Adaptor { .. })));
    assert!(!claim_path(&fx.volume.local_root().unwrap(), "k-fail").exists());
    assert_eq!(row_count(&fx).await, 0);
}

#[tokio::test]
async fn concurrent_computations_produce_one_entry() {
    let fx = fixture().await;
    let computed = AtomicU32::new(0);
    let scratch = fx.dir.path().join("scratch");

    let compute = |name: &'static str| {
        let computed = &computed;
        let scratch = scratch.clone();
        move || async move {
            computed.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, Error>(common::artifact(&scratch, name, 8).await)
        }
    };

    let (a, b) = tokio::join!(
        fx.wrapper
            .compute_or_fetch(&fx.volume, "k-same", None, compute("a.bin")),
        fx.wrapper
            .compute_or_fetch(&fx.volume, "k-same", None, compute("b.bin")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert_eq!(a.entry.id, b.entry.id);
    assert_ne!(a.computed, b.computed);
    assert_eq!(row_count(&fx).await, 1);
    assert!(!claim_path(&fx.volume.local_root().unwrap(), "k-same").exists());
}

#[tokio::test]
async fn held_claim_times_out() {
    let fx = fixture().await;
    let root = fx.volume.local_root().unwrap();
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(claim_path(&root, "k-held"), b"{}").unwrap();

    let mut claims = common::quick_claims();
    claims.timeout = Duration::from_millis(100);
    let wrapper = CacheWrapper::new(
        fx.store.clone(),
        claims,
        CacheDepth::Root,
        common::identity(),
    );

    let result = wrapper
        .compute_or_fetch(&fx.volume, "k-held", None, || async {
            Err(Error::Other("computed while the claim was held".into()))
        })
        .await;

    assert!(matches!(result, Err(Error::ClaimTimeout { .. })));
    // Someone else's claim stays where it is.
    assert!(claim_path(&root, "k-held").exists());
}
