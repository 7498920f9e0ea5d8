//! Expire cache entries by collection and creation time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use retrieval_worker::database::RetryPolicy;
use retrieval_worker::database::repositories::SqliteCacheStore;
use retrieval_worker::database::time::{now_ms, parse_timestamp};
use retrieval_worker::janitor::{ExpireOptions, expire_cache_entries};
use retrieval_worker::logging::{LogFormat, init_logging};

#[derive(Debug, Parser)]
#[command(
    name = "expire-cache-entries",
    version,
    about = "Expire cache entries of some or all collections"
)]
struct Args {
    /// Collection to expire. Repeatable.
    #[arg(long = "collection-id", conflicts_with = "all_collections")]
    collection_ids: Vec<String>,

    /// Expire entries of every collection.
    #[arg(long)]
    all_collections: bool,

    /// Only entries created before this time (ISO 8601, UTC when no offset). Defaults to now.
    #[arg(long, value_parser = parse_time)]
    before: Option<DateTime<Utc>>,

    /// Only entries created at or after this time (ISO 8601, UTC when no offset).
    #[arg(long, value_parser = parse_time)]
    after: Option<DateTime<Utc>>,

    /// Delete entries and their files instead of marking them expired.
    #[arg(long)]
    delete: bool,

    /// Only report how many entries would be expired.
    #[arg(long)]
    dry_run: bool,

    /// Entries handled per batch.
    #[arg(long, default_value_t = 100)]
    batch_size: u32,

    /// Seconds to sleep between batches.
    #[arg(long, default_value_t = 0.0)]
    batch_delay: f64,

    #[arg(long, env = "CACHE_DB_URL", default_value = "sqlite:cache.db?mode=rwc")]
    cache_db_url: String,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(LogFormat::from_env_or(LogFormat::Pretty))?;

    let args = Args::parse();
    let opts = ExpireOptions {
        collection_ids: args.collection_ids,
        all_collections: args.all_collections,
        before: args.before,
        after: args.after,
        delete: args.delete,
        dry_run: args.dry_run,
        batch_size: args.batch_size,
        batch_delay: Duration::try_from_secs_f64(args.batch_delay)?,
    };
    // Reject bad flag combinations before opening the index.
    opts.filter(now_ms())?;

    let store = SqliteCacheStore::connect(&args.cache_db_url, RetryPolicy::default()).await?;
    let count = expire_cache_entries(&store, &opts).await?;

    if opts.dry_run {
        println!("Number of entries to expire: {count}");
    } else {
        println!("Number of entries expired: {count}");
    }
    Ok(())
}
