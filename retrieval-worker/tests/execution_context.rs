//! Execution context: threshold gating, user-visible events and buffered
//! writes, persisted through a real job store.

mod common;

use std::sync::Arc;

use retrieval_worker::context::{ExecutionContext, LogLevel};
use retrieval_worker::database::models::{EventType, JobDbModel, JobEventDbModel};
use retrieval_worker::database::repositories::JobStore;
use serde_json::json;
use tempfile::TempDir;

async fn context(threshold: LogLevel) -> (TempDir, ExecutionContext) {
    let dir = TempDir::new().unwrap();
    let store = common::job_store(dir.path()).await;
    store
        .create_job(&JobDbModel::new("job-1", "echo", &common::object(json!({}))))
        .await
        .unwrap();
    let ctx = ExecutionContext::new("job-1", Arc::new(store), threshold);
    (dir, ctx)
}

fn kinds_and_messages(events: &[JobEventDbModel]) -> Vec<(Option<EventType>, &str)> {
    events
        .iter()
        .map(|e| (e.event_type(), e.message.as_str()))
        .collect()
}

#[tokio::test]
async fn events_below_threshold_are_not_persisted() {
    let (_dir, ctx) = context(LogLevel::Warning).await;

    ctx.debug("debug detail").await.unwrap();
    ctx.info("progress").await.unwrap();
    ctx.warning("slow upstream").await.unwrap();
    ctx.error("upstream failed").await.unwrap();

    let events = ctx.events().await.unwrap();
    assert_eq!(
        kinds_and_messages(&events),
        vec![
            (Some(EventType::Warning), "slow upstream"),
            (Some(EventType::Error), "upstream failed"),
        ]
    );
}

#[tokio::test]
async fn user_visible_events_ignore_threshold() {
    let (_dir, ctx) = context(LogLevel::Error).await;

    ctx.add_user_visible_log("queued at the provider").await.unwrap();
    ctx.add_user_visible_error("request too large").await.unwrap();

    let events = ctx.events().await.unwrap();
    assert_eq!(
        kinds_and_messages(&events),
        vec![
            (Some(EventType::UserVisibleLog), "queued at the provider"),
            (Some(EventType::UserVisibleError), "request too large"),
        ]
    );
    assert!(events.iter().all(|e| e.event_type().is_some_and(|t| t.is_user_visible())));
}

#[tokio::test]
async fn write_buffers_until_flush() {
    let (_dir, ctx) = context(LogLevel::Info).await;

    ctx.write("downloaded ");
    ctx.write("3 files\n");
    assert!(ctx.events().await.unwrap().is_empty());

    ctx.flush().await.unwrap();
    ctx.flush().await.unwrap();

    let events = ctx.events().await.unwrap();
    assert_eq!(
        kinds_and_messages(&events),
        vec![(Some(EventType::Info), "downloaded 3 files")]
    );
}

#[tokio::test]
async fn worker_announcement_is_recorded() {
    let (_dir, ctx) = context(LogLevel::Error).await;

    ctx.announce_worker(&common::identity()).await.unwrap();

    let events = ctx.events().await.unwrap();
    assert_eq!(
        kinds_and_messages(&events),
        vec![(Some(EventType::WorkerName), "test-host:4242")]
    );
}
