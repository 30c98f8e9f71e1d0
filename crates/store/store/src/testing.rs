//! Backend conformance suite.
//!
//! Call [`run_conformance_tests`] from a backend's test module with a
//! fresh store instance. The suite uses generous TTLs so it passes under
//! real wall-clock time against a live store as well as under a paused
//! test clock against the memory backend.

use std::time::Duration;

use cordon_core::SyncError;

use crate::store::{LeaseStatus, SyncStore};

/// Run the full conformance suite against `store`.
///
/// # Errors
///
/// Returns the first store error encountered; assertion failures panic.
pub async fn run_conformance_tests(store: &dyn SyncStore) -> Result<(), SyncError> {
    test_lease_roundtrip(store).await?;
    test_lease_contention(store).await?;
    test_release_wrong_token(store).await?;
    test_release_idempotence(store).await?;
    test_extend_resets_ttl(store).await?;
    test_kv_roundtrip(store).await?;
    test_clock_is_monotonic(store).await?;
    test_fixed_window_admission(store).await?;
    test_gcra_admission(store).await?;
    test_token_bucket_admission(store).await?;
    test_pubsub_delivery(store).await?;
    Ok(())
}

const TTL: Duration = Duration::from_secs(30);

async fn test_lease_roundtrip(store: &dyn SyncStore) -> Result<(), SyncError> {
    let set = store.acquire("conf:lease-1", "tok-a", TTL).await?;
    assert!(set, "acquire on a free key should succeed");

    let status = store.release("conf:lease-1", "tok-a").await?;
    assert_eq!(status, LeaseStatus::Ok, "matching release should apply");

    let val = store.get("conf:lease-1").await?;
    assert!(val.is_none(), "key should be gone after release");
    Ok(())
}

async fn test_lease_contention(store: &dyn SyncStore) -> Result<(), SyncError> {
    let first = store.acquire("conf:lease-2", "tok-a", TTL).await?;
    assert!(first);
    let second = store.acquire("conf:lease-2", "tok-b", TTL).await?;
    assert!(!second, "acquire on a held key should fail");

    let val = store.get("conf:lease-2").await?;
    assert_eq!(val.as_deref(), Some("tok-a"), "loser must not clobber the token");

    store.release("conf:lease-2", "tok-a").await?;
    Ok(())
}

async fn test_release_wrong_token(store: &dyn SyncStore) -> Result<(), SyncError> {
    store.acquire("conf:lease-3", "tok-a", TTL).await?;

    let status = store.release("conf:lease-3", "tok-b").await?;
    assert_eq!(status, LeaseStatus::Mismatch);

    let val = store.get("conf:lease-3").await?;
    assert_eq!(val.as_deref(), Some("tok-a"), "mismatched release must not delete");

    store.release("conf:lease-3", "tok-a").await?;
    Ok(())
}

async fn test_release_idempotence(store: &dyn SyncStore) -> Result<(), SyncError> {
    store.acquire("conf:lease-4", "tok-a", TTL).await?;
    assert_eq!(store.release("conf:lease-4", "tok-a").await?, LeaseStatus::Ok);
    assert_eq!(
        store.release("conf:lease-4", "tok-a").await?,
        LeaseStatus::Missing,
        "second release should report the key gone"
    );
    assert_eq!(
        store.extend("conf:lease-4", "tok-a", TTL).await?,
        LeaseStatus::Missing,
        "extend after release should report the key gone"
    );
    Ok(())
}

async fn test_extend_resets_ttl(store: &dyn SyncStore) -> Result<(), SyncError> {
    store
        .acquire("conf:lease-5", "tok-a", Duration::from_secs(10))
        .await?;
    let status = store
        .extend("conf:lease-5", "tok-a", Duration::from_secs(120))
        .await?;
    assert_eq!(status, LeaseStatus::Ok);

    let ttl = store.pttl("conf:lease-5").await?;
    let ttl = ttl.expect("extended key should carry a TTL");
    assert!(
        ttl > Duration::from_secs(60) && ttl <= Duration::from_secs(120),
        "TTL should reflect the extension, got {ttl:?}"
    );

    store.release("conf:lease-5", "tok-a").await?;
    Ok(())
}

async fn test_kv_roundtrip(store: &dyn SyncStore) -> Result<(), SyncError> {
    assert!(store.get("conf:kv-missing").await?.is_none());

    store.set("conf:kv-1", "hello", None).await?;
    assert_eq!(store.get("conf:kv-1").await?.as_deref(), Some("hello"));

    let existed = store.delete("conf:kv-1").await?;
    assert!(existed);
    assert!(!store.delete("conf:kv-1").await?);

    store
        .set("conf:kv-2", "ephemeral", Some(Duration::from_secs(60)))
        .await?;
    let ttl = store.pttl("conf:kv-2").await?;
    assert!(ttl.is_some(), "TTL'd value should report a TTL");
    store.delete("conf:kv-2").await?;
    Ok(())
}

async fn test_clock_is_monotonic(store: &dyn SyncStore) -> Result<(), SyncError> {
    let a = store.now_ms().await?;
    let b = store.now_ms().await?;
    assert!(b >= a, "store clock must not run backwards");
    Ok(())
}

async fn test_fixed_window_admission(store: &dyn SyncStore) -> Result<(), SyncError> {
    let period = Duration::from_secs(60);
    for i in 0u64..3 {
        let reply = store.fixed_window("conf:fw-1", 3, period, 1).await?;
        assert!(reply.allowed, "admission {i} of 3 should be allowed");
        assert_eq!(reply.remaining, 3 - (i + 1));
    }

    let reply = store.fixed_window("conf:fw-1", 3, period, 1).await?;
    assert!(!reply.allowed, "fourth admission should be denied");
    assert_eq!(reply.remaining, 0);
    assert_eq!(
        reply.retry_at_ms, reply.reset_at_ms,
        "denied retry should point at the window reset"
    );
    Ok(())
}

async fn test_gcra_admission(store: &dyn SyncStore) -> Result<(), SyncError> {
    // One admission per minute, no burst: the second request must wait.
    let reply = store
        .gcra("conf:gcra-1", 0, 1, Duration::from_secs(60), 1)
        .await?;
    assert!(reply.allowed, "first GCRA admission should pass");

    let reply = store
        .gcra("conf:gcra-1", 0, 1, Duration::from_secs(60), 1)
        .await?;
    assert!(!reply.allowed, "back-to-back admission should be smoothed out");
    assert!(
        reply.retry_in > Duration::from_secs(30),
        "retry should be roughly one period away, got {:?}",
        reply.retry_in
    );
    Ok(())
}

async fn test_token_bucket_admission(store: &dyn SyncStore) -> Result<(), SyncError> {
    let now = store.now_ms().await?;
    let period = Duration::from_secs(60);

    let reply = store
        .token_bucket("conf:tb-1", 1, period, 1, now, 1)
        .await?;
    assert!(reply.allowed, "refill admission should pass");

    let reply = store
        .token_bucket("conf:tb-1", 1, period, 1, now, 1)
        .await?;
    assert!(reply.allowed, "burst capacity should admit one more");

    let reply = store
        .token_bucket("conf:tb-1", 1, period, 1, now, 1)
        .await?;
    assert!(!reply.allowed, "third admission should be denied");
    assert!(reply.retry_in > Duration::ZERO);
    Ok(())
}

async fn test_pubsub_delivery(store: &dyn SyncStore) -> Result<(), SyncError> {
    let mut sub = store.subscribe("conf:chan-1").await?;
    store.publish("conf:chan-1", "ok").await?;

    let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("publish should reach the subscriber promptly");
    assert_eq!(msg.as_deref(), Some("ok"));
    Ok(())
}
