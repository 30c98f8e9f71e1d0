use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use cordon_core::backoff::{Backoff, ExponentialJitter};
use cordon_core::keyed_mutex::KeyedMutex;
use cordon_core::SyncError;
use cordon_store::pubsub::DONE;
use cordon_store::store::{LeaseStatus, SyncStore};

use crate::options::LockOptions;

/// Distributed lock manager.
///
/// Cheap to clone; clones share the keyed mutex registry. Must be
/// constructed inside a Tokio runtime (the registry spawns its sweeper).
///
/// Dropping an in-flight future from one of the locking methods leaves
/// the key to be reaped by its TTL; explicit completion through
/// [`with_lock`](Locker::with_lock) or [`Lease::release`] is preferred.
#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn SyncStore>,
    keyed: KeyedMutex,
    backoff: Arc<dyn Backoff>,
    pubsub: bool,
}

impl Locker {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self {
            store,
            keyed: KeyedMutex::new(),
            backoff: Arc::new(ExponentialJitter::default()),
            pubsub: true,
        }
    }

    /// Replace the backoff strategy used while waiting for acquisition.
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable pub/sub-assisted waiting. Waiters make progress
    /// either way; the notification only shortens the common case.
    pub fn with_pubsub(mut self, enabled: bool) -> Self {
        self.pubsub = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Try to acquire `key` once. Surfaces
    /// [`AlreadyLocked`](SyncError::AlreadyLocked) if another token holds it.
    pub async fn try_lock(&self, key: &str, opts: &LockOptions) -> Result<Lease, SyncError> {
        let token = opts.token.clone().unwrap_or_else(new_token);
        if self.store.acquire(key, &token, opts.ttl).await? {
            Ok(self.lease(key, token, opts))
        } else {
            Err(SyncError::AlreadyLocked(key.to_owned()))
        }
    }

    /// Acquire `key`, retrying with backoff until `opts.wait` elapses.
    ///
    /// When pub/sub is enabled, each retry also races the previous
    /// holder's release notification, so handoff usually happens well
    /// before the next backoff tick.
    #[instrument(name = "lock.acquire", skip_all, fields(%key))]
    pub async fn lock(&self, key: &str, opts: &LockOptions) -> Result<Lease, SyncError> {
        let token = opts.token.clone().unwrap_or_else(new_token);
        if self.store.acquire(key, &token, opts.ttl).await? {
            return Ok(self.lease(key, token, opts));
        }
        if opts.wait.is_zero() {
            return Err(SyncError::AlreadyLocked(key.to_owned()));
        }

        let deadline = Instant::now() + opts.wait;
        let mut wakeup = if self.pubsub {
            Some(self.store.subscribe(key).await?)
        } else {
            None
        };
        let mut attempt = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(%key, "lock wait budget exhausted");
                return Err(SyncError::WaitTimeout(opts.wait));
            }
            let delay = self.backoff.delay(attempt).min(deadline - now);
            attempt += 1;

            let subscription_closed = match wakeup.as_mut() {
                Some(sub) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => false,
                        msg = sub.recv() => match msg {
                            Some(payload) if payload == DONE => false,
                            Some(_) => continue,
                            None => true,
                        },
                    }
                }
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            if subscription_closed {
                // Fall back to plain polling.
                wakeup = None;
            }

            if self.store.acquire(key, &token, opts.ttl).await? {
                return Ok(self.lease(key, token, opts));
            }
        }
    }

    /// Run `f` under the lock for `key`.
    ///
    /// Local callers for the same key are serialized through the keyed
    /// mutex first, so only one task per process polls the store; the
    /// wait budget spans that local wait plus the remote acquisition.
    /// While `f` runs, the lease is refreshed every `refresh_ratio *
    /// ttl`; if a refresh discovers the lease lost, the token handed to
    /// `f` is cancelled and the lost-lease error is surfaced. The lock is
    /// released on every exit path.
    #[instrument(name = "lock.with_lock", skip_all, fields(%key))]
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        opts: &LockOptions,
        f: F,
    ) -> Result<T, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let started = Instant::now();
        let handle = self.keyed.key(key);
        let Ok(_local) = tokio::time::timeout(opts.wait, handle.lock()).await else {
            return Err(if opts.wait.is_zero() {
                SyncError::AlreadyLocked(key.to_owned())
            } else {
                SyncError::WaitTimeout(opts.wait)
            });
        };

        let remaining = opts
            .clone()
            .with_wait(opts.wait.saturating_sub(started.elapsed()));
        let lease = match self.lock(key, &remaining).await {
            Ok(lease) => lease,
            // The local wait ate the whole budget; report it as such.
            Err(SyncError::AlreadyLocked(_)) if !opts.wait.is_zero() => {
                return Err(SyncError::WaitTimeout(opts.wait));
            }
            Err(err) => return Err(err),
        };
        let result = lease.keep_while(f).await;
        let released = lease.release().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            // The work finished but the lease was gone at release time:
            // mutual exclusion may have been violated, tell the caller.
            (Ok(_), Err(err)) => Err(err),
            (Err(err), released) => {
                if let Err(release_err) = released {
                    debug!(%key, error = %release_err, "release after failed protected work");
                }
                Err(err)
            }
        }
    }

    fn lease(&self, key: &str, token: String, opts: &LockOptions) -> Lease {
        Lease {
            store: Arc::clone(&self.store),
            key: key.to_owned(),
            token,
            ttl: opts.ttl,
            refresh_interval: opts.refresh_interval(),
        }
    }
}

fn new_token() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// A held lock: key plus the fencing token proving ownership.
///
/// Dropping a lease without releasing is safe; the key expires with its
/// TTL. Explicit [`release`](Lease::release) reclaims it promptly and
/// notifies waiters.
pub struct Lease {
    store: Arc<dyn SyncStore>,
    key: String,
    token: String,
    ttl: Duration,
    refresh_interval: Option<Duration>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Reset the lease TTL, proving ownership with the fencing token.
    pub async fn extend(&self, ttl: Duration) -> Result<(), SyncError> {
        match self.store.extend(&self.key, &self.token, ttl).await? {
            LeaseStatus::Ok => Ok(()),
            LeaseStatus::Missing => Err(SyncError::LockExpired(self.key.clone())),
            LeaseStatus::Mismatch => Err(SyncError::LockMismatch(self.key.clone())),
        }
    }

    /// Whether the store still maps the key to this lease's token.
    pub async fn is_held(&self) -> Result<bool, SyncError> {
        Ok(self.store.get(&self.key).await?.as_deref() == Some(self.token.as_str()))
    }

    /// Release the lock and publish the completion notification on the
    /// key's channel. A second release of the same key surfaces
    /// [`LockExpired`](SyncError::LockExpired); the store is unchanged.
    pub async fn release(self) -> Result<(), SyncError> {
        match self.store.release(&self.key, &self.token).await? {
            LeaseStatus::Ok => {
                self.store.publish(&self.key, DONE).await?;
                Ok(())
            }
            LeaseStatus::Missing => Err(SyncError::LockExpired(self.key)),
            LeaseStatus::Mismatch => Err(SyncError::LockMismatch(self.key)),
        }
    }

    /// Drive `f` to completion while keeping the lease alive.
    ///
    /// With refresh enabled, the lease TTL is re-armed on every refresh
    /// tick; a failed refresh cancels the token handed to `f`, waits for
    /// `f` to observe it, and surfaces the lost-lease error. With refresh
    /// disabled, `f` is bounded by a hard `ttl` deadline instead.
    pub async fn keep_while<F, Fut, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let cancel = CancellationToken::new();
        let work = f(cancel.clone());
        tokio::pin!(work);

        match self.refresh_interval {
            Some(interval) => loop {
                tokio::select! {
                    result = &mut work => return result,
                    () = tokio::time::sleep(interval) => {
                        if let Err(err) = self.extend(self.ttl).await {
                            warn!(key = %self.key, error = %err, "lease refresh failed, cancelling protected work");
                            cancel.cancel();
                            let _ = work.await;
                            return Err(err);
                        }
                    }
                }
            },
            None => {
                tokio::select! {
                    result = &mut work => result,
                    () = tokio::time::sleep(self.ttl) => {
                        debug!(key = %self.key, "hard lease deadline reached, cancelling protected work");
                        cancel.cancel();
                        let _ = work.await;
                        Err(SyncError::LockExpired(self.key.clone()))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use cordon_core::backoff::Constant;
    use cordon_store_memory::MemorySyncStore;

    use super::*;

    fn locker() -> Locker {
        Locker::new(Arc::new(MemorySyncStore::new()))
    }

    fn opts(ttl_ms: u64, wait_ms: u64) -> LockOptions {
        LockOptions::default()
            .with_ttl(Duration::from_millis(ttl_ms))
            .with_wait(Duration::from_millis(wait_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn basic_handoff_between_tasks() {
        let locker = locker();
        let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let locker = locker.clone();
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                locker
                    .with_lock("R", &opts(1000, 1000), |_cancel| async {
                        events.lock().unwrap().push("a:start");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        events.lock().unwrap().push("a:end");
                        Ok(())
                    })
                    .await
            })
        };

        // Let A acquire before B shows up.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let b = {
            let locker = locker.clone();
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                locker
                    .with_lock("R", &opts(1000, 200), |_cancel| async {
                        events.lock().unwrap().push("b:start");
                        events.lock().unwrap().push("b:end");
                        Ok(())
                    })
                    .await
            })
        };

        a.await.unwrap().expect("A should succeed");
        b.await.unwrap().expect("B should succeed");

        let events = events.lock().unwrap();
        assert_eq!(*events, vec!["a:start", "a:end", "b:start", "b:end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_budget_exhausted() {
        let store: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::new());
        let locker = Locker::new(Arc::clone(&store));

        let a = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker
                    .with_lock("R", &opts(1000, 1000), |_cancel| async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let b_opts = opts(1000, 100);
        let b = locker.with_lock("R", &b_opts, |_cancel| async { Ok(()) });
        let err = b.await.expect_err("B should give up");
        assert!(matches!(err, SyncError::WaitTimeout(_)));

        a.await.unwrap().expect("A should still succeed");
        assert!(store.get("R").await.unwrap().is_none(), "key should be reclaimed");
    }

    #[tokio::test(start_paused = true)]
    async fn self_cancellation_still_releases() {
        let store: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::new());
        let locker = Locker::new(Arc::clone(&store));

        locker
            .with_lock("R", &opts(1000, 1000), |cancel| async move {
                cancel.cancel();
                Ok(())
            })
            .await
            .expect("work that cancels itself but returns Ok should succeed");

        assert!(store.get("R").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_outlives_short_ttl() {
        let locker = locker();
        let result = locker
            .with_lock(
                "R",
                &opts(200, 100).with_refresh_ratio(0.5),
                |_cancel| async {
                    // Five times the TTL; only refresh keeps the lease.
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    Ok(42)
                },
            )
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_cancels_work() {
        let store: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::new());
        let locker = Locker::new(Arc::clone(&store));

        let result = locker
            .with_lock("R", &opts(1000, 1000), |cancel| {
                let store = Arc::clone(&store);
                async move {
                    // Simulate the lease vanishing out from under us.
                    store.delete("R").await.unwrap();
                    cancel.cancelled().await;
                    Err::<(), _>(SyncError::Cancelled)
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::LockExpired(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_deadline_without_refresh() {
        let locker = locker();
        let started = Instant::now();

        let result = locker
            .with_lock(
                "R",
                &opts(100, 1000).with_refresh_ratio(0.0),
                |cancel| async move {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(60)) => Ok(()),
                        () = cancel.cancelled() => Err(SyncError::Cancelled),
                    }
                },
            )
            .await;

        assert!(matches!(result, Err(SyncError::LockExpired(_))));
        assert!(started.elapsed() < Duration::from_secs(1), "deadline must bound the work");
    }

    #[tokio::test(start_paused = true)]
    async fn try_lock_contention() {
        let locker = locker();
        let held = locker.try_lock("R", &opts(1000, 0)).await.expect("first wins");

        let err = locker.try_lock("R", &opts(1000, 0)).await.expect_err("second loses");
        assert!(matches!(err, SyncError::AlreadyLocked(_)));

        let err = locker.lock("R", &opts(1000, 0)).await.expect_err("zero wait tries once");
        assert!(matches!(err, SyncError::AlreadyLocked(_)));

        held.release().await.expect("release should succeed");
        let lease = locker.try_lock("R", &opts(1000, 0)).await.expect("free again");
        lease.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn release_notification_beats_backoff() {
        let store: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::new());
        // Backoff so slow that only the pub/sub wake-up can explain a
        // prompt handoff.
        let locker = Locker::new(Arc::clone(&store))
            .with_backoff(Arc::new(Constant(Duration::from_secs(30))));

        let a = {
            let locker = locker.clone();
            tokio::spawn(async move {
                let lease = locker.try_lock("R", &opts(5000, 0)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                lease.release().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let lease = locker
            .lock("R", &opts(5000, 60_000))
            .await
            .expect("waiter should be woken by the release");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "handoff took {:?}, pub/sub wake-up did not fire",
            started.elapsed()
        );
        lease.release().await.unwrap();
        a.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn polling_waiter_progresses_without_pubsub() {
        let store: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::new());
        let locker = Locker::new(Arc::clone(&store)).with_pubsub(false);

        let a = {
            let locker = locker.clone();
            tokio::spawn(async move {
                let lease = locker.try_lock("R", &opts(5000, 0)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                lease.release().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lease = locker
            .lock("R", &opts(5000, 10_000))
            .await
            .expect("polling alone must still acquire");
        lease.release().await.unwrap();
        a.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn caller_token_is_used() {
        let store: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::new());
        let locker = Locker::new(Arc::clone(&store));

        let lease = locker
            .try_lock("R", &opts(1000, 0).with_token("fencing-1"))
            .await
            .unwrap();
        assert_eq!(lease.token(), "fencing-1");
        assert_eq!(store.get("R").await.unwrap().as_deref(), Some("fencing-1"));
        assert!(lease.is_held().await.unwrap());
        lease.release().await.unwrap();
    }
}
