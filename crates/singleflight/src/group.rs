use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use cordon_core::backoff::{Backoff, ExponentialJitter};
use cordon_core::SyncError;
use cordon_lock::{LockOptions, Locker};
use cordon_store::pubsub::DONE;

/// Options applied to the lock underlying each flight.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// TTL of the in-progress marker (the leader's lock lease). The
    /// leader refreshes it while the operation runs.
    pub lock_ttl: Duration,

    /// How long waiters (local and remote) wait for the leader before
    /// giving up with `WaitTimeout`.
    pub wait_ttl: Duration,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            wait_ttl: Duration::from_secs(30),
        }
    }
}

impl GroupOptions {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_wait_ttl(mut self, ttl: Duration) -> Self {
        self.wait_ttl = ttl;
        self
    }
}

/// How a successful [`Group::run`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This call executed the operation.
    Executed,
    /// A peer (local or remote) executed it; this call only waited.
    Shared,
}

impl Outcome {
    pub fn executed(self) -> bool {
        matches!(self, Self::Executed)
    }
}

type FlightResult = Result<(), SyncError>;

/// A single-flight group over one store.
///
/// Every key gets at most one in-flight execution per group at a time;
/// concurrent `run` calls for the same key fold into it.
pub struct Group {
    locker: Locker,
    opts: GroupOptions,
    backoff: Arc<dyn Backoff>,
    calls: Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>,
}

impl Group {
    pub fn new(locker: Locker) -> Self {
        Self::with_options(locker, GroupOptions::default())
    }

    pub fn with_options(locker: Locker, opts: GroupOptions) -> Self {
        Self {
            locker,
            opts,
            backoff: Arc::new(ExponentialJitter::default()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the backoff strategy used by remote waiters.
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn locker(&self) -> &Locker {
        &self.locker
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<Option<FlightResult>>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute `f` at most once across all processes sharing the store.
    ///
    /// Returns [`Outcome::Executed`] if this call ran `f`,
    /// [`Outcome::Shared`] if a peer ran it, and
    /// [`WaitTimeout`](SyncError::WaitTimeout) if the peer did not finish
    /// within `wait_ttl`. A leader failure is propagated to every local
    /// caller folded into the same flight.
    #[instrument(name = "singleflight.run", skip_all, fields(%key))]
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> Result<Outcome, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        // Local layer: one task per process proceeds, the rest share its
        // deferred result.
        enum Slot {
            Wait(watch::Receiver<Option<FlightResult>>),
            Lead(watch::Sender<Option<FlightResult>>),
        }

        let slot = {
            let mut calls = self.calls();
            if let Some(rx) = calls.get(key) {
                Slot::Wait(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                calls.insert(key.to_owned(), rx);
                Slot::Lead(tx)
            }
        };

        let resolve = match slot {
            Slot::Wait(rx) => return self.wait_local(rx).await,
            Slot::Lead(tx) => tx,
        };

        let result = self.lead_or_wait(key, f).await;

        self.calls().remove(key);
        let shared = match &result {
            Ok(_) => Ok(()),
            Err(err) => Err(err.clone()),
        };
        let _ = resolve.send(Some(shared));

        result
    }

    /// Wait for the in-process leader's outcome.
    async fn wait_local(
        &self,
        mut rx: watch::Receiver<Option<FlightResult>>,
    ) -> Result<Outcome, SyncError> {
        let wait = self.opts.wait_ttl;
        match tokio::time::timeout(wait, rx.wait_for(Option::is_some)).await {
            Err(_) => Err(SyncError::WaitTimeout(wait)),
            // The leader future was dropped before resolving.
            Ok(Err(_)) => Err(SyncError::Cancelled),
            Ok(Ok(resolved)) => match resolved.clone() {
                Some(Ok(())) => Ok(Outcome::Shared),
                Some(Err(err)) => Err(err),
                None => unreachable!("wait_for only returns on Some"),
            },
        }
    }

    /// Remote layer: take the lock and lead, or wait for the holder.
    async fn lead_or_wait<F, Fut>(&self, key: &str, f: F) -> Result<Outcome, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let lock_opts = LockOptions::default()
            .with_ttl(self.opts.lock_ttl)
            .with_wait(Duration::ZERO);

        match self.locker.try_lock(key, &lock_opts).await {
            Ok(lease) => {
                let result = lease.keep_while(f).await;
                // Releasing deletes the in-progress marker and publishes
                // the completion signal, success or not.
                let released = lease.release().await;
                match (result, released) {
                    (Ok(()), Ok(())) => Ok(Outcome::Executed),
                    (Ok(()), Err(err)) => Err(err),
                    (Err(err), released) => {
                        if let Err(release_err) = released {
                            debug!(%key, error = %release_err, "release after failed flight");
                        }
                        Err(err)
                    }
                }
            }
            Err(SyncError::AlreadyLocked(_)) => self.wait_remote(key).await,
            Err(err) => Err(err),
        }
    }

    /// Wait for a remote leader: race the completion message, a
    /// backoff-delayed probe of the in-progress marker, and the wait
    /// deadline.
    async fn wait_remote(&self, key: &str) -> Result<Outcome, SyncError> {
        let wait = self.opts.wait_ttl;
        let deadline = Instant::now() + wait;
        let store = self.locker.store();

        // Subscribe before the first probe so a completion between probe
        // and subscribe cannot be missed.
        let mut wakeup = Some(store.subscribe(key).await?);
        let mut attempt = 0u32;

        loop {
            if store.get(key).await?.is_none() {
                return Ok(Outcome::Shared);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(%key, "gave up waiting for remote flight");
                return Err(SyncError::WaitTimeout(wait));
            }
            let delay = self.backoff.delay(attempt).min(deadline - now);
            attempt += 1;

            let subscription_closed = match wakeup.as_mut() {
                Some(sub) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => false,
                        msg = sub.recv() => match msg {
                            Some(payload) if payload == DONE => return Ok(Outcome::Shared),
                            Some(_) => false,
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
                wakeup = None;
            }
        }
    }
}
