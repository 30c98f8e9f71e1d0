use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::broadcast;
use tokio::time::Instant;

use cordon_core::SyncError;
use cordon_store::pubsub::Subscription;
use cordon_store::store::{LeaseStatus, RateReply, SyncStore, WindowReply};

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
enum Slot {
    /// Plain value; also holds lock tokens.
    Value(String),
    /// Fixed-window counter.
    Counter(u64),
    /// GCRA theoretical arrival time, ms on the store clock.
    Tat(f64),
    /// Token-bucket state.
    Bucket { retry_at_ms: f64, count: u64 },
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory [`SyncStore`] backed by a [`DashMap`].
///
/// Every compare-and-act operation runs its whole read-modify-write while
/// holding the entry guard, with no awaits in between, which gives the
/// same per-key atomicity the Redis backend gets from Lua.
pub struct MemorySyncStore {
    entries: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<String>>,
    epoch: Instant,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    fn clock_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn instant_to_ms(&self, at: Instant) -> i64 {
        i64::try_from(at.duration_since(self.epoch).as_millis()).unwrap_or(i64::MAX)
    }

    /// Evict `key` if its entry has expired.
    fn evict_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, SyncError> {
        let now = Instant::now();
        let fresh = Entry {
            slot: Slot::Value(token.to_owned()),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<LeaseStatus, SyncError> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return Ok(LeaseStatus::Missing);
                }
                match &occupied.get().slot {
                    Slot::Value(stored) if stored == token => {
                        occupied.remove();
                        Ok(LeaseStatus::Ok)
                    }
                    _ => Ok(LeaseStatus::Mismatch),
                }
            }
            MapEntry::Vacant(_) => Ok(LeaseStatus::Missing),
        }
    }

    async fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LeaseStatus, SyncError> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return Ok(LeaseStatus::Missing);
                }
                match &occupied.get().slot {
                    Slot::Value(stored) if stored == token => {
                        occupied.get_mut().expires_at = Some(now + ttl);
                        Ok(LeaseStatus::Ok)
                    }
                    _ => Ok(LeaseStatus::Mismatch),
                }
            }
            MapEntry::Vacant(_) => Ok(LeaseStatus::Missing),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        self.evict_expired(key);
        Ok(self.entries.get(key).and_then(|entry| match &entry.slot {
            Slot::Value(v) => Some(v.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), SyncError> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                slot: Slot::Value(value.to_owned()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, SyncError> {
        self.evict_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, SyncError> {
        self.evict_expired(key);
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn now_ms(&self) -> Result<i64, SyncError> {
        Ok(self.clock_ms())
    }

    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        n: u64,
    ) -> Result<WindowReply, SyncError> {
        let now = Instant::now();
        let now_ms = self.clock_ms();

        let mut entry = self.entries.entry(key.to_owned()).or_insert(Entry {
            slot: Slot::Counter(0),
            expires_at: None,
        });
        if entry.is_expired(now) || !matches!(entry.slot, Slot::Counter(_)) {
            *entry = Entry {
                slot: Slot::Counter(0),
                expires_at: None,
            };
        }
        let Slot::Counter(ref mut count) = entry.slot else {
            unreachable!("slot was just reset to a counter");
        };
        *count += n;
        let count = *count;
        if count == n {
            entry.expires_at = Some(now + period);
        }
        let reset_at_ms = entry
            .expires_at
            .map_or(now_ms, |at| self.instant_to_ms(at));
        drop(entry);

        let allowed = count <= limit;
        Ok(WindowReply {
            allowed,
            remaining: limit.saturating_sub(count),
            retry_at_ms: if allowed { now_ms } else { reset_at_ms },
            reset_at_ms,
        })
    }

    async fn gcra(
        &self,
        key: &str,
        burst: u64,
        limit: u64,
        period: Duration,
        n: u64,
    ) -> Result<RateReply, SyncError> {
        if limit == 0 {
            return Err(SyncError::Store("gcra limit must be positive".into()));
        }
        let now_instant = Instant::now();
        let now = self.clock_ms() as f64;
        let delta = period.as_millis() as f64 / limit as f64;

        let mut entry = self.entries.entry(key.to_owned()).or_insert(Entry {
            slot: Slot::Tat(0.0),
            expires_at: None,
        });
        if entry.is_expired(now_instant) || !matches!(entry.slot, Slot::Tat(_)) {
            *entry = Entry {
                slot: Slot::Tat(0.0),
                expires_at: None,
            };
        }
        let Slot::Tat(stored) = entry.slot else {
            unreachable!("slot was just reset to a TAT");
        };

        let tat = stored.max(now);
        let burst_allowance = burst as f64 * delta;
        let allowed = tat - burst_allowance <= now;
        let new_tat = if allowed {
            let advanced = tat + n as f64 * delta;
            *entry = Entry {
                slot: Slot::Tat(advanced),
                expires_at: Some(now_instant + period),
            };
            advanced
        } else {
            tat
        };
        drop(entry);

        let retry_in_ms = (new_tat - burst_allowance - now).max(0.0);
        let remaining = ((now + delta - (new_tat - burst_allowance)) / delta).floor();
        let reset_in_ms = (new_tat - now).max(0.0);

        Ok(RateReply {
            allowed,
            remaining: if remaining < 0.0 { 0 } else { remaining as u64 },
            retry_in: Duration::from_millis(retry_in_ms as u64),
            reset_in: Duration::from_millis(reset_in_ms as u64),
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        limit: u64,
        period: Duration,
        burst: u64,
        now_ms: i64,
        n: u64,
    ) -> Result<RateReply, SyncError> {
        if limit == 0 {
            return Err(SyncError::Store("token bucket limit must be positive".into()));
        }
        let now_instant = Instant::now();
        let now = now_ms as f64;
        let delta = period.as_millis() as f64 / limit as f64;

        let mut entry = self.entries.entry(key.to_owned()).or_insert(Entry {
            slot: Slot::Bucket {
                retry_at_ms: 0.0,
                count: 0,
            },
            expires_at: None,
        });
        if entry.is_expired(now_instant) || !matches!(entry.slot, Slot::Bucket { .. }) {
            *entry = Entry {
                slot: Slot::Bucket {
                    retry_at_ms: 0.0,
                    count: 0,
                },
                expires_at: None,
            };
        }
        let Slot::Bucket {
            mut retry_at_ms,
            mut count,
        } = entry.slot
        else {
            unreachable!("slot was just reset to a bucket");
        };

        let allowed = if now >= retry_at_ms {
            // Refill: a fresh interval starts now.
            retry_at_ms = retry_at_ms.max(now) + n as f64 * delta;
            count = 0;
            true
        } else if count + n <= burst {
            count += n;
            retry_at_ms += n as f64 * delta;
            true
        } else {
            false
        };

        if allowed {
            *entry = Entry {
                slot: Slot::Bucket { retry_at_ms, count },
                expires_at: Some(now_instant + period),
            };
        }
        drop(entry);

        let reset_in_ms = (retry_at_ms - now).max(0.0);
        Ok(RateReply {
            allowed,
            remaining: burst.saturating_sub(count),
            retry_in: if allowed {
                Duration::ZERO
            } else {
                Duration::from_millis(reset_in_ms as u64)
            },
            reset_in: Duration::from_millis(reset_in_ms as u64),
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SyncError> {
        if let Some(sender) = self.channels.get(channel) {
            if sender.send(payload.to_owned()).is_err() {
                drop(sender);
                // Last subscriber is gone; drop the channel.
                self.channels
                    .remove_if(channel, |_, sender| sender.receiver_count() == 0);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, SyncError> {
        let receiver = self
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(Box::new(MemorySubscription { receiver }))
    }
}

struct MemorySubscription {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                // A lagged subscriber just skips ahead; waiters re-probe anyway.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
