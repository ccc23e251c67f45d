//! Keyed sliding-window state.
//!
//! The store owns every piece of mutable rate limit state. Entries live in a
//! [`DashMap`], so a request only ever locks the shard holding its own key:
//! requests for the same key are serialized, requests for keys in other
//! shards proceed in parallel.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

use super::clock::Clock;

/// Errors raised when the store cannot take on more state.
///
/// Callers are expected to fail open on these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store is tracking its maximum of {0} keys")]
    CapacityReached(usize),
    #[error("failed to allocate request history for key")]
    AllocationFailed,
    #[error("window of {0:?} does not fit on the clock")]
    DeadlineOverflow(Duration),
}

/// How the reset deadline of an active entry is maintained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// The deadline is fixed when the entry is created and never moves.
    ///
    /// The count is a true sliding window, so the advertised reset can be
    /// later than the moment capacity actually returns.
    #[default]
    WindowStart,
    /// The deadline follows the oldest request still inside the window.
    OldestRequest,
}

/// Rate limit state for one identity.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    /// Requests inside the window; always equals `recent.len()` after pruning
    pub count: u64,
    /// When the entry logically expires
    pub reset_at: Instant,
    /// Request timestamps, oldest first
    recent: VecDeque<Instant>,
}

impl WindowEntry {
    fn fresh(now: Instant, window: Duration) -> Result<Self, StoreError> {
        let reset_at = deadline(now, window)?;
        let mut recent = VecDeque::new();
        recent
            .try_reserve(1)
            .map_err(|_| StoreError::AllocationFailed)?;
        recent.push_back(now);

        Ok(Self {
            count: 1,
            reset_at,
            recent,
        })
    }

    /// Whether the entry must be replaced rather than updated.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.reset_at <= now
    }

    /// The recorded request timestamps, oldest first.
    pub fn recent_requests(&self) -> impl Iterator<Item = &Instant> {
        self.recent.iter()
    }

    fn record(&mut self, now: Instant, window: Duration, mode: ResetMode) -> Result<(), StoreError> {
        deadline(now, window)?;
        self.recent
            .try_reserve(1)
            .map_err(|_| StoreError::AllocationFailed)?;
        self.recent.push_back(now);

        if let Some(cutoff) = now.checked_sub(window) {
            while self.recent.front().is_some_and(|ts| *ts < cutoff) {
                self.recent.pop_front();
            }
        }
        self.count = self.recent.len() as u64;

        if mode == ResetMode::OldestRequest {
            let oldest = self.recent.front();
            if let Some(reset_at) = oldest.and_then(|ts| ts.checked_add(window)) {
                self.reset_at = reset_at;
            }
        }
        Ok(())
    }
}

fn deadline(now: Instant, window: Duration) -> Result<Instant, StoreError> {
    now.checked_add(window).ok_or(StoreError::DeadlineOverflow(window))
}

/// The outcome of recording one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Requests inside the window, including this one
    pub count: u64,
    /// Deadline advertised to the client
    pub reset_at: Instant,
}

/// A concurrency-safe map from identity key to window state.
#[derive(Debug)]
pub struct WindowStore {
    entries: DashMap<String, WindowEntry>,
    /// Mirrors `entries.len()` without taking every shard lock
    tracked: AtomicUsize,
    max_keys: usize,
    reset_mode: ResetMode,
    clock: Arc<dyn Clock>,
}

impl WindowStore {
    /// Create an unbounded store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_options(clock, 0, ResetMode::default())
    }

    /// Create a store. A `max_keys` of zero disables the key bound.
    pub fn with_options(clock: Arc<dyn Clock>, max_keys: usize, reset_mode: ResetMode) -> Self {
        Self {
            entries: DashMap::new(),
            tracked: AtomicUsize::new(0),
            max_keys,
            reset_mode,
            clock,
        }
    }

    /// Record a request for `key` and return the window count and reset deadline.
    ///
    /// An absent or expired entry is replaced with a fresh one whose deadline
    /// is `now + window`. Otherwise the timestamp is appended, anything older
    /// than `now - window` is pruned and the count is re-derived.
    pub fn record_and_count(&self, key: &str, window: Duration) -> Result<Admission, StoreError> {
        self.record_and_count_at(key, window, self.clock.now())
    }

    /// [`record_and_count`](Self::record_and_count) at a time the caller already read.
    pub fn record_and_count_at(
        &self,
        key: &str,
        window: Duration,
        now: Instant,
    ) -> Result<Admission, StoreError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            return self.update(&mut entry, now, window);
        }

        match self.entries.entry(key.to_string()) {
            // Another request for the key got in between the two lookups.
            Entry::Occupied(mut occupied) => self.update(occupied.get_mut(), now, window),
            Entry::Vacant(vacant) => {
                self.reserve_slot()?;
                let entry = match WindowEntry::fresh(now, window) {
                    Ok(entry) => entry,
                    Err(e) => {
                        self.release_slots(1);
                        return Err(e);
                    }
                };
                let admission = Admission {
                    count: entry.count,
                    reset_at: entry.reset_at,
                };
                vacant.insert(entry);
                trace!(key = %key, "Created window entry");
                Ok(admission)
            }
        }
    }

    /// Claim room for one new key. The claim happens before the insert, so
    /// keys racing in on different shards cannot overshoot the bound.
    fn reserve_slot(&self) -> Result<(), StoreError> {
        if self.max_keys == 0 {
            self.tracked.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        self.tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tracked| {
                (tracked < self.max_keys).then_some(tracked + 1)
            })
            .map(|_| ())
            .map_err(|_| StoreError::CapacityReached(self.max_keys))
    }

    fn release_slots(&self, count: usize) {
        // The closure never returns None, so the update cannot fail.
        let _ = self
            .tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tracked| {
                Some(tracked.saturating_sub(count))
            });
    }

    fn update(
        &self,
        entry: &mut WindowEntry,
        now: Instant,
        window: Duration,
    ) -> Result<Admission, StoreError> {
        if entry.is_expired(now) {
            *entry = WindowEntry::fresh(now, window)?;
        } else {
            entry.record(now, window, self.reset_mode)?;
        }
        Ok(Admission {
            count: entry.count,
            reset_at: entry.reset_at,
        })
    }

    /// Remove every logically expired entry, returning how many were removed.
    ///
    /// DashMap retains shard by shard, so at most one shard is write-locked at
    /// any moment and requests for keys elsewhere are not stalled.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });

        self.release_slots(removed);
        debug!(removed, remaining = self.len(), "Swept expired window entries");
        removed
    }

    /// A copy of the entry for `key`, if one is tracked.
    pub fn snapshot(&self, key: &str) -> Option<WindowEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.tracked.load(Ordering::Acquire)
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all state.
    pub fn clear(&self) {
        let mut removed = 0;
        self.entries.retain(|_, _| {
            removed += 1;
            false
        });
        self.release_slots(removed);
    }

    /// The clock this store reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
