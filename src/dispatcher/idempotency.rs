//! Idempotency guard keyed by the canonical scan string.
//!
//! `try_claim` is an atomic check-and-set so that concurrent workers never
//! execute the same event twice. Completed keys suppress duplicates for the
//! retention window.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Result of claiming an idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the key and must `complete` or `release` it
    Claimed,
    /// Already processed within the retention window
    AlreadyCompleted,
    /// Another worker currently holds the key
    InFlight,
}

/// Shared duplicate-suppression state
pub trait IdempotencyGuard: Send + Sync + 'static {
    /// Atomically claim `key` unless it is completed or in flight
    fn try_claim(&self, key: &str) -> ClaimOutcome;

    /// Mark a claimed key as completed
    fn complete(&self, key: &str);

    /// Give up a claim so a later delivery can retry
    fn release(&self, key: &str);

    /// Whether `key` completed within the retention window
    fn is_completed(&self, key: &str) -> bool;
}

#[derive(Debug, Clone, Copy)]
enum KeyState {
    InFlight { since: Instant },
    Completed { at: Instant },
}

/// Process-local guard on a `DashMap`
///
/// In-flight claims older than the retention window are treated as abandoned
/// and can be taken over.
#[derive(Debug)]
pub struct InMemoryIdempotencyGuard {
    entries: DashMap<String, KeyState>,
    retention: Duration,
}

impl InMemoryIdempotencyGuard {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn is_expired(&self, state: &KeyState, now: Instant) -> bool {
        let started = match state {
            KeyState::InFlight { since } => *since,
            KeyState::Completed { at } => *at,
        };
        now.duration_since(started) >= self.retention
    }

    /// Drop expired records, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, state| !self.is_expired(state, now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "Purged expired idempotency records");
        }
        purged
    }

    /// Tracked keys, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdempotencyGuard for InMemoryIdempotencyGuard {
    fn try_claim(&self, key: &str) -> ClaimOutcome {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(KeyState::InFlight { since: now });
                ClaimOutcome::Claimed
            }
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now) {
                    occupied.insert(KeyState::InFlight { since: now });
                    return ClaimOutcome::Claimed;
                }
                match occupied.get() {
                    KeyState::Completed { .. } => ClaimOutcome::AlreadyCompleted,
                    KeyState::InFlight { .. } => ClaimOutcome::InFlight,
                }
            }
        }
    }

    fn complete(&self, key: &str) {
        self.entries.insert(
            key.to_string(),
            KeyState::Completed { at: Instant::now() },
        );
    }

    fn release(&self, key: &str) {
        self.entries
            .remove_if(key, |_, state| matches!(state, KeyState::InFlight { .. }));
    }

    fn is_completed(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|state| {
                matches!(*state, KeyState::Completed { .. }) && !self.is_expired(&state, now)
            })
            .unwrap_or(false)
    }
}
