// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leases and clocks.
//!
//! A lease is valid iff `now < leased_at + lease_duration`. An entity with a
//! valid lease owned by someone else is invisible to `next_not_leased` and
//! cannot be leased, saved or deleted by anyone but its owner. Re-acquiring
//! one's own lease renews it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Ownership record attached to a stateful entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The leased entity.
    pub entity_id: String,
    /// Identifier of the owning connector instance.
    pub leased_by: String,
    /// When the lease was acquired or last renewed.
    pub leased_at: DateTime<Utc>,
    /// Validity window.
    pub lease_duration: Duration,
}

impl Lease {
    /// Create a lease acquired at `leased_at`.
    pub fn new(
        entity_id: impl Into<String>,
        leased_by: impl Into<String>,
        leased_at: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            leased_by: leased_by.into(),
            leased_at,
            lease_duration,
        }
    }

    /// Rebuild a lease from epoch-millisecond columns.
    pub fn from_millis(
        entity_id: impl Into<String>,
        leased_by: impl Into<String>,
        leased_at_ms: i64,
        lease_duration_ms: i64,
    ) -> Self {
        Self::new(
            entity_id,
            leased_by,
            DateTime::from_timestamp_millis(leased_at_ms).unwrap_or_default(),
            Duration::from_millis(lease_duration_ms.max(0) as u64),
        )
    }

    /// First instant at which the lease is no longer valid.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.leased_at + to_chrono(self.lease_duration)
    }

    /// Whether the lease still excludes other owners at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// Whether `owner` holds this lease.
    pub fn is_held_by(&self, owner: &str) -> bool {
        self.leased_by == owner
    }

    /// Whether `owner` may take (or renew) this lease at `now`.
    pub fn can_be_acquired_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.is_held_by(owner) || !self.is_valid_at(now)
    }
}

/// Convert a std duration to a chrono one, saturating at roughly a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Duration as signed milliseconds for SQL columns.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Source of wall-clock time for lease and retry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_chrono(by);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
