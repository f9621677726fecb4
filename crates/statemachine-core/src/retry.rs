// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-entity retry policy.
//!
//! Business transition functions use `state_count` to back off an entity
//! that keeps failing in the same state and to give up once the limit is
//! reached.

use std::sync::Arc;
use std::time::Duration;

use crate::entity::StatefulEntity;
use crate::lease::{Clock, SystemClock, to_chrono};

/// Retry configuration for entities stuck in one state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRetryConfig {
    /// Attempts in one state before the entity is given up.
    pub retry_limit: u32,
    /// Delay before the first retry; doubles with every further attempt.
    pub base_delay: Duration,
}

impl Default for EntityRetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: 7,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Decides whether an entity is due for another attempt.
#[derive(Debug, Clone)]
pub struct EntityRetryPolicy {
    config: EntityRetryConfig,
    clock: Arc<dyn Clock>,
}

impl EntityRetryPolicy {
    /// Largest exponent applied to `base_delay`.
    const MAX_EXPONENT: u32 = 10;

    /// Create a policy using the system clock.
    pub fn new(config: EntityRetryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &EntityRetryConfig {
        &self.config
    }

    /// The clock attempts are measured against.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Delay required after the attempt that produced `state_count`.
    pub fn delay_for(&self, state_count: u32) -> Duration {
        if state_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (state_count - 1).min(Self::MAX_EXPONENT);
        self.config.base_delay.saturating_mul(2u32.pow(exponent))
    }

    /// Whether enough time has passed since the last attempt.
    pub fn is_due<E: StatefulEntity>(&self, entity: &E) -> bool {
        let meta = entity.meta();
        let delay = self.delay_for(meta.state_count);
        if delay.is_zero() {
            return true;
        }
        self.clock.now() >= meta.updated_at + to_chrono(delay)
    }

    /// Whether the entity has used up its attempts in the current state.
    pub fn retries_exhausted<E: StatefulEntity>(&self, entity: &E) -> bool {
        entity.state_count() >= self.config.retry_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::TestEntity;
    use crate::lease::ManualClock;

    fn policy(clock: &ManualClock) -> EntityRetryPolicy {
        EntityRetryPolicy::new(EntityRetryConfig {
            retry_limit: 3,
            base_delay: Duration::from_millis(100),
        })
        .with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let clock = ManualClock::default();
        let policy = policy(&clock);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(50), Duration::from_millis(100 * 1024));
    }

    #[test]
    fn test_fresh_entity_is_due() {
        let clock = ManualClock::default();
        let entity = TestEntity::new("e-1", 100);
        assert!(policy(&clock).is_due(&entity));
    }

    #[test]
    fn test_retried_entity_waits_for_backoff() {
        let clock = ManualClock::default();
        let policy = policy(&clock);
        let mut entity = TestEntity::new("e-1", 100);
        entity.transition_to_at(100, clock.now());
        entity.transition_to_at(100, clock.now());
        assert_eq!(entity.state_count(), 2);

        assert!(!policy.is_due(&entity));
        clock.advance(Duration::from_millis(199));
        assert!(!policy.is_due(&entity));
        clock.advance(Duration::from_millis(1));
        assert!(policy.is_due(&entity));
    }

    #[test]
    fn test_retries_exhausted_at_limit() {
        let clock = ManualClock::default();
        let policy = policy(&clock);
        let mut entity = TestEntity::new("e-1", 100);
        for _ in 0..2 {
            entity.transition_to(100);
        }
        assert!(!policy.retries_exhausted(&entity));
        entity.transition_to(100);
        assert!(policy.retries_exhausted(&entity));
    }

    #[test]
    fn test_default_config() {
        let config = EntityRetryConfig::default();
        assert_eq!(config.retry_limit, 7);
        assert_eq!(config.base_delay, Duration::from_secs(1));
    }
}
