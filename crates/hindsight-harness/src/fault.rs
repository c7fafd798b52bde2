//! Injected protocol delays.
//!
//! The protocol's correctness claims are ordering claims, so the
//! interesting schedules are the ones where a block stalls at an awkward
//! moment: after publishing its partial but before resolving its look-back,
//! or just before publishing its complete. A [`DelayPlan`] pins such stalls
//! to chosen blocks deterministically; [`DelayPlan::seeded`] scatters them
//! for stress runs.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Where in a block's protocol run a delay fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayPoint {
    /// Before the block publishes its partial aggregate.
    BeforePartial,
    /// After the partial is published, before the look-back walk.
    DuringLookback,
    /// After the look-back resolves, before the complete is published.
    BeforeComplete,
}

/// Per-block, per-point injected delays.
#[derive(Debug, Clone, Default)]
pub struct DelayPlan {
    delays: HashMap<(usize, DelayPoint), Duration>,
}

impl DelayPlan {
    /// An empty plan: no delays anywhere.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delay for one block at one protocol point.
    #[must_use]
    pub fn with_delay(mut self, block_id: usize, point: DelayPoint, delay: Duration) -> Self {
        self.delays.insert((block_id, point), delay);
        self
    }

    /// Scatter delays over roughly a quarter of the blocks at random
    /// points, deterministically from `seed`.
    #[must_use]
    pub fn seeded(seed: u64, number_of_blocks: usize, max_delay: Duration) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let max_us = max_delay.as_micros().max(1) as u64;
        let mut plan = Self::new();
        for block_id in 0..number_of_blocks {
            if !rng.gen_bool(0.25) {
                continue;
            }
            let point = match rng.gen_range(0..3) {
                0 => DelayPoint::BeforePartial,
                1 => DelayPoint::DuringLookback,
                _ => DelayPoint::BeforeComplete,
            };
            let delay = Duration::from_micros(rng.gen_range(1..=max_us));
            plan.delays.insert((block_id, point), delay);
        }
        plan
    }

    /// The configured delay for a block at a point, if any.
    #[must_use]
    pub fn delay(&self, block_id: usize, point: DelayPoint) -> Option<Duration> {
        self.delays.get(&(block_id, point)).copied()
    }

    /// Sleep for the configured delay, if any.
    pub fn apply(&self, block_id: usize, point: DelayPoint) {
        if let Some(delay) = self.delay(block_id, point) {
            tracing::trace!(
                target: "hindsight.device",
                block_id,
                point = ?point,
                delay_us = delay.as_micros() as u64,
                "injected delay"
            );
            thread::sleep(delay);
        }
    }

    /// Number of configured delays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// Whether the plan carries no delays.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_delays_are_looked_up() {
        let plan = DelayPlan::new()
            .with_delay(3, DelayPoint::BeforeComplete, Duration::from_millis(5))
            .with_delay(0, DelayPoint::BeforePartial, Duration::from_millis(1));

        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.delay(3, DelayPoint::BeforeComplete),
            Some(Duration::from_millis(5))
        );
        assert_eq!(plan.delay(3, DelayPoint::BeforePartial), None);
        assert_eq!(plan.delay(1, DelayPoint::BeforeComplete), None);
    }

    #[test]
    fn seeded_plans_are_deterministic() {
        let a = DelayPlan::seeded(42, 64, Duration::from_micros(500));
        let b = DelayPlan::seeded(42, 64, Duration::from_micros(500));
        for block_id in 0..64 {
            for point in [
                DelayPoint::BeforePartial,
                DelayPoint::DuringLookback,
                DelayPoint::BeforeComplete,
            ] {
                assert_eq!(a.delay(block_id, point), b.delay(block_id, point));
            }
        }
    }

    #[test]
    fn empty_plan_applies_nothing() {
        let plan = DelayPlan::new();
        assert!(plan.is_empty());
        // Must return immediately.
        plan.apply(0, DelayPoint::DuringLookback);
    }
}
