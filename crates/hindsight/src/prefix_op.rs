//! Per-block protocol coordinator.
//!
//! One `LookbackPrefixOp` drives a single block through its run: publish
//! the local aggregate as `Partial`, walk predecessor windows back until a
//! terminal one, publish the inclusive aggregate as `Complete`, and hand
//! the exclusive prefix back to the caller. Blocks never inspect a
//! larger-indexed block, so no block ever waits on work issued after it.
//!
//! The walk is bounded: a block whose predecessors are all `Complete`
//! finishes in one window read, and the worst case reaches block 0 in
//! `number_of_blocks / window_lanes` reads.

use crate::reducer::reduce_window;
use crate::state::{LookbackScanState, ScanValue};

/// Coordinator for one block's protocol run.
///
/// The combine function must be associative and must agree with the one
/// used to build each block's local aggregate; it is not assumed
/// commutative.
pub struct LookbackPrefixOp<'a, T: ScanValue, F> {
    block_id: usize,
    state: &'a LookbackScanState<T>,
    combine: F,
}

impl<'a, T, F> LookbackPrefixOp<'a, T, F>
where
    T: ScanValue,
    F: Fn(T, T) -> T,
{
    /// Create the coordinator for `block_id`.
    ///
    /// # Panics
    ///
    /// Panics if `block_id` is out of range for the table.
    #[must_use]
    pub fn new(block_id: usize, state: &'a LookbackScanState<T>, combine: F) -> Self {
        assert!(
            block_id < state.number_of_blocks(),
            "block {block_id} out of range for {} blocks",
            state.number_of_blocks()
        );
        Self {
            block_id,
            state,
            combine,
        }
    }

    /// Run the full protocol for this block.
    ///
    /// Publishes `Partial`, discovers the exclusive prefix by look-back,
    /// publishes `Complete`, and returns the exclusive prefix. Block 0 has
    /// no predecessors: it returns `None` and the caller substitutes its
    /// own seed or identity value.
    pub fn exclusive_prefix(&self, local_aggregate: T) -> Option<T> {
        self.publish_partial(local_aggregate);
        if self.block_id == 0 {
            self.publish_complete(None, local_aggregate);
            return None;
        }
        let prefix = self.look_back();
        self.publish_complete(Some(prefix), local_aggregate);
        Some(prefix)
    }

    /// Protocol step 1: publish this block's local aggregate.
    pub fn publish_partial(&self, local_aggregate: T) {
        self.state.set_partial(self.block_id, local_aggregate);
    }

    /// Protocol step 2: walk predecessor windows until one is terminal and
    /// return the exclusive prefix of all blocks before this one.
    ///
    /// Block 0 never looks back; calling this for block 0 is a programming
    /// error.
    ///
    /// # Panics
    ///
    /// Panics if called for block 0.
    #[must_use]
    pub fn look_back(&self) -> T {
        assert!(self.block_id > 0, "block 0 has no predecessors to inspect");

        let window = self.state.window_lanes() as isize;
        let mut nearest = self.block_id as isize - 1;
        let mut windows_walked: u64 = 1;

        let mut reduction = reduce_window(self.state, nearest, &self.combine);
        // The nearest lane reads a real predecessor, so the first window
        // always carries a contribution.
        let mut prefix = match reduction.value {
            Some(value) => value,
            None => unreachable!("first look-back window reduced to no value"),
        };

        while !reduction.terminal {
            nearest -= window;
            windows_walked += 1;
            reduction = reduce_window(self.state, nearest, &self.combine);
            if let Some(value) = reduction.value {
                prefix = (self.combine)(value, prefix);
            }
        }

        tracing::debug!(
            target: "hindsight.lookback",
            block_id = self.block_id,
            windows_walked,
            "look-back resolved"
        );
        prefix
    }

    /// Protocol step 3: publish the inclusive aggregate through this block.
    ///
    /// `prefix` is the discovered exclusive prefix, or `None` for block 0.
    pub fn publish_complete(&self, prefix: Option<T>, local_aggregate: T) {
        let inclusive = match prefix {
            Some(p) => (self.combine)(p, local_aggregate),
            None => local_aggregate,
        };
        self.state.set_complete(self.block_id, inclusive);
    }
}

impl<T: ScanValue, F> std::fmt::Debug for LookbackPrefixOp<'_, T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookbackPrefixOp")
            .field("block_id", &self.block_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PrefixStatus;

    /// Drive every block's protocol in id order on one thread. All
    /// predecessors are `Complete` by the time a block looks back, so each
    /// look-back resolves in its first window.
    fn run_sequential<T: ScanValue>(
        state: &LookbackScanState<T>,
        aggregates: &[T],
        combine: impl Fn(T, T) -> T + Copy,
    ) -> Vec<Option<T>> {
        aggregates
            .iter()
            .enumerate()
            .map(|(block_id, &agg)| {
                LookbackPrefixOp::new(block_id, state, combine).exclusive_prefix(agg)
            })
            .collect()
    }

    #[test]
    fn sum_scenario_window_four() {
        let aggregates = [10_u32, 20, 30, 40, 50, 60];
        let state = LookbackScanState::<u32>::with_window(aggregates.len(), 4);
        let prefixes = run_sequential(&state, &aggregates, |a, b| a + b);

        assert_eq!(prefixes[0], None);
        assert_eq!(
            &prefixes[1..],
            &[Some(10), Some(30), Some(60), Some(100), Some(150)]
        );

        // Stored complete values are the inclusive aggregates.
        let complete: Vec<u32> = (0..aggregates.len())
            .map(|b| match state.get(b) {
                PrefixStatus::Complete(v) => v,
                other => panic!("block {b} not complete: {other:?}"),
            })
            .collect();
        assert_eq!(complete, vec![10, 30, 60, 100, 150, 210]);
    }

    #[test]
    fn fewer_blocks_than_window() {
        let aggregates = [3_u32, 4, 5];
        let state = LookbackScanState::<u32>::with_window(aggregates.len(), 32);
        let prefixes = run_sequential(&state, &aggregates, |a, b| a + b);
        assert_eq!(prefixes, vec![None, Some(3), Some(7)]);
    }

    /// Decimal concatenation: associative over inputs without leading
    /// zeros, not commutative.
    fn concat(a: u64, b: u64) -> u64 {
        let mut shift = 10_u64;
        let mut rest = b;
        while rest >= 10 {
            shift *= 10;
            rest /= 10;
        }
        a * shift + b
    }

    #[test]
    fn non_commutative_combine_preserves_block_order() {
        let aggregates = [1_u64, 2, 3, 4, 5, 6, 7];
        let state = LookbackScanState::<u64>::with_window(aggregates.len(), 2);
        let prefixes = run_sequential(&state, &aggregates, concat);
        assert_eq!(
            prefixes,
            vec![
                None,
                Some(1),
                Some(12),
                Some(123),
                Some(1234),
                Some(12345),
                Some(123456)
            ]
        );
    }

    #[test]
    fn look_back_over_partial_predecessors() {
        // Blocks 1..=4 published only partials; block 5 folds two partial
        // windows and stops at block 0's complete.
        let aggregates = [1_u64, 2, 3, 4, 5];
        let state = LookbackScanState::<u64>::with_window(6, 2);
        LookbackPrefixOp::new(0, &state, concat).exclusive_prefix(aggregates[0]);
        for block in 1..5 {
            state.set_partial(block, aggregates[block]);
        }

        let op = LookbackPrefixOp::new(5, &state, concat);
        op.publish_partial(6);
        assert_eq!(op.look_back(), 12345);
    }

    #[test]
    fn look_back_stops_at_nearest_complete() {
        let state = LookbackScanState::<u32>::with_window(8, 2);
        // Block 5 holds the true inclusive aggregate through itself; blocks
        // 6 and 7 are partial. Block 7's first window [6, 5] is terminal.
        state.set_complete(5, 600);
        state.set_partial(6, 7);

        let op = LookbackPrefixOp::new(7, &state, |a: u32, b: u32| a + b);
        assert_eq!(op.look_back(), 600 + 7);
    }

    #[test]
    #[should_panic(expected = "no predecessors")]
    fn block_zero_cannot_look_back() {
        let state = LookbackScanState::<u32>::new(1);
        let op = LookbackPrefixOp::new(0, &state, |a: u32, b: u32| a + b);
        let _ = op.look_back();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_block_rejected() {
        let state = LookbackScanState::<u32>::new(2);
        let _ = LookbackPrefixOp::new(2, &state, |a: u32, b: u32| a + b);
    }
}
