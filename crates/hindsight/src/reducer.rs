//! Windowed look-back reduction with a reversed, completion-absorbing
//! combine.
//!
//! A window covers up to `window_lanes` predecessors; lane `k` holds the
//! status of block `nearest - k`, so lane 0 is the nearest predecessor and
//! the last lane the farthest. The fold runs in reverse lane order (farthest
//! to nearest) because the combine function is not assumed commutative:
//! accumulating far-to-near preserves predecessor-to-successor order in the
//! result.
//!
//! A `Complete` entry absorbs everything farther back: its value already
//! includes the full prefix of all blocks before it, so the fold restarts
//! from it. An `Invalid` padding entry cuts the window the same way but
//! contributes no value, which keeps windows that reach below block 0
//! correct without reading out of range.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::flag::PrefixFlag;
use crate::state::{LookbackScanState, PrefixStatus, ScanValue};

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static HINDSIGHT_WINDOW_READS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of look-back reducer metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LookbackMetrics {
    /// Windows fetched and reduced across all blocks.
    pub hindsight_window_reads_total: u64,
}

/// Read current look-back metrics.
#[must_use]
pub fn lookback_metrics() -> LookbackMetrics {
    LookbackMetrics {
        hindsight_window_reads_total: HINDSIGHT_WINDOW_READS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_lookback_metrics() {
    HINDSIGHT_WINDOW_READS_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// WindowReduction
// ---------------------------------------------------------------------------

/// Result of reducing one window of predecessor statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReduction<T> {
    /// Aggregate of the segment adjacent to the window's near edge, or
    /// `None` when the window was cut by padding before any contribution.
    pub value: Option<T>,
    /// Whether the window contained a `Complete` or `Invalid` entry. A
    /// terminal window ends the look-back: the accumulated value is the
    /// full exclusive prefix.
    pub terminal: bool,
}

impl<T> WindowReduction<T> {
    /// The strongest flag the window observed: `Complete` for a terminal
    /// window, `Partial` otherwise.
    #[must_use]
    pub fn flag(&self) -> PrefixFlag {
        if self.terminal {
            PrefixFlag::Complete
        } else {
            PrefixFlag::Partial
        }
    }
}

/// Fetch and reduce the window whose nearest predecessor is block
/// `nearest` (signed; padding indices resolve below block 0).
///
/// Each of the `window_lanes` lanes reads exactly one predecessor, spinning
/// until that entry is non-`Empty`, so the whole window observes published
/// statuses. The reduction then folds lanes farthest-first with the
/// completion-absorbing combine described in the module docs.
pub fn reduce_window<T, F>(
    state: &LookbackScanState<T>,
    nearest: isize,
    combine: &F,
) -> WindowReduction<T>
where
    T: ScanValue,
    F: Fn(T, T) -> T,
{
    let lanes = state.window_lanes();
    let mut value: Option<T> = None;
    let mut terminal = false;

    // Reverse lane order: the last lane holds the farthest predecessor.
    for lane in (0..lanes).rev() {
        match state.get_signed(nearest - lane as isize) {
            PrefixStatus::Invalid => {
                value = None;
                terminal = true;
            }
            PrefixStatus::Complete(v) => {
                value = Some(v);
                terminal = true;
            }
            PrefixStatus::Partial(v) => {
                value = Some(match value {
                    Some(acc) => combine(acc, v),
                    None => v,
                });
            }
        }
    }

    HINDSIGHT_WINDOW_READS_TOTAL.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(
        target: "hindsight.lookback",
        nearest,
        terminal,
        "window reduced"
    );

    WindowReduction { value, terminal }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

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
    fn all_partial_window_folds_in_block_order() {
        let state = LookbackScanState::<u64>::with_window(4, 4);
        state.set_partial(0, 1);
        state.set_partial(1, 2);
        state.set_partial(2, 3);
        state.set_partial(3, 4);

        let reduction = reduce_window(&state, 3, &concat);
        assert!(!reduction.terminal);
        assert_eq!(reduction.flag(), PrefixFlag::Partial);
        assert_eq!(reduction.value, Some(1234));
    }

    #[test]
    fn complete_entry_absorbs_everything_farther() {
        let state = LookbackScanState::<u64>::with_window(5, 4);
        // Window over blocks 4, 3, 2, 1; block 2 is complete.
        state.set_partial(1, 9);
        state.set_complete(2, 7);
        state.set_partial(3, 3);
        state.set_partial(4, 4);

        let reduction = reduce_window(&state, 4, &concat);
        assert!(reduction.terminal);
        assert_eq!(reduction.flag(), PrefixFlag::Complete);
        // Block 1's partial is discarded; 7 then 3 then 4 in block order.
        assert_eq!(reduction.value, Some(734));
    }

    #[test]
    fn nearest_complete_wins() {
        let state = LookbackScanState::<u64>::with_window(4, 4);
        state.set_complete(0, 1);
        state.set_complete(1, 12);
        state.set_complete(2, 123);
        state.set_complete(3, 1234);

        let reduction = reduce_window(&state, 3, &concat);
        assert!(reduction.terminal);
        assert_eq!(reduction.value, Some(1234));
    }

    #[test]
    fn padding_cuts_without_contributing() {
        let state = LookbackScanState::<u64>::with_window(2, 4);
        // Block 2's window: lanes read blocks 1, 0, -1, -2.
        state.set_partial(0, 5);
        state.set_partial(1, 6);

        let reduction = reduce_window(&state, 1, &concat);
        assert!(reduction.terminal, "padding must terminate the window");
        assert_eq!(reduction.value, Some(56));
    }

    #[test]
    fn pure_padding_window_is_terminal_and_valueless() {
        let state = LookbackScanState::<u64>::with_window(8, 4);
        for block in 0..8 {
            state.set_partial(block, 1);
        }
        // Window entirely below block 0.
        let reduction = reduce_window(&state, -1, &|a: u64, b: u64| a + b);
        assert!(reduction.terminal);
        assert_eq!(reduction.value, None);
    }

    #[test]
    fn window_read_metric_increments() {
        let before = lookback_metrics();
        let state = LookbackScanState::<u32>::with_window(2, 2);
        state.set_partial(0, 1);
        state.set_partial(1, 1);
        let _ = reduce_window(&state, 1, &|a: u32, b: u32| a + b);
        let after = lookback_metrics();
        assert!(after.hindsight_window_reads_total > before.hindsight_window_reads_total);
    }
}
