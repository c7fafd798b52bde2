//! Device-wide scan drivers built on the look-back core.
//!
//! These drivers play the caller role the core leaves external: partition
//! the input into fixed tiles, give every tile a dense block id, run each
//! block's local reduce and protocol run, and assemble per-element outputs
//! from the discovered prefixes. They exist for verification; a real device
//! backend would do the same steps in kernel code.

use hindsight::{DEFAULT_WINDOW_LANES, LookbackPrefixOp, LookbackScanState, ScanValue};
use parking_lot::Mutex;

use crate::device::{BlockScheduler, ScheduleError, run_blocks};
use crate::fault::{DelayPlan, DelayPoint};

enum ScanKind<T> {
    /// Each element's output excludes the element itself; block 0's first
    /// output is the caller-supplied identity.
    Exclusive { identity: T },
    /// Each element's output includes the element itself.
    Inclusive,
}

/// Exclusive device-wide scan of `input` in tiles of `tile` elements.
///
/// `identity` seeds block 0 and must be a left identity of `combine`.
///
/// # Errors
///
/// Returns [`ScheduleError`] when the scheduler configuration cannot run.
///
/// # Panics
///
/// Panics if `tile` is zero.
pub fn device_exclusive_scan<T, F>(
    input: &[T],
    identity: T,
    tile: usize,
    scheduler: BlockScheduler,
    combine: F,
) -> Result<Vec<T>, ScheduleError>
where
    T: ScanValue,
    F: Fn(T, T) -> T + Send + Sync,
{
    run_device_scan(
        input,
        tile,
        DEFAULT_WINDOW_LANES,
        scheduler,
        &combine,
        &DelayPlan::new(),
        ScanKind::Exclusive { identity },
    )
}

/// Inclusive device-wide scan of `input` in tiles of `tile` elements.
///
/// # Errors
///
/// Returns [`ScheduleError`] when the scheduler configuration cannot run.
///
/// # Panics
///
/// Panics if `tile` is zero.
pub fn device_inclusive_scan<T, F>(
    input: &[T],
    tile: usize,
    scheduler: BlockScheduler,
    combine: F,
) -> Result<Vec<T>, ScheduleError>
where
    T: ScanValue,
    F: Fn(T, T) -> T + Send + Sync,
{
    run_device_scan(
        input,
        tile,
        DEFAULT_WINDOW_LANES,
        scheduler,
        &combine,
        &DelayPlan::new(),
        ScanKind::Inclusive,
    )
}

/// Exclusive scan with an explicit window width and injected delays, for
/// ordering stress tests.
///
/// # Errors
///
/// Returns [`ScheduleError`] when the scheduler configuration cannot run.
///
/// # Panics
///
/// Panics if `tile` or `window_lanes` is zero.
pub fn device_exclusive_scan_with_plan<T, F>(
    input: &[T],
    identity: T,
    tile: usize,
    window_lanes: usize,
    scheduler: BlockScheduler,
    plan: &DelayPlan,
    combine: F,
) -> Result<Vec<T>, ScheduleError>
where
    T: ScanValue,
    F: Fn(T, T) -> T + Send + Sync,
{
    run_device_scan(
        input,
        tile,
        window_lanes,
        scheduler,
        &combine,
        plan,
        ScanKind::Exclusive { identity },
    )
}

fn run_device_scan<T, F>(
    input: &[T],
    tile: usize,
    window_lanes: usize,
    scheduler: BlockScheduler,
    combine: &F,
    plan: &DelayPlan,
    kind: ScanKind<T>,
) -> Result<Vec<T>, ScheduleError>
where
    T: ScanValue,
    F: Fn(T, T) -> T + Send + Sync,
{
    assert!(tile > 0, "scan tile must hold at least one element");
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let number_of_blocks = input.len().div_ceil(tile);
    let state = LookbackScanState::<T>::with_window(number_of_blocks, window_lanes);
    state.debug_validate_layout();

    // Distinct initialization phase: every body and padding position is
    // set before any block publishes or reads.
    for block_id in 0..number_of_blocks.max(window_lanes) {
        state.initialize_prefix(block_id, number_of_blocks);
    }

    tracing::debug!(
        target: "hindsight.device",
        elements = input.len(),
        tile,
        number_of_blocks,
        window_lanes,
        "device scan dispatch"
    );

    let tiles: Mutex<Vec<(usize, Vec<T>)>> = Mutex::new(Vec::with_capacity(number_of_blocks));

    run_blocks(scheduler, number_of_blocks, |block_id| {
        let lo = block_id * tile;
        let hi = (lo + tile).min(input.len());
        let slice = &input[lo..hi];

        // Local reduce over the tile; opaque to the core.
        let mut local = slice[0];
        for &x in &slice[1..] {
            local = combine(local, x);
        }

        let op = LookbackPrefixOp::new(block_id, &state, combine);
        plan.apply(block_id, DelayPoint::BeforePartial);
        op.publish_partial(local);
        let prefix = if block_id == 0 {
            None
        } else {
            plan.apply(block_id, DelayPoint::DuringLookback);
            Some(op.look_back())
        };
        plan.apply(block_id, DelayPoint::BeforeComplete);
        op.publish_complete(prefix, local);

        // Final per-element outputs from the discovered exclusive prefix.
        let mut out = Vec::with_capacity(slice.len());
        match &kind {
            ScanKind::Exclusive { identity } => {
                let mut running = prefix.unwrap_or(*identity);
                for &x in slice {
                    out.push(running);
                    running = combine(running, x);
                }
            }
            ScanKind::Inclusive => {
                let mut running = prefix;
                for &x in slice {
                    let next = match running {
                        Some(acc) => combine(acc, x),
                        None => x,
                    };
                    out.push(next);
                    running = Some(next);
                }
            }
        }
        tiles.lock().push((block_id, out));
    })?;

    let mut gathered = tiles.into_inner();
    gathered.sort_unstable_by_key(|(block_id, _)| *block_id);
    let mut output = Vec::with_capacity(input.len());
    for (_, mut chunk) in gathered {
        output.append(&mut chunk);
    }
    Ok(output)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_exclusive(input: &[u32]) -> Vec<u32> {
        let mut out = Vec::with_capacity(input.len());
        let mut acc = 0_u32;
        for &x in input {
            out.push(acc);
            acc = acc.wrapping_add(x);
        }
        out
    }

    #[test]
    fn exclusive_matches_reference_single_worker() {
        let input: Vec<u32> = (1..=100).collect();
        let got = device_exclusive_scan(&input, 0, 8, BlockScheduler::Fifo { workers: 1 }, |a, b| {
            a.wrapping_add(b)
        })
        .unwrap();
        assert_eq!(got, reference_exclusive(&input));
    }

    #[test]
    fn inclusive_matches_reference() {
        let input: Vec<u32> = (1..=40).collect();
        let got = device_inclusive_scan(&input, 4, BlockScheduler::Fifo { workers: 4 }, |a, b| {
            a.wrapping_add(b)
        })
        .unwrap();
        let expected: Vec<u32> = input
            .iter()
            .scan(0_u32, |acc, &x| {
                *acc = acc.wrapping_add(x);
                Some(*acc)
            })
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn ragged_final_tile() {
        let input: Vec<u32> = (1..=13).collect();
        let got = device_exclusive_scan(&input, 0, 5, BlockScheduler::Fifo { workers: 2 }, |a, b| {
            a.wrapping_add(b)
        })
        .unwrap();
        assert_eq!(got, reference_exclusive(&input));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let got = device_exclusive_scan(&[], 0_u32, 8, BlockScheduler::Fifo { workers: 1 }, |a, b| {
            a + b
        })
        .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn single_element_input() {
        let got =
            device_exclusive_scan(&[9_u32], 0, 8, BlockScheduler::Fifo { workers: 1 }, |a, b| {
                a + b
            })
            .unwrap();
        assert_eq!(got, vec![0]);
    }

    #[test]
    #[should_panic(expected = "at least one element")]
    fn zero_tile_rejected() {
        let _ = device_exclusive_scan(&[1_u32], 0, 0, BlockScheduler::Fifo { workers: 1 }, |a, b| {
            a + b
        });
    }
}
