//! Simulated device schedulers for protocol blocks.
//!
//! The core's spin-wait assumes every block with a smaller id eventually
//! makes progress. Real devices guarantee this for resident blocks; a
//! thread-pool simulation has to earn it. Two schedulers are provided:
//!
//! - [`BlockScheduler::Fifo`]: a fixed pool claims blocks strictly in id
//!   order. When any block spins, every smaller-id block has already been
//!   claimed, so the smallest unfinished block always runs to completion
//!   and the pool never deadlocks, for any pool size down to one worker.
//!   This is the safe shape for the classic occupancy hazard: launching
//!   blocks out of id order on a pool smaller than the dependency depth
//!   can park every worker on a spin that nothing will ever satisfy.
//! - [`BlockScheduler::Concurrent`]: one thread per block, seeded-shuffled
//!   spawn order with start jitter, to exercise adversarial completion
//!   orders. Requires all blocks resident at once; keep block counts
//!   thread-pool sized.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// How simulated blocks get mapped onto OS threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockScheduler {
    /// Fixed pool of `workers` threads claiming blocks in id order.
    Fifo { workers: usize },
    /// One thread per block, seeded-shuffled start order.
    Concurrent { seed: u64 },
}

/// Errors returned by [`run_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// A FIFO scheduler was configured with zero workers.
    NoWorkers,
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoWorkers => f.write_str("FIFO scheduler requires at least one worker"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Run `block_fn(block_id)` once for every block in `0..number_of_blocks`
/// under the given scheduler, returning when all blocks have finished.
///
/// # Errors
///
/// Returns [`ScheduleError::NoWorkers`] for a zero-worker FIFO pool.
pub fn run_blocks<F>(
    scheduler: BlockScheduler,
    number_of_blocks: usize,
    block_fn: F,
) -> Result<(), ScheduleError>
where
    F: Fn(usize) + Send + Sync,
{
    if number_of_blocks == 0 {
        return Ok(());
    }

    match scheduler {
        BlockScheduler::Fifo { workers } => {
            if workers == 0 {
                return Err(ScheduleError::NoWorkers);
            }
            let next = AtomicUsize::new(0);
            let block_fn = &block_fn;
            thread::scope(|scope| {
                for _ in 0..workers.min(number_of_blocks) {
                    scope.spawn(|| {
                        loop {
                            // Claim order is id order: the progress argument
                            // in the module docs depends on this.
                            let block_id = next.fetch_add(1, Ordering::Relaxed);
                            if block_id >= number_of_blocks {
                                break;
                            }
                            block_fn(block_id);
                        }
                    });
                }
            });
            tracing::debug!(
                target: "hindsight.device",
                number_of_blocks,
                workers,
                "fifo schedule drained"
            );
            Ok(())
        }
        BlockScheduler::Concurrent { seed } => {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut order: Vec<usize> = (0..number_of_blocks).collect();
            order.shuffle(&mut rng);
            let jitter_us: Vec<u64> = (0..number_of_blocks)
                .map(|_| rng.gen_range(0..200))
                .collect();

            let block_fn = &block_fn;
            thread::scope(|scope| {
                for (slot, block_id) in order.into_iter().enumerate() {
                    let jitter = jitter_us[slot];
                    scope.spawn(move || {
                        if jitter > 0 {
                            thread::sleep(Duration::from_micros(jitter));
                        }
                        block_fn(block_id);
                    });
                }
            });
            tracing::debug!(
                target: "hindsight.device",
                number_of_blocks,
                seed,
                "concurrent schedule drained"
            );
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn fifo_runs_every_block_once() {
        let hits: Vec<AtomicU64> = (0..17).map(|_| AtomicU64::new(0)).collect();
        run_blocks(BlockScheduler::Fifo { workers: 3 }, 17, |block_id| {
            hits[block_id].fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        for (block_id, hit) in hits.iter().enumerate() {
            assert_eq!(hit.load(Ordering::Relaxed), 1, "block {block_id}");
        }
    }

    #[test]
    fn concurrent_runs_every_block_once() {
        let hits: Vec<AtomicU64> = (0..16).map(|_| AtomicU64::new(0)).collect();
        run_blocks(BlockScheduler::Concurrent { seed: 7 }, 16, |block_id| {
            hits[block_id].fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        for hit in &hits {
            assert_eq!(hit.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn zero_workers_rejected() {
        let result = run_blocks(BlockScheduler::Fifo { workers: 0 }, 4, |_| {});
        assert_eq!(result, Err(ScheduleError::NoWorkers));
        assert!(ScheduleError::NoWorkers.to_string().contains("worker"));
    }

    #[test]
    fn empty_schedule_is_a_noop() {
        run_blocks(BlockScheduler::Fifo { workers: 0 }, 0, |_| {
            panic!("no blocks should run");
        })
        .unwrap();
    }
}
