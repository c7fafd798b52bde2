//! hindsight verification harness.
//!
//! This crate is intentionally not "just tests": it contains reusable
//! verification tooling (simulated device schedulers, protocol delay
//! injection, full device-wide scan drivers) that the integration suite
//! and the benches drive against the look-back core.

pub mod device;
pub mod fault;
pub mod scan;
pub mod sym;

pub use device::{BlockScheduler, ScheduleError, run_blocks};
pub use fault::{DelayPlan, DelayPoint};
pub use scan::{device_exclusive_scan, device_exclusive_scan_with_plan, device_inclusive_scan};
pub use sym::{SYM_CAPACITY, Sym};
