//! Single-pass parallel prefix scan coordination via decoupled look-back.
//!
//! Implements the coordination core of the single-pass scan described in
//! Merrill & Garland, *Single-pass Parallel Prefix Scan with Decoupled
//! Look-back* (NVIDIA Technical Report NVR-2016-001): many independently
//! scheduled blocks each reduce a slice of input, and every block discovers
//! the combined aggregate of all earlier blocks by walking a shared status
//! table backward instead of waiting for a second combining pass.
//!
//! The crate deliberately covers only the coordination protocol:
//!
//! - [`LookbackScanState`]: the shared status table, one single-writer
//!   entry per block plus a padding region below block 0.
//! - [`PrefixFlag`]: the monotonic `Empty -> Partial -> Complete`
//!   lifecycle (`Invalid` marks padding).
//! - [`reduce_window`]: the windowed look-back reduction with a reversed,
//!   completion-absorbing combine.
//! - [`LookbackPrefixOp`]: one block's protocol run, producing that
//!   block's exclusive prefix.
//!
//! The elementwise scan arithmetic, input partitioning, and block dispatch
//! belong to the caller; the `hindsight-harness` crate carries a simulated
//! device and full scan drivers for verification.

pub mod flag;
pub mod prefix_op;
pub mod reducer;
pub mod state;

pub use flag::PrefixFlag;
pub use prefix_op::LookbackPrefixOp;
pub use reducer::{
    LookbackMetrics, WindowReduction, lookback_metrics, reduce_window, reset_lookback_metrics,
};
pub use state::{
    DEFAULT_WINDOW_LANES, LookbackScanState, PrefixStatus, ScanValue, StateMetrics,
    reset_state_metrics, state_metrics,
};
