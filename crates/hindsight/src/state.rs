//! Shared status table for the decoupled look-back protocol.
//!
//! One entry per block plus a window-width run of padding entries below
//! block 0. Each entry is written by exactly one block (its owner) and read
//! by any later block. Flags advance `Empty -> Partial -> Complete` and
//! never regress, so correctness rests on the monotonic lifecycle plus a
//! single release/acquire pairing: the store that makes a flag visible as
//! non-`Empty` must not become visible before the associated value store.
//!
//! ## Storage strategies
//!
//! Two layouts sit behind one interface, selected at construction from the
//! value type:
//!
//! - **Packed**: flag and value share one `AtomicU64` word, published by a
//!   single release store. Used when the value round-trips through 32 bits
//!   ([`ScanValue::PACKABLE`]).
//! - **Split**: an `AtomicU8` flag array plus two value arrays. Partial and
//!   complete values get separate slots because the value store and the flag
//!   store are distinct instructions, and a partial value must never
//!   overwrite an already-published complete value.
//!
//! ## Blocking
//!
//! [`LookbackScanState::get`] is the only blocking point: a pure spin with
//! an acquire load per iteration and no backoff. Progress is bounded by the
//! progress of earlier blocks, which makes the spin a priority-inversion
//! hazard on schedulers that do not run all participating blocks
//! concurrently. Callers on such schedulers must bound the number of
//! in-flight blocks themselves; see the harness FIFO scheduler for the
//! standard argument.
//!
//! ## Metrics
//!
//! - Counters: `hindsight_status_spins_total`,
//!   `hindsight_status_spin_iters_total`, `hindsight_partial_publishes_total`,
//!   `hindsight_complete_publishes_total`.
//! - Log target `hindsight.state`, DEBUG on contended reads.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

use crate::flag::{PrefixFlag, pack_word, word_flag, word_value};

/// Default look-back window width, in lanes.
///
/// Matches the synchronization-unit width of common parallel hardware. The
/// padding region below block 0 always has exactly this many entries for a
/// given table.
pub const DEFAULT_WINDOW_LANES: usize = 32;

/// Alignment granule for the split layout's storage accounting.
const STORAGE_ALIGN_BYTES: usize = 64;

// ---------------------------------------------------------------------------
// Global metrics (lock-free, Relaxed ordering)
// ---------------------------------------------------------------------------

static HINDSIGHT_STATUS_SPINS_TOTAL: AtomicU64 = AtomicU64::new(0);
static HINDSIGHT_STATUS_SPIN_ITERS_TOTAL: AtomicU64 = AtomicU64::new(0);
static HINDSIGHT_PARTIAL_PUBLISHES_TOTAL: AtomicU64 = AtomicU64::new(0);
static HINDSIGHT_COMPLETE_PUBLISHES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of status-table metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateMetrics {
    /// Reads that had to wait for a not-yet-published entry.
    pub hindsight_status_spins_total: u64,
    /// Total spin iterations across all waiting reads.
    pub hindsight_status_spin_iters_total: u64,
    /// `set_partial` publications.
    pub hindsight_partial_publishes_total: u64,
    /// `set_complete` publications.
    pub hindsight_complete_publishes_total: u64,
}

/// Read current status-table metrics.
#[must_use]
pub fn state_metrics() -> StateMetrics {
    StateMetrics {
        hindsight_status_spins_total: HINDSIGHT_STATUS_SPINS_TOTAL.load(Ordering::Relaxed),
        hindsight_status_spin_iters_total: HINDSIGHT_STATUS_SPIN_ITERS_TOTAL
            .load(Ordering::Relaxed),
        hindsight_partial_publishes_total: HINDSIGHT_PARTIAL_PUBLISHES_TOTAL
            .load(Ordering::Relaxed),
        hindsight_complete_publishes_total: HINDSIGHT_COMPLETE_PUBLISHES_TOTAL
            .load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_state_metrics() {
    HINDSIGHT_STATUS_SPINS_TOTAL.store(0, Ordering::Relaxed);
    HINDSIGHT_STATUS_SPIN_ITERS_TOTAL.store(0, Ordering::Relaxed);
    HINDSIGHT_PARTIAL_PUBLISHES_TOTAL.store(0, Ordering::Relaxed);
    HINDSIGHT_COMPLETE_PUBLISHES_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// ScanValue
// ---------------------------------------------------------------------------

/// A per-block aggregate value that can live in the status table.
///
/// Types that round-trip through a 32-bit word opt into the packed layout by
/// setting [`PACKABLE`](Self::PACKABLE) and overriding [`pack`](Self::pack)
/// and [`unpack`](Self::unpack); everything else gets the split layout and
/// keeps the default methods, which are never called.
pub trait ScanValue: Copy + Send + Sync + 'static {
    /// Whether flag and value fit one 64-bit status word together.
    const PACKABLE: bool;

    /// Encode into the 32-bit payload of a packed status word.
    ///
    /// Must be overridden when `PACKABLE` is `true`.
    fn pack(self) -> u32 {
        unreachable!("ScanValue::pack called on a type without a packed encoding")
    }

    /// Decode from the 32-bit payload of a packed status word.
    ///
    /// Must be overridden when `PACKABLE` is `true`.
    fn unpack(_bits: u32) -> Self {
        unreachable!("ScanValue::unpack called on a type without a packed encoding")
    }
}

macro_rules! packed_scan_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ScanValue for $ty {
                const PACKABLE: bool = true;

                #[inline]
                fn pack(self) -> u32 {
                    // Sign-extends for the signed types; `unpack` truncates
                    // back, so the round-trip is exact.
                    self as u32
                }

                #[inline]
                fn unpack(bits: u32) -> Self {
                    bits as $ty
                }
            }
        )*
    };
}

macro_rules! split_scan_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ScanValue for $ty {
                const PACKABLE: bool = false;
            }
        )*
    };
}

packed_scan_value!(u8, u16, u32, i8, i16, i32);
split_scan_value!(u64, i64, u128, i128, usize, isize, f64);

impl ScanValue for f32 {
    const PACKABLE: bool = true;

    #[inline]
    fn pack(self) -> u32 {
        self.to_bits()
    }

    #[inline]
    fn unpack(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}

// ---------------------------------------------------------------------------
// PrefixStatus
// ---------------------------------------------------------------------------

/// A non-`Empty` status entry as observed by a reader.
///
/// `Empty` is the transient not-yet-published state consumed internally by
/// the spin in [`LookbackScanState::get`]; it is never returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixStatus<T> {
    /// Padding below block 0; contributes nothing to any prefix.
    Invalid,
    /// The owning block's local aggregate only.
    Partial(T),
    /// The inclusive aggregate through the owning block.
    Complete(T),
}

impl<T> PrefixStatus<T> {
    /// The lifecycle flag this status was read under.
    #[inline]
    #[must_use]
    pub fn flag(&self) -> PrefixFlag {
        match self {
            Self::Invalid => PrefixFlag::Invalid,
            Self::Partial(_) => PrefixFlag::Partial,
            Self::Complete(_) => PrefixFlag::Complete,
        }
    }

    /// Whether a look-back window stops at this entry.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.flag().is_terminal()
    }

    /// The carried value, if any.
    #[inline]
    pub fn value(self) -> Option<T> {
        match self {
            Self::Invalid => None,
            Self::Partial(v) | Self::Complete(v) => Some(v),
        }
    }
}

// ---------------------------------------------------------------------------
// Value cells (split layout)
// ---------------------------------------------------------------------------

/// One value slot of the split layout.
///
/// Safety protocol: the slot is written only by the owning block's single
/// designated writer, strictly before the `Release` store of the matching
/// flag; readers dereference only after an `Acquire` load has observed that
/// flag, so every read is of an initialized value that happens-after its
/// write. Partial and complete slots are distinct, so a slot is never
/// written while a reader holds it.
#[repr(transparent)]
struct ValueCell<T>(UnsafeCell<MaybeUninit<T>>);

impl<T: Copy> ValueCell<T> {
    const fn empty() -> Self {
        Self(UnsafeCell::new(MaybeUninit::uninit()))
    }

    /// Write the slot. Caller must be the entry's single writer and must
    /// publish the matching flag with `Release` ordering afterwards.
    unsafe fn write(&self, value: T) {
        // SAFETY: single writer per the protocol above; no reader can hold
        // a reference into the slot before the flag is published.
        unsafe { (*self.0.get()).write(value) };
    }

    /// Read the slot. Caller must have observed the matching flag with
    /// `Acquire` ordering.
    unsafe fn read(&self) -> T {
        // SAFETY: the Acquire/Release pairing on the flag guarantees the
        // slot was initialized before this read began.
        unsafe { (*self.0.get()).assume_init() }
    }
}

// SAFETY: concurrent access is mediated by the flag protocol documented on
// the type; the cell itself is only a storage location.
unsafe impl<T: Send + Sync> Sync for ValueCell<T> {}

// ---------------------------------------------------------------------------
// Storage strategies
// ---------------------------------------------------------------------------

enum SlotStore<T> {
    /// Flag and value in one atomic word per entry.
    Packed { words: Box<[AtomicU64]> },
    /// Flag array plus distinct partial/complete value arrays.
    Split {
        flags: Box<[AtomicU8]>,
        partial: Box<[ValueCell<T>]>,
        complete: Box<[ValueCell<T>]>,
    },
}

/// Round split-layout array footprints up to the storage granule.
const fn align_up(size: usize) -> usize {
    (size + STORAGE_ALIGN_BYTES - 1) & !(STORAGE_ALIGN_BYTES - 1)
}

fn decode_flag(raw: u8) -> PrefixFlag {
    match PrefixFlag::from_raw(raw as i8) {
        Some(flag) => flag,
        None => unreachable!("corrupt status flag byte: {raw:#04x}"),
    }
}

// ---------------------------------------------------------------------------
// LookbackScanState
// ---------------------------------------------------------------------------

/// The shared status table for one device-wide scan invocation.
///
/// Sized as `window_lanes + number_of_blocks` entries; the low
/// `window_lanes` entries are permanent `Invalid` padding so windowed reads
/// just below block 0 stay in bounds. The table is built for a single
/// invocation; reuse requires a full [`initialize_prefix`] pass first.
///
/// [`initialize_prefix`]: LookbackScanState::initialize_prefix
pub struct LookbackScanState<T: ScanValue> {
    store: SlotStore<T>,
    number_of_blocks: usize,
    window_lanes: usize,
}

impl<T: ScanValue> LookbackScanState<T> {
    /// Create a fully initialized table with the default window width.
    #[must_use]
    pub fn new(number_of_blocks: usize) -> Self {
        Self::with_window(number_of_blocks, DEFAULT_WINDOW_LANES)
    }

    /// Create a fully initialized table with an explicit window width.
    ///
    /// # Panics
    ///
    /// Panics if `number_of_blocks` or `window_lanes` is zero.
    #[must_use]
    pub fn with_window(number_of_blocks: usize, window_lanes: usize) -> Self {
        assert!(
            number_of_blocks > 0,
            "lookback scan state requires at least one block"
        );
        assert!(
            window_lanes > 0,
            "look-back window requires at least one lane"
        );

        let entries = window_lanes + number_of_blocks;
        let init_flag = |i: usize| {
            if i < window_lanes {
                PrefixFlag::Invalid
            } else {
                PrefixFlag::Empty
            }
        };

        let store = if T::PACKABLE {
            let words = (0..entries)
                .map(|i| AtomicU64::new(pack_word(init_flag(i), 0)))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            SlotStore::Packed { words }
        } else {
            let flags = (0..entries)
                .map(|i| AtomicU8::new(init_flag(i).raw() as u8))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            let partial = (0..entries)
                .map(|_| ValueCell::empty())
                .collect::<Vec<_>>()
                .into_boxed_slice();
            let complete = (0..entries)
                .map(|_| ValueCell::empty())
                .collect::<Vec<_>>()
                .into_boxed_slice();
            SlotStore::Split {
                flags,
                partial,
                complete,
            }
        };

        Self {
            store,
            number_of_blocks,
            window_lanes,
        }
    }

    /// Number of participating blocks.
    #[inline]
    #[must_use]
    pub fn number_of_blocks(&self) -> usize {
        self.number_of_blocks
    }

    /// Look-back window width in lanes; also the padding length.
    #[inline]
    #[must_use]
    pub fn window_lanes(&self) -> usize {
        self.window_lanes
    }

    /// Whether this table uses the single-word packed layout.
    #[must_use]
    pub fn uses_packed_layout(&self) -> bool {
        matches!(self.store, SlotStore::Packed { .. })
    }

    /// Storage footprint in bytes for a table over `number_of_blocks`
    /// blocks with the default window width.
    ///
    /// Pure function of the block count and the value type; callers sizing
    /// an external allocation call this before construction.
    #[must_use]
    pub fn storage_size(number_of_blocks: usize) -> usize {
        Self::storage_size_with_window(number_of_blocks, DEFAULT_WINDOW_LANES)
    }

    /// Storage footprint in bytes for an explicit window width.
    #[must_use]
    pub fn storage_size_with_window(number_of_blocks: usize, window_lanes: usize) -> usize {
        let entries = window_lanes + number_of_blocks;
        if T::PACKABLE {
            entries * std::mem::size_of::<u64>()
        } else {
            align_up(entries) + 2 * align_up(entries * std::mem::size_of::<T>())
        }
    }

    /// Debug-only check that the live allocation matches
    /// [`storage_size_with_window`](Self::storage_size_with_window).
    ///
    /// Compiled out of release builds; there is no error channel at this
    /// layer, so a mismatch is a construction bug, not a runtime condition.
    pub fn debug_validate_layout(&self) {
        debug_assert_eq!(
            self.live_storage_bytes(),
            Self::storage_size_with_window(self.number_of_blocks, self.window_lanes),
            "status table allocation does not match its declared storage size"
        );
    }

    fn live_storage_bytes(&self) -> usize {
        match &self.store {
            SlotStore::Packed { words } => words.len() * std::mem::size_of::<u64>(),
            SlotStore::Split {
                flags,
                partial,
                complete,
            } => {
                align_up(flags.len())
                    + align_up(partial.len() * std::mem::size_of::<T>())
                    + align_up(complete.len() * std::mem::size_of::<T>())
            }
        }
    }

    /// Re-initialize one block's entry (and its mirrored padding position)
    /// for a fresh invocation.
    ///
    /// Every participating block must run this before any block publishes
    /// or reads; the initialization phase and the scan phase must not
    /// overlap. A table that skipped re-initialization spins forever on the
    /// first stale read, which is a caller contract violation rather than a
    /// reported error.
    pub fn initialize_prefix(&self, block_id: usize, number_of_blocks: usize) {
        debug_assert_eq!(
            number_of_blocks, self.number_of_blocks,
            "initialize_prefix called with a mismatched block count"
        );
        if block_id < number_of_blocks {
            self.store_flag(self.window_lanes + block_id, PrefixFlag::Empty);
        }
        if block_id < self.window_lanes {
            self.store_flag(block_id, PrefixFlag::Invalid);
        }
    }

    /// Publish this block's local aggregate.
    pub fn set_partial(&self, block_id: usize, value: T) {
        self.publish(block_id, PrefixFlag::Partial, value);
        HINDSIGHT_PARTIAL_PUBLISHES_TOTAL.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish this block's inclusive aggregate (local aggregate combined
    /// with the full prefix of all prior blocks).
    pub fn set_complete(&self, block_id: usize, value: T) {
        self.publish(block_id, PrefixFlag::Complete, value);
        HINDSIGHT_COMPLETE_PUBLISHES_TOTAL.fetch_add(1, Ordering::Relaxed);
    }

    /// Blocking read of block `block_id`'s status.
    ///
    /// Spins with an acquire load per iteration until the entry is
    /// non-`Empty`, then returns the observed status. An entry that is
    /// already `Complete` returns the identical status on every subsequent
    /// call.
    #[must_use]
    pub fn get(&self, block_id: usize) -> PrefixStatus<T> {
        debug_assert!(
            block_id < self.number_of_blocks,
            "status read out of range: block {block_id} of {}",
            self.number_of_blocks
        );
        self.spin_status(self.window_lanes + block_id)
    }

    /// Non-blocking read: `None` while the entry is still `Empty`.
    #[must_use]
    pub fn try_get(&self, block_id: usize) -> Option<PrefixStatus<T>> {
        debug_assert!(
            block_id < self.number_of_blocks,
            "status read out of range: block {block_id} of {}",
            self.number_of_blocks
        );
        self.load_status(self.window_lanes + block_id)
    }

    /// Blocking read by signed block index; indices in
    /// `-window_lanes..0` resolve to the permanent `Invalid` padding.
    pub(crate) fn get_signed(&self, block_index: isize) -> PrefixStatus<T> {
        let padded = block_index + self.window_lanes as isize;
        debug_assert!(
            padded >= 0 && (padded as usize) < self.window_lanes + self.number_of_blocks,
            "signed status read out of range: block index {block_index}"
        );
        self.spin_status(padded as usize)
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    fn spin_status(&self, physical: usize) -> PrefixStatus<T> {
        let mut iters: u64 = 0;
        let status = loop {
            if let Some(status) = self.load_status(physical) {
                break status;
            }
            iters += 1;
            std::hint::spin_loop();
        };

        if iters > 0 {
            HINDSIGHT_STATUS_SPINS_TOTAL.fetch_add(1, Ordering::Relaxed);
            HINDSIGHT_STATUS_SPIN_ITERS_TOTAL.fetch_add(iters, Ordering::Relaxed);
            tracing::debug!(
                target: "hindsight.state",
                physical,
                iters,
                "status read contended"
            );
        }
        status
    }

    fn load_status(&self, physical: usize) -> Option<PrefixStatus<T>> {
        match &self.store {
            SlotStore::Packed { words } => {
                let word = words[physical].load(Ordering::Acquire);
                match word_flag(word) {
                    PrefixFlag::Empty => None,
                    PrefixFlag::Invalid => Some(PrefixStatus::Invalid),
                    PrefixFlag::Partial => {
                        Some(PrefixStatus::Partial(T::unpack(word_value(word))))
                    }
                    PrefixFlag::Complete => {
                        Some(PrefixStatus::Complete(T::unpack(word_value(word))))
                    }
                }
            }
            SlotStore::Split {
                flags,
                partial,
                complete,
            } => {
                let flag = decode_flag(flags[physical].load(Ordering::Acquire));
                match flag {
                    PrefixFlag::Empty => None,
                    PrefixFlag::Invalid => Some(PrefixStatus::Invalid),
                    // SAFETY: the Acquire load above observed the flag that
                    // the writer stored with Release after writing the
                    // matching value slot.
                    PrefixFlag::Partial => {
                        Some(PrefixStatus::Partial(unsafe { partial[physical].read() }))
                    }
                    PrefixFlag::Complete => {
                        Some(PrefixStatus::Complete(unsafe { complete[physical].read() }))
                    }
                }
            }
        }
    }

    fn publish(&self, block_id: usize, flag: PrefixFlag, value: T) {
        debug_assert!(
            block_id < self.number_of_blocks,
            "publish out of range: block {block_id} of {}",
            self.number_of_blocks
        );
        debug_assert!(
            matches!(flag, PrefixFlag::Partial | PrefixFlag::Complete),
            "publish accepts only partial or complete flags"
        );
        let physical = self.window_lanes + block_id;
        match &self.store {
            SlotStore::Packed { words } => {
                words[physical].store(pack_word(flag, value.pack()), Ordering::Release);
            }
            SlotStore::Split {
                flags,
                partial,
                complete,
            } => {
                let cell = match flag {
                    PrefixFlag::Partial => &partial[physical],
                    _ => &complete[physical],
                };
                // SAFETY: this thread is the entry's single designated
                // writer; the Release store below publishes the write.
                unsafe { cell.write(value) };
                flags[physical].store(flag.raw() as u8, Ordering::Release);
            }
        }
        tracing::trace!(target: "hindsight.state", block_id, flag = %flag, "status published");
    }

    fn store_flag(&self, physical: usize, flag: PrefixFlag) {
        match &self.store {
            SlotStore::Packed { words } => {
                words[physical].store(pack_word(flag, 0), Ordering::Release);
            }
            SlotStore::Split { flags, .. } => {
                flags[physical].store(flag.raw() as u8, Ordering::Release);
            }
        }
    }
}

impl<T: ScanValue> std::fmt::Debug for LookbackScanState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookbackScanState")
            .field("number_of_blocks", &self.number_of_blocks)
            .field("window_lanes", &self.window_lanes)
            .field("packed", &self.uses_packed_layout())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
