//! # kvstore — log-structured key-value store for raw flash
//!
//! A power-loss-safe key-value store layered on any [`BlockDevice`], built
//! for small devices that persist configuration and credential data in raw
//! flash. The device is wrapped in a [`bufdev::BufferedBlockDevice`] so
//! records can be laid out byte-by-byte while the media only ever sees
//! aligned program units.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  KvStore                      │
//! │                                               │
//! │ write.rs → set_start / set_add_data /         │
//! │            set_finalize (append + verify)     │
//! │ read.rs  → get / get_at / get_info            │
//! │ iter.rs  → prefix iteration (pooled handles)  │
//! │ gc.rs    → area-swap garbage collection       │
//! │ init.rs  → area geometry, master records,     │
//! │            log replay                         │
//! │ reserved.rs → write-once reserved payload     │
//! └───────────────────┬───────────────────────────┘
//!                     │ byte-granular I/O
//!                     ▼
//!            BufferedBlockDevice → BlockDevice
//! ```
//!
//! ## On-device layout
//!
//! The device is split into two equal areas, each tiled from whole erase
//! units. Exactly one area is active; the other stands by for garbage
//! collection. Low to high inside an area:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ reserved region (payload + size/CRC trailer) │
//! ├─────────────────────────────────────────────┤
//! │ master record ("mstr", 16-bit version)       │
//! ├─────────────────────────────────────────────┤
//! │ append log: CRC-framed records               │
//! ├─────────────────────────────────────────────┤
//! │ free (erased) space                          │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Keys are deleted by appending a tombstone record, never by rewriting in
//! place; space is reclaimed by copying live records into the standby area
//! and swapping. The master record's version decides which area is
//! authoritative after a restart.
//!
//! ## Crash safety
//!
//! A record becomes visible only after its header (carrying the CRC over
//! header, key, and data) is written and synced — data and key bytes go to
//! the device first, the header last. Replay stops at the first record that
//! fails to decode or checksum: a torn tail is "never written", not an
//! error. Garbage collection commits by writing the standby area's master
//! record last, so power loss mid-GC leaves the old area authoritative.

mod gc;
mod index;
mod init;
mod iter;
mod read;
mod record;
mod reserved;
mod write;

pub use record::CreateFlags;

use blockdev::{BdError, BlockDevice};
use bufdev::BufferedBlockDevice;
use index::RamIndex;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 128;

/// Maximum number of concurrently open iterators.
pub const MAX_OPEN_ITERATORS: usize = 16;

/// Capacity of the write-once reserved payload at the start of each area.
pub const RESERVED_DATA_SIZE: usize = 64;

/// Characters that may not appear in a key.
pub(crate) const KEY_FORBIDDEN_CHARS: &[char] =
    &['*', '/', '?', ':', ';', '"', '|', '<', '>', '\\'];

/// Fixed key of the per-area master record. Not usable as a user key.
pub(crate) const MASTER_KEY: &[u8] = b"mstr";

pub(crate) const INITIAL_INDEX_CAPACITY: usize = 32;

/// Unified error type for store operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// A lower-layer device error, surfaced verbatim.
    #[error("block device error: {0}")]
    Device(#[from] BdError),

    /// The device cannot host two equal-sized areas, or is too small.
    #[error("store initialization failed")]
    InitFailed,

    /// The key does not exist (or iteration is exhausted).
    #[error("key not found")]
    NotFound,

    /// Bad key, bad flags, or otherwise malformed input.
    #[error("invalid argument")]
    InvalidArgument,

    /// Offset beyond the value, over- or under-declared incremental write,
    /// or a stale incremental handle.
    #[error("invalid size")]
    InvalidSize,

    /// A record failed CRC or structural validation.
    #[error("corrupt data detected")]
    CorruptData,

    /// The iterator pool is exhausted.
    #[error("out of resources")]
    OutOfResources,

    /// The key is write-once protected, or the reserved payload was already
    /// written.
    #[error("write protected")]
    WriteProtected,

    /// The record does not fit even after garbage collection.
    #[error("media full")]
    MediaFull,

    /// A new incremental write was started before the previous one
    /// completed.
    #[error("incremental write not finalized")]
    NotFinalized,
}

/// Metadata for a stored key, as returned by [`KvStore::get_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    /// Value size in bytes.
    pub size: usize,
    /// Flags the key was created with.
    pub flags: CreateFlags,
}

/// Opaque handle for an in-progress incremental write.
///
/// Obtained from [`KvStore::set_start`]; consumed by
/// [`KvStore::set_finalize`]. At most one may be in flight per store.
#[derive(Debug)]
pub struct SetHandle {
    tag: u64,
}

/// Opaque handle for an open iterator slot.
#[derive(Debug)]
pub struct IterHandle {
    slot: usize,
}

pub(crate) struct IncState {
    tag: u64,
    /// Record base offset within the active area.
    base: u64,
    key: Vec<u8>,
    flags: u32,
    data_len: u32,
    written: u32,
    crc: crc32fast::Hasher,
}

pub(crate) struct IterState {
    /// Next index position to examine.
    pos: usize,
    prefix: Option<String>,
}

/// Log-structured key-value store over a block device.
///
/// Single-threaded and synchronous: every call runs to completion on the
/// calling thread, and mutating calls are non-reentrant. Embedders that
/// share a store across execution contexts must serialize access
/// externally.
pub struct KvStore<D: BlockDevice> {
    dev: BufferedBlockDevice<D>,
    /// Native program unit of the wrapped device; record alignment
    /// granularity.
    prog_size: u64,
    /// Size of each of the two areas (always equal).
    area_size: u64,
    /// Offset of the master record within an area.
    master_offset: u64,
    /// Offset where the append log starts (just past the master record).
    log_start: u64,
    active: usize,
    active_version: u16,
    /// First byte past the last committed record, relative to the active
    /// area.
    free_space_offset: u64,
    index: RamIndex,
    iters: [Option<IterState>; MAX_OPEN_ITERATORS],
    inc: Option<IncState>,
    inc_tag: u64,
    in_gc: bool,
    /// Scratch for chunked CRC passes and record copies.
    work_buf: Vec<u8>,
}

impl<D: BlockDevice> KvStore<D> {
    /// Opens a store on `dev`, performing full recovery: area geometry,
    /// master-record arbitration, and log replay into the RAM index.
    ///
    /// # Errors
    ///
    /// [`StoreError::InitFailed`] when the device cannot be split into two
    /// equal erase-unit-aligned areas or is too small to hold a single
    /// record; device errors are surfaced verbatim.
    pub fn new(dev: D) -> Result<Self> {
        let mut dev = BufferedBlockDevice::new(dev);
        dev.init()?;

        let prog_size = dev.inner().program_size();
        let area_size = init::compute_area_size(&dev)?;
        if area_size > u64::from(u32::MAX) {
            // index offsets are 32-bit
            return Err(StoreError::InitFailed);
        }

        let reserved_size = blockdev::align_up(
            (RESERVED_DATA_SIZE + reserved::TRAILER_SIZE) as u64,
            prog_size,
        );
        let master_offset = reserved_size;
        let master_size = blockdev::align_up(
            (record::HEADER_SIZE + MASTER_KEY.len() + init::MASTER_DATA_SIZE) as u64,
            prog_size,
        );
        let log_start = master_offset + master_size;
        let min_record = blockdev::align_up((record::HEADER_SIZE + 1) as u64, prog_size);
        if log_start + min_record > area_size {
            return Err(StoreError::InitFailed);
        }

        let mut store = Self {
            dev,
            prog_size,
            area_size,
            master_offset,
            log_start,
            active: 0,
            active_version: 0,
            free_space_offset: log_start,
            index: RamIndex::with_capacity(INITIAL_INDEX_CAPACITY),
            iters: std::array::from_fn(|_| None),
            inc: None,
            inc_tag: 0,
            in_gc: false,
            work_buf: vec![0u8; (prog_size as usize).max(256)],
        };
        store.init_state()?;
        Ok(store)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// `true` when the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes left in the active area before the next append forces garbage
    /// collection.
    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.area_size - self.free_space_offset
    }

    /// Flushes pending writes and shuts the underlying device down.
    ///
    /// A flush failure is reported as
    /// [`BdError::SyncFailed`](blockdev::BdError::SyncFailed) through
    /// [`StoreError::Device`], distinct from a wrapped-device failure.
    pub fn deinit(&mut self) -> Result<()> {
        self.dev.deinit().map_err(StoreError::from)
    }

    // ---- internal addressing helpers ----

    pub(crate) fn area_addr(&self, area: usize, offset: u64) -> u64 {
        area as u64 * self.area_size + offset
    }

    pub(crate) fn read_area(&mut self, area: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let addr = self.area_addr(area, offset);
        self.dev.read(buf, addr).map_err(StoreError::from)
    }

    pub(crate) fn program_area(&mut self, area: usize, offset: u64, buf: &[u8]) -> Result<()> {
        let addr = self.area_addr(area, offset);
        self.dev.program(buf, addr).map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests;
