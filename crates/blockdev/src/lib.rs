//! # blockdev — block-device capability contract
//!
//! Defines the [`BlockDevice`] trait every storage backend in CinderKV
//! implements, together with the geometry rules the upper layers are allowed
//! to rely on:
//!
//! - `read_size` — smallest readable unit, in bytes
//! - `program_size` — smallest writable unit, a multiple of `read_size`
//! - `erase_size(addr)` — smallest erasable unit at `addr`, a multiple of
//!   `program_size` (may vary across address regions)
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ KvStore              (crates/kvstore)       │
//! ├─────────────────────────────────────────────┤
//! │ BufferedBlockDevice  (crates/bufdev)        │
//! ├─────────────────────────────────────────────┤
//! │ BlockDevice trait    (this crate)           │
//! │   RamBlockDevice | FileBlockDevice | ...    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Every operation returns a typed [`BdError`] — nothing panics on a
//! recoverable path, and no operation partially succeeds silently. Callers
//! can probe feasibility up front through the default `validate_*` methods,
//! which compute the required alignment from the device's own geometry.
//!
//! `program` requires the target range to have been erased first. That is a
//! caller obligation; the contract does not police it.

mod file;
mod ram;

pub use file::FileBlockDevice;
pub use ram::RamBlockDevice;

use thiserror::Error;

/// Result type alias for block-device operations.
pub type Result<T> = std::result::Result<T, BdError>;

/// Errors reported by [`BlockDevice`] implementations.
///
/// Upper layers branch on these to decide retry-vs-abort, so misuse
/// (alignment, size, bounds) is kept distinct from media failure and from
/// lifecycle errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BdError {
    /// Operation attempted before `init` or after `deinit`.
    #[error("device not initialized")]
    NotInitialized,

    /// The backend failed to initialize.
    #[error("device initialization failed")]
    InitFailed,

    /// The underlying media reported a failure.
    #[error("device media error")]
    DeviceError,

    /// Length is not a multiple of the required unit, or the range runs past
    /// the device end.
    #[error("incorrect size for operation")]
    IncorrectSize,

    /// Address lies outside the device.
    #[error("address out of device bounds")]
    IncorrectAddress,

    /// Address is not aligned to the required unit.
    #[error("address not aligned to the required unit")]
    NotAligned,

    /// A pending cache line could not be flushed during sync or teardown.
    ///
    /// Reported by buffering layers that implement this trait; kept in the
    /// shared error type so callers can tell "cached writes may be lost"
    /// apart from an ordinary media error.
    #[error("cache synchronization failed")]
    SyncFailed,
}

/// Rounds `x` down to a multiple of `unit`.
#[must_use]
pub fn align_down(x: u64, unit: u64) -> u64 {
    x - x % unit
}

/// Rounds `x` up to a multiple of `unit`.
#[must_use]
pub fn align_up(x: u64, unit: u64) -> u64 {
    align_down(x + unit - 1, unit)
}

fn validate_uniform(addr: u64, len: u64, unit: u64, size: u64) -> Result<()> {
    let end = addr.checked_add(len).ok_or(BdError::IncorrectSize)?;
    if addr > size {
        return Err(BdError::IncorrectAddress);
    }
    if end > size {
        return Err(BdError::IncorrectSize);
    }
    if addr % unit != 0 {
        return Err(BdError::NotAligned);
    }
    if len % unit != 0 {
        return Err(BdError::IncorrectSize);
    }
    Ok(())
}

/// Capability contract for a physical or logical storage backend.
///
/// Geometry invariants: `program_size` is a multiple of `read_size`, and
/// `erase_size(addr)` is a multiple of `program_size` for every `addr`.
/// Implementations with a single uniform erase unit simply ignore `addr`.
///
/// Lifecycle is dual-stage: `init` before any I/O, `deinit` when done.
/// Geometry queries are valid at any time.
pub trait BlockDevice {
    /// Initializes the device. Idempotent: repeated `init` while already
    /// initialized is a no-op success.
    fn init(&mut self) -> Result<()>;

    /// Deinitializes the device.
    fn deinit(&mut self) -> Result<()>;

    /// Reads `buf.len()` bytes starting at `addr`.
    ///
    /// `addr` must be aligned to `read_size` and `buf.len()` a multiple of
    /// it; the range must not run past the device end.
    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()>;

    /// Programs `buf.len()` bytes starting at `addr`.
    ///
    /// Same alignment rules as `read`, against `program_size`. The target
    /// range must have been erased (or, when `erase_value` is known, filled
    /// with that value) beforehand.
    fn program(&mut self, buf: &[u8], addr: u64) -> Result<()>;

    /// Erases `len` bytes starting at `addr`, both aligned to the (possibly
    /// address-dependent) erase unit.
    ///
    /// Afterwards the range reads back as `erase_value` everywhere if that
    /// value is known, or as an unspecified-but-readable pattern otherwise.
    fn erase(&mut self, addr: u64, len: u64) -> Result<()>;

    /// Smallest readable unit in bytes.
    fn read_size(&self) -> u64;

    /// Smallest programmable unit in bytes. A multiple of `read_size`.
    fn program_size(&self) -> u64;

    /// Smallest erasable unit at `addr`, in bytes. A multiple of
    /// `program_size`; may vary by address region.
    fn erase_size(&self, addr: u64) -> u64;

    /// Byte value the media reads back as after an erase, or `None` when the
    /// backend cannot promise one.
    fn erase_value(&self) -> Option<u8>;

    /// Total device capacity in bytes.
    fn size(&self) -> u64;

    /// Short static name identifying the backend kind.
    fn device_type(&self) -> &'static str;

    /// Checks whether a `read` at `addr` of `len` bytes would be accepted.
    fn validate_read(&self, addr: u64, len: u64) -> Result<()> {
        validate_uniform(addr, len, self.read_size(), self.size())
    }

    /// Checks whether a `program` at `addr` of `len` bytes would be accepted.
    fn validate_program(&self, addr: u64, len: u64) -> Result<()> {
        validate_uniform(addr, len, self.program_size(), self.size())
    }

    /// Checks whether an `erase` at `addr` of `len` bytes would be accepted.
    ///
    /// Walks the (possibly non-uniform) erase units covering the range: the
    /// start must fall on a unit boundary and the end must land exactly on
    /// one.
    fn validate_erase(&self, addr: u64, len: u64) -> Result<()> {
        let size = self.size();
        let end = addr.checked_add(len).ok_or(BdError::IncorrectSize)?;
        if addr > size {
            return Err(BdError::IncorrectAddress);
        }
        if end > size {
            return Err(BdError::IncorrectSize);
        }
        if addr % self.erase_size(addr) != 0 {
            return Err(BdError::NotAligned);
        }
        let mut pos = addr;
        while pos < end {
            pos += self.erase_size(pos);
        }
        if pos != end {
            return Err(BdError::IncorrectSize);
        }
        Ok(())
    }
}

/// A mutable reference to a device is itself a device, so an owner can lend
/// its device to a consumer (a buffering layer, a store) and take it back —
/// the pattern a restart cycle needs.
impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }
    fn deinit(&mut self) -> Result<()> {
        (**self).deinit()
    }
    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()> {
        (**self).read(buf, addr)
    }
    fn program(&mut self, buf: &[u8], addr: u64) -> Result<()> {
        (**self).program(buf, addr)
    }
    fn erase(&mut self, addr: u64, len: u64) -> Result<()> {
        (**self).erase(addr, len)
    }
    fn read_size(&self) -> u64 {
        (**self).read_size()
    }
    fn program_size(&self) -> u64 {
        (**self).program_size()
    }
    fn erase_size(&self, addr: u64) -> u64 {
        (**self).erase_size(addr)
    }
    fn erase_value(&self) -> Option<u8> {
        (**self).erase_value()
    }
    fn size(&self) -> u64 {
        (**self).size()
    }
    fn device_type(&self) -> &'static str {
        (**self).device_type()
    }
    fn validate_read(&self, addr: u64, len: u64) -> Result<()> {
        (**self).validate_read(addr, len)
    }
    fn validate_program(&self, addr: u64, len: u64) -> Result<()> {
        (**self).validate_program(addr, len)
    }
    fn validate_erase(&self, addr: u64, len: u64) -> Result<()> {
        (**self).validate_erase(addr, len)
    }
}
