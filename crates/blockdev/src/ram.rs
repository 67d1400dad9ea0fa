//! RAM-backed block device.
//!
//! Simulates flash geometry entirely in memory: reads and programs enforce
//! the alignment contract, erase fills the range with the erase value
//! (`0xff`). The primary backend for exercising the upper layers in tests.

use crate::{BdError, BlockDevice, Result};

/// Heap-backed block device with configurable geometry.
pub struct RamBlockDevice {
    data: Vec<u8>,
    read_size: u64,
    program_size: u64,
    erase_size: u64,
    initialized: bool,
    program_count: u64,
    erase_count: u64,
}

const ERASE_VALUE: u8 = 0xff;

impl RamBlockDevice {
    /// Creates a device of `size` bytes with the given unit geometry.
    ///
    /// Fresh media reads back fully erased.
    ///
    /// # Panics
    ///
    /// Panics on incoherent geometry: `program_size` must be a multiple of
    /// `read_size`, `erase_size` a multiple of `program_size`, and `size` a
    /// multiple of `erase_size`.
    pub fn new(size: u64, read_size: u64, program_size: u64, erase_size: u64) -> Self {
        assert!(read_size > 0, "read_size must be > 0");
        assert!(
            program_size % read_size == 0,
            "program_size must be a multiple of read_size"
        );
        assert!(
            erase_size % program_size == 0,
            "erase_size must be a multiple of program_size"
        );
        assert!(size % erase_size == 0, "size must be a multiple of erase_size");
        Self {
            data: vec![ERASE_VALUE; size as usize],
            read_size,
            program_size,
            erase_size,
            initialized: false,
            program_count: 0,
            erase_count: 0,
        }
    }

    /// How many `program` calls have been accepted (for testing).
    #[must_use]
    pub fn program_count(&self) -> u64 {
        self.program_count
    }

    /// How many `erase` calls have been accepted (for testing).
    #[must_use]
    pub fn erase_count(&self) -> u64 {
        self.erase_count
    }

    /// Raw view of the backing bytes, for test verification.
    #[must_use]
    pub fn read_raw(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Scribbles raw bytes, bypassing the program contract. Test-side
    /// corruption injection.
    pub fn write_raw(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl BlockDevice for RamBlockDevice {
    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.initialized = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()> {
        if !self.initialized {
            return Err(BdError::NotInitialized);
        }
        self.validate_read(addr, buf.len() as u64)?;
        let start = addr as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn program(&mut self, buf: &[u8], addr: u64) -> Result<()> {
        if !self.initialized {
            return Err(BdError::NotInitialized);
        }
        self.validate_program(addr, buf.len() as u64)?;
        let start = addr as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        self.program_count += 1;
        Ok(())
    }

    fn erase(&mut self, addr: u64, len: u64) -> Result<()> {
        if !self.initialized {
            return Err(BdError::NotInitialized);
        }
        self.validate_erase(addr, len)?;
        let start = addr as usize;
        self.data[start..start + len as usize].fill(ERASE_VALUE);
        self.erase_count += 1;
        Ok(())
    }

    fn read_size(&self) -> u64 {
        self.read_size
    }

    fn program_size(&self) -> u64 {
        self.program_size
    }

    fn erase_size(&self, _addr: u64) -> u64 {
        self.erase_size
    }

    fn erase_value(&self) -> Option<u8> {
        Some(ERASE_VALUE)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn device_type(&self) -> &'static str {
        "ram"
    }
}
