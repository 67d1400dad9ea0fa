//! File-backed block device.
//!
//! Backs the contract with an ordinary file for host-side development and
//! integration testing. Geometry is fixed at construction; the file is
//! created (and grown to `size`) on `init`. Erase fills the range with
//! `0xff`, matching what NOR flash reads back as.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{BdError, BlockDevice, Result};

const ERASE_VALUE: u8 = 0xff;

/// Block device persisted in a file on the host filesystem.
pub struct FileBlockDevice {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    read_size: u64,
    program_size: u64,
    erase_size: u64,
}

impl FileBlockDevice {
    /// Creates a descriptor for a file-backed device. No I/O happens until
    /// `init`.
    ///
    /// # Panics
    ///
    /// Panics on incoherent geometry, same rules as
    /// [`RamBlockDevice::new`](crate::RamBlockDevice::new).
    pub fn new<P: AsRef<Path>>(
        path: P,
        size: u64,
        read_size: u64,
        program_size: u64,
        erase_size: u64,
    ) -> Self {
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
            path: path.as_ref().to_path_buf(),
            file: None,
            size,
            read_size,
            program_size,
            erase_size,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(BdError::NotInitialized)
    }
}

impl BlockDevice for FileBlockDevice {
    fn init(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|_| BdError::InitFailed)?;
        let len = file.metadata().map_err(|_| BdError::InitFailed)?.len();
        if len < self.size {
            // grow to capacity; fresh regions read back as zero, which is an
            // unknown-erase-value pattern, so erase before first use
            file.set_len(self.size).map_err(|_| BdError::InitFailed)?;
        }
        self.file = Some(file);
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|_| BdError::DeviceError)?;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()> {
        self.validate_read(addr, buf.len() as u64)?;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(addr)).map_err(|_| BdError::DeviceError)?;
        file.read_exact(buf).map_err(|_| BdError::DeviceError)
    }

    fn program(&mut self, buf: &[u8], addr: u64) -> Result<()> {
        self.validate_program(addr, buf.len() as u64)?;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(addr)).map_err(|_| BdError::DeviceError)?;
        file.write_all(buf).map_err(|_| BdError::DeviceError)?;
        file.flush().map_err(|_| BdError::DeviceError)
    }

    fn erase(&mut self, addr: u64, len: u64) -> Result<()> {
        self.validate_erase(addr, len)?;
        let unit = vec![ERASE_VALUE; self.erase_size as usize];
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(addr)).map_err(|_| BdError::DeviceError)?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(unit.len() as u64) as usize;
            file.write_all(&unit[..n]).map_err(|_| BdError::DeviceError)?;
            remaining -= n as u64;
        }
        file.flush().map_err(|_| BdError::DeviceError)
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
        self.size
    }

    fn device_type(&self) -> &'static str {
        "file"
    }
}
