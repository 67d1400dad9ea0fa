//! # bufdev — write-coalescing buffered block device
//!
//! [`BufferedBlockDevice`] wraps any [`BlockDevice`] and presents
//! `read_size = program_size = 1`, so callers can read and write arbitrary
//! byte ranges while the wrapped device only ever sees aligned, unit-sized
//! operations.
//!
//! ## How writes coalesce
//!
//! ```text
//! caller            program("ab", 510)   program("cd", 512)
//!                          |                    |
//!                          v                    v
//! cache line   [ unit @ 0 ............ab]  [cd............ unit @ 512 ]
//!                          |  (unit boundary crossed: flush)
//!                          v
//! wrapped dev   program(512 bytes, 0)
//! ```
//!
//! One cache line of `program_size` bytes holds the single in-flight unit.
//! Writing into a different unit flushes the previous one first; a write
//! whose tail reaches the unit boundary is flushed immediately. Partial
//! writes into a unit that has never been cached first read the unit's
//! current content back from the device (read-before-merge) so unrelated
//! bytes survive.
//!
//! Reads that overlap the pending unit are served from the cache, never the
//! device — unflushed writes stay visible. Everything else goes through an
//! alignment shim that uses a one-unit scratch buffer for unaligned head and
//! tail segments.
//!
//! ## Failure semantics
//!
//! A failed flush fails the call that triggered it and leaves the cache
//! intact, so retrying the same write can still complete. `deinit` reports a
//! flush failure as [`BdError::SyncFailed`], distinct from a wrapped-device
//! failure, so callers know cached writes may be lost.

use blockdev::{align_down, BdError, BlockDevice, Result};

/// Byte-granular adapter over a block device with native program/erase units.
pub struct BufferedBlockDevice<D: BlockDevice> {
    bd: D,
    /// One program unit of pending write data; valid only when `cache_valid`.
    cache: Vec<u8>,
    /// Unit-aligned address the cache line represents.
    cache_addr: u64,
    cache_valid: bool,
    /// Scratch buffer for unaligned head/tail reads, one read unit long.
    read_buf: Vec<u8>,
    prog_size: u64,
    read_size: u64,
    initialized: bool,
}

impl<D: BlockDevice> BufferedBlockDevice<D> {
    /// Wraps a device. No I/O happens until `init`.
    pub fn new(bd: D) -> Self {
        Self {
            bd,
            cache: Vec::new(),
            cache_addr: 0,
            cache_valid: false,
            read_buf: Vec::new(),
            prog_size: 0,
            read_size: 0,
            initialized: false,
        }
    }

    /// The wrapped device.
    #[must_use]
    pub fn inner(&self) -> &D {
        &self.bd
    }

    /// Mutable access to the wrapped device.
    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.bd
    }

    /// Flushes the pending cache unit, if any, to the wrapped device.
    pub fn sync(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(BdError::NotInitialized);
        }
        self.flush_cache()
    }

    fn flush_cache(&mut self) -> Result<()> {
        if self.cache_valid {
            self.bd.program(&self.cache, self.cache_addr)?;
            self.cache_valid = false;
        }
        Ok(())
    }

    /// Reads an arbitrary byte range from the wrapped device, bridging its
    /// read-unit alignment with the scratch buffer.
    fn read_through(&mut self, buf: &mut [u8], mut addr: u64) -> Result<()> {
        let rs = self.read_size as usize;
        let mut pos = 0usize;

        let head = (addr % self.read_size) as usize;
        if head != 0 {
            self.bd.read(&mut self.read_buf, addr - head as u64)?;
            let n = (rs - head).min(buf.len());
            buf[..n].copy_from_slice(&self.read_buf[head..head + n]);
            pos += n;
            addr += n as u64;
        }

        let mid = (buf.len() - pos) / rs * rs;
        if mid > 0 {
            self.bd.read(&mut buf[pos..pos + mid], addr)?;
            pos += mid;
            addr += mid as u64;
        }

        if pos < buf.len() {
            self.bd.read(&mut self.read_buf, addr)?;
            let n = buf.len() - pos;
            buf[pos..].copy_from_slice(&self.read_buf[..n]);
        }
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for BufferedBlockDevice<D> {
    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.bd.init()?;
        let rs = self.bd.read_size();
        let ps = self.bd.program_size();
        if rs == 0 || ps == 0 || ps % rs != 0 {
            return Err(BdError::InitFailed);
        }
        self.read_size = rs;
        self.prog_size = ps;
        self.cache = vec![0u8; ps as usize];
        self.read_buf = vec![0u8; rs as usize];
        self.cache_valid = false;
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.flush_cache().map_err(|_| BdError::SyncFailed)?;
        self.bd.deinit()?;
        self.cache = Vec::new();
        self.read_buf = Vec::new();
        self.initialized = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()> {
        if !self.initialized {
            return Err(BdError::NotInitialized);
        }
        self.validate_read(addr, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len() as u64;

        if self.cache_valid {
            let cs = self.cache_addr;
            let ce = cs + self.prog_size;
            if addr < ce && addr + len > cs {
                // the range touches the pending unit: serve it in segments
                // so unflushed writes stay visible
                let ov_start = addr.max(cs);
                let ov_end = (addr + len).min(ce);
                let dst_s = (ov_start - addr) as usize;
                let dst_e = (ov_end - addr) as usize;
                let src_s = (ov_start - cs) as usize;
                let src_e = (ov_end - cs) as usize;

                if addr < cs {
                    self.read_through(&mut buf[..dst_s], addr)?;
                }
                buf[dst_s..dst_e].copy_from_slice(&self.cache[src_s..src_e]);
                if addr + len > ce {
                    self.read_through(&mut buf[dst_e..], ce)?;
                }
                return Ok(());
            }
        }
        self.read_through(buf, addr)
    }

    fn program(&mut self, buf: &[u8], addr: u64) -> Result<()> {
        if !self.initialized {
            return Err(BdError::NotInitialized);
        }
        self.validate_program(addr, buf.len() as u64)?;
        let ps = self.prog_size;
        let mut pos = 0usize;
        let mut addr = addr;

        while pos < buf.len() {
            let unit = align_down(addr, ps);
            if self.cache_valid && self.cache_addr != unit {
                self.flush_cache()?;
            }

            let in_unit = (addr - unit) as usize;
            let remaining = buf.len() - pos;

            if !self.cache_valid && in_unit == 0 && remaining >= ps as usize {
                // whole aligned units: bypass the cache entirely
                let n = remaining / ps as usize * ps as usize;
                self.bd.program(&buf[pos..pos + n], addr)?;
                pos += n;
                addr += n as u64;
                continue;
            }

            if !self.cache_valid {
                // merge-read so untouched bytes in the unit survive
                self.bd.read(&mut self.cache, unit)?;
                self.cache_addr = unit;
                self.cache_valid = true;
            }

            let n = remaining.min(ps as usize - in_unit);
            self.cache[in_unit..in_unit + n].copy_from_slice(&buf[pos..pos + n]);
            pos += n;
            addr += n as u64;

            if in_unit + n == ps as usize {
                // the write completed the unit: flush it now
                self.flush_cache()?;
            }
        }
        Ok(())
    }

    fn erase(&mut self, addr: u64, len: u64) -> Result<()> {
        if !self.initialized {
            return Err(BdError::NotInitialized);
        }
        self.validate_erase(addr, len)?;
        if self.cache_valid
            && self.cache_addr < addr + len
            && self.cache_addr + self.prog_size > addr
        {
            // cached data is stale after the erase; drop it without flushing
            self.cache_valid = false;
        }
        self.bd.erase(addr, len)
    }

    fn read_size(&self) -> u64 {
        1
    }

    fn program_size(&self) -> u64 {
        1
    }

    fn erase_size(&self, addr: u64) -> u64 {
        self.bd.erase_size(addr)
    }

    fn erase_value(&self) -> Option<u8> {
        self.bd.erase_value()
    }

    fn size(&self) -> u64 {
        self.bd.size()
    }

    fn device_type(&self) -> &'static str {
        "buffered"
    }
}

/// Best-effort flush on drop. A failure here is unreportable; callers that
/// need the distinction use `deinit`.
impl<D: BlockDevice> Drop for BufferedBlockDevice<D> {
    fn drop(&mut self) {
        if self.initialized {
            let _ = self.flush_cache();
        }
    }
}
