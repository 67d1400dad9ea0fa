//! Write-once reserved payload at the start of each area.
//!
//! The payload (typically a device root key) is written identically into
//! both areas so it survives an area swap and either copy can serve it back
//! during recovery. Layout, program-unit aligned as a whole:
//!
//! ```text
//! [payload slot: RESERVED_DATA_SIZE bytes][data_size: u16][pad: u16][crc32: u32]
//! ```

use blockdev::BlockDevice;
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

use crate::{KvStore, Result, StoreError, RESERVED_DATA_SIZE};

pub(crate) const TRAILER_SIZE: usize = 8;

fn encode_trailer(data: &[u8]) -> [u8; TRAILER_SIZE] {
    let mut trailer = [0u8; TRAILER_SIZE];
    LittleEndian::write_u16(&mut trailer[0..2], data.len() as u16);
    let mut hasher = Crc32::new();
    hasher.update(data);
    LittleEndian::write_u32(&mut trailer[4..8], hasher.finalize());
    trailer
}

impl<D: BlockDevice> KvStore<D> {
    /// Stores the reserved payload, identically in both areas. May succeed
    /// exactly once per store lifetime.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteProtected`] when a payload was already written
    /// (in this run or any earlier one); [`StoreError::InvalidSize`] when
    /// `data` is empty or exceeds [`RESERVED_DATA_SIZE`].
    pub fn reserved_data_set(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > RESERVED_DATA_SIZE {
            return Err(StoreError::InvalidSize);
        }
        if self.read_reserved(0)?.is_some() || self.read_reserved(1)?.is_some() {
            return Err(StoreError::WriteProtected);
        }
        for area in 0..2 {
            self.write_reserved_into(area, data)?;
        }
        self.dev.sync().map_err(StoreError::from)
    }

    /// Reads the reserved payload into `buf` from whichever area's trailer
    /// validates. Returns the byte count copied,
    /// `min(buf.len(), payload_len)`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no valid payload exists in either area.
    pub fn reserved_data_get(&mut self, buf: &mut [u8]) -> Result<usize> {
        for area in [self.active, 1 - self.active] {
            if let Some(data) = self.read_reserved(area)? {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                return Ok(n);
            }
        }
        Err(StoreError::NotFound)
    }

    /// Decodes one area's reserved payload; `None` when its trailer does
    /// not validate.
    pub(crate) fn read_reserved(&mut self, area: usize) -> Result<Option<Vec<u8>>> {
        let mut trailer = [0u8; TRAILER_SIZE];
        self.read_area(area, RESERVED_DATA_SIZE as u64, &mut trailer)?;
        let size = LittleEndian::read_u16(&trailer[0..2]) as usize;
        let crc = LittleEndian::read_u32(&trailer[4..8]);
        if size == 0 || size > RESERVED_DATA_SIZE {
            return Ok(None);
        }
        let mut data = vec![0u8; size];
        self.read_area(area, 0, &mut data)?;
        let mut hasher = Crc32::new();
        hasher.update(&data);
        if hasher.finalize() != crc {
            return Ok(None);
        }
        Ok(Some(data))
    }

    /// Writes payload plus trailer into one area's reserved region. The
    /// region must be freshly erased.
    pub(crate) fn write_reserved_into(&mut self, area: usize, data: &[u8]) -> Result<()> {
        let trailer = encode_trailer(data);
        self.program_area(area, 0, data)?;
        self.program_area(area, RESERVED_DATA_SIZE as u64, &trailer)?;
        Ok(())
    }
}
