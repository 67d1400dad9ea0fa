//! Startup: area geometry, master-record arbitration, and log replay.

use blockdev::BlockDevice;
use bufdev::BufferedBlockDevice;
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::record;
use crate::{KvStore, Result, StoreError, MASTER_KEY};

/// Value payload of a master record: `{version: u16, revision: u16,
/// reserved: u32}`.
pub(crate) const MASTER_DATA_SIZE: usize = 8;

/// Splits the device into two equal areas tiled from whole erase units.
///
/// Erase units (which may vary by address) are accumulated greedily into
/// area 0 while staying at or below half the capacity; the next run of units
/// must then tile exactly the same size for area 1. Layouts that cannot
/// produce the symmetry are a capacity error, not a guess.
pub(crate) fn compute_area_size<D: BlockDevice>(dev: &BufferedBlockDevice<D>) -> Result<u64> {
    let size = dev.size();
    let half = size / 2;

    let mut area0 = 0u64;
    loop {
        let unit = dev.erase_size(area0);
        if unit == 0 {
            return Err(StoreError::InitFailed);
        }
        if area0 + unit > half {
            break;
        }
        area0 += unit;
    }
    if area0 == 0 {
        return Err(StoreError::InitFailed);
    }

    let mut pos = area0;
    while pos < area0 * 2 {
        let unit = dev.erase_size(pos);
        if unit == 0 {
            return Err(StoreError::InitFailed);
        }
        pos += unit;
    }
    if pos != area0 * 2 {
        return Err(StoreError::InitFailed);
    }
    Ok(area0)
}

/// Area-version arbitration: higher wins, except a wrapped-around zero
/// beats any nonzero version.
pub(crate) fn master_wins(a: u16, b: u16) -> bool {
    if a == 0 || b == 0 {
        return a == 0;
    }
    a >= b
}

impl<D: BlockDevice> KvStore<D> {
    /// Recovers the store's state from the device: picks the active area by
    /// master-record version, replays its log into the RAM index, and scrubs
    /// a dirty tail if one is found.
    pub(crate) fn init_state(&mut self) -> Result<()> {
        let v0 = self.read_master_version(0)?;
        let v1 = self.read_master_version(1)?;
        let (active, version) = match (v0, v1) {
            (None, None) => {
                debug!("no valid master record; formatting");
                return self.format();
            }
            (Some(v), None) => (0, v),
            (None, Some(v)) => (1, v),
            (Some(a), Some(b)) => {
                if master_wins(a, b) {
                    (0, a)
                } else {
                    (1, b)
                }
            }
        };
        self.active = active;
        self.active_version = version;
        debug!(area = active, version, "selected active area");

        self.replay_log()?;
        self.scrub_dirty_tail()
    }

    /// Empty-store bring-up: erase area 0, make it active with version 1.
    fn format(&mut self) -> Result<()> {
        self.dev.erase(0, self.area_size)?;
        self.active = 0;
        self.active_version = 1;
        self.free_space_offset = self.log_start;
        self.write_master_record(0, 1)
    }

    /// Reads and validates one area's master record; `None` when the area
    /// carries no authoritative state.
    fn read_master_version(&mut self, area: usize) -> Result<Option<u16>> {
        let offset = self.master_offset;
        let Some(rec) = self.read_header(area, offset)? else {
            return Ok(None);
        };
        if rec.header.key_len as usize != MASTER_KEY.len()
            || rec.header.data_len as usize != MASTER_DATA_SIZE
            || rec.header.is_tombstone()
        {
            return Ok(None);
        }
        if !self.check_record(area, rec)? {
            return Ok(None);
        }
        if self.read_key(area, rec)? != MASTER_KEY {
            return Ok(None);
        }
        let mut data = [0u8; MASTER_DATA_SIZE];
        self.read_area(area, rec.base + rec.header.data_offset(), &mut data)?;
        Ok(Some(LittleEndian::read_u16(&data[0..2])))
    }

    /// Rebuilds the RAM index from the active area's log.
    ///
    /// Stops at the first offset where no CRC-valid record starts:
    /// everything beyond is treated as never written, which is what makes a
    /// torn tail survivable.
    fn replay_log(&mut self) -> Result<()> {
        let mut offset = self.log_start;
        loop {
            let active = self.active;
            let Some(rec) = self.read_header(active, offset)? else {
                break;
            };
            if !self.check_record(active, rec)? {
                warn!(offset, "log replay stopped at corrupt record");
                break;
            }
            let key = self.read_key(active, rec)?;
            if key != MASTER_KEY {
                let existing = self.find_record(&key)?.map(|(pos, _)| pos);
                if rec.header.is_tombstone() {
                    if let Some(pos) = existing {
                        self.index.remove_at(pos);
                    }
                } else if let Some(pos) = existing {
                    self.index.set_offset(pos, offset as u32);
                } else {
                    self.index.insert(record::key_hash(&key), offset as u32);
                }
            }
            offset += rec.header.total_size(self.prog_size);
        }
        self.free_space_offset = offset;
        debug!(
            keys = self.index.len(),
            free_space_offset = offset,
            "log replay complete"
        );
        Ok(())
    }

    /// If anything past the end of the valid log is not in the erased state,
    /// a collection pass relocates the live set onto a freshly erased area.
    /// Stale bytes left by a torn write could otherwise be programmed over
    /// by the next append, or be mistaken for a record by a later replay.
    fn scrub_dirty_tail(&mut self) -> Result<()> {
        let Some(erase_value) = self.dev.erase_value() else {
            // without a known erase value there is nothing to compare
            // against; replay's stop point is the best available truth
            return Ok(());
        };
        let end = self.area_size;
        let mut offset = self.free_space_offset;
        let mut dirty = false;
        while offset < end && !dirty {
            let chunk = (self.work_buf.len() as u64).min(end - offset) as usize;
            let addr = self.area_addr(self.active, offset);
            self.dev.read(&mut self.work_buf[..chunk], addr)?;
            dirty = self.work_buf[..chunk].iter().any(|&b| b != erase_value);
            offset += chunk as u64;
        }
        if dirty {
            warn!("free space is not erased; relocating live records");
            self.garbage_collect()?;
        }
        Ok(())
    }
}
