//! Garbage collection: copy the live set into the standby area and swap.

use blockdev::BlockDevice;
use crc32fast::Hasher as Crc32;
use tracing::debug;

use crate::read::Located;
use crate::record::{self, Header, HEADER_SIZE};
use crate::{KvStore, Result, StoreError, MASTER_KEY};

impl<D: BlockDevice> KvStore<D> {
    /// Reclaims the space held by superseded and tombstoned records.
    ///
    /// The standby area is erased, the reserved payload (if any) and every
    /// indexed record are copied over in index order, and a fresh master
    /// record with the next version commits the swap. Power loss anywhere
    /// before that final write leaves the old area authoritative; the index
    /// is only repointed after it.
    pub(crate) fn garbage_collect(&mut self) -> Result<()> {
        if self.in_gc {
            return Ok(());
        }
        self.in_gc = true;
        let res = self.collect_into_standby();
        self.in_gc = false;
        res
    }

    fn collect_into_standby(&mut self) -> Result<()> {
        let standby = 1 - self.active;
        debug!(
            from = self.active,
            to = standby,
            live = self.index.len(),
            "garbage collection"
        );

        // capture the reserved payload before the erase can destroy the
        // last valid copy of it
        let reserved = match self.read_reserved(self.active)? {
            Some(data) => Some(data),
            None => self.read_reserved(standby)?,
        };

        let standby_addr = self.area_addr(standby, 0);
        self.dev.erase(standby_addr, self.area_size)?;
        if let Some(data) = reserved {
            self.write_reserved_into(standby, &data)?;
        }

        let mut new_offsets = Vec::with_capacity(self.index.len());
        let mut write_offset = self.log_start;
        for pos in 0..self.index.len() {
            let entry = self.index.get(pos).ok_or(StoreError::CorruptData)?;
            let active = self.active;
            let Some(rec) = self.read_header(active, u64::from(entry.offset))? else {
                return Err(StoreError::CorruptData);
            };
            let raw_len =
                HEADER_SIZE as u64 + u64::from(rec.header.key_len) + u64::from(rec.header.data_len);
            self.copy_bytes(active, rec.base, standby, write_offset, raw_len)?;
            new_offsets.push(write_offset as u32);
            write_offset += rec.header.total_size(self.prog_size);
        }

        let version = self.active_version.wrapping_add(1);
        self.write_master_record(standby, version)?;

        // the standby master record is durable: the swap is committed
        self.active = standby;
        self.active_version = version;
        self.free_space_offset = write_offset;
        for (pos, offset) in new_offsets.into_iter().enumerate() {
            self.index.set_offset(pos, offset);
        }
        debug!(area = self.active, version, "garbage collection complete");
        Ok(())
    }

    /// Raw byte copy between areas, one scratch-buffer chunk at a time.
    /// Records are copied verbatim, so their CRCs carry over.
    fn copy_bytes(
        &mut self,
        src_area: usize,
        src: u64,
        dst_area: usize,
        dst: u64,
        len: u64,
    ) -> Result<()> {
        let mut pos = 0u64;
        while pos < len {
            let chunk = (self.work_buf.len() as u64).min(len - pos) as usize;
            let src_addr = self.area_addr(src_area, src + pos);
            let dst_addr = self.area_addr(dst_area, dst + pos);
            self.dev.read(&mut self.work_buf[..chunk], src_addr)?;
            self.dev.program(&self.work_buf[..chunk], dst_addr)?;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// Writes a complete record in one shot and read-verifies it. Master
    /// records and formatting use this; user appends go through the
    /// incremental path in `write.rs`.
    pub(crate) fn write_record_at(
        &mut self,
        area: usize,
        offset: u64,
        key: &[u8],
        data: &[u8],
        flags: u32,
    ) -> Result<()> {
        let mut prefix = [0u8; HEADER_SIZE];
        record::encode_prefix(flags, key.len() as u16, data.len() as u32, &mut prefix);
        let mut hasher = Crc32::new();
        hasher.update(&prefix[..HEADER_SIZE - 4]);
        hasher.update(key);
        hasher.update(data);
        let header = Header {
            flags,
            key_len: key.len() as u16,
            data_len: data.len() as u32,
            crc: hasher.finalize(),
        };

        // body first, header last: the record only decodes once complete
        self.program_area(area, offset + HEADER_SIZE as u64, key)?;
        if !data.is_empty() {
            self.program_area(area, offset + (HEADER_SIZE + key.len()) as u64, data)?;
        }
        let mut raw = [0u8; HEADER_SIZE];
        header.encode(&mut raw);
        self.program_area(area, offset, &raw)?;
        self.dev.sync()?;
        if !self.check_record(area, Located { base: offset, header })? {
            return Err(StoreError::CorruptData);
        }
        Ok(())
    }

    /// Writes the master record for `area` with the given version.
    pub(crate) fn write_master_record(&mut self, area: usize, version: u16) -> Result<()> {
        let mut data = [0u8; crate::init::MASTER_DATA_SIZE];
        data[0..2].copy_from_slice(&version.to_le_bytes());
        data[2..4].copy_from_slice(&record::FORMAT_REVISION.to_le_bytes());
        let offset = self.master_offset;
        self.write_record_at(area, offset, MASTER_KEY, &data, 0)
    }
}
