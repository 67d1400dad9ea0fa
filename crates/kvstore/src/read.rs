//! Read path: `get`, `get_at`, `get_info`, and the record-decoding helpers
//! the other modules lean on.

use blockdev::BlockDevice;
use crc32fast::Hasher as Crc32;

use crate::record::{self, Header, HEADER_SIZE};
use crate::{CreateFlags, Info, KvStore, Result, StoreError};

/// A record located in an area: its base offset plus the parsed header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Located {
    pub base: u64,
    pub header: Header,
}

impl<D: BlockDevice> KvStore<D> {
    /// Reads the whole value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the key does not exist;
    /// [`StoreError::CorruptData`] when the record fails its CRC.
    pub fn get(&mut self, key: &str) -> Result<Vec<u8>> {
        let (_, rec) = self
            .find_record(key.as_bytes())?
            .ok_or(StoreError::NotFound)?;
        let mut out = vec![0u8; rec.header.data_len as usize];
        let active = self.active;
        self.read_value(active, rec, 0, &mut out)?;
        Ok(out)
    }

    /// Reads up to `buf.len()` value bytes starting `offset` bytes into the
    /// value, without materializing the rest. Returns the count copied,
    /// `min(buf.len(), value_len - offset)`.
    ///
    /// The whole record is still CRC-validated while streaming past the
    /// unrequested bytes.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidSize`] when `offset` lies beyond the value.
    pub fn get_at(&mut self, key: &str, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let (_, rec) = self
            .find_record(key.as_bytes())?
            .ok_or(StoreError::NotFound)?;
        let active = self.active;
        self.read_value(active, rec, offset, buf)
    }

    /// Returns the value size and creation flags for `key`.
    pub fn get_info(&mut self, key: &str) -> Result<Info> {
        let (_, rec) = self
            .find_record(key.as_bytes())?
            .ok_or(StoreError::NotFound)?;
        let active = self.active;
        if !self.check_record(active, rec)? {
            return Err(StoreError::CorruptData);
        }
        Ok(Info {
            size: rec.header.data_len as usize,
            flags: CreateFlags::from_bits_truncate(rec.header.flags),
        })
    }

    // ---- shared record decoding ----

    /// Decodes the header at `offset`. `None` when no valid record starts
    /// there, or when the declared footprint would run past the area end.
    pub(crate) fn read_header(&mut self, area: usize, offset: u64) -> Result<Option<Located>> {
        if offset + HEADER_SIZE as u64 > self.area_size {
            return Ok(None);
        }
        let mut raw = [0u8; HEADER_SIZE];
        self.read_area(area, offset, &mut raw)?;
        let Some(header) = Header::decode(&raw) else {
            return Ok(None);
        };
        let rec = Located {
            base: offset,
            header,
        };
        if rec.base + rec.header.total_size(self.prog_size) > self.area_size {
            return Ok(None);
        }
        Ok(Some(rec))
    }

    /// Streams the record through the scratch buffer recomputing its CRC;
    /// `true` when it matches the header's.
    pub(crate) fn check_record(&mut self, area: usize, rec: Located) -> Result<bool> {
        let mut hasher = Crc32::new();
        let mut prefix = [0u8; HEADER_SIZE];
        record::encode_prefix(
            rec.header.flags,
            rec.header.key_len,
            rec.header.data_len,
            &mut prefix,
        );
        hasher.update(&prefix[..HEADER_SIZE - 4]);
        let body_len = u64::from(rec.header.key_len) + u64::from(rec.header.data_len);
        self.stream_crc(area, rec.base + HEADER_SIZE as u64, body_len, &mut hasher)?;
        Ok(hasher.finalize() == rec.header.crc)
    }

    /// Reads the record's key bytes.
    pub(crate) fn read_key(&mut self, area: usize, rec: Located) -> Result<Vec<u8>> {
        let mut key = vec![0u8; rec.header.key_len as usize];
        self.read_area(area, rec.base + HEADER_SIZE as u64, &mut key)?;
        Ok(key)
    }

    /// Locates `key` in the active area: binary partition to its hash run in
    /// the RAM index, then an on-device key compare per candidate.
    pub(crate) fn find_record(&mut self, key: &[u8]) -> Result<Option<(usize, Located)>> {
        let hash = record::key_hash(key);
        let mut pos = self.index.lower_bound(hash);
        while let Some(entry) = self.index.get(pos) {
            if entry.hash != hash {
                break;
            }
            let active = self.active;
            let Some(rec) = self.read_header(active, u64::from(entry.offset))? else {
                // the index never points at a non-record
                return Err(StoreError::CorruptData);
            };
            if rec.header.key_len as usize == key.len() && self.read_key(active, rec)? == key {
                return Ok(Some((pos, rec)));
            }
            pos += 1;
        }
        Ok(None)
    }

    /// Copies value bytes `[offset, offset + n)` into `out` while streaming
    /// the whole record past the CRC. `n = min(out.len(), data_len - offset)`
    /// is returned.
    pub(crate) fn read_value(
        &mut self,
        area: usize,
        rec: Located,
        offset: usize,
        out: &mut [u8],
    ) -> Result<usize> {
        let data_len = rec.header.data_len as usize;
        if offset > data_len {
            return Err(StoreError::InvalidSize);
        }
        let n = out.len().min(data_len - offset);

        let mut hasher = Crc32::new();
        let mut prefix = [0u8; HEADER_SIZE];
        record::encode_prefix(
            rec.header.flags,
            rec.header.key_len,
            rec.header.data_len,
            &mut prefix,
        );
        hasher.update(&prefix[..HEADER_SIZE - 4]);

        // key and data in one pass; the requested window is copied out as it
        // streams by
        let body = rec.base + HEADER_SIZE as u64;
        let body_len = u64::from(rec.header.key_len) + rec.header.data_len as u64;
        let win_start = u64::from(rec.header.key_len) + offset as u64;
        let win_end = win_start + n as u64;
        let mut pos = 0u64;
        while pos < body_len {
            let chunk = (self.work_buf.len() as u64).min(body_len - pos) as usize;
            let addr = self.area_addr(area, body + pos);
            self.dev.read(&mut self.work_buf[..chunk], addr)?;
            hasher.update(&self.work_buf[..chunk]);

            let lo = pos.max(win_start);
            let hi = (pos + chunk as u64).min(win_end);
            if lo < hi {
                let src = (lo - pos) as usize;
                let dst = (lo - win_start) as usize;
                let len = (hi - lo) as usize;
                out[dst..dst + len].copy_from_slice(&self.work_buf[src..src + len]);
            }
            pos += chunk as u64;
        }
        if hasher.finalize() != rec.header.crc {
            return Err(StoreError::CorruptData);
        }
        Ok(n)
    }

    /// Feeds `len` device bytes starting at `offset` into `hasher`, one
    /// scratch-buffer chunk at a time.
    pub(crate) fn stream_crc(
        &mut self,
        area: usize,
        offset: u64,
        len: u64,
        hasher: &mut Crc32,
    ) -> Result<()> {
        let mut pos = 0u64;
        while pos < len {
            let chunk = (self.work_buf.len() as u64).min(len - pos) as usize;
            let addr = self.area_addr(area, offset + pos);
            self.dev.read(&mut self.work_buf[..chunk], addr)?;
            hasher.update(&self.work_buf[..chunk]);
            pos += chunk as u64;
        }
        Ok(())
    }
}
