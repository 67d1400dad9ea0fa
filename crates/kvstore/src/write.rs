//! Write path: the incremental `set_start` / `set_add_data` / `set_finalize`
//! protocol, plus the single-call `set` and `remove` built on top of it.
//!
//! A record becomes visible in exactly one place: `set_finalize` writes the
//! header (carrying the CRC over header, key, and data) after the key and
//! value bytes are already on the device, syncs, and read-verifies the whole
//! record before touching the RAM index. Everything before that point is a
//! torn write the next replay ignores.

use blockdev::{align_up, BlockDevice};
use crc32fast::Hasher as Crc32;
use tracing::warn;

use crate::read::Located;
use crate::record::{self, CreateFlags, Header, FLAG_TOMBSTONE, HEADER_SIZE};
use crate::{
    IncState, KvStore, Result, SetHandle, StoreError, KEY_FORBIDDEN_CHARS, MASTER_KEY,
    MAX_KEY_SIZE,
};

impl<D: BlockDevice> KvStore<D> {
    /// Stores `value` under `key` in one call.
    pub fn set(&mut self, key: &str, value: &[u8], flags: CreateFlags) -> Result<()> {
        let handle = self.set_start(key, value.len(), flags)?;
        self.set_add_data(&handle, value)?;
        self.set_finalize(handle)
    }

    /// Logically deletes `key` by appending a tombstone record. The key's
    /// bytes stay in the log until the next garbage collection.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the key does not exist;
    /// [`StoreError::WriteProtected`] when it was created write-once.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        let handle = self.start_record(key, 0, FLAG_TOMBSTONE)?;
        self.set_finalize(handle)
    }

    /// Begins an incremental write of `data_len` value bytes under `key`.
    ///
    /// The key bytes go to the device immediately; value bytes follow via
    /// [`set_add_data`](Self::set_add_data). At most one incremental write
    /// may be in flight per store.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFinalized`] when another incremental write is open;
    /// [`StoreError::MediaFull`] when the record does not fit even after
    /// garbage collection; [`StoreError::WriteProtected`] when the key was
    /// created write-once.
    pub fn set_start(
        &mut self,
        key: &str,
        data_len: usize,
        flags: CreateFlags,
    ) -> Result<SetHandle> {
        self.start_record(key, data_len, flags.bits())
    }

    fn start_record(&mut self, key: &str, data_len: usize, flags: u32) -> Result<SetHandle> {
        if self.inc.is_some() {
            return Err(StoreError::NotFinalized);
        }
        let key_bytes = key.as_bytes();
        if key_bytes.is_empty() || key_bytes.len() > MAX_KEY_SIZE || key_bytes == MASTER_KEY {
            return Err(StoreError::InvalidArgument);
        }
        if key.chars().any(|c| KEY_FORBIDDEN_CHARS.contains(&c)) {
            return Err(StoreError::InvalidArgument);
        }
        if data_len > u32::MAX as usize {
            return Err(StoreError::InvalidSize);
        }
        let tombstone = flags & FLAG_TOMBSTONE != 0;
        if tombstone && data_len != 0 {
            return Err(StoreError::InvalidArgument);
        }

        let existing = self.find_record(key_bytes)?;
        if tombstone && existing.is_none() {
            return Err(StoreError::NotFound);
        }
        if let Some((_, rec)) = existing {
            if rec.header.is_write_once() {
                return Err(StoreError::WriteProtected);
            }
        }

        let rec_size = align_up(
            (HEADER_SIZE + key_bytes.len() + data_len) as u64,
            self.prog_size,
        );
        if self.free_space_offset + rec_size > self.area_size {
            self.garbage_collect()?;
            if self.free_space_offset + rec_size > self.area_size {
                return Err(StoreError::MediaFull);
            }
        }

        let base = self.free_space_offset;
        let mut prefix = [0u8; HEADER_SIZE];
        record::encode_prefix(flags, key_bytes.len() as u16, data_len as u32, &mut prefix);
        let mut crc = Crc32::new();
        crc.update(&prefix[..HEADER_SIZE - 4]);
        crc.update(key_bytes);

        let active = self.active;
        if let Err(e) = self.program_area(active, base + HEADER_SIZE as u64, key_bytes) {
            self.scrub_failed_write();
            return Err(e);
        }

        self.inc_tag += 1;
        let tag = self.inc_tag;
        self.inc = Some(IncState {
            tag,
            base,
            key: key_bytes.to_vec(),
            flags,
            data_len: data_len as u32,
            written: 0,
            crc,
        });
        Ok(SetHandle { tag })
    }

    /// Appends value bytes to the in-progress record.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidSize`] when the chunk would exceed the declared
    /// value length, the handle is stale, or no incremental write is open.
    /// A device failure invalidates the handle and scrubs the partial
    /// record.
    pub fn set_add_data(&mut self, handle: &SetHandle, chunk: &[u8]) -> Result<()> {
        let offset = match self.inc.as_ref() {
            Some(st) if st.tag == handle.tag => {
                if st.written as usize + chunk.len() > st.data_len as usize {
                    return Err(StoreError::InvalidSize);
                }
                st.base + HEADER_SIZE as u64 + st.key.len() as u64 + u64::from(st.written)
            }
            _ => return Err(StoreError::InvalidSize),
        };

        let active = self.active;
        if let Err(e) = self.program_area(active, offset, chunk) {
            self.inc = None;
            self.scrub_failed_write();
            return Err(e);
        }
        if let Some(st) = self.inc.as_mut() {
            st.crc.update(chunk);
            st.written += chunk.len() as u32;
        }
        Ok(())
    }

    /// Completes the in-progress record: writes the header with the final
    /// CRC, syncs, read-verifies that the bytes actually landed, then
    /// publishes the key in the RAM index.
    ///
    /// Success and failure both consume the handle. Any failure scrubs the
    /// partial record out of the log with a garbage-collection pass so the
    /// store stays recoverable.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidSize`] when fewer bytes than declared were
    /// written, or the handle is stale; [`StoreError::CorruptData`] when
    /// the read-back does not match what was written.
    pub fn set_finalize(&mut self, handle: SetHandle) -> Result<()> {
        let st = match self.inc.take() {
            Some(st) if st.tag == handle.tag => st,
            other => {
                // a stale handle must not kill a live incremental write
                self.inc = other;
                return Err(StoreError::InvalidSize);
            }
        };

        if st.written != st.data_len {
            self.scrub_failed_write();
            return Err(StoreError::InvalidSize);
        }

        let header = Header {
            flags: st.flags,
            key_len: st.key.len() as u16,
            data_len: st.data_len,
            crc: st.crc.finalize(),
        };
        if let Err(e) = self.commit_record(st.base, header) {
            self.scrub_failed_write();
            return Err(e);
        }
        self.publish_record(st.base, header, &st.key)
    }

    /// Header write, sync, and read-back verification.
    fn commit_record(&mut self, base: u64, header: Header) -> Result<()> {
        let mut raw = [0u8; HEADER_SIZE];
        header.encode(&mut raw);
        let active = self.active;
        self.program_area(active, base, &raw)?;
        self.dev.sync()?;
        // flash programs can fail without a device-level error; trust only
        // what reads back
        if !self.check_record(active, Located { base, header })? {
            return Err(StoreError::CorruptData);
        }
        Ok(())
    }

    /// Updates the RAM index for a just-committed record and advances the
    /// free-space watermark past it.
    fn publish_record(&mut self, base: u64, header: Header, key: &[u8]) -> Result<()> {
        // the pre-write lookup may predate a garbage collection; redo it
        let existing = self.find_record(key)?.map(|(pos, _)| pos);
        if header.is_tombstone() {
            if let Some(pos) = existing {
                self.index.remove_at(pos);
                self.cursor_removed(pos);
            }
        } else if let Some(pos) = existing {
            self.index.set_offset(pos, base as u32);
        } else {
            let pos = self.index.insert(record::key_hash(key), base as u32);
            self.cursor_inserted(pos);
        }
        self.free_space_offset = base + header.total_size(self.prog_size);
        Ok(())
    }

    /// After a failed or abandoned append, partial bytes sit past
    /// `free_space_offset` where the next append would have to program over
    /// them. A collection pass moves the live set onto the freshly erased
    /// standby area and leaves the partial record behind.
    pub(crate) fn scrub_failed_write(&mut self) {
        if self.in_gc {
            // a failed master-record write is handled by the collection
            // that issued it
            return;
        }
        if let Err(e) = self.garbage_collect() {
            warn!(error = %e, "failed to scrub partial record");
        }
    }
}
