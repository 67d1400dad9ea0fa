//! On-device record format.
//!
//! Every entry in the append log is framed the same way:
//!
//! ```text
//! [magic: u32 "CNDR"][header_size: u16][revision: u16][flags: u32]
//! [key_len: u16][reserved: u16][data_len: u32][crc32: u32]
//! [key bytes ...][value bytes ...]
//! ```
//!
//! All integers are little-endian. The CRC covers the header minus the CRC
//! field itself, then the key, then the value. The whole record is padded to
//! the device program size; padding bytes stay in the erased state.

use bitflags::bitflags;
use blockdev::align_up;
use byteorder::{ByteOrder, LittleEndian};

pub(crate) const MAGIC: u32 = u32::from_le_bytes(*b"CNDR");
pub(crate) const HEADER_SIZE: usize = 24;
pub(crate) const FORMAT_REVISION: u16 = 1;

/// Flag bit marking a record as a delete tombstone. Internal: set by
/// `remove`, never through [`CreateFlags`].
pub(crate) const FLAG_TOMBSTONE: u32 = 1 << 31;

bitflags! {
    /// Flags a key can be created with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// The key may be written exactly once; later writes and removes
        /// fail with a write-protection error.
        const WRITE_ONCE = 1 << 0;
        /// Reserved for encrypted-at-rest storage; currently inert.
        const CONFIDENTIAL = 1 << 1;
        /// Reserved for rollback detection; currently inert.
        const REPLAY_PROTECT = 1 << 2;
    }
}

/// Parsed record header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub flags: u32,
    pub key_len: u16,
    pub data_len: u32,
    pub crc: u32,
}

impl Header {
    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    pub fn is_write_once(&self) -> bool {
        self.flags & CreateFlags::WRITE_ONCE.bits() != 0
    }

    /// Offset of the first value byte, relative to the record base.
    pub fn data_offset(&self) -> u64 {
        (HEADER_SIZE + self.key_len as usize) as u64
    }

    /// Whole on-device footprint, including alignment padding.
    pub fn total_size(&self, prog_size: u64) -> u64 {
        align_up(
            HEADER_SIZE as u64 + u64::from(self.key_len) + u64::from(self.data_len),
            prog_size,
        )
    }

    /// Decodes a header, checking magic, declared size, and revision.
    ///
    /// `None` means no record starts here — erased space or garbage. Whether
    /// the record's body actually matches the CRC is a separate, streaming
    /// check.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        if LittleEndian::read_u32(&buf[0..4]) != MAGIC {
            return None;
        }
        if LittleEndian::read_u16(&buf[4..6]) as usize != HEADER_SIZE {
            return None;
        }
        if LittleEndian::read_u16(&buf[6..8]) != FORMAT_REVISION {
            return None;
        }
        let flags = LittleEndian::read_u32(&buf[8..12]);
        let key_len = LittleEndian::read_u16(&buf[12..14]);
        if key_len == 0 {
            return None;
        }
        let data_len = LittleEndian::read_u32(&buf[16..20]);
        let crc = LittleEndian::read_u32(&buf[20..24]);
        Some(Self {
            flags,
            key_len,
            data_len,
            crc,
        })
    }

    /// Encodes the header with its final CRC filled in.
    pub fn encode(&self, buf: &mut [u8; HEADER_SIZE]) {
        encode_prefix(self.flags, self.key_len, self.data_len, buf);
        LittleEndian::write_u32(&mut buf[20..24], self.crc);
    }
}

/// Fills everything the CRC covers: bytes `0..20` of the header. The CRC
/// field itself is zeroed; [`Header::encode`] overwrites it.
pub(crate) fn encode_prefix(flags: u32, key_len: u16, data_len: u32, buf: &mut [u8; HEADER_SIZE]) {
    LittleEndian::write_u32(&mut buf[0..4], MAGIC);
    LittleEndian::write_u16(&mut buf[4..6], HEADER_SIZE as u16);
    LittleEndian::write_u16(&mut buf[6..8], FORMAT_REVISION);
    LittleEndian::write_u32(&mut buf[8..12], flags);
    LittleEndian::write_u16(&mut buf[12..14], key_len);
    LittleEndian::write_u16(&mut buf[14..16], 0);
    LittleEndian::write_u32(&mut buf[16..20], data_len);
    LittleEndian::write_u32(&mut buf[20..24], 0);
}

/// CRC32 of a key — the sort key of the RAM index.
pub(crate) fn key_hash(key: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.finalize()
}
