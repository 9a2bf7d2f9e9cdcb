//! Fixed-size segment file header.
//!
//! ```text
//! | magic "PBDS" (4) | version u16 | flags u16 | entry_count u32 | extra_len u32 |
//! | created_ms i64 | prev_segment_id u64 | extra_crc u32 | header_crc u32 |
//! ```
//!
//! All integers are little endian. `header_crc` covers the 36 bytes before
//! it. `entry_count` is only authoritative once [`HeaderFlags::FINALIZED`]
//! is set; for a quarantined segment it is the readable prefix.

use crate::error::{CoreError, CoreResult};

/// Magic bytes at the start of every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"PBDS";

/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Encoded size of [`SegmentHeader`].
pub const SEGMENT_HEADER_SIZE: usize = 40;

/// Segment header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(u16);

impl HeaderFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The segment was sealed and `entry_count` is valid.
    pub const FINALIZED: Self = Self(0x01);
    /// The segment was quarantined.
    pub const QUARANTINED: Self = Self(0x02);
    /// An extra header blob follows the header.
    pub const HAS_EXTRA: Self = Self(0x04);

    const KNOWN: u16 = 0x07;

    /// Creates flags from the raw value.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Checks whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Decoded segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Header flags.
    pub flags: HeaderFlags,
    /// Entry count (see module docs).
    pub entry_count: u32,
    /// Length of the extra header blob.
    pub extra_len: u32,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_ms: i64,
    /// Id of the segment that preceded this one when it was created, or 0.
    pub prev_id: u64,
    /// CRC32 of the extra header blob.
    pub extra_crc: u32,
}

impl SegmentHeader {
    /// Creates the header of a fresh segment.
    #[must_use]
    pub fn new(extra: &[u8], created_ms: i64, prev_id: u64) -> Self {
        let flags = if extra.is_empty() {
            HeaderFlags::NONE
        } else {
            HeaderFlags::HAS_EXTRA
        };
        Self {
            flags,
            entry_count: 0,
            extra_len: extra.len() as u32,
            created_ms,
            prev_id,
            extra_crc: crc32fast::hash(extra),
        }
    }

    /// Returns true if the segment was sealed.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.flags.contains(HeaderFlags::FINALIZED)
    }

    /// Returns true if the segment was quarantined.
    #[must_use]
    pub const fn is_quarantined(&self) -> bool {
        self.flags.contains(HeaderFlags::QUARANTINED)
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..12].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.extra_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.created_ms.to_le_bytes());
        buf[24..32].copy_from_slice(&self.prev_id.to_le_bytes());
        buf[32..36].copy_from_slice(&self.extra_crc.to_le_bytes());
        let crc = crc32fast::hash(&buf[..36]);
        buf[36..40].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a header.
    ///
    /// # Errors
    ///
    /// - `SegmentCorruption` for a short buffer, bad magic or unknown flags
    /// - `ChecksumMismatch` if the header CRC does not match
    /// - `InvalidFormat` for a version this build cannot read
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < SEGMENT_HEADER_SIZE {
            return Err(CoreError::segment_corruption(format!(
                "segment header too short: {} bytes",
                data.len()
            )));
        }

        if data[0..4] != SEGMENT_MAGIC {
            return Err(CoreError::segment_corruption("invalid segment magic"));
        }

        let stored_crc = read_u32(data, 36);
        let computed_crc = crc32fast::hash(&data[..36]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SEGMENT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported segment version {version}, expected {SEGMENT_VERSION}"
            )));
        }

        let flags = u16::from_le_bytes([data[6], data[7]]);
        if flags & !HeaderFlags::KNOWN != 0 {
            return Err(CoreError::segment_corruption(format!(
                "unknown segment flags {flags:#06x}"
            )));
        }

        Ok(Self {
            flags: HeaderFlags::from_bits(flags),
            entry_count: read_u32(data, 8),
            extra_len: read_u32(data, 12),
            created_ms: i64::from_le_bytes(read_8(data, 16)),
            prev_id: u64::from_le_bytes(read_8(data, 24)),
            extra_crc: read_u32(data, 32),
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_8(data: &[u8], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&data[at..at + 8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut header = SegmentHeader::new(b"schema-v2", 1_700_000_000_000, 42);
        header.flags = header.flags.with(HeaderFlags::FINALIZED);
        header.entry_count = 17;

        let decoded = SegmentHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_finalized());
        assert!(!decoded.is_quarantined());
        assert!(decoded.flags.contains(HeaderFlags::HAS_EXTRA));
        assert_eq!(decoded.extra_len, 9);
    }

    #[test]
    fn empty_extra_has_no_flag() {
        let header = SegmentHeader::new(b"", 0, 0);
        assert_eq!(header.flags, HeaderFlags::NONE);
    }

    #[test]
    fn short_header_is_corruption() {
        let err = SegmentHeader::decode(&[0u8; 12]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = SegmentHeader::new(b"", 0, 0).encode();
        bytes[0] = b'X';
        assert!(SegmentHeader::decode(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let mut bytes = SegmentHeader::new(b"", 5, 0).encode();
        bytes[10] ^= 0x40;
        assert!(matches!(
            SegmentHeader::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn future_version_is_format_error() {
        let mut bytes = SegmentHeader::new(b"", 5, 0).encode();
        bytes[4..6].copy_from_slice(&9u16.to_le_bytes());
        let crc = crc32fast::hash(&bytes[..36]);
        bytes[36..40].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            SegmentHeader::decode(&bytes),
            Err(CoreError::InvalidFormat { .. })
        ));
    }
}
