//! Entry framing.
//!
//! ```text
//! | stored_len i32 | flags u8 | logical_len u32 | start_id i64 | end_id i64 |
//! | timestamp_ms i64 | crc u32 | payload (stored_len bytes) |
//! ```
//!
//! The CRC covers the 33 header bytes before it plus the stored payload.
//! Entries without ids store `-1` in both id fields.

use crate::error::{CoreError, CoreResult};
use crate::types::IdRange;

/// Encoded size of an entry header.
pub const ENTRY_HEADER_SIZE: usize = 37;

/// Stored lengths above this are treated as garbage rather than data.
pub(crate) const MAX_STORED_LEN: u32 = 1 << 30;

const CRC_OFFSET: usize = 33;

/// Entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Payload is LZ4 block-compressed.
    pub const COMPRESSED: Self = Self(0x01);
    /// The entry carries an id range.
    pub const HAS_IDS: Self = Self(0x02);

    const KNOWN: u8 = 0x03;

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Decoded entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Bytes of payload stored on disk.
    pub stored_len: u32,
    /// Entry flags.
    pub flags: EntryFlags,
    /// Payload length after decompression.
    pub logical_len: u32,
    /// Id range, when the deque tracks ids.
    pub ids: Option<IdRange>,
    /// Wall-clock time of the offer, in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Stored CRC32.
    pub crc: u32,
}

impl EntryHeader {
    /// Total encoded size of the entry including its header.
    #[must_use]
    pub const fn frame_len(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64 + self.stored_len as u64
    }

    /// Decodes and sanity-checks a header.
    ///
    /// Returns a description of the problem when the bytes cannot be a
    /// valid header; such a header is never a torn write.
    pub(crate) fn decode(data: &[u8]) -> Result<Self, String> {
        if data.len() < ENTRY_HEADER_SIZE {
            return Err(format!("entry header too short: {} bytes", data.len()));
        }

        let stored_len = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if stored_len < 0 {
            return Err(format!("negative entry length {stored_len}"));
        }
        let stored_len = stored_len as u32;
        if stored_len > MAX_STORED_LEN {
            return Err(format!("entry length {stored_len} exceeds format limit"));
        }

        let flags = data[4];
        if flags & !EntryFlags::KNOWN != 0 {
            return Err(format!("unknown entry flags {flags:#04x}"));
        }
        let flags = EntryFlags(flags);

        let logical_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
        if logical_len > MAX_STORED_LEN {
            return Err(format!("logical length {logical_len} exceeds format limit"));
        }
        if !flags.contains(EntryFlags::COMPRESSED) && logical_len != stored_len {
            return Err(format!(
                "uncompressed entry has logical length {logical_len} but stores {stored_len}"
            ));
        }

        let start_id = i64::from_le_bytes(read_8(data, 9));
        let end_id = i64::from_le_bytes(read_8(data, 17));
        let ids = if flags.contains(EntryFlags::HAS_IDS) {
            Some(IdRange::new(start_id, end_id).map_err(|e| e.to_string())?)
        } else {
            None
        };

        Ok(Self {
            stored_len,
            flags,
            logical_len,
            ids,
            timestamp: i64::from_le_bytes(read_8(data, 25)),
            crc: u32::from_le_bytes([data[33], data[34], data[35], data[36]]),
        })
    }
}

/// An entry ready to be appended.
#[derive(Debug, Clone)]
pub(crate) struct EncodedEntry {
    pub(crate) header: EntryHeader,
    pub(crate) bytes: Vec<u8>,
}

/// Frames a payload, compressing it when asked and when that helps.
pub(crate) fn encode_entry(
    payload: &[u8],
    ids: Option<IdRange>,
    timestamp: i64,
    compress: bool,
) -> EncodedEntry {
    let mut flags = EntryFlags::NONE;
    if ids.is_some() {
        flags = flags.with(EntryFlags::HAS_IDS);
    }

    let compressed = if compress && !payload.is_empty() {
        let block = lz4_flex::block::compress(payload);
        (block.len() < payload.len()).then_some(block)
    } else {
        None
    };
    let stored: &[u8] = match &compressed {
        Some(block) => {
            flags = flags.with(EntryFlags::COMPRESSED);
            block
        }
        None => payload,
    };

    let (start_id, end_id) = ids.map_or((-1, -1), |r| (r.start, r.end));
    let mut bytes = Vec::with_capacity(ENTRY_HEADER_SIZE + stored.len());
    bytes.extend_from_slice(&(stored.len() as i32).to_le_bytes());
    bytes.push(flags.as_byte());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&start_id.to_le_bytes());
    bytes.extend_from_slice(&end_id.to_le_bytes());
    bytes.extend_from_slice(&timestamp.to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..CRC_OFFSET]);
    hasher.update(stored);
    let crc = hasher.finalize();
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes.extend_from_slice(stored);

    EncodedEntry {
        header: EntryHeader {
            stored_len: stored.len() as u32,
            flags,
            logical_len: payload.len() as u32,
            ids,
            timestamp,
            crc,
        },
        bytes,
    }
}

/// Verifies the CRC of a frame and returns the logical payload.
///
/// `frame` is the whole encoded entry, header included.
///
/// # Errors
///
/// Returns `ChecksumMismatch` or `SegmentCorruption` if the frame is damaged.
pub(crate) fn decode_payload(header: &EntryHeader, frame: &[u8]) -> CoreResult<Vec<u8>> {
    let stored = &frame[ENTRY_HEADER_SIZE..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[..CRC_OFFSET]);
    hasher.update(stored);
    let actual = hasher.finalize();
    if actual != header.crc {
        return Err(CoreError::ChecksumMismatch {
            expected: header.crc,
            actual,
        });
    }

    if !header.flags.contains(EntryFlags::COMPRESSED) {
        return Ok(stored.to_vec());
    }

    let payload = lz4_flex::block::decompress(stored, header.logical_len as usize)
        .map_err(|e| CoreError::segment_corruption(format!("lz4 block: {e}")))?;
    if payload.len() != header.logical_len as usize {
        return Err(CoreError::segment_corruption(format!(
            "decompressed {} bytes, header says {}",
            payload.len(),
            header.logical_len
        )));
    }
    Ok(payload)
}

fn read_8(data: &[u8], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&data[at..at + 8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_frame(bytes: &[u8]) -> (EntryHeader, Vec<u8>) {
        let header = EntryHeader::decode(&bytes[..ENTRY_HEADER_SIZE]).unwrap();
        let payload = decode_payload(&header, bytes).unwrap();
        (header, payload)
    }

    #[test]
    fn plain_entry() {
        let entry = encode_entry(b"hello", None, 99, false);
        assert_eq!(entry.bytes.len(), ENTRY_HEADER_SIZE + 5);

        let (header, payload) = decode_frame(&entry.bytes);
        assert_eq!(header, entry.header);
        assert_eq!(payload, b"hello");
        assert_eq!(header.ids, None);
        assert_eq!(header.timestamp, 99);
    }

    #[test]
    fn entry_with_ids() {
        let ids = IdRange::new(11, 20).unwrap();
        let entry = encode_entry(b"x", Some(ids), 0, false);
        let (header, _) = decode_frame(&entry.bytes);
        assert_eq!(header.ids, Some(ids));
        assert!(header.flags.contains(EntryFlags::HAS_IDS));
    }

    #[test]
    fn compressible_payload_is_compressed() {
        let payload = vec![7u8; 4096];
        let entry = encode_entry(&payload, None, 0, true);
        assert!(entry.header.flags.contains(EntryFlags::COMPRESSED));
        assert!(entry.bytes.len() < payload.len());

        let (header, decoded) = decode_frame(&entry.bytes);
        assert_eq!(header.logical_len, 4096);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn incompressible_payload_is_stored_plain() {
        let payload: Vec<u8> = (0..32u8).collect();
        let entry = encode_entry(&payload, None, 0, true);
        assert!(!entry.header.flags.contains(EntryFlags::COMPRESSED));
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut bytes = encode_entry(b"abc", None, 0, false).bytes;
        bytes[0..4].copy_from_slice(&(-5i32).to_le_bytes());
        let err = EntryHeader::decode(&bytes).unwrap_err();
        assert!(err.contains("negative"));
    }

    #[test]
    fn absurd_length_is_rejected() {
        let mut bytes = encode_entry(b"abc", None, 0, false).bytes;
        bytes[0..4].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(EntryHeader::decode(&bytes).is_err());
    }

    #[test]
    fn payload_damage_fails_crc() {
        let mut bytes = encode_entry(b"payload", None, 0, false).bytes;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let header = EntryHeader::decode(&bytes).unwrap();
        assert!(matches!(
            decode_payload(&header, &bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn timestamp_damage_fails_crc() {
        let mut bytes = encode_entry(b"payload", None, 1234, false).bytes;
        bytes[26] ^= 0x01;
        let header = EntryHeader::decode(&bytes).unwrap();
        assert!(decode_payload(&header, &bytes).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_payloads_decode(
            payload in prop::collection::vec(any::<u8>(), 0..2048),
            compress in any::<bool>(),
            start in 0i64..1_000_000,
            len in 0i64..1000,
        ) {
            let ids = IdRange::new(start, start + len).unwrap();
            let entry = encode_entry(&payload, Some(ids), 5, compress);
            let (header, decoded) = decode_frame(&entry.bytes);
            prop_assert_eq!(header.frame_len() as usize, entry.bytes.len());
            prop_assert_eq!(decoded, payload);
        }
    }
}
