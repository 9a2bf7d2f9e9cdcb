//! Typed access to per-segment extra headers.
//!
//! The deque stores extra headers as opaque bytes. Callers that attach a
//! structured value (a schema version, a source descriptor) implement
//! [`ExtraHeaderSerializer`] for it and use the `*_with` entry points.

use crate::error::CoreResult;

/// Converts a caller type to and from extra header bytes.
pub trait ExtraHeaderSerializer: Send + Sync {
    /// The structured header type.
    type Header;

    /// Encodes a header.
    fn encode(&self, header: &Self::Header) -> Vec<u8>;

    /// Decodes a header.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoding.
    fn decode(&self, bytes: &[u8]) -> CoreResult<Self::Header>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CoreError;

    /// Schema version plus a source name.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct SchemaHeader {
        pub(crate) version: u32,
        pub(crate) source: String,
    }

    pub(crate) struct SchemaSerializer;

    impl ExtraHeaderSerializer for SchemaSerializer {
        type Header = SchemaHeader;

        fn encode(&self, header: &SchemaHeader) -> Vec<u8> {
            let mut out = header.version.to_le_bytes().to_vec();
            out.extend_from_slice(header.source.as_bytes());
            out
        }

        fn decode(&self, bytes: &[u8]) -> CoreResult<SchemaHeader> {
            if bytes.len() < 4 {
                return Err(CoreError::invalid_format("schema header too short"));
            }
            let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let source = String::from_utf8(bytes[4..].to_vec())
                .map_err(|e| CoreError::invalid_format(e.to_string()))?;
            Ok(SchemaHeader { version, source })
        }
    }

    #[test]
    fn serializer_roundtrip() {
        let header = SchemaHeader {
            version: 3,
            source: "orders".into(),
        };
        let bytes = SchemaSerializer.encode(&header);
        assert_eq!(SchemaSerializer.decode(&bytes).unwrap(), header);
        assert!(SchemaSerializer.decode(&[1]).is_err());
    }
}
