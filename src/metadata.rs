//! Splitfile metadata: the final descriptor of an inserted file

use serde::{Deserialize, Serialize};

use crate::codec::SplitfileAlgorithm;
use crate::types::BlockKey;

/// Client-facing description of the content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Optional MIME type
    pub mime_type: Option<String>,
}

impl ClientMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set MIME type
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Whether there is nothing worth recording
    pub fn is_trivial(&self) -> bool {
        self.mime_type.is_none()
    }
}

/// Descriptor aggregating every block key of an inserted splitfile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitfileMetadata {
    /// Redundancy scheme used for every segment
    pub splitfile_algorithm: SplitfileAlgorithm,
    /// Data block keys, in segment order then block order
    pub data_keys: Vec<BlockKey>,
    /// Check block keys, in segment order then block order
    pub check_keys: Vec<BlockKey>,
    /// Target data blocks per segment
    pub segment_size: i32,
    /// Target check blocks per segment
    pub check_segment_size: i32,
    pub client_metadata: ClientMetadata,
    /// Length of the (compressed) payload in bytes
    pub data_length: u64,
    /// Compression codec id, -1 for none
    pub compression_codec: i16,
    /// Length before compression
    pub decompressed_length: u64,
    /// The payload is itself metadata
    pub is_metadata: bool,
    /// The payload should be treated as an archive manifest
    pub insert_as_archive_manifest: bool,
}

impl SplitfileMetadata {
    /// Number of segments described, derived from the key counts
    pub fn segment_count(&self) -> usize {
        match usize::try_from(self.segment_size) {
            Ok(size) if size > 0 => self.data_keys.len().div_ceil(size).max(1),
            _ => 1,
        }
    }

    /// Binary form for embedding in a manifest or a single block
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(data_keys: usize, segment_size: i32) -> SplitfileMetadata {
        SplitfileMetadata {
            splitfile_algorithm: SplitfileAlgorithm::OnionStandard,
            data_keys: (0..data_keys)
                .map(|i| BlockKey::new([i as u8; 32], [0u8; 32]))
                .collect(),
            check_keys: vec![BlockKey::new([0xEE; 32], [0x11; 32])],
            segment_size,
            check_segment_size: 128,
            client_metadata: ClientMetadata::new().with_mime_type("text/plain"),
            data_length: 1234,
            compression_codec: -1,
            decompressed_length: 1234,
            is_metadata: false,
            insert_as_archive_manifest: false,
        }
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = sample(3, 128);
        let bytes = metadata.to_bytes().unwrap();
        let restored = SplitfileMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(restored, metadata);
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(sample(10, 4).segment_count(), 3);
        assert_eq!(sample(8, 4).segment_count(), 2);
        assert_eq!(sample(300, -1).segment_count(), 1);
        assert_eq!(sample(0, 4).segment_count(), 1);
    }

    #[test]
    fn test_client_metadata() {
        assert!(ClientMetadata::new().is_trivial());
        assert!(!ClientMetadata::new().with_mime_type("image/png").is_trivial());
    }
}
