//! Common types used throughout the splitfile inserter

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Content-hash key of an inserted block
///
/// The routing key locates the block in the network, the crypto key
/// decrypts it. Both are derived from the block content alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    routing_key: [u8; 32],
    crypto_key: [u8; 32],
}

impl BlockKey {
    /// Create a key from its two halves
    pub fn new(routing_key: [u8; 32], crypto_key: [u8; 32]) -> Self {
        Self {
            routing_key,
            crypto_key,
        }
    }

    /// Get the routing key
    pub fn routing_key(&self) -> &[u8; 32] {
        &self.routing_key
    }

    /// Get the decryption key
    pub fn crypto_key(&self) -> &[u8; 32] {
        &self.crypto_key
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CHK@{},{}",
            hex::encode(self.routing_key),
            hex::encode(self.crypto_key)
        )
    }
}

/// Error returned when a key string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed block key: {0}")]
pub struct ParseKeyError(String);

impl FromStr for BlockKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("CHK@")
            .ok_or_else(|| ParseKeyError(s.to_string()))?;
        let (routing, crypto) = body
            .split_once(',')
            .ok_or_else(|| ParseKeyError(s.to_string()))?;

        let decode = |part: &str| -> Result<[u8; 32], ParseKeyError> {
            let bytes = hex::decode(part).map_err(|_| ParseKeyError(s.to_string()))?;
            bytes.try_into().map_err(|_| ParseKeyError(s.to_string()))
        };

        Ok(Self::new(decode(routing)?, decode(crypto)?))
    }
}

static NEXT_INSERTER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an inserter, usable as a map or set key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InserterId(u64);

impl InserterId {
    /// Allocate a new process-unique identity
    pub fn next() -> Self {
        Self(NEXT_INSERTER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InserterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inserter#{}", self.0)
    }
}

/// Opaque caller-supplied correlation token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InsertToken(pub u64);

impl fmt::Display for InsertToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_key_string_roundtrip() {
        let key = BlockKey::new([0xAB; 32], [0x01; 32]);
        let text = key.to_string();

        assert!(text.starts_with("CHK@abab"));
        assert_eq!(text.parse::<BlockKey>().unwrap(), key);
    }

    #[test]
    fn test_block_key_rejects_garbage() {
        assert!("SSK@abc,def".parse::<BlockKey>().is_err());
        assert!("CHK@abcdef".parse::<BlockKey>().is_err());
        assert!("CHK@zz,00".parse::<BlockKey>().is_err());
        // Right encoding, wrong length
        assert!("CHK@0011,2233".parse::<BlockKey>().is_err());
    }

    #[test]
    fn test_inserter_ids_unique() {
        let a = InserterId::next();
        let b = InserterId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }
}
