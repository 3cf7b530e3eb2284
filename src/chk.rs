//! Content-hash-key block encoding
//!
//! Every splitfile block is stored as a CHK block:
//! - the plaintext is zero-padded to [`CHK_BLOCK_SIZE`]
//! - the decryption key is a convergent BLAKE3 hash of the padded plaintext
//! - the payload is AES-256-GCM ciphertext under that key
//! - the routing key is the SHA-256 of the ciphertext
//!
//! Identical blocks therefore always produce identical keys, which is what
//! lets a resumed insert re-derive exactly the keys it would have produced.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use blake3::Hasher;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CHK_BLOCK_SIZE;
use crate::error::InsertError;
use crate::types::BlockKey;

/// The key is unique per content, so a fixed nonce never repeats under one key
const CHK_NONCE: [u8; 12] = [0u8; 12];

/// Encryption key wrapper with secure handling
#[derive(Zeroize, ZeroizeOnDrop)]
struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Derive a convergent encryption key from block content
fn derive_convergent_key(content: &[u8]) -> EncryptionKey {
    let mut hasher = Hasher::new();

    // Domain separation
    hasher.update(b"splitfile-chk-v1-key");
    hasher.update(content);

    EncryptionKey(*hasher.finalize().as_bytes())
}

/// An encrypted block ready for insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkBlock {
    key: BlockKey,
    payload: Bytes,
}

impl ChkBlock {
    /// Encode a plaintext block of at most [`CHK_BLOCK_SIZE`] bytes
    pub fn encode(data: &[u8]) -> Result<Self, InsertError> {
        if data.len() > CHK_BLOCK_SIZE {
            return Err(InsertError::internal(format!(
                "block of {} bytes exceeds CHK block size {}",
                data.len(),
                CHK_BLOCK_SIZE
            )));
        }

        let mut padded = vec![0u8; CHK_BLOCK_SIZE];
        padded[..data.len()].copy_from_slice(data);

        let crypto_key = derive_convergent_key(&padded);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(crypto_key.as_bytes()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&CHK_NONCE), padded.as_slice())
            .map_err(|_| InsertError::internal("CHK encryption failed"))?;
        padded.zeroize();

        let routing_key: [u8; 32] = Sha256::digest(&ciphertext).into();

        Ok(Self {
            key: BlockKey::new(routing_key, *crypto_key.as_bytes()),
            payload: Bytes::from(ciphertext),
        })
    }

    /// Rebuild a block fetched by routing key, checking it matches the key
    pub fn from_parts(key: BlockKey, payload: Bytes) -> Result<Self, InsertError> {
        let routing_key: [u8; 32] = Sha256::digest(&payload).into();
        if &routing_key != key.routing_key() {
            return Err(InsertError::internal(format!(
                "payload does not hash to routing key of {}",
                key
            )));
        }
        Ok(Self { key, payload })
    }

    pub fn key(&self) -> &BlockKey {
        &self.key
    }

    /// Encrypted payload as stored in the network
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decrypt the block back into its padded plaintext
    pub fn decode(&self) -> Result<Vec<u8>, InsertError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.crypto_key()));
        cipher
            .decrypt(Nonce::from_slice(&CHK_NONCE), &self.payload[..])
            .map_err(|_| InsertError::internal(format!("CHK decryption failed for {}", self.key)))
    }
}
