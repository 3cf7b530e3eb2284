//! Block and progress storage
//!
//! This module provides the concrete [`BlockInserter`] implementations
//! (local filesystem, in-memory) and the [`ProgressStore`] abstraction used
//! to checkpoint resumable inserts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::chk::ChkBlock;
use crate::error::{InsertError, InsertErrorMode};
use crate::fieldset::FieldSet;
use crate::traits::BlockInserter;
use crate::types::BlockKey;

/// Write `data` to `path` through a temp file and an atomic rename
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create parent directory")?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .await
        .context("Failed to create temp file")?;
    file.write_all(data)
        .await
        .context("Failed to write file data")?;
    file.sync_all().await.context("Failed to sync file")?;

    fs::rename(&temp_path, path)
        .await
        .context("Failed to rename temp file")?;
    Ok(())
}

/// Read a whole file, `None` if it does not exist
async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
    }
}

/// Local filesystem block store, sharded by routing key
pub struct LocalBlockStore {
    /// Base directory for block storage
    base_path: PathBuf,
    /// Number of directory levels for sharding
    shard_levels: usize,
}

impl LocalBlockStore {
    /// Create a new local block store
    pub async fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .await
            .context("Failed to create storage directory")?;

        Ok(Self {
            base_path,
            shard_levels: 2,
        })
    }

    /// Get the path for a block (e.g. `ab/cd/abcdef....chk`)
    fn block_path(&self, routing_key: &[u8; 32]) -> PathBuf {
        let hex = hex::encode(routing_key);
        let mut path = self.base_path.clone();
        for level in 0..self.shard_levels {
            path = path.join(&hex[level * 2..level * 2 + 2]);
        }
        path.join(format!("{}.chk", hex))
    }

    /// Store a block, treating an identical existing block as success
    pub async fn store(&self, block: &ChkBlock) -> Result<StoreOutcome> {
        let path = self.block_path(block.key().routing_key());

        if let Some(existing) = read_optional(&path).await? {
            if existing[..] == block.payload()[..] {
                return Ok(StoreOutcome::AlreadyPresent);
            }
            return Ok(StoreOutcome::Collision);
        }

        write_atomic(&path, block.payload()).await?;
        Ok(StoreOutcome::Stored)
    }

    /// Fetch and verify a block by key
    pub async fn get_block(&self, key: &BlockKey) -> Result<Option<ChkBlock>> {
        let path = self.block_path(key.routing_key());
        match read_optional(&path).await? {
            Some(payload) => {
                let block = ChkBlock::from_parts(*key, Bytes::from(payload))
                    .with_context(|| format!("Stored block does not match {}", key))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    pub async fn has_block(&self, key: &BlockKey) -> bool {
        fs::try_exists(self.block_path(key.routing_key()))
            .await
            .unwrap_or(false)
    }
}

/// Result of storing a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    AlreadyPresent,
    /// Different content already lives under the routing key
    Collision,
}

#[async_trait]
impl BlockInserter for LocalBlockStore {
    async fn put_block(&self, block: &ChkBlock) -> std::result::Result<(), InsertError> {
        match self.store(block).await {
            Ok(StoreOutcome::Stored) => Ok(()),
            Ok(StoreOutcome::AlreadyPresent) => {
                debug!("Block {} already stored", block.key());
                Ok(())
            }
            Ok(StoreOutcome::Collision) => Err(InsertError::with_message(
                InsertErrorMode::Collision,
                block.key().to_string(),
            )),
            Err(e) => {
                warn!("Failed to store block {}: {:#}", block.key(), e);
                Err(InsertError::bucket(format!("{:#}", e)))
            }
        }
    }
}

/// In-memory block store
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<[u8; 32], Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.blocks.lock().contains_key(key.routing_key())
    }

    /// Fetch and verify a block by key
    pub fn get_block(&self, key: &BlockKey) -> Option<ChkBlock> {
        let payload = self.blocks.lock().get(key.routing_key()).cloned()?;
        ChkBlock::from_parts(*key, payload).ok()
    }
}

#[async_trait]
impl BlockInserter for MemoryBlockStore {
    async fn put_block(&self, block: &ChkBlock) -> std::result::Result<(), InsertError> {
        let mut blocks = self.blocks.lock();
        match blocks.get(block.key().routing_key()) {
            Some(existing) if existing != block.payload() => Err(InsertError::with_message(
                InsertErrorMode::Collision,
                block.key().to_string(),
            )),
            Some(_) => Ok(()),
            None => {
                blocks.insert(*block.key().routing_key(), block.payload().clone());
                Ok(())
            }
        }
    }
}

/// Durable home for insert progress records
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Replace the record stored under `name`
    async fn save(&self, name: &str, record: &FieldSet) -> Result<()>;

    /// Load the record stored under `name`, if any
    async fn load(&self, name: &str) -> Result<Option<FieldSet>>;

    /// Forget the record stored under `name`
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Progress records as field-set text files in one directory
pub struct LocalProgressStore {
    base_path: PathBuf,
}

impl LocalProgressStore {
    pub async fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .await
            .context("Failed to create progress directory")?;
        Ok(Self { base_path })
    }

    fn record_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            anyhow::bail!("Invalid progress record name: {:?}", name);
        }
        Ok(self.base_path.join(format!("{}.progress", name)))
    }
}

#[async_trait]
impl ProgressStore for LocalProgressStore {
    async fn save(&self, name: &str, record: &FieldSet) -> Result<()> {
        let path = self.record_path(name)?;
        write_atomic(&path, record.to_text().as_bytes()).await
    }

    async fn load(&self, name: &str) -> Result<Option<FieldSet>> {
        let path = self.record_path(name)?;
        let Some(data) = read_optional(&path).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(data).context("Progress record is not UTF-8")?;
        let record = FieldSet::from_text(&text)
            .with_context(|| format!("Corrupt progress record {:?}", name))?;
        Ok(Some(record))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to delete progress record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_block_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlockStore::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let block = ChkBlock::encode(b"Hello, World!").unwrap();
        assert!(!store.has_block(block.key()).await);

        store.put_block(&block).await.unwrap();
        assert!(store.has_block(block.key()).await);

        let fetched = store.get_block(block.key()).await.unwrap().unwrap();
        assert_eq!(fetched, block);
        assert_eq!(&fetched.decode().unwrap()[..13], b"Hello, World!");
    }

    #[tokio::test]
    async fn test_local_block_store_duplicate_and_collision() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlockStore::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let block = ChkBlock::encode(b"same").unwrap();
        assert_eq!(store.store(&block).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(
            store.store(&block).await.unwrap(),
            StoreOutcome::AlreadyPresent
        );

        // Overwrite the file behind the store's back
        let path = store.block_path(block.key().routing_key());
        std::fs::write(&path, b"something else").unwrap();

        let err = store.put_block(&block).await.unwrap_err();
        assert_eq!(err.mode(), InsertErrorMode::Collision);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_local_block_store_missing_block() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlockStore::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        let key = BlockKey::new([7u8; 32], [8u8; 32]);
        assert!(store.get_block(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_block_store() {
        let store = MemoryBlockStore::new();
        assert!(store.is_empty());

        let a = ChkBlock::encode(b"a").unwrap();
        let b = ChkBlock::encode(b"b").unwrap();
        store.put_block(&a).await.unwrap();
        store.put_block(&a).await.unwrap();
        store.put_block(&b).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.contains(a.key()));
        assert_eq!(store.get_block(b.key()), Some(b));
    }

    #[tokio::test]
    async fn test_progress_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalProgressStore::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        assert!(store.load("splitfile-1").await.unwrap().is_none());

        let mut record = FieldSet::new();
        record.put("DataLength", 1234u64);
        record.put("Segments.Count", 2);
        store.save("splitfile-1", &record).await.unwrap();

        let loaded = store.load("splitfile-1").await.unwrap().unwrap();
        assert_eq!(loaded, record);

        store.remove("splitfile-1").await.unwrap();
        store.remove("splitfile-1").await.unwrap();
        assert!(store.load("splitfile-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_progress_store_rejects_bad_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalProgressStore::new(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(store.save("../escape", &FieldSet::new()).await.is_err());
        assert!(store.load("").await.is_err());
    }
}
