//! On-disk shard store
//!
//! Layout: `<root>/shards/aa/bb/<blake3(object-id)>.<index>.shard`, where
//! `aa`/`bb` are the first two bytes of the digest. Files are written to a
//! temporary name and renamed into place.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::format::{decode_shard, encode_shard, ShardHeader};
use crate::config::ShardStoreConfig;
use crate::domain::{
    content_checksum, Capacity, NodeId, ObjectId, PutOutcome, PutShardRequest, ShardProbe,
    ShardService,
};
use crate::error::{Error, Result};

type ShardKey = (ObjectId, usize);

/// Largest header we expect; probes read at most this much.
const HEADER_READ_LIMIT: u64 = 4 + 1 + 1 + 2 + 8 + 32 + 2 + 2 * u16::MAX as u64 + 2 + 16;

/// Durable local storage of shards, addressed by object identity and index.
pub struct ShardStore {
    node_id: NodeId,
    root: PathBuf,
    sync_writes: bool,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    locks: DashMap<ShardKey, Arc<Mutex<()>>>,
}

/// Holds the per-shard lock; drops the map slot when nobody else waits on it.
struct KeyLock<'a> {
    locks: &'a DashMap<ShardKey, Arc<Mutex<()>>>,
    key: ShardKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

impl ShardStore {
    /// Open or create a store rooted at `root`.
    ///
    /// Removes temporary files left by interrupted writes and recomputes
    /// the used-bytes counter.
    pub fn open(node_id: NodeId, root: impl AsRef<Path>, config: &ShardStoreConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let shards_dir = root.join("shards");
        std::fs::create_dir_all(&shards_dir)?;

        let (files, used) = scan_dir(&shards_dir)?;
        info!(
            node = %node_id,
            path = %shards_dir.display(),
            files,
            used_bytes = used,
            "Shard store opened"
        );

        Ok(Self {
            node_id,
            root,
            sync_writes: config.sync_writes,
            capacity_bytes: config.capacity_bytes,
            used_bytes: AtomicU64::new(used),
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding `(object_id, shard_index)`.
    pub fn shard_path(&self, object_id: &ObjectId, shard_index: usize) -> PathBuf {
        let digest = object_id.digest();
        self.root
            .join("shards")
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(format!("{}.{}.shard", digest, shard_index))
    }

    /// Capacity snapshot for heartbeats.
    pub fn capacity(&self) -> Capacity {
        Capacity {
            total_bytes: self.capacity_bytes,
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
        }
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    async fn lock(&self, object_id: &ObjectId, shard_index: usize) -> KeyLock<'_> {
        let key = (object_id.clone(), shard_index);
        let mutex = Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = mutex.lock_owned().await;
        KeyLock {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    async fn read_file(path: &Path) -> Result<Option<Bytes>> {
        match tokio::fs::read(path).await {
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("shard.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        if self.sync_writes {
            file.sync_all().await?;
        }
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Store a shard.
    ///
    /// Same checksum as the stored copy is a no-op, or a rewrite if the
    /// stored copy is damaged. A different checksum is a `Conflict`.
    #[instrument(skip(self, request), fields(node = %self.node_id, object = %request.object_id, shard = request.shard_index))]
    pub async fn put(&self, request: PutShardRequest) -> Result<PutOutcome> {
        if content_checksum(&request.payload) != request.checksum {
            return Err(Error::Corrupt(format!(
                "{} shard {}: payload does not match supplied checksum",
                request.object_id, request.shard_index
            )));
        }

        let _lock = self.lock(&request.object_id, request.shard_index).await;
        let path = self.shard_path(&request.object_id, request.shard_index);

        let outcome = match Self::read_file(&path).await? {
            None => PutOutcome::Stored,
            Some(existing) => match decode_shard(existing) {
                Ok((header, payload)) => {
                    if header.object_id != request.object_id
                        || header.checksum_hex() != request.checksum
                    {
                        return Err(Error::Conflict(format!(
                            "{} shard {} already stored with checksum {}",
                            request.object_id,
                            request.shard_index,
                            header.checksum_hex()
                        )));
                    }
                    if header.verifies(&payload) {
                        debug!("Identical shard already present");
                        return Ok(PutOutcome::AlreadyPresent);
                    }
                    PutOutcome::Repaired
                }
                Err(e) => {
                    warn!(error = %e, "Stored shard unreadable, overwriting");
                    PutOutcome::Repaired
                }
            },
        };

        let header = ShardHeader::new(
            request.object_id.clone(),
            request.shard_index,
            request.kind,
            request.payload.len() as u64,
            &request.checksum,
        )?;
        let contents = encode_shard(&header, &request.payload)?;

        let previous_len = match outcome {
            PutOutcome::Repaired => file_len(&path).await,
            _ => 0,
        };
        self.write_file(&path, &contents).await?;
        self.used_bytes
            .fetch_add(contents.len() as u64, Ordering::Relaxed);
        self.release(previous_len);

        debug!(?outcome, bytes = contents.len(), "Shard stored");
        Ok(outcome)
    }

    /// Fetch a shard payload after verifying its checksum.
    #[instrument(skip(self), fields(node = %self.node_id))]
    pub async fn get(&self, object_id: &ObjectId, shard_index: usize) -> Result<Bytes> {
        let path = self.shard_path(object_id, shard_index);
        let raw = Self::read_file(&path).await?.ok_or_else(|| {
            Error::NotFound(format!("{} shard {}", object_id, shard_index))
        })?;

        let (header, payload) = decode_shard(raw).map_err(|e| {
            Error::Corrupt(format!("{} shard {}: {}", object_id, shard_index, e))
        })?;
        if &header.object_id != object_id || header.shard_index != shard_index {
            return Err(Error::Corrupt(format!(
                "{} shard {}: header names {} shard {}",
                object_id, shard_index, header.object_id, header.shard_index
            )));
        }
        if !header.verifies(&payload) {
            warn!(object = %object_id, shard = shard_index, "Checksum mismatch on read");
            return Err(Error::Corrupt(format!(
                "{} shard {}: checksum mismatch",
                object_id, shard_index
            )));
        }
        Ok(payload)
    }

    /// Remove a shard. Returns whether a file was removed.
    #[instrument(skip(self), fields(node = %self.node_id))]
    pub async fn delete(&self, object_id: &ObjectId, shard_index: usize) -> Result<bool> {
        let _lock = self.lock(object_id, shard_index).await;
        let path = self.shard_path(object_id, shard_index);
        let len = file_len(&path).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.release(len);
                debug!(object = %object_id, shard = shard_index, "Shard deleted");
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Report existence and health without returning the payload.
    ///
    /// A shallow probe reads the header and checks the file length; a deep
    /// probe also hashes the payload.
    pub async fn probe(
        &self,
        object_id: &ObjectId,
        shard_index: usize,
        deep: bool,
    ) -> Result<ShardProbe> {
        if deep {
            return match self.get(object_id, shard_index).await {
                Ok(payload) => Ok(ShardProbe {
                    exists: true,
                    healthy: true,
                    checksum: Some(content_checksum(&payload)),
                    payload_len: payload.len() as u64,
                }),
                Err(Error::NotFound(_)) => Ok(ShardProbe::missing()),
                Err(Error::Corrupt(_)) => Ok(ShardProbe {
                    exists: true,
                    healthy: false,
                    checksum: None,
                    payload_len: 0,
                }),
                Err(e) => Err(e),
            };
        }

        let path = self.shard_path(object_id, shard_index);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(ShardProbe::missing()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata().await?.len();
        let mut prefix = Vec::new();
        (&mut file)
            .take(HEADER_READ_LIMIT.min(file_len))
            .read_to_end(&mut prefix)
            .await?;

        Ok(match ShardHeader::decode(&prefix) {
            Ok((header, header_len)) => ShardProbe {
                exists: true,
                healthy: &header.object_id == object_id
                    && header_len as u64 + header.payload_len == file_len,
                checksum: Some(header.checksum_hex()),
                payload_len: header.payload_len,
            },
            Err(_) => ShardProbe {
                exists: true,
                healthy: false,
                checksum: None,
                payload_len: 0,
            },
        })
    }
}

#[async_trait]
impl ShardService for ShardStore {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn put_shard(&self, request: PutShardRequest) -> Result<PutOutcome> {
        self.put(request).await
    }

    async fn get_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<Bytes> {
        self.get(object_id, shard_index).await
    }

    async fn delete_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<bool> {
        self.delete(object_id, shard_index).await
    }

    async fn probe_shard(
        &self,
        object_id: &ObjectId,
        shard_index: usize,
        deep: bool,
    ) -> Result<ShardProbe> {
        self.probe(object_id, shard_index, deep).await
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Count shard files and bytes under `dir`, removing stale temp files.
fn scan_dir(dir: &Path) -> Result<(usize, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "Removing interrupted write");
                std::fs::remove_file(&path)?;
            } else if path.extension().is_some_and(|ext| ext == "shard") {
                files += 1;
                bytes += meta.len();
            }
        }
    }
    Ok((files, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ShardKind, VersionId};
    use assert_matches::assert_matches;

    fn open_store(dir: &Path) -> ShardStore {
        ShardStore::open(NodeId::from("node-1"), dir, &ShardStoreConfig::default()).unwrap()
    }

    fn request(object_id: &ObjectId, index: usize, payload: &[u8]) -> PutShardRequest {
        PutShardRequest {
            object_id: object_id.clone(),
            shard_index: index,
            kind: ShardKind::Data,
            checksum: content_checksum(payload),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let id = ObjectId::new("bucket", "key", VersionId::generate());

        let outcome = store.put(request(&id, 0, b"shard zero")).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(&store.get(&id, 0).await.unwrap()[..], b"shard zero");
        assert!(store.capacity().used_bytes > 10);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let id = ObjectId::new("bucket", "key", VersionId::generate());

        store.put(request(&id, 1, b"payload")).await.unwrap();
        let used = store.capacity().used_bytes;
        let file = std::fs::read(store.shard_path(&id, 1)).unwrap();

        let again = store.put(request(&id, 1, b"payload")).await.unwrap();
        assert_eq!(again, PutOutcome::AlreadyPresent);
        assert_eq!(store.capacity().used_bytes, used);
        assert_eq!(std::fs::read(store.shard_path(&id, 1)).unwrap(), file);
    }

    #[tokio::test]
    async fn test_put_conflict_on_different_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let id = ObjectId::new("bucket", "key", VersionId::generate());

        store.put(request(&id, 0, b"first")).await.unwrap();
        let result = store.put(request(&id, 0, b"second")).await;
        assert_matches!(result, Err(Error::Conflict(_)));
        assert_eq!(&store.get(&id, 0).await.unwrap()[..], b"first");
    }

    #[tokio::test]
    async fn test_put_rejects_payload_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let id = ObjectId::new("bucket", "key", VersionId::generate());

        let mut req = request(&id, 0, b"payload");
        req.payload = Bytes::from_static(b"tampered");
        assert_matches!(store.put(req).await, Err(Error::Corrupt(_)));
        assert_matches!(store.get(&id, 0).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_detects_corruption_and_put_repairs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let id = ObjectId::new("bucket", "key", VersionId::generate());
        store.put(request(&id, 2, b"healthy payload")).await.unwrap();

        // flip the last payload byte
        let path = store.shard_path(&id, 2);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        std::fs::write(&path, raw).unwrap();

        assert_matches!(store.get(&id, 2).await, Err(Error::Corrupt(_)));
        let probe = store.probe(&id, 2, true).await.unwrap();
        assert!(probe.exists && !probe.healthy);
        // shallow probe only sees a well-formed header
        assert!(store.probe(&id, 2, false).await.unwrap().healthy);

        let outcome = store.put(request(&id, 2, b"healthy payload")).await.unwrap();
        assert_eq!(outcome, PutOutcome::Repaired);
        assert_eq!(&store.get(&id, 2).await.unwrap()[..], b"healthy payload");
    }

    #[tokio::test]
    async fn test_delete_and_probe_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let id = ObjectId::new("bucket", "key", VersionId::generate());

        store.put(request(&id, 0, b"bytes")).await.unwrap();
        assert!(store.delete(&id, 0).await.unwrap());
        assert!(!store.delete(&id, 0).await.unwrap());
        assert_eq!(store.capacity().used_bytes, 0);
        assert_eq!(store.probe(&id, 0, false).await.unwrap(), ShardProbe::missing());
        assert_matches!(store.get(&id, 0).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_truncated_file_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let id = ObjectId::new("bucket", "key", VersionId::generate());
        store.put(request(&id, 3, b"0123456789")).await.unwrap();

        let path = store.shard_path(&id, 3);
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 4]).unwrap();

        assert!(!store.probe(&id, 3, false).await.unwrap().healthy);
        assert_matches!(store.get(&id, 3).await, Err(Error::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_reopen_recounts_usage_and_drops_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let id = ObjectId::new("bucket", "key", VersionId::generate());
        let used = {
            let store = open_store(dir.path());
            store.put(request(&id, 0, b"persisted")).await.unwrap();
            let tmp = store.shard_path(&id, 9).with_extension("shard.tmp");
            std::fs::write(&tmp, b"partial").unwrap();
            store.capacity().used_bytes
        };

        let store = open_store(dir.path());
        assert_eq!(store.capacity().used_bytes, used);
        assert_eq!(&store.get(&id, 0).await.unwrap()[..], b"persisted");
        let tmp = store.shard_path(&id, 9).with_extension("shard.tmp");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_concurrent_puts_of_same_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));
        let id = ObjectId::new("bucket", "key", VersionId::generate());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let req = request(&id, 0, b"same bytes");
            handles.push(tokio::spawn(async move { store.put(req).await }));
        }
        let mut stored = 0;
        for h in handles {
            if h.await.unwrap().unwrap() == PutOutcome::Stored {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert!(store.locks.is_empty());
    }
}
