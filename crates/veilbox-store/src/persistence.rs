//! Snapshot persistence.
//!
//! [`JsonDirStore`] keeps one JSON file per map plus the raw salt inside a
//! data directory. A save stages every file as a temporary sibling first and
//! renames them into place only once all writes succeeded, so a failed write
//! leaves the previous snapshot intact. Saves through one store (and its
//! clones) are serialized.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use veilbox_shared::constants::{BLOCKS_FILE, HASHES_FILE, INBOX_FILE, SALT_FILE, STATES_FILE};
use veilbox_shared::Salt;

use crate::error::{Result, StoreError};
use crate::snapshot::Snapshot;

/// Source and sink of relay snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last saved snapshot. Nothing saved yet yields an empty one.
    async fn load(&self) -> Result<Snapshot>;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
    save_lock: Arc<Mutex<()>>,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SnapshotStore for JsonDirStore {
    async fn load(&self) -> Result<Snapshot> {
        let salt = match fs::read(self.dir.join(SALT_FILE)).await {
            Ok(bytes) => Some(
                Salt::from_bytes(bytes)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {}", SALT_FILE, e)))?,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let snapshot = Snapshot {
            pairings: read_json(&self.dir.join(STATES_FILE)).await?,
            blocks: read_json(&self.dir.join(BLOCKS_FILE)).await?,
            inbox: read_json(&self.dir.join(INBOX_FILE)).await?,
            hashes: read_json(&self.dir.join(HASHES_FILE)).await?,
            salt,
        };

        info!(
            dir = %self.dir.display(),
            pairings = snapshot.pairings.len(),
            inboxes = snapshot.inbox.len(),
            tokens = snapshot.hashes.len(),
            "Loaded relay snapshot"
        );

        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        // Temp file names are fixed per target, so only one save may stage at a time.
        let _guard = self.save_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;

        let mut files = vec![
            (STATES_FILE, serde_json::to_vec_pretty(&snapshot.pairings)?),
            (BLOCKS_FILE, serde_json::to_vec_pretty(&snapshot.blocks)?),
            (INBOX_FILE, serde_json::to_vec_pretty(&snapshot.inbox)?),
            (HASHES_FILE, serde_json::to_vec_pretty(&snapshot.hashes)?),
        ];
        if let Some(salt) = &snapshot.salt {
            files.push((SALT_FILE, salt.as_bytes().to_vec()));
        }

        let mut staged = Vec::with_capacity(files.len());
        for (name, bytes) in &files {
            let target = self.dir.join(name);
            let tmp = tmp_path(&target);
            let written = fs::write(&tmp, bytes).await;
            staged.push((tmp, target));
            if let Err(e) = written {
                discard_staged(&staged).await;
                return Err(e.into());
            }
        }

        for (tmp, target) in &staged {
            fs::rename(tmp, target).await?;
        }

        debug!(dir = %self.dir.display(), files = staged.len(), "Saved relay snapshot");
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    target.with_extension("tmp")
}

async fn discard_staged(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        if let Err(e) = fs::remove_file(tmp).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "Failed to remove staged snapshot file");
            }
        }
    }
}

/// Keeps the last saved snapshot in memory. Used by tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    latest: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            latest: Mutex::new(Some(snapshot)),
        }
    }

    pub async fn latest(&self) -> Option<Snapshot> {
        self.latest.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Snapshot> {
        Ok(self.latest.lock().await.clone().unwrap_or_default())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.latest.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;
    use veilbox_shared::{LinkToken, MessageRef, UserId};

    use crate::snapshot::InboxEntry;

    fn sample_snapshot() -> Snapshot {
        let salt = Salt::from_bytes(vec![7u8; 16]).unwrap();
        let mut snapshot = Snapshot {
            salt: Some(salt.clone()),
            ..Default::default()
        };
        snapshot.pairings.insert(UserId(1), Some(UserId(2)));
        snapshot.pairings.insert(UserId(2), None);
        snapshot.blocks.insert(UserId(3), BTreeSet::from([UserId(4), UserId(5)]));
        snapshot.blocks.insert(UserId(6), BTreeSet::new());
        snapshot.inbox.insert(
            UserId(2),
            vec![
                InboxEntry {
                    sender: UserId(9),
                    messages: vec![MessageRef(30), MessageRef(31)],
                },
                InboxEntry {
                    sender: UserId(1),
                    messages: vec![MessageRef(20)],
                },
            ],
        );
        snapshot.inbox.insert(UserId(8), Vec::new());
        snapshot
            .hashes
            .insert(LinkToken::derive(UserId(1), &salt), UserId(1));
        snapshot
    }

    #[tokio::test]
    async fn test_json_dir_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirStore::new(dir.path().join("state"));
        let snapshot = sample_snapshot();

        store.save(&snapshot).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.pairings.get(&UserId(2)), Some(&None));
        assert_eq!(loaded.blocks.get(&UserId(6)), Some(&BTreeSet::new()));
    }

    #[tokio::test]
    async fn test_empty_dir_loads_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirStore::new(dir.path());

        let loaded = store.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_states_file_uses_null_for_no_partner() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirStore::new(dir.path());
        store.save(&sample_snapshot()).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(STATES_FILE)).unwrap();
        let parsed: BTreeMap<String, Option<i64>> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.get("1"), Some(&Some(2)));
        assert_eq!(parsed.get("2"), Some(&None));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(BLOCKS_FILE), b"{not json").unwrap();

        let err = JsonDirStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Json(_)));
    }

    #[tokio::test]
    async fn test_empty_salt_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SALT_FILE), b"").unwrap();

        let err = JsonDirStore::new(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_concurrent_saves_all_succeed() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirStore::new(dir.path());
        let snapshot = sample_snapshot();

        for _ in 0..20 {
            let saves = (0..4).map(|_| {
                let store = store.clone();
                let snapshot = snapshot.clone();
                tokio::spawn(async move { store.save(&snapshot).await })
            });
            for result in futures::future::join_all(saves).await {
                result.unwrap().unwrap();
            }
        }

        assert_eq!(store.load().await.unwrap(), snapshot);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_keeps_previous_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirStore::new(dir.path());
        let old = sample_snapshot();
        store.save(&old).await.unwrap();

        // A directory in place of the inbox temp file makes that write fail.
        std::fs::create_dir(dir.path().join("inbox.tmp")).unwrap();
        let mut new = old.clone();
        new.pairings.insert(UserId(50), Some(UserId(51)));
        new.inbox.clear();
        assert!(store.save(&new).await.is_err());

        assert_eq!(store.load().await.unwrap(), old);
        assert!(!dir.path().join("states.tmp").exists());
        assert!(!dir.path().join("blocks.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_store_keeps_latest() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_empty());

        store.save(&sample_snapshot()).await.unwrap();
        assert_eq!(store.latest().await, Some(sample_snapshot()));
    }
}
