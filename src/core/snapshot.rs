//! Pre-apply snapshots of the live tables
//!
//! Before each restore the dump that is about to be replaced is written to
//! the state directory as a JSON envelope with a SHA-256 checksum. The newest
//! five per family are kept.

use crate::core::error::{Error, Result, SnapshotError};
use crate::core::gate;
use crate::core::model::IpFamily;
use crate::core::table_backend::TableBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MAX_SNAPSHOTS: usize = 5;

/// One saved table dump
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSnapshot {
    pub family: IpFamily,
    pub taken_at: DateTime<Utc>,
    pub checksum: String,
    pub dump: String,
}

impl TableSnapshot {
    pub fn new(family: IpFamily, dump: impl Into<String>) -> Self {
        let dump = dump.into();
        Self {
            family,
            taken_at: Utc::now(),
            checksum: compute_checksum(&dump),
            dump,
        }
    }

    /// Checks the stored checksum against the dump text
    pub fn verify(&self) -> std::result::Result<(), SnapshotError> {
        if self.dump.trim().is_empty() {
            return Err(SnapshotError::Empty);
        }
        let actual = compute_checksum(&self.dump);
        if actual != self.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Computes the SHA-256 checksum of a dump, as lowercase hex.
pub fn compute_checksum(dump: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dump.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Directory of snapshot files
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store in the XDG state directory
    pub fn in_state_dir() -> Result<Self> {
        let dir = crate::utils::get_state_dir()
            .ok_or_else(|| Error::Internal("Failed to get state directory".to_string()))?;
        crate::utils::ensure_dirs()?;
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves a dump with restrictive permissions and prunes old snapshots.
    pub async fn save(&self, family: IpFamily, dump: &str) -> Result<PathBuf> {
        let snapshot = TableSnapshot::new(family, dump);
        let timestamp = snapshot.taken_at.format("%Y%m%d_%H%M%S_%6f");
        let path = self.dir.join(format!("snapshot_{family}_{timestamp}.json"));
        let json = serde_json::to_string_pretty(&snapshot)?;

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(&path, json).await?;
        }

        info!("Snapshot saved to {:?}", path);
        self.cleanup(family).await?;
        Ok(path)
    }

    /// Snapshots of one family, newest first
    pub async fn list(&self, family: IpFamily) -> Result<Vec<PathBuf>> {
        let prefix = format!("snapshot_{family}_");
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            {
                snapshots.push(path);
            }
        }

        // Timestamps in the name sort lexicographically
        snapshots.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(snapshots)
    }

    /// Reads and verifies one snapshot file
    pub async fn load(&self, path: &Path) -> Result<TableSnapshot> {
        let json = tokio::fs::read_to_string(path).await?;
        let snapshot: TableSnapshot =
            serde_json::from_str(&json).map_err(|_| SnapshotError::Corrupted)?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Newest verified snapshot of a family
    pub async fn latest(&self, family: IpFamily) -> Result<TableSnapshot> {
        let newest = self
            .list(family)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SnapshotError::NotFound(format!("no {family} snapshots")))?;
        self.load(&newest).await
    }

    async fn cleanup(&self, family: IpFamily) -> Result<()> {
        let mut snapshots = self.list(family).await?;
        if snapshots.len() > MAX_SNAPSHOTS {
            for old in snapshots.drain(MAX_SNAPSHOTS..) {
                if let Err(e) = tokio::fs::remove_file(&old).await {
                    warn!("Failed to remove old snapshot {:?}: {}", old, e);
                } else {
                    info!("Removed old snapshot: {:?}", old);
                }
            }
        }
        Ok(())
    }
}

/// Reloads the newest snapshot of `family` into the live tables.
pub async fn restore_latest_snapshot<B: TableBackend>(
    store: &SnapshotStore,
    backend: &B,
    family: IpFamily,
) -> Result<TableSnapshot> {
    let snapshot = store.latest(family).await?;
    info!(%family, taken_at = %snapshot.taken_at, "Restoring snapshot");

    let _gate = gate::acquire().await;
    backend.restore(family, &snapshot.dump).await?;
    Ok(snapshot)
}
