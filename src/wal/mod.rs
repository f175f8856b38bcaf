//! Write-Ahead Log
//!
//! The epoch authority of the engine: every committed write receives its
//! epoch here, under the single writer lock, so epochs are globally monotone
//! and strictly increasing.
//!
//! Durability guarantees:
//! - records are framed and CRC-checked, so replay detects corruption
//! - fsync before acknowledgment (unless disabled for tests)

pub mod entry;
pub mod reader;

use crate::config::WalConfig;
use crate::types::{Epoch, OpKind, Timestamp, VectorEntry};
use entry::{WalError, WalRecord};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only write-ahead log with epoch issuance
pub struct Wal {
    path: PathBuf,
    config: WalConfig,
    next_epoch: AtomicU64,
    write_lock: Mutex<()>,
}

impl Wal {
    /// Open or create a WAL, scanning existing records to restore the epoch
    /// clock
    ///
    /// A torn tail left by a crash mid-append is truncated away so that
    /// future appends land inside the replayable prefix.
    pub async fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();

        let next_epoch = if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read(&path).await?;
            let (records, valid_len) = reader::scan_valid_prefix(&data, 0)?;
            if valid_len < data.len() {
                tracing::warn!(
                    valid_len,
                    file_len = data.len(),
                    "truncating torn WAL tail"
                );
                let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                file.set_len(valid_len as u64).await?;
                file.sync_all().await?;
            }
            records.last().map(|r| r.epoch + 1).unwrap_or(1)
        } else {
            tokio::fs::write(&path, &[] as &[u8]).await?;
            1
        };

        tracing::info!(path = %path.display(), next_epoch, "WAL opened");
        Ok(Self {
            path,
            config,
            next_epoch: AtomicU64::new(next_epoch),
            write_lock: Mutex::new(()),
        })
    }

    /// Append a committed write and return its assigned epoch
    ///
    /// When this returns Ok the record is durable (with `sync_on_append`).
    pub async fn append(
        &self,
        op: OpKind,
        entry: &VectorEntry,
    ) -> Result<(Epoch, Timestamp), WalError> {
        let _guard = self.write_lock.lock().await;

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let timestamp = crate::types::now_micros();

        let record = WalRecord {
            epoch,
            op,
            timestamp,
            entry: entry.clone(),
        };
        let data = record.encode();

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(&data).await?;
        if self.config.sync_on_append {
            file.sync_all().await?;
        }

        Ok((epoch, timestamp))
    }

    /// Last epoch handed out, 0 if none
    pub fn current_epoch(&self) -> Epoch {
        self.next_epoch.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Replay every record in the log
    pub async fn replay(&self) -> Result<Vec<WalRecord>, WalError> {
        reader::replay_path(&self.path, 0).await
    }

    /// Replay records with epochs strictly greater than `after_epoch`
    pub async fn replay_from(&self, after_epoch: Epoch) -> Result<Vec<WalRecord>, WalError> {
        reader::replay_path(&self.path, after_epoch).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VectorId;

    fn entry(name: &str) -> VectorEntry {
        VectorEntry::new(VectorId::from(name), vec![1.0, 2.0], "t", "n", vec![])
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log"), WalConfig::default())
            .await
            .unwrap();

        let (e1, _) = wal.append(OpKind::Upsert, &entry("a")).await.unwrap();
        let (e2, _) = wal.append(OpKind::Upsert, &entry("b")).await.unwrap();

        assert_eq!(e1, 1);
        assert_eq!(e2, 2);
        assert_eq!(wal.current_epoch(), 2);
    }

    #[tokio::test]
    async fn test_replay_returns_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log"), WalConfig::default())
            .await
            .unwrap();

        wal.append(OpKind::Insert, &entry("a")).await.unwrap();
        wal.append(OpKind::Delete, &VectorEntry::tombstone(VectorId::from("a")))
            .await
            .unwrap();

        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, OpKind::Insert);
        assert_eq!(records[1].op, OpKind::Delete);
    }

    #[tokio::test]
    async fn test_epoch_clock_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let wal = Wal::open(&path, WalConfig::default()).await.unwrap();
            wal.append(OpKind::Upsert, &entry("a")).await.unwrap();
            wal.append(OpKind::Upsert, &entry("b")).await.unwrap();
        }

        let wal = Wal::open(&path, WalConfig::default()).await.unwrap();
        assert_eq!(wal.current_epoch(), 2);

        let (e3, _) = wal.append(OpKind::Upsert, &entry("c")).await.unwrap();
        assert_eq!(e3, 3);
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let wal = Wal::open(&path, WalConfig::default()).await.unwrap();
            wal.append(OpKind::Upsert, &entry("a")).await.unwrap();
        }

        // Crash mid-append: garbage after the last full record
        let mut data = std::fs::read(&path).unwrap();
        let valid_len = data.len();
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        std::fs::write(&path, &data).unwrap();

        let wal = Wal::open(&path, WalConfig::default()).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len as u64);

        // Appends after the repair stay replayable
        wal.append(OpKind::Upsert, &entry("b")).await.unwrap();
        let records = wal.replay().await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_from_skips_older_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log"), WalConfig::default())
            .await
            .unwrap();

        for name in ["a", "b", "c", "d"] {
            wal.append(OpKind::Upsert, &entry(name)).await.unwrap();
        }

        let records = wal.replay_from(2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].epoch, 3);
    }
}
