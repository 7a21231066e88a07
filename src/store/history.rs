use crate::core::{Transfer, TransferDirection, TransferStatus};
use crate::error::Result;
use crate::protocol::TransferFile;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound on retained records; oldest fall off first
const MAX_HISTORY_ENTRIES: usize = 100;

/// Snapshot of a transfer at the moment it reached a terminal status
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub peer_address: String,
    pub files: Vec<TransferFile>,
    pub total_size: u64,
    pub status: TransferStatus,
    pub completed_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Snapshot a transfer that has just entered a terminal status
    pub fn from_transfer(transfer: &Transfer) -> Self {
        debug_assert!(transfer.status.is_terminal());
        Self {
            transfer_id: transfer.id.clone(),
            direction: transfer.direction,
            peer_address: transfer.peer_address.clone(),
            files: transfer.files.clone(),
            total_size: transfer.total_size,
            status: transfer.status,
            completed_at: transfer.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct HistoryFile {
    records: Vec<HistoryRecord>,
}

/// Append-only transfer history (except for explicit clear-all), most recent
/// first, persisted to a JSON file
pub struct HistoryStore {
    records: RwLock<Vec<HistoryRecord>>,
    file_path: PathBuf,
}

impl HistoryStore {
    pub fn open(config_dir: &Path) -> Result<Self> {
        fs::create_dir_all(config_dir)?;
        let file_path = config_dir.join("history.json");

        let records = if file_path.exists() {
            let content = fs::read_to_string(&file_path)?;
            let file: HistoryFile = serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse history, starting fresh: {}", e);
                HistoryFile {
                    records: Vec::new(),
                }
            });
            file.records
        } else {
            Vec::new()
        };

        Ok(Self {
            records: RwLock::new(records),
            file_path,
        })
    }

    fn persist(&self) -> Result<()> {
        let content = {
            let records = self.records.read();
            serde_json::to_string_pretty(&HistoryFile {
                records: records.clone(),
            })?
        };
        fs::write(&self.file_path, content)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<HistoryRecord> {
        self.records.read().clone()
    }

    pub fn add(&self, record: HistoryRecord) -> Result<()> {
        {
            let mut records = self.records.write();
            records.insert(0, record);
            if records.len() > MAX_HISTORY_ENTRIES {
                records.truncate(MAX_HISTORY_ENTRIES);
            }
        }
        self.persist()
    }

    pub fn clear(&self) -> Result<()> {
        {
            let mut records = self.records.write();
            records.clear();
        }
        self.persist()
    }

    pub fn count(&self) -> usize {
        self.records.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> HistoryRecord {
        let mut transfer = Transfer::inbound(
            id.to_string(),
            "10.0.0.5".to_string(),
            53317,
            vec![TransferFile::new("a.txt", 10)],
        );
        transfer.reject().unwrap();
        HistoryRecord::from_transfer(&transfer)
    }

    #[test]
    fn test_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();

        store.add(record("first")).unwrap();
        store.add(record("second")).unwrap();

        let records = store.list();
        assert_eq!(records[0].transfer_id, "second");
        assert_eq!(records[1].transfer_id, "first");
    }

    #[test]
    fn test_capped_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();

        for i in 0..(MAX_HISTORY_ENTRIES + 5) {
            store.add(record(&format!("t-{}", i))).unwrap();
        }
        assert_eq!(store.count(), MAX_HISTORY_ENTRIES);
    }

    #[test]
    fn test_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        store.add(record("t-1")).unwrap();

        store.clear().unwrap();
        assert_eq!(store.count(), 0);

        // Cleared state survives reopen
        let reopened = HistoryStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count(), 0);
    }

    #[test]
    fn test_snapshot_captures_terminal_state() {
        let rec = record("t-9");
        assert_eq!(rec.status, TransferStatus::Rejected);
        assert_eq!(rec.direction, TransferDirection::Inbound);
        assert_eq!(rec.total_size, 10);
    }
}
