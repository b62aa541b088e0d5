//! Transaction log - append-only durable record of merge and undo
//! operations.
//!
//! One JSON record per line: a schema header first, then full
//! transactions as they open (`pending`) and slim status records as they
//! settle. Every append is fsynced, so the `pending` → terminal
//! transition survives a crash at any point; startup recovery replays
//! the log and rolls back whatever never committed.
//!
//! The log is the only persistent resource shared between concurrent
//! operations; all writes go through one exclusive append path.

use crate::merge::{Transaction, TxStatus};
use crate::{now_nanos, DvojnikError, Result, TxId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current log schema version.
pub const TXLOG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum TxRecord {
    Header {
        schema_version: u32,
    },
    /// Full transaction at open time; status is `pending`.
    Open(Box<Transaction>),
    /// Status transition for an already-opened transaction.
    Status {
        tx_id: TxId,
        status: TxStatus,
        timestamp_ns: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// An undo operation, logged as its own record referencing its
    /// target transaction.
    Undo {
        undo_id: TxId,
        target: TxId,
        timestamp_ns: i64,
    },
}

/// Append-only transaction log.
#[derive(Debug)]
pub struct TxLog {
    path: PathBuf,
}

impl TxLog {
    /// Opens (or creates) the log and verifies its schema version.
    ///
    /// On version mismatch a migration hook is consulted; with no
    /// applicable migration the log is refused with `schema_mismatch`.
    pub fn open(path: &Path) -> Result<TxLog> {
        let log = TxLog {
            path: path.to_path_buf(),
        };
        if !path.exists() {
            log.append(&TxRecord::Header {
                schema_version: TXLOG_SCHEMA_VERSION,
            })?;
            return Ok(log);
        }

        let text = fs::read_to_string(path)
            .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
        let first = text.lines().next().unwrap_or_default();
        let header: TxRecord = serde_json::from_str(first).map_err(|_| {
            DvojnikError::SchemaMismatch {
                found: "unrecognized log header".to_string(),
                expected: format!("schema_version {}", TXLOG_SCHEMA_VERSION),
            }
        })?;
        match header {
            TxRecord::Header { schema_version } if schema_version == TXLOG_SCHEMA_VERSION => {
                Ok(log)
            }
            TxRecord::Header { schema_version } => migrate(path, schema_version).map(|()| log),
            _ => Err(DvojnikError::SchemaMismatch {
                found: "missing log header".to_string(),
                expected: format!("schema_version {}", TXLOG_SCHEMA_VERSION),
            }),
        }
    }

    /// Appends a full transaction in `pending` state. Fsynced.
    pub fn append_open(&self, tx: &Transaction) -> Result<()> {
        debug_assert_eq!(tx.status, TxStatus::Pending);
        self.append(&TxRecord::Open(Box::new(tx.clone())))
    }

    /// Appends a status transition. Fsynced.
    pub fn append_status(
        &self,
        tx_id: TxId,
        status: TxStatus,
        note: Option<String>,
    ) -> Result<()> {
        self.append(&TxRecord::Status {
            tx_id,
            status,
            timestamp_ns: now_nanos(),
            note,
        })
    }

    /// Appends the record of an undo operation. Fsynced.
    pub fn append_undo(&self, undo_id: TxId, target: TxId) -> Result<()> {
        self.append(&TxRecord::Undo {
            undo_id,
            target,
            timestamp_ns: now_nanos(),
        })
    }

    fn append(&self, record: &TxRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        debug_assert!(!line.contains('\n'));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DvojnikError::from_io_with_path(Some(self.path.clone()), e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| DvojnikError::from_io_with_path(Some(self.path.clone()), e))?;
        file.write_all(b"\n")
            .map_err(|e| DvojnikError::from_io_with_path(Some(self.path.clone()), e))?;
        file.sync_all()
            .map_err(|e| DvojnikError::from_io_with_path(Some(self.path.clone()), e))?;
        Ok(())
    }

    /// Replays the log into the current state of every transaction.
    ///
    /// Status records settle their transaction; undo records append a
    /// note on their target. A torn final line (crash mid-append) is
    /// ignored; corruption elsewhere is an error.
    pub fn load(&self) -> Result<Vec<Transaction>> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| DvojnikError::from_io_with_path(Some(self.path.clone()), e))?;
        let lines: Vec<&str> = text.lines().collect();
        let mut transactions: Vec<Transaction> = Vec::new();
        let mut index: HashMap<TxId, usize> = HashMap::new();

        for (n, line) in lines.iter().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let record: TxRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) if n + 1 == lines.len() => {
                    log::warn!("ignoring torn final log line: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(DvojnikError::Internal {
                        message: format!("corrupt transaction log line {}: {}", n + 1, e),
                    });
                }
            };
            match record {
                TxRecord::Header { .. } => {}
                TxRecord::Open(tx) => {
                    index.insert(tx.tx_id, transactions.len());
                    transactions.push(*tx);
                }
                TxRecord::Status {
                    tx_id,
                    status,
                    note,
                    ..
                } => {
                    if let Some(&i) = index.get(&tx_id) {
                        transactions[i].status = status;
                        if let Some(note) = note {
                            transactions[i].notes.push(note);
                        }
                    } else {
                        log::warn!("status record for unknown transaction {}", tx_id);
                    }
                }
                TxRecord::Undo {
                    undo_id, target, ..
                } => {
                    if let Some(&i) = index.get(&target) {
                        transactions[i].notes.push(format!("undone by {}", undo_id));
                    }
                }
            }
        }
        Ok(transactions)
    }

    /// Transactions still `pending` after replay - crash leftovers.
    pub fn pending(&self) -> Result<Vec<Transaction>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|tx| tx.status == TxStatus::Pending)
            .collect())
    }

    /// True when a `partial` transaction blocks further merges.
    pub fn has_partial(&self) -> Result<Option<TxId>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|tx| tx.status == TxStatus::Partial)
            .map(|tx| tx.tx_id))
    }

    /// Most recent `committed` transaction, or the given one.
    pub fn find_committed(&self, tx_id: Option<TxId>) -> Result<Option<Transaction>> {
        let mut all = self.load()?;
        all.retain(|tx| tx.status == TxStatus::Committed);
        match tx_id {
            Some(id) => Ok(all.into_iter().find(|tx| tx.tx_id == id)),
            None => {
                all.sort_by_key(|tx| tx.timestamp_ns);
                Ok(all.pop())
            }
        }
    }

    /// Latest transaction state for one id.
    pub fn find(&self, tx_id: TxId) -> Result<Option<Transaction>> {
        Ok(self.load()?.into_iter().find(|tx| tx.tx_id == tx_id))
    }

    /// Newest-first listing, truncated to `window`.
    pub fn list(&self, window: usize) -> Result<Vec<Transaction>> {
        let mut all = self.load()?;
        all.sort_by(|x, y| y.timestamp_ns.cmp(&x.timestamp_ns));
        all.truncate(window);
        Ok(all)
    }

    /// Drops terminal transactions older than the retention window whose
    /// recycle payload no longer exists on disk. The log is rewritten
    /// atomically (temp file, fsync, rename).
    pub fn purge_older_than(&self, retention_days: u32) -> Result<usize> {
        let cutoff_ns = now_nanos() - i64::from(retention_days) * 86_400 * 1_000_000_000;
        let all = self.load()?;
        let keep: Vec<&Transaction> = all
            .iter()
            .filter(|tx| {
                let terminal = !matches!(tx.status, TxStatus::Pending | TxStatus::Partial);
                let expired = tx.timestamp_ns < cutoff_ns;
                let payload_present = tx
                    .losers
                    .iter()
                    .any(|l| l.recycle_path.exists());
                !(terminal && expired && !payload_present)
            })
            .collect();
        let purged = all.len() - keep.len();
        if purged == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("db.tmp");
        {
            let mut file = File::create(&tmp)
                .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
            let header = serde_json::to_string(&TxRecord::Header {
                schema_version: TXLOG_SCHEMA_VERSION,
            })?;
            writeln!(file, "{}", header)
                .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
            for tx in keep {
                // Rewritten transactions carry their settled status.
                let line = serde_json::to_string(&TxRecord::Open(Box::new((*tx).clone())))?;
                writeln!(file, "{}", line)
                    .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
            }
            file.sync_all()
                .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|e| DvojnikError::from_io_with_path(Some(self.path.clone()), e))?;
        log::info!("purged {} expired transactions from log", purged);
        Ok(purged)
    }
}

/// Migration hook for older log schemas. No migrations exist yet, so
/// any mismatch is refused.
fn migrate(_path: &Path, from_version: u32) -> Result<()> {
    Err(DvojnikError::SchemaMismatch {
        found: format!("schema_version {}", from_version),
        expected: format!("schema_version {}", TXLOG_SCHEMA_VERSION),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::test_support::sample_tx;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> TxLog {
        TxLog::open(&dir.path().join("txlog.db")).unwrap()
    }

    #[test]
    fn test_open_creates_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.db");
        TxLog::open(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\"record\":\"header\""));
        // Reopen succeeds on the same version.
        TxLog::open(&path).unwrap();
    }

    #[test]
    fn test_schema_mismatch_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("txlog.db");
        fs::write(&path, "{\"record\":\"header\",\"schema_version\":99}\n").unwrap();
        let err = TxLog::open(&path).unwrap_err();
        assert!(matches!(err, DvojnikError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_status_transitions_replay() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let tx = sample_tx(TxId(1), TxStatus::Pending);
        log.append_open(&tx).unwrap();

        assert_eq!(log.pending().unwrap().len(), 1);

        log.append_status(TxId(1), TxStatus::Committed, None).unwrap();
        assert!(log.pending().unwrap().is_empty());
        let committed = log.find_committed(None).unwrap().unwrap();
        assert_eq!(committed.tx_id, TxId(1));

        log.append_status(TxId(1), TxStatus::Undone, Some("user undo".to_string()))
            .unwrap();
        let found = log.find(TxId(1)).unwrap().unwrap();
        assert_eq!(found.status, TxStatus::Undone);
        assert_eq!(found.notes, vec!["user undo"]);
        assert!(log.find_committed(None).unwrap().is_none());
    }

    #[test]
    fn test_partial_blocks() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append_open(&sample_tx(TxId(5), TxStatus::Pending)).unwrap();
        assert!(log.has_partial().unwrap().is_none());
        log.append_status(TxId(5), TxStatus::Partial, None).unwrap();
        assert_eq!(log.has_partial().unwrap(), Some(TxId(5)));
    }

    #[test]
    fn test_torn_final_line_ignored() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append_open(&sample_tx(TxId(1), TxStatus::Pending)).unwrap();
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("txlog.db"))
            .unwrap();
        file.write_all(b"{\"record\":\"status\",\"tx_id\":\"trunc").unwrap();
        drop(file);

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, TxStatus::Pending);
    }

    #[test]
    fn test_undo_record_annotates_target() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append_open(&sample_tx(TxId(1), TxStatus::Pending)).unwrap();
        log.append_status(TxId(1), TxStatus::Committed, None).unwrap();
        log.append_undo(TxId(2), TxId(1)).unwrap();
        let found = log.find(TxId(1)).unwrap().unwrap();
        assert_eq!(found.notes, vec![format!("undone by {}", TxId(2))]);
    }

    #[test]
    fn test_list_window_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        for i in 1..=3u128 {
            let mut tx = sample_tx(TxId(i), TxStatus::Pending);
            tx.timestamp_ns = i as i64;
            log.append_open(&tx).unwrap();
        }
        let listed = log.list(2).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].tx_id, TxId(3));
        assert_eq!(listed[1].tx_id, TxId(2));
    }

    #[test]
    fn test_purge_drops_expired_without_payload() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let mut old = sample_tx(TxId(1), TxStatus::Pending);
        old.timestamp_ns = 0; // far in the past, recycle path missing
        log.append_open(&old).unwrap();
        log.append_status(TxId(1), TxStatus::Undone, None).unwrap();

        let fresh = sample_tx(TxId(2), TxStatus::Pending);
        log.append_open(&fresh).unwrap();
        log.append_status(TxId(2), TxStatus::Committed, None).unwrap();

        let purged = log.purge_older_than(7).unwrap();
        assert_eq!(purged, 1);
        let remaining = log.load().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tx_id, TxId(2));
        assert_eq!(remaining[0].status, TxStatus::Committed);
    }

    #[test]
    fn test_pending_never_purged() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let mut tx = sample_tx(TxId(1), TxStatus::Pending);
        tx.timestamp_ns = 0;
        log.append_open(&tx).unwrap();
        assert_eq!(log.purge_older_than(7).unwrap(), 0);
        assert_eq!(log.pending().unwrap().len(), 1);
    }
}
