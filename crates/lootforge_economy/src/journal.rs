//! # Payout Journal
//!
//! Crash-safe record of every payout and refund the engine commits.
//!
//! A payout is journaled as a transaction: `Begin`, one `Operation`, then
//! `Commit` once the asset transfer went through. A transfer that fails
//! leaves a `Rollback`. On restart [`OpenJournal::replay`] returns the
//! committed operations only; transactions with neither `Commit` nor
//! `Rollback` are reported as in doubt.
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "LFJL"]
//! [4 bytes: version]
//! [8 bytes: reserved, zero]
//!
//! Record format:
//! [8 bytes: LSN]
//! [1 byte: record type (BEGIN/OP/COMMIT/ROLLBACK)]
//! [4 bytes: payload length]
//! [N bytes: payload]
//! [4 bytes: CRC32 of above]
//! ```
//!
//! `Operation`, `Commit` and `Rollback` payloads start with the 8-byte LSN
//! of the transaction's `Begin` record.

use alloy_primitives::{Address, U256};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::asset::{BoxId, RequestId, TicketId};
use crate::error::{LootBoxError, LootBoxResult};

const JOURNAL_MAGIC: &[u8; 4] = b"LFJL";
const JOURNAL_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;

/// Journal record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Start of a transaction.
    Begin = 1,
    /// An operation within a transaction.
    Operation = 2,
    /// The transaction took effect.
    Commit = 3,
    /// The transaction was abandoned.
    Rollback = 4,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Operation),
            3 => Some(Self::Commit),
            4 => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// Operations the engine journals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalOp {
    /// A reward left the vault.
    Payout {
        /// Fulfilled request.
        request_id: RequestId,
        /// Recipient.
        caller: Address,
        /// Box opened.
        box_id: BoxId,
        /// Index of the reward paid.
        reward_index: u64,
        /// Ticket issued for the open.
        ticket_id: TicketId,
    },
    /// A payment was made claimable again.
    Refund {
        /// Refunded request.
        request_id: RequestId,
        /// Address credited.
        caller: Address,
        /// Amount credited.
        amount: U256,
    },
}

impl JournalOp {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(69);

        match self {
            Self::Payout { request_id, caller, box_id, reward_index, ticket_id } => {
                buf.push(1);
                buf.extend_from_slice(&request_id.to_le_bytes());
                buf.extend_from_slice(caller.as_slice());
                buf.extend_from_slice(&box_id.to_le_bytes());
                buf.extend_from_slice(&reward_index.to_le_bytes());
                buf.extend_from_slice(&ticket_id.to_le_bytes());
            }
            Self::Refund { request_id, caller, amount } => {
                buf.push(2);
                buf.extend_from_slice(&request_id.to_le_bytes());
                buf.extend_from_slice(caller.as_slice());
                buf.extend_from_slice(&amount.to_be_bytes::<32>());
            }
        }

        buf
    }

    fn deserialize(data: &[u8]) -> Option<Self> {
        let (&tag, rest) = data.split_first()?;
        let u64_at = |at: usize| -> Option<u64> {
            Some(u64::from_le_bytes(rest.get(at..at + 8)?.try_into().ok()?))
        };
        let address_at = |at: usize| -> Option<Address> {
            Some(Address::from_slice(rest.get(at..at + 20)?))
        };

        match tag {
            1 if rest.len() == 52 => Some(Self::Payout {
                request_id: u64_at(0)?,
                caller: address_at(8)?,
                box_id: u64_at(28)?,
                reward_index: u64_at(36)?,
                ticket_id: u64_at(44)?,
            }),
            2 if rest.len() == 60 => Some(Self::Refund {
                request_id: u64_at(0)?,
                caller: address_at(8)?,
                amount: U256::from_be_slice(rest.get(28..60)?),
            }),
            _ => None,
        }
    }
}

/// A record as read back from disk.
#[derive(Clone, Debug)]
struct JournalRecord {
    lsn: u64,
    record_type: RecordType,
    payload: Vec<u8>,
}

/// Result of reading a journal file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JournalRecovery {
    /// Committed operations in commit order.
    pub committed: Vec<JournalOp>,
    /// Transactions with neither `Commit` nor `Rollback`.
    pub in_doubt: usize,
    /// LSN the next record will get.
    pub next_lsn: u64,
    /// Length of the readable prefix of the file.
    valid_len: u64,
}

/// Transaction handle grouping the records of one payout or refund.
///
/// Dropping an unfinished transaction writes a `Rollback` record.
pub struct Transaction<'a> {
    journal: &'a OpenJournal,
    /// LSN of the `Begin` record.
    pub txn_id: u64,
    operations: Vec<JournalOp>,
    finalized: bool,
}

impl Transaction<'_> {
    /// Appends an operation to the transaction.
    ///
    /// # Errors
    ///
    /// `Journal` on write failure.
    pub fn add_operation(&mut self, op: JournalOp) -> LootBoxResult<()> {
        let mut payload = self.txn_id.to_le_bytes().to_vec();
        payload.extend_from_slice(&op.serialize());
        self.journal.write_record(RecordType::Operation, &payload)?;
        self.operations.push(op);
        Ok(())
    }

    /// Commits and syncs the transaction, returning its operations.
    ///
    /// # Errors
    ///
    /// `Journal` on write or sync failure.
    pub fn commit(mut self) -> LootBoxResult<Vec<JournalOp>> {
        self.journal
            .write_record(RecordType::Commit, &self.txn_id.to_le_bytes())?;
        self.journal.sync()?;
        self.finalized = true;
        Ok(std::mem::take(&mut self.operations))
    }

    /// Abandons the transaction.
    ///
    /// # Errors
    ///
    /// `Journal` on write failure.
    pub fn rollback(mut self) -> LootBoxResult<()> {
        self.finalized = true;
        self.journal
            .write_record(RecordType::Rollback, &self.txn_id.to_le_bytes())?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self
                .journal
                .write_record(RecordType::Rollback, &self.txn_id.to_le_bytes());
        }
    }
}

/// An open journal file accepting new transactions.
pub struct OpenJournal {
    path: PathBuf,
    current_lsn: AtomicU64,
    file: Mutex<BufWriter<File>>,
}

impl std::fmt::Debug for OpenJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenJournal")
            .field("path", &self.path)
            .field("current_lsn", &self.current_lsn.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn io_err(context: &str) -> impl FnOnce(std::io::Error) -> LootBoxError + '_ {
    move |e| LootBoxError::Journal(format!("{context}: {e}"))
}

impl OpenJournal {
    /// Opens or creates a journal file and positions it for appending.
    ///
    /// Existing content is replayed first; a torn record at the tail is
    /// cut off so new records stay readable.
    ///
    /// # Errors
    ///
    /// `Journal` if the file cannot be opened or has a bad header.
    pub fn open(path: impl AsRef<Path>) -> LootBoxResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err("failed to open journal"))?;
        let len = file
            .metadata()
            .map_err(io_err("failed to read journal metadata"))?
            .len();

        let mut next_lsn = 0;
        if len == 0 {
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            header.extend_from_slice(JOURNAL_MAGIC);
            header.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
            header.extend_from_slice(&0u64.to_le_bytes());
            (&file)
                .write_all(&header)
                .map_err(io_err("failed to write journal header"))?;
            file.sync_all().map_err(io_err("failed to sync journal"))?;
        } else {
            let recovery = Self::replay(&path)?;
            if recovery.valid_len < len {
                warn!(
                    path = %path.display(),
                    dropped_bytes = len - recovery.valid_len,
                    "truncating torn journal tail"
                );
                file.set_len(recovery.valid_len)
                    .map_err(io_err("failed to truncate journal"))?;
            }
            next_lsn = recovery.next_lsn;
        }

        info!(path = %path.display(), next_lsn, "payout journal opened");

        Ok(Self {
            path,
            current_lsn: AtomicU64::new(next_lsn),
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begins a new transaction.
    ///
    /// # Errors
    ///
    /// `Journal` on write failure.
    pub fn begin(&self) -> LootBoxResult<Transaction<'_>> {
        let txn_id = self.write_record(RecordType::Begin, &[])?;
        Ok(Transaction {
            journal: self,
            txn_id,
            operations: Vec::new(),
            finalized: false,
        })
    }

    /// Journals a single operation as its own committed transaction.
    ///
    /// # Errors
    ///
    /// `Journal` on write or sync failure.
    pub fn append_committed(&self, op: JournalOp) -> LootBoxResult<()> {
        let mut txn = self.begin()?;
        txn.add_operation(op)?;
        txn.commit().map(|_| ())
    }

    fn write_record(&self, record_type: RecordType, payload: &[u8]) -> LootBoxResult<u64> {
        let mut file = self.file.lock();
        let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);
        let len = u32::try_from(payload.len())
            .map_err(|_| LootBoxError::Journal("record payload too large".to_string()))?;

        let mut frame = Vec::with_capacity(8 + 1 + 4 + payload.len() + 4);
        frame.extend_from_slice(&lsn.to_le_bytes());
        frame.push(record_type as u8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        file.write_all(&frame).map_err(io_err("journal write failed"))?;
        Ok(lsn)
    }

    fn sync(&self) -> LootBoxResult<()> {
        let mut file = self.file.lock();
        file.flush().map_err(io_err("journal flush failed"))?;
        file.get_ref()
            .sync_all()
            .map_err(io_err("journal sync failed"))
    }

    /// Reads a journal file and returns its committed operations.
    ///
    /// Reading stops at the first record that is truncated or fails its
    /// CRC check.
    ///
    /// # Errors
    ///
    /// `Journal` if the file cannot be read or has a bad header.
    pub fn replay(path: impl AsRef<Path>) -> LootBoxResult<JournalRecovery> {
        let file = File::open(path.as_ref()).map_err(io_err("failed to open journal for replay"))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut header)
            .map_err(io_err("failed to read journal header"))?;
        if &header[0..4] != JOURNAL_MAGIC {
            return Err(LootBoxError::Journal("invalid journal magic".to_string()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&header[4..8]);
        let version = u32::from_le_bytes(version);
        if version != JOURNAL_VERSION {
            return Err(LootBoxError::Journal(format!(
                "unsupported journal version: {version}"
            )));
        }

        let mut open: BTreeMap<u64, Vec<JournalOp>> = BTreeMap::new();
        let mut recovery = JournalRecovery {
            valid_len: HEADER_LEN,
            ..JournalRecovery::default()
        };

        while let Some((record, size)) = Self::read_record(&mut reader) {
            recovery.valid_len += size;
            recovery.next_lsn = recovery.next_lsn.max(record.lsn + 1);

            let txn_id = || -> Option<u64> {
                Some(u64::from_le_bytes(record.payload.get(0..8)?.try_into().ok()?))
            };

            match record.record_type {
                RecordType::Begin => {
                    open.insert(record.lsn, Vec::new());
                }
                RecordType::Operation => {
                    let op = record.payload.get(8..).and_then(JournalOp::deserialize);
                    if let (Some(txn), Some(op)) = (txn_id(), op) {
                        if let Some(ops) = open.get_mut(&txn) {
                            ops.push(op);
                        }
                    }
                }
                RecordType::Commit => {
                    if let Some(ops) = txn_id().and_then(|txn| open.remove(&txn)) {
                        recovery.committed.extend(ops);
                    }
                }
                RecordType::Rollback => {
                    if let Some(txn) = txn_id() {
                        open.remove(&txn);
                    }
                }
            }
        }

        recovery.in_doubt = open.len();
        if recovery.in_doubt > 0 {
            warn!(in_doubt = recovery.in_doubt, "journal has unfinished transactions");
        }

        Ok(recovery)
    }

    /// Reads one record and its on-disk size, or `None` at a bad or missing record.
    fn read_record(reader: &mut impl Read) -> Option<(JournalRecord, u64)> {
        let mut head = [0u8; 13];
        reader.read_exact(&mut head).ok()?;

        let lsn = u64::from_le_bytes(head[0..8].try_into().ok()?);
        let record_type = RecordType::from_u8(head[8])?;
        let payload_len = u32::from_le_bytes(head[9..13].try_into().ok()?) as usize;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).ok()?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes).ok()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            return None;
        }

        let size = (head.len() + payload_len + crc_bytes.len()) as u64;
        Some((
            JournalRecord {
                lsn,
                record_type,
                payload,
            },
            size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_journal_path() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_journal_{id}_{:?}.lfj", std::thread::current().id()))
    }

    fn payout(request_id: u64) -> JournalOp {
        JournalOp::Payout {
            request_id,
            caller: Address::repeat_byte(0x42),
            box_id: 3,
            reward_index: 1,
            ticket_id: request_id + 100,
        }
    }

    #[test]
    fn test_journal_create_and_open() {
        let path = temp_journal_path();
        {
            let journal = OpenJournal::open(&path).unwrap();
            assert_eq!(journal.path(), path.as_path());
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_LEN);
        assert_eq!(OpenJournal::replay(&path).unwrap().committed, vec![]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_replay_returns_committed_only() {
        let path = temp_journal_path();
        {
            let journal = OpenJournal::open(&path).unwrap();

            let mut committed = journal.begin().unwrap();
            committed.add_operation(payout(1)).unwrap();
            assert_eq!(committed.commit().unwrap(), vec![payout(1)]);

            let mut rolled_back = journal.begin().unwrap();
            rolled_back.add_operation(payout(2)).unwrap();
            rolled_back.rollback().unwrap();

            let mut dropped = journal.begin().unwrap();
            dropped.add_operation(payout(3)).unwrap();
        }

        let recovery = OpenJournal::replay(&path).unwrap();
        assert_eq!(recovery.committed, vec![payout(1)]);
        assert_eq!(recovery.in_doubt, 0);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_interleaved_transactions_commit_independently() {
        let path = temp_journal_path();
        {
            let journal = OpenJournal::open(&path).unwrap();
            let mut a = journal.begin().unwrap();
            let mut b = journal.begin().unwrap();
            a.add_operation(payout(10)).unwrap();
            b.add_operation(payout(20)).unwrap();
            b.commit().unwrap();
            a.rollback().unwrap();
        }

        let recovery = OpenJournal::replay(&path).unwrap();
        assert_eq!(recovery.committed, vec![payout(20)]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_refund_round_trips_through_disk() {
        let path = temp_journal_path();
        let refund = JournalOp::Refund {
            request_id: 8,
            caller: Address::repeat_byte(0x07),
            amount: U256::MAX - U256::from(5u64),
        };
        {
            let journal = OpenJournal::open(&path).unwrap();
            journal.append_committed(refund.clone()).unwrap();
        }
        assert_eq!(OpenJournal::replay(&path).unwrap().committed, vec![refund]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reopen_continues_lsn_and_keeps_history() {
        let path = temp_journal_path();
        {
            let journal = OpenJournal::open(&path).unwrap();
            journal.append_committed(payout(1)).unwrap();
        }
        {
            let journal = OpenJournal::open(&path).unwrap();
            assert_eq!(journal.current_lsn.load(Ordering::SeqCst), 3);
            journal.append_committed(payout(2)).unwrap();
        }

        let recovery = OpenJournal::replay(&path).unwrap();
        assert_eq!(recovery.committed, vec![payout(1), payout(2)]);
        assert_eq!(recovery.next_lsn, 6);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_torn_tail_is_ignored_and_truncated() {
        let path = temp_journal_path();
        {
            let journal = OpenJournal::open(&path).unwrap();
            journal.append_committed(payout(1)).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB; 7]).unwrap();
        }

        assert_eq!(OpenJournal::replay(&path).unwrap().committed, vec![payout(1)]);
        {
            let journal = OpenJournal::open(&path).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            journal.append_committed(payout(2)).unwrap();
        }
        assert_eq!(
            OpenJournal::replay(&path).unwrap().committed,
            vec![payout(1), payout(2)]
        );
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_in_doubt_transactions_are_counted() {
        let path = temp_journal_path();
        {
            let journal = OpenJournal::open(&path).unwrap();
            let mut txn = journal.begin().unwrap();
            txn.add_operation(payout(1)).unwrap();
            // simulate a crash: no Commit and no Rollback reaches the file
            std::mem::forget(txn);
            journal.sync().unwrap();
        }

        let recovery = OpenJournal::replay(&path).unwrap();
        assert!(recovery.committed.is_empty());
        assert_eq!(recovery.in_doubt, 1);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let path = temp_journal_path();
        fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        assert!(matches!(OpenJournal::replay(&path), Err(LootBoxError::Journal(_))));
        assert!(OpenJournal::open(&path).is_err());
        fs::remove_file(&path).ok();
    }
}
