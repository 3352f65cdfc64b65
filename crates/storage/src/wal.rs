//! Write-Ahead Log (WAL) for durability.
//!
//! On-disk format, one entry per mutation:
//!
//! ```text
//! [4B entry_size (BE, excludes this header and the CRC)]
//! [1B op_type][8B timestamp (BE)]
//! [4B key_len (BE)][key bytes][4B val_len (BE)][val bytes]
//! [4B CRC32 (BE) over the record bytes]
//! ```
//!
//! Replay recovers the longest valid prefix: it stops at the first
//! truncated or CRC-corrupt entry and returns everything before it.

use parking_lot::Mutex;
use quorumkv_common::{OpType, Timestamp};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One replayed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub op: OpType,
    pub timestamp: Timestamp,
    pub key: String,
    pub value: String,
}

/// An append-only write-ahead log.
///
/// One mutex serializes appends and replays; the storage engine's map lock
/// is never held across WAL I/O.
#[derive(Debug)]
pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
    entries_written: AtomicU64,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        tracing::info!(path = %path.display(), "WAL opened");
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            entries_written: AtomicU64::new(0),
        })
    }

    /// Append one record and flush it to disk.
    ///
    /// Durability is best-effort: a short write or sync failure is logged
    /// but not surfaced; the next replay truncates at the damaged record.
    pub fn append(&self, op: OpType, key: &str, value: &str, ts: Timestamp) {
        let record = encode_record(op, key, value, ts);
        let crc = crc32fast::hash(&record);

        let mut blob = Vec::with_capacity(4 + record.len() + 4);
        blob.extend_from_slice(&(record.len() as u32).to_be_bytes());
        blob.extend_from_slice(&record);
        blob.extend_from_slice(&crc.to_be_bytes());

        let mut file = self.file.lock();
        if let Err(e) = file.write_all(&blob) {
            tracing::error!(path = %self.path.display(), "WAL append failed: {e}");
            return;
        }
        if let Err(e) = file.sync_data() {
            tracing::error!(path = %self.path.display(), "WAL sync failed: {e}");
        }
        self.entries_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Replay all valid entries from the start of the file.
    ///
    /// Stops at the first truncation or CRC mismatch and returns the entries
    /// that precede it. The file position is restored to end-of-file for
    /// future appends.
    pub fn replay(&self) -> Result<Vec<WalEntry>, WalError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut corrupted = false;
        {
            let mut reader = BufReader::new(&mut *file);
            loop {
                // Entry size header; clean EOF here ends the log.
                let mut size_buf = [0u8; 4];
                match read_exact_or_eof(&mut reader, &mut size_buf)? {
                    ReadOutcome::Full => {}
                    ReadOutcome::Eof => break,
                }
                let entry_size = u32::from_be_bytes(size_buf) as usize;

                let mut record = vec![0u8; entry_size];
                if read_exact_or_eof(&mut reader, &mut record)? == ReadOutcome::Eof {
                    tracing::warn!("WAL truncated record at entry {}", entries.len());
                    corrupted = true;
                    break;
                }

                let mut crc_buf = [0u8; 4];
                if read_exact_or_eof(&mut reader, &mut crc_buf)? == ReadOutcome::Eof {
                    tracing::warn!("WAL truncated CRC at entry {}", entries.len());
                    corrupted = true;
                    break;
                }
                let stored_crc = u32::from_be_bytes(crc_buf);

                let computed_crc = crc32fast::hash(&record);
                if computed_crc != stored_crc {
                    tracing::warn!(
                        "WAL CRC mismatch at entry {} (stored={stored_crc:#010x} computed={computed_crc:#010x})",
                        entries.len()
                    );
                    corrupted = true;
                    break;
                }

                match decode_record(&record) {
                    Some(entry) => entries.push(entry),
                    None => {
                        tracing::warn!("WAL unparseable record at entry {}", entries.len());
                        corrupted = true;
                        break;
                    }
                }
            }
        }

        file.seek(SeekFrom::End(0))?;

        tracing::info!(
            recovered = entries.len(),
            corrupted,
            "WAL replay complete"
        );
        Ok(entries)
    }

    /// Zero-length the file. Used only by external tooling, never by the
    /// normal write path.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        tracing::info!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Flush file contents to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    pub fn file_size(&self) -> u64 {
        self.file
            .lock()
            .metadata()
            .map(|m| m.len())
            .unwrap_or_default()
    }

    /// Number of entries appended since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Final flush on clean destruction.
        let _ = self.file.lock().sync_data();
    }
}

// ---------------------------------------------------------------------------
// Record encoding
// ---------------------------------------------------------------------------

fn encode_record(op: OpType, key: &str, value: &str, ts: Timestamp) -> Vec<u8> {
    let mut record = Vec::with_capacity(1 + 8 + 4 + key.len() + 4 + value.len());
    record.push(op as u8);
    record.extend_from_slice(&ts.to_be_bytes());
    record.extend_from_slice(&(key.len() as u32).to_be_bytes());
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(&(value.len() as u32).to_be_bytes());
    record.extend_from_slice(value.as_bytes());
    record
}

fn decode_record(record: &[u8]) -> Option<WalEntry> {
    let mut pos = 0usize;

    let op = OpType::try_from(*record.first()?).ok()?;
    pos += 1;

    let ts_bytes: [u8; 8] = record.get(pos..pos + 8)?.try_into().ok()?;
    let timestamp = u64::from_be_bytes(ts_bytes);
    pos += 8;

    let klen_bytes: [u8; 4] = record.get(pos..pos + 4)?.try_into().ok()?;
    let klen = u32::from_be_bytes(klen_bytes) as usize;
    pos += 4;
    let key = String::from_utf8(record.get(pos..pos + klen)?.to_vec()).ok()?;
    pos += klen;

    let vlen_bytes: [u8; 4] = record.get(pos..pos + 4)?.try_into().ok()?;
    let vlen = u32::from_be_bytes(vlen_bytes) as usize;
    pos += 4;
    let value = String::from_utf8(record.get(pos..pos + vlen)?.to_vec()).ok()?;

    Some(WalEntry {
        op,
        timestamp,
        key,
        value,
    })
}

#[derive(PartialEq, Eq)]
enum ReadOutcome {
    Full,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, WalError> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_wal(dir: &TempDir) -> Wal {
        Wal::open(&dir.path().join("wal.log")).unwrap()
    }

    #[test]
    fn test_append_and_replay_round_trip() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);

        wal.append(OpType::Put, "k1", "v1", 100);
        wal.append(OpType::Put, "k2", "v2", 200);
        wal.append(OpType::Delete, "k1", "", 300);
        assert_eq!(wal.entries_written(), 3);

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            WalEntry {
                op: OpType::Put,
                timestamp: 100,
                key: "k1".into(),
                value: "v1".into()
            }
        );
        assert_eq!(entries[2].op, OpType::Delete);
        assert_eq!(entries[2].value, "");
    }

    #[test]
    fn test_replay_empty_log() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn test_replay_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(OpType::Put, "durable", "yes", 42);
        }
        let wal = Wal::open(&path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "durable");
    }

    #[test]
    fn test_append_after_replay_goes_to_end() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);

        wal.append(OpType::Put, "a", "1", 1);
        assert_eq!(wal.replay().unwrap().len(), 1);

        // Replay must not clobber the append position.
        wal.append(OpType::Put, "b", "2", 2);
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].key, "b");
    }

    #[test]
    fn test_truncated_tail_recovers_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(OpType::Put, "k1", "v1", 1);
            wal.append(OpType::Put, "k2", "v2", 2);
            wal.append(OpType::Put, "k3", "v3", 3);
        }

        // Chop a few bytes off the last record.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 5).unwrap();

        let wal = Wal::open(&path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 2, "only the intact prefix is recovered");
        assert_eq!(entries[1].key, "k2");
    }

    #[test]
    fn test_corrupt_byte_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(OpType::Put, "k1", "v1", 1);
            wal.append(OpType::Put, "k2", "v2", 2);
        }

        // Flip one byte inside the second record's key.
        let mut raw = std::fs::read(&path).unwrap();
        let second_entry_offset = {
            let first_record_len =
                u32::from_be_bytes(raw[0..4].try_into().unwrap()) as usize;
            4 + first_record_len + 4
        };
        let target = second_entry_offset + 4 + 10; // inside op/ts/key of entry 2
        raw[target] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let wal = Wal::open(&path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "k1");
    }

    #[test]
    fn test_truncate_empties_log() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        wal.append(OpType::Put, "k", "v", 1);
        assert!(wal.file_size() > 0);

        wal.truncate().unwrap();
        assert_eq!(wal.file_size(), 0);
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn test_record_layout_is_stable() {
        // [1B op][8B ts][4B klen]["k"][4B vlen]["v"] = 19 bytes,
        // framed by a 4B size header and a 4B CRC.
        let record = encode_record(OpType::Put, "k", "v", 0x0102030405060708);
        assert_eq!(record.len(), 19);
        assert_eq!(record[0], OpType::Put as u8);
        assert_eq!(&record[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&record[9..13], &[0, 0, 0, 1]);
        assert_eq!(record[13], b'k');

        let decoded = decode_record(&record).unwrap();
        assert_eq!(decoded.key, "k");
        assert_eq!(decoded.value, "v");
        assert_eq!(decoded.timestamp, 0x0102030405060708);
    }

    #[test]
    fn test_crc_is_standard_reflected_polynomial() {
        // Reference check value for the 0xEDB88320 CRC-32.
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF43926);
    }
}
