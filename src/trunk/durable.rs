//! Durable trunk-binlog file: a separate append-only stream from the main
//! binlog (`spec.md` §4.B "Durability" — "Every allocation and free appends
//! a trunk-binlog record (separate stream from the main binlog)"),
//! replayed by [`super::TrunkAllocator::open`] on restart.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, StorageError};

use super::TrunkBinlogRecord;

/// An open, append-only handle to a trunk-binlog file. Every `append` does
/// a `write` then `fsync`, matching the durability the main binlog gives
/// its own writer (`spec.md` §4.C "Writer contract").
pub struct TrunkBinlogFile {
    file: Mutex<File>,
}

impl TrunkBinlogFile {
    pub fn open(path: &Path) -> Result<TrunkBinlogFile> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(TrunkBinlogFile { file: Mutex::new(file) })
    }

    /// Appends one record. A write or fsync failure here is fatal
    /// (`spec.md` §7 "Fatal ... trunk-binlog write fails").
    pub fn append(&self, record: &TrunkBinlogRecord) -> Result<()> {
        let mut file = self.file.lock().expect("trunk-binlog file mutex poisoned");
        file.write_all(record.encode().as_bytes()).map_err(|err| StorageError::Fatal(format!("trunk-binlog append failed: {err}")))?;
        file.sync_all().map_err(|err| StorageError::Fatal(format!("trunk-binlog fsync failed: {err}")))?;
        Ok(())
    }
}

/// Reads every record previously appended to a trunk-binlog file, in order.
/// A missing file (first run) yields an empty list.
pub fn read_all(path: &Path) -> Result<Vec<TrunkBinlogRecord>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    text.lines().map(TrunkBinlogRecord::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunk_binlog.dat");
        let file = TrunkBinlogFile::open(&path).unwrap();
        file.append(&TrunkBinlogRecord::NewTrunk { trunk_id: 1, size: 1024 }).unwrap();
        file.append(&TrunkBinlogRecord::Alloc { trunk_id: 1, offset: 0, length: 256 }).unwrap();
        file.append(&TrunkBinlogRecord::Free { trunk_id: 1, offset: 0, length: 256 }).unwrap();

        let records = read_all(&path).unwrap();
        assert_eq!(
            records,
            vec![
                TrunkBinlogRecord::NewTrunk { trunk_id: 1, size: 1024 },
                TrunkBinlogRecord::Alloc { trunk_id: 1, offset: 0, length: 256 },
                TrunkBinlogRecord::Free { trunk_id: 1, offset: 0, length: 256 },
            ]
        );
    }

    #[test]
    fn reading_a_missing_file_yields_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.dat");
        assert!(read_all(&path).unwrap().is_empty());
    }

    #[test]
    fn appends_survive_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunk_binlog.dat");
        {
            let file = TrunkBinlogFile::open(&path).unwrap();
            file.append(&TrunkBinlogRecord::NewTrunk { trunk_id: 7, size: 64 }).unwrap();
        }
        let file = TrunkBinlogFile::open(&path).unwrap();
        file.append(&TrunkBinlogRecord::Alloc { trunk_id: 7, offset: 0, length: 16 }).unwrap();
        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
    }
}
