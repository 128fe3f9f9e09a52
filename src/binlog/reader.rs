//! Binlog reader: tails the writer's output for one peer, rolling across
//! rotated (and possibly gzip-compressed) files (`spec.md` §4.C "Reader
//! contract").

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::{Result, StorageError};

use super::record::BinlogRecord;
use super::writer::{read_binlog_from, BinlogIndex};

/// Sentinel returned by [`BinlogReader::read_next`] when the reader has
/// caught up to the writer and there is nothing left to read yet
/// (`spec.md` §4.C: "ENOENT is returned when the reader's position equals
/// the live writer's position"). The caller sleeps and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enoent;

/// Tails binlog files on behalf of one peer (or the trunk-binlog, the
/// recovery binlog, etc.), maintaining a byte buffer and current file
/// position.
pub struct BinlogReader {
    sync_dir: PathBuf,
    index: u32,
    offset: u64,
    buffer: Vec<u8>,
}

impl BinlogReader {
    pub fn new(sync_dir: PathBuf, index: u32, offset: u64) -> BinlogReader {
        BinlogReader { sync_dir, index, offset, buffer: Vec::new() }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next complete record, rolling to the following binlog
    /// file (transparently decompressing a `.gz` tail file if that's all
    /// that remains) when the current file is exhausted but is not the
    /// live writer's file.
    ///
    /// Returns `Ok(None)` (ENOENT) when `self.index == current_write_index`
    /// and the buffer has no complete line left.
    pub fn read_next(&mut self, current_write_index: u32) -> Result<Option<BinlogRecord>> {
        loop {
            if let Some(pos) = find_newline(&self.buffer) {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let consumed = line.len() as u64;
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                self.offset += consumed;
                return Ok(Some(BinlogRecord::parse(&text)?));
            }

            let refilled = self.refill()?;
            if refilled {
                continue;
            }

            if self.index < current_write_index {
                self.roll_to_next_file()?;
                continue;
            }

            return Ok(None);
        }
    }

    fn refill(&mut self) -> Result<bool> {
        let fresh = read_current_file_tail(&self.sync_dir, self.index, self.offset + self.buffer.len() as u64)?;
        if fresh.is_empty() {
            return Ok(false);
        }
        self.buffer.extend_from_slice(&fresh);
        Ok(true)
    }

    fn roll_to_next_file(&mut self) -> Result<()> {
        self.index += 1;
        self.offset = 0;
        self.buffer.clear();
        Ok(())
    }

    /// Persists this reader's position into a [`super::checkpoint::ReaderCheckpoint`]
    /// snapshot, for callers that own the rest of the checkpoint fields
    /// (`need_sync_old`, row counts, ...).
    pub fn position(&self) -> (u32, u64) {
        (self.index, self.offset)
    }

    /// Rewinds the cursor to an earlier `(index, offset)`, discarding any
    /// buffered bytes read past that point. Used to re-issue a batch whose
    /// replication send failed partway through (`spec.md` §4.F step 6
    /// "rewind the reader to the earliest failing record's offset").
    pub fn seek(&mut self, index: u32, offset: u64) {
        self.index = index;
        self.offset = offset;
        self.buffer.clear();
    }
}

/// Reads whatever new bytes exist past `offset` in binlog file `index`,
/// transparently decompressing `binlog.NNN.gz` if the plain file is gone
/// (`spec.md` §4.C compression interaction).
fn read_current_file_tail(sync_dir: &Path, index: u32, offset: u64) -> Result<Vec<u8>> {
    match read_binlog_from(sync_dir, index, offset) {
        Ok(bytes) => Ok(bytes),
        Err(StorageError::NotFound) => read_gz_tail(sync_dir, index, offset),
        Err(err) => Err(err),
    }
}

fn read_gz_tail(sync_dir: &Path, index: u32, offset: u64) -> Result<Vec<u8>> {
    let gz_path = sync_dir.join(format!("binlog.{index:03}.gz"));
    let file = match std::fs::File::open(&gz_path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut decoder = GzDecoder::new(file);
    let mut whole = Vec::new();
    decoder.read_to_end(&mut whole)?;
    if offset as usize >= whole.len() {
        return Ok(Vec::new());
    }
    Ok(whole[offset as usize..].to_vec())
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n')
}

/// Live writer position a reader compares itself against.
pub fn current_write_index(sync_dir: &Path) -> Result<u32> {
    Ok(BinlogIndex::read(sync_dir)?.current_write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::record::Op;
    use crate::binlog::writer::BinlogWriter;

    #[test]
    fn reads_records_appended_after_construction() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 1024, 4096).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "a")).unwrap();
        writer.flush().unwrap();

        let mut reader = BinlogReader::new(dir.path().to_path_buf(), 0, 0);
        let record = reader.read_next(writer.current_index()).unwrap().unwrap();
        assert_eq!(record.filename, "a");
    }

    #[test]
    fn returns_enoent_when_caught_up() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 1024, 4096).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "a")).unwrap();
        writer.flush().unwrap();

        let mut reader = BinlogReader::new(dir.path().to_path_buf(), 0, 0);
        reader.read_next(writer.current_index()).unwrap();
        assert!(reader.read_next(writer.current_index()).unwrap().is_none());
    }

    #[test]
    fn checkpoint_position_points_at_a_record_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 1024, 4096).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "a")).unwrap();
        writer.append(&BinlogRecord::new(2, Op::SourceCreate, "b")).unwrap();
        writer.flush().unwrap();

        let mut reader = BinlogReader::new(dir.path().to_path_buf(), 0, 0);
        reader.read_next(writer.current_index()).unwrap();
        let (index, offset) = reader.position();

        let mut fresh = BinlogReader::new(dir.path().to_path_buf(), index, offset);
        let record = fresh.read_next(writer.current_index()).unwrap().unwrap();
        assert_eq!(record.filename, "b");
    }

    #[test]
    fn seek_rewinds_past_buffered_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 1024, 4096).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "a")).unwrap();
        writer.append(&BinlogRecord::new(2, Op::SourceCreate, "b")).unwrap();
        writer.flush().unwrap();

        let mut reader = BinlogReader::new(dir.path().to_path_buf(), 0, 0);
        reader.read_next(writer.current_index()).unwrap();
        let (index, offset) = reader.position();
        reader.read_next(writer.current_index()).unwrap();

        reader.seek(index, offset);
        let record = reader.read_next(writer.current_index()).unwrap().unwrap();
        assert_eq!(record.filename, "b");
    }

    #[test]
    fn rolls_across_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 5, 4096).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "first")).unwrap();
        writer.flush().unwrap();
        writer.append(&BinlogRecord::new(2, Op::SourceCreate, "second")).unwrap();
        writer.flush().unwrap();
        assert!(writer.current_index() >= 1);

        let mut reader = BinlogReader::new(dir.path().to_path_buf(), 0, 0);
        let first = reader.read_next(writer.current_index()).unwrap().unwrap();
        assert_eq!(first.filename, "first");
        let second = reader.read_next(writer.current_index()).unwrap().unwrap();
        assert_eq!(second.filename, "second");
    }
}
