//! Binlog writer: append-only, rotating, periodically-flushed log of every
//! visible mutation (`spec.md` §4.C "Writer contract" and "Rotation").
//!
//! The writer is intentionally synchronous — plain, lock-guarded state;
//! the file-service state machine
//! and the scheduler task call it through `spawn_blocking` so the network
//! loops never block on an fsync (`spec.md` §4.E applies the same
//! discipline to payload I/O).

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;

use super::record::BinlogRecord;

/// `binlog_index.dat`: tracks which binlog file is live and how far
/// compression has advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinlogIndex {
    pub current_write: u32,
    pub current_compress: u32,
}

impl BinlogIndex {
    pub fn encode(&self) -> String {
        format!("current_write={}\ncurrent_compress={}\n", self.current_write, self.current_compress)
    }

    pub fn decode(text: &str) -> BinlogIndex {
        let mut index = BinlogIndex::default();
        for line in text.lines() {
            if let Some((k, v)) = line.split_once('=') {
                match k {
                    "current_write" => index.current_write = v.parse().unwrap_or(0),
                    "current_compress" => index.current_compress = v.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
        index
    }

    fn path(sync_dir: &Path) -> PathBuf {
        sync_dir.join("binlog_index.dat")
    }

    pub fn read(sync_dir: &Path) -> Result<BinlogIndex> {
        match std::fs::read_to_string(Self::path(sync_dir)) {
            Ok(text) => Ok(BinlogIndex::decode(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BinlogIndex::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the index atomically (write-temp, rename) and fsyncs the
    /// containing directory afterward, closing the crash-safety gap noted
    /// in `spec.md` §9: without the directory fsync, a crash between
    /// rename and a later directory flush could leave the rename
    /// unobserved after power loss.
    pub fn write(&self, sync_dir: &Path) -> Result<()> {
        let final_path = Self::path(sync_dir);
        let tmp_path = sync_dir.join("binlog_index.dat.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(self.encode().as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        fsync_dir(sync_dir)?;
        Ok(())
    }
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn binlog_file_name(index: u32) -> String {
    format!("binlog.{index:03}")
}

struct OpenBinlog {
    file: File,
    index: u32,
    size: u64,
}

/// Append-only, rotating binlog writer. One instance per storage node (the
/// main binlog lives under `<base>/data/sync/`).
pub struct BinlogWriter {
    sync_dir: PathBuf,
    rotate_size: u64,
    buffer_limit: usize,
    state: Mutex<WriterState>,
    write_version: AtomicU64,
}

struct WriterState {
    buffer: Vec<u8>,
    current: OpenBinlog,
}

impl BinlogWriter {
    /// Opens (creating if necessary) the current binlog file described by
    /// `<sync_dir>/binlog_index.dat`.
    pub fn open(sync_dir: PathBuf, rotate_size: u64, buffer_limit: usize) -> Result<BinlogWriter> {
        std::fs::create_dir_all(&sync_dir)?;
        let index = BinlogIndex::read(&sync_dir)?;
        let path = sync_dir.join(binlog_file_name(index.current_write));
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(BinlogWriter {
            sync_dir,
            rotate_size,
            buffer_limit,
            state: Mutex::new(WriterState {
                buffer: Vec::with_capacity(buffer_limit),
                current: OpenBinlog { file, index: index.current_write, size },
            }),
            write_version: AtomicU64::new(0),
        })
    }

    /// Appends one record to the in-memory buffer, flushing immediately if
    /// the buffer would overflow (`spec.md` §4.C "Writer contract").
    pub fn append(&self, record: &BinlogRecord) -> Result<()> {
        let line = record.format();
        let mut state = self.state.lock().expect("binlog writer mutex poisoned");
        if state.buffer.len() + line.len() > self.buffer_limit {
            self.flush_locked(&mut state)?;
        }
        state.buffer.extend_from_slice(line.as_bytes());
        Ok(())
    }

    /// Flushes the write buffer to disk: `write` then `fsync`, rotating to
    /// a new file first if the write would cross `rotate_size`
    /// (`spec.md` §4.C "Rotation" and §8 boundary: rotate before appending
    /// the overflow record). Bumps `write_version` so readers can notice
    /// new data without re-reading the file.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().expect("binlog writer mutex poisoned");
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut WriterState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        if state.current.size + state.buffer.len() as u64 > self.rotate_size {
            self.rotate_locked(state)?;
        }

        state.current.file.write_all(&state.buffer)?;
        state.current.file.sync_all()?;
        state.current.size += state.buffer.len() as u64;
        state.buffer.clear();
        self.write_version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rotate_locked(&self, state: &mut WriterState) -> Result<()> {
        let next_index = state.current.index + 1;
        let path = self.sync_dir.join(binlog_file_name(next_index));
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;

        let mut index = BinlogIndex::read(&self.sync_dir)?;
        index.current_write = next_index;
        index.write(&self.sync_dir)?;

        state.current = OpenBinlog { file, index: next_index, size: 0 };
        Ok(())
    }

    pub fn current_index(&self) -> u32 {
        self.state.lock().expect("binlog writer mutex poisoned").current.index
    }

    pub fn current_offset(&self) -> u64 {
        let state = self.state.lock().expect("binlog writer mutex poisoned");
        state.current.size + state.buffer.len() as u64
    }

    pub fn write_version(&self) -> u64 {
        self.write_version.load(Ordering::SeqCst)
    }

    pub fn sync_dir(&self) -> &Path {
        &self.sync_dir
    }
}

/// Reads the full contents of a binlog file at `index`, flushing any
/// in-memory buffered bytes from `writer` first so the read observes the
/// latest data — used by tests and by the reader when it catches up to the
/// writer's current file.
pub fn read_binlog_file(sync_dir: &Path, index: u32) -> Result<Vec<u8>> {
    let path = sync_dir.join(binlog_file_name(index));
    Ok(std::fs::read(path)?)
}

/// Seeks to `offset` and reads the remaining bytes of binlog file `index`.
pub fn read_binlog_from(sync_dir: &Path, index: u32, offset: u64) -> Result<Vec<u8>> {
    let path = sync_dir.join(binlog_file_name(index));
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut file, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::record::Op;

    #[test]
    fn append_then_flush_is_visible_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 1024, 64).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "M00/00/00/a")).unwrap();
        writer.flush().unwrap();
        let bytes = read_binlog_file(dir.path(), 0).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "1 C M00/00/00/a\n");
    }

    #[test]
    fn overflowing_buffer_triggers_implicit_flush() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 1024, 8).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "aaaaaaaaaaaaaaaaaaaa")).unwrap();
        // The append above already overflowed the 8-byte buffer and flushed.
        assert!(writer.write_version() >= 1);
    }

    #[test]
    fn rotation_opens_a_new_file_and_bumps_index() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 10, 4096).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "0123456789012345")).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.current_index(), 1);
        let index = BinlogIndex::read(dir.path()).unwrap();
        assert_eq!(index.current_write, 1);
    }

    #[test]
    fn write_version_only_advances_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BinlogWriter::open(dir.path().to_path_buf(), 1024, 4096).unwrap();
        let before = writer.write_version();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "a")).unwrap();
        assert_eq!(writer.write_version(), before);
        writer.flush().unwrap();
        assert_eq!(writer.write_version(), before + 1);
    }
}
