//! Background binlog compression (`spec.md` §4.C "Compression").
//!
//! Periodically gzips binlog files strictly older than the minimum live
//! reader checkpoint, advancing `current_compress` in the index file. A
//! flag file prevents two concurrent decompressions/compressions of the
//! same binlog from racing.

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

use super::writer::BinlogIndex;

/// Computes the minimum binlog index across all live replication readers;
/// compression must never touch a file at or above this index
/// (`spec.md` §8 "Compression skips any binlog whose index is the minimum
/// live reader index").
pub fn min_live_reader_index(reader_indices: &[u32]) -> Option<u32> {
    reader_indices.iter().copied().min()
}

/// Runs one compression sweep: gzips every binlog file with
/// `current_compress <= index < min_live_reader_index`, deleting the
/// plaintext copy once the gzip is fsynced, and advances
/// `current_compress` accordingly.
pub fn compress_sweep(sync_dir: &Path, reader_indices: &[u32]) -> Result<u32> {
    let mut index = BinlogIndex::read(sync_dir)?;
    let Some(min_reader) = min_live_reader_index(reader_indices) else {
        return Ok(index.current_compress);
    };

    let mut compressed = 0;
    while index.current_compress < min_reader && index.current_compress < index.current_write {
        let candidate = index.current_compress;
        let plain_path = sync_dir.join(format!("binlog.{candidate:03}"));
        if !plain_path.exists() {
            index.current_compress += 1;
            continue;
        }

        let lock_path = sync_dir.join(format!("binlog.{candidate:03}.compressing"));
        if lock_path.exists() {
            break;
        }
        std::fs::File::create(&lock_path)?;

        let result = gzip_file(&plain_path);
        std::fs::remove_file(&lock_path)?;
        result?;

        std::fs::remove_file(&plain_path)?;
        index.current_compress += 1;
        compressed += 1;
    }

    if compressed > 0 {
        index.write(sync_dir)?;
    }
    Ok(index.current_compress)
}

fn gzip_file(plain_path: &Path) -> Result<()> {
    let mut gz_name = plain_path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = std::path::PathBuf::from(gz_name);

    let input = std::fs::read(plain_path)?;
    let output = std::fs::File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    encoder.write_all(&input)?;
    let output = encoder.finish()?;
    output.sync_all()?;
    Ok(())
}
