//! Per-peer reader checkpoint ("mark file"), `spec.md` §3 "Reader Checkpoint".

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Durable replication-reader position for one peer.
///
/// Invariant: `(binlog_index, binlog_offset)` always points to a record
/// boundary — callers only ever advance it by whole record lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderCheckpoint {
    pub binlog_index: u32,
    pub binlog_offset: u64,
    pub need_sync_old: bool,
    pub sync_old_done: bool,
    pub until_timestamp: u32,
    pub scan_row_count: u64,
    pub sync_row_count: u64,
}

impl ReaderCheckpoint {
    /// Serializes to the simple `key=value` mark-file text format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut push = |k: &str, v: String| out.push_str(&format!("{k}={v}\n"));
        push("binlog_index", self.binlog_index.to_string());
        push("binlog_offset", self.binlog_offset.to_string());
        push("need_sync_old", (self.need_sync_old as u8).to_string());
        push("sync_old_done", (self.sync_old_done as u8).to_string());
        push("until_timestamp", self.until_timestamp.to_string());
        push("scan_row_count", self.scan_row_count.to_string());
        push("sync_row_count", self.sync_row_count.to_string());
        out
    }

    pub fn decode(text: &str) -> Result<ReaderCheckpoint> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            if let Some((k, v)) = line.split_once('=') {
                fields.insert(k, v);
            }
        }
        let get_u32 = |k: &str| fields.get(k).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
        let get_u64 = |k: &str| fields.get(k).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let get_bool = |k: &str| fields.get(k).map(|v| *v != "0").unwrap_or(false);

        Ok(ReaderCheckpoint {
            binlog_index: get_u32("binlog_index"),
            binlog_offset: get_u64("binlog_offset"),
            need_sync_old: get_bool("need_sync_old"),
            sync_old_done: get_bool("sync_old_done"),
            until_timestamp: get_u32("until_timestamp"),
            scan_row_count: get_u64("scan_row_count"),
            sync_row_count: get_u64("sync_row_count"),
        })
    }

    /// Atomically persists this checkpoint to `<sync_dir>/<peer_id>.mark`
    /// via write-temp-then-rename, matching the binlog index file's
    /// durability pattern (`spec.md` §4.C rotation).
    pub fn write_to(&self, sync_dir: &Path, peer_id: &str) -> Result<()> {
        let final_path = mark_file_path(sync_dir, peer_id);
        let tmp_path = final_path.with_extension("mark.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(self.encode().as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn read_from(sync_dir: &Path, peer_id: &str) -> Result<ReaderCheckpoint> {
        let path = mark_file_path(sync_dir, peer_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => ReaderCheckpoint::decode(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ReaderCheckpoint::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn mark_file_path(sync_dir: &Path, peer_id: &str) -> PathBuf {
    sync_dir.join(format!("{peer_id}.mark"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let checkpoint = ReaderCheckpoint {
            binlog_index: 3,
            binlog_offset: 4096,
            need_sync_old: true,
            sync_old_done: false,
            until_timestamp: 1_700_000_000,
            scan_row_count: 10,
            sync_row_count: 9,
        };
        let decoded = ReaderCheckpoint::decode(&checkpoint.encode()).unwrap();
        assert_eq!(checkpoint, decoded);
    }

    #[test]
    fn missing_mark_file_yields_default_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = ReaderCheckpoint::read_from(dir.path(), "peer-1").unwrap();
        assert_eq!(checkpoint, ReaderCheckpoint::default());
    }

    #[test]
    fn write_then_read_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = ReaderCheckpoint { binlog_index: 5, binlog_offset: 128, ..Default::default() };
        checkpoint.write_to(dir.path(), "peer-2").unwrap();
        let reread = ReaderCheckpoint::read_from(dir.path(), "peer-2").unwrap();
        assert_eq!(reread, checkpoint);
    }
}
