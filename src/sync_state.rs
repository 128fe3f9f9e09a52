//! `storage_sync.dat` (`spec.md` §6 "Persisted state layout"): the
//! per-peer catch-up assignment a tracker hands back on
//! [`crate::tracker::JoinRequest`] (`spec.md` §4.F "Bootstrap"), persisted
//! so a restarted node does not re-ask the tracker "am I the sync source
//! for peer P" and risk a different answer mid-catch-up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::replication::SyncBootstrap;

/// One peer's persisted bootstrap assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSyncState {
    pub sync_src_id_is_us: bool,
    pub until_timestamp: u32,
}

impl From<PeerSyncState> for SyncBootstrap {
    fn from(state: PeerSyncState) -> SyncBootstrap {
        SyncBootstrap { sync_src_id_is_us: state.sync_src_id_is_us, until_timestamp: state.until_timestamp }
    }
}

/// All peers' bootstrap assignments, keyed by peer id. One file per
/// `sync/` directory, `key=value` text like `binlog_index.dat`.
#[derive(Debug, Clone, Default)]
pub struct SyncStateFile {
    entries: HashMap<String, PeerSyncState>,
}

impl SyncStateFile {
    fn path(sync_dir: &Path) -> PathBuf {
        sync_dir.join("storage_sync.dat")
    }

    pub fn load(sync_dir: &Path) -> Result<SyncStateFile> {
        let text = match std::fs::read_to_string(Self::path(sync_dir)) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(SyncStateFile::default()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = HashMap::new();
        for line in text.lines() {
            let Some((peer_id, rest)) = line.split_once('\t') else { continue };
            let mut sync_src_id_is_us = false;
            let mut until_timestamp = 0u32;
            for field in rest.split(',') {
                if let Some(v) = field.strip_prefix("src_is_us=") {
                    sync_src_id_is_us = v == "1";
                } else if let Some(v) = field.strip_prefix("until_ts=") {
                    until_timestamp = v.parse().unwrap_or(0);
                }
            }
            entries.insert(peer_id.to_string(), PeerSyncState { sync_src_id_is_us, until_timestamp });
        }
        Ok(SyncStateFile { entries })
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerSyncState> {
        self.entries.get(peer_id).copied()
    }

    /// Records `peer_id`'s assignment and atomically persists the whole
    /// file (write-temp, rename — same discipline as `binlog_index.dat`).
    pub fn set_and_save(&mut self, sync_dir: &Path, peer_id: &str, state: PeerSyncState) -> Result<()> {
        self.entries.insert(peer_id.to_string(), state);
        self.save(sync_dir)
    }

    fn save(&self, sync_dir: &Path) -> Result<()> {
        let mut text = String::new();
        for (peer_id, state) in &self.entries {
            text.push_str(peer_id);
            text.push('\t');
            text.push_str(&format!("src_is_us={},until_ts={}\n", state.sync_src_id_is_us as u8, state.until_timestamp));
        }
        let final_path = Self::path(sync_dir);
        let tmp_path = sync_dir.join("storage_sync.dat.tmp");
        std::fs::write(&tmp_path, text)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SyncStateFile::load(dir.path()).unwrap();
        assert!(file.get("p1").is_none());

        file.set_and_save(dir.path(), "p1", PeerSyncState { sync_src_id_is_us: true, until_timestamp: 1234 }).unwrap();

        let reloaded = SyncStateFile::load(dir.path()).unwrap();
        let state = reloaded.get("p1").unwrap();
        assert!(state.sync_src_id_is_us);
        assert_eq!(state.until_timestamp, 1234);
    }

    #[test]
    fn missing_peer_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = SyncStateFile::load(dir.path()).unwrap();
        assert!(file.get("nope").is_none());
    }
}
