//! Storage node configuration.
//!
//! Settings are read from a TOML file (the Rust-native analogue of
//! `storage.conf`) into [`StorageConfig`]. Launching a daemon, parsing a
//! non-TOML config grammar, and signal-driven reload are out of scope
//! (`spec.md` §1); this module only owns the typed settings every other
//! subsystem reads from.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line entry point for a storage node process.
#[derive(Debug, Parser)]
#[command(name = "fastdfs-storaged", about = "FastDFS storage node")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "storage.toml")]
    pub config: PathBuf,

    /// Overrides the configured log level (e.g. `debug`, `info`, `warn`).
    #[arg(long)]
    pub log_level: Option<String>,

    /// This node's id in the peer table and replication protocol.
    /// Defaults to the bind address when unset.
    #[arg(long)]
    pub id: Option<String>,
}

/// How a write picks which store path receives a new file (`spec.md` §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSelectionMode {
    /// Rotate through store paths in round-robin order.
    RoundRobin,
    /// Pick the store path with the most free megabytes above the reserve.
    LoadBalance,
}

impl Default for PathSelectionMode {
    fn default() -> Self {
        PathSelectionMode::RoundRobin
    }
}

/// Top-level storage node configuration, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// This node's group name.
    pub group_name: String,
    /// Local listen address for the storage wire protocol.
    pub bind_addr: String,
    /// One base directory per local disk/volume; `store_paths[0]` also
    /// owns the `sync/` binlog subtree.
    pub store_paths: Vec<PathBuf>,
    /// How a path is picked for a new upload.
    pub path_selection_mode: PathSelectionMode,
    /// Reserved megabytes per path below which it is never selected for
    /// writes in `LOAD_BALANCE` mode.
    pub reserved_storage_mb: u64,
    /// Writes at or above this size always bypass the trunk allocator.
    pub slot_max_size: u64,
    /// Smallest trunk slot the allocator will hand out.
    pub slot_min_size: u64,
    /// Trunk slot sizes are rounded up to a multiple of this alignment.
    /// When greater than `slot_min_size` it takes precedence (`spec.md` §9).
    pub trunk_alloc_alignment_size: u64,
    /// Size of a pre-allocated trunk file.
    pub trunk_file_size: u64,
    /// Whether adjacent freed trunk extents are merged.
    pub trunk_free_space_merge: bool,
    /// Whether a fully-freed trunk file is scheduled for deletion.
    pub delete_unused_trunk_files: bool,
    /// Whether the trunk allocator rebuilds its free map from the
    /// trunk-binlog on restart instead of (or in addition to) scanning.
    pub trunk_init_reload_from_binlog: bool,
    /// fsync a trunk/standalone file after this many bytes have been
    /// written without one; `0` disables the byte-count trigger.
    pub fsync_after_written_bytes: u64,
    /// In-memory binlog write buffer size, bytes.
    pub binlog_buffer_size: usize,
    /// Binlog flush interval when the buffer has not overflowed.
    #[serde(with = "duration_secs")]
    pub sync_binlog_buff_interval: Duration,
    /// Binlog rotation threshold.
    pub binlog_rotate_size: u64,
    /// How many synced records between durable mark-file writes.
    pub write_mark_file_freq: u64,
    /// Interval between binlog-compression sweeps.
    #[serde(with = "duration_secs")]
    pub binlog_compress_interval: Duration,
    /// Number of DIO reader threads per store path.
    pub disk_reader_threads: usize,
    /// Number of DIO writer threads per store path.
    pub disk_writer_threads: usize,
    /// Use `O_DIRECT` for reads where the platform supports it.
    pub read_direct_io: bool,
    /// Use `O_DIRECT` for writes where the platform supports it.
    pub write_direct_io: bool,
    /// Minimum number of worker threads for batched replication sends.
    pub sync_min_threads: usize,
    /// Maximum number of worker threads / conflict-free batch size for
    /// replication sends (`spec.md` §4.F step 6).
    pub sync_max_threads: usize,
    /// Tracker/peer heart-beat cadence.
    #[serde(with = "duration_secs")]
    pub heart_beat_interval: Duration,
    /// Disk-usage report cadence to the tracker.
    #[serde(with = "duration_secs")]
    pub stat_report_interval: Duration,
    /// How many records a disk-recovery pass persists progress after.
    pub recovery_mark_freq: u64,
    /// Network idle timeout applied in the `INIT`/`RECV_BODY` FSM stages.
    #[serde(with = "duration_secs")]
    pub network_idle_timeout: Duration,
    /// Grace period the process waits for workers to drain on shutdown.
    #[serde(with = "duration_secs")]
    pub shutdown_drain_timeout: Duration,
    /// Known tracker server addresses.
    pub tracker_servers: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            group_name: "group1".to_string(),
            bind_addr: "0.0.0.0:23000".to_string(),
            store_paths: vec![PathBuf::from("/data/fastdfs/store0")],
            path_selection_mode: PathSelectionMode::default(),
            reserved_storage_mb: 1024,
            slot_max_size: 16 * 1024 * 1024,
            slot_min_size: 256,
            trunk_alloc_alignment_size: 0,
            trunk_file_size: 64 * 1024 * 1024,
            trunk_free_space_merge: true,
            delete_unused_trunk_files: false,
            trunk_init_reload_from_binlog: true,
            fsync_after_written_bytes: 0,
            binlog_buffer_size: 16 * 1024,
            sync_binlog_buff_interval: Duration::from_secs(10),
            binlog_rotate_size: 1024 * 1024 * 1024,
            write_mark_file_freq: 500,
            binlog_compress_interval: Duration::from_secs(24 * 3600),
            disk_reader_threads: 1,
            disk_writer_threads: 1,
            read_direct_io: false,
            write_direct_io: false,
            sync_min_threads: 1,
            sync_max_threads: 4,
            heart_beat_interval: Duration::from_secs(30),
            stat_report_interval: Duration::from_secs(5 * 60),
            recovery_mark_freq: 1000,
            network_idle_timeout: Duration::from_secs(28800),
            shutdown_drain_timeout: Duration::from_secs(90),
            tracker_servers: Vec::new(),
        }
    }
}

impl StorageConfig {
    /// Loads and deserializes a configuration file.
    pub fn load(path: &std::path::Path) -> std::io::Result<StorageConfig> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// Resolves the effective slot minimum size, applying the §9 precedence
    /// rule: when the alignment is larger than the configured minimum, the
    /// alignment wins.
    pub fn effective_slot_min_size(&self) -> u64 {
        self.slot_min_size.max(self.trunk_alloc_alignment_size)
    }
}

/// Serializes a [`Duration`] as whole seconds, since storage configs are
/// hand-edited TOML and humans think in seconds, not nanosecond structs.
mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}
