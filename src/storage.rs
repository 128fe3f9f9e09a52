//! Root context object (`spec.md` §9 "Global mutable state": "encapsulate
//! as three explicit 'service' objects passed through a root context. No
//! process-wide singletons").
//!
//! `Storage` bundles the three stateful services every connection and
//! background task needs — the binlog writer, the trunk allocator(s), and
//! the peer table — plus the path layout and DIO pools built on top of
//! them. Tests instantiate as many `Storage` values in one process as they
//! like; nothing here is global.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::binlog::BinlogWriter;
use crate::config::StorageConfig;
use crate::dio::DioPool;
use crate::error::{Result, StorageError};
use crate::path_layout::{self, store_path::PathSelector, store_path::StorePath, Location, LogicalName};
use crate::peer::PeerTable;
use crate::trunk::TrunkAllocator;

/// A running storage node's local state: store paths, the binlog, the
/// trunk allocator, the peer table, and the DIO pools every command runs
/// payload I/O through.
pub struct Storage {
    pub config: StorageConfig,
    pub group: String,
    pub self_id: String,
    pub store_paths: Vec<StorePath>,
    pub path_selector: PathSelector,
    pub trunk: TrunkAllocator,
    pub binlog: BinlogWriter,
    pub peer_table: PeerTable,
    pub dio_reader: DioPool,
    pub dio_writer: DioPool,
}

impl Storage {
    /// Opens (creating directories as needed) a storage node rooted at
    /// `config.store_paths`. `store_paths[0]` owns the `sync/` binlog
    /// subtree (`spec.md` §6 "Persisted state layout").
    pub fn open(config: StorageConfig, group: String, self_id: String) -> Result<Storage> {
        if config.store_paths.is_empty() {
            return Err(StorageError::Fatal("no store paths configured".to_string()));
        }

        let store_paths: Vec<StorePath> = config
            .store_paths
            .iter()
            .enumerate()
            .map(|(i, root)| StorePath::new(i as u8, root.clone()))
            .collect();

        let sync_dir = config.store_paths[0].join("data").join("sync");
        let binlog = BinlogWriter::open(sync_dir, config.binlog_rotate_size, config.binlog_buffer_size)?;

        let trunk_binlog_path = config.store_paths[0].join("data").join("trunk_binlog.dat");
        let trunk = TrunkAllocator::open(
            trunk_binlog_path,
            &config.store_paths,
            config.trunk_init_reload_from_binlog,
            config.trunk_file_size,
            config.trunk_alloc_alignment_size.max(1),
            config.effective_slot_min_size(),
            config.trunk_free_space_merge,
            config.delete_unused_trunk_files,
        )?;

        let path_selector = PathSelector::new(config.path_selection_mode, config.reserved_storage_mb);
        let dio_reader = DioPool::new("reader", config.disk_reader_threads);
        let dio_writer = DioPool::new("writer", config.disk_writer_threads);

        Ok(Storage {
            config,
            group,
            self_id,
            store_paths,
            path_selector,
            trunk,
            binlog,
            peer_table: PeerTable::new(),
            dio_reader,
            dio_writer,
        })
    }

    pub fn store_path(&self, index: u8) -> Result<&StorePath> {
        self.store_paths.get(index as usize).ok_or(StorageError::InvalidFilename(format!("unknown path index {index}")))
    }

    /// Resolves a decoded logical name to the physical file that holds
    /// its bytes: a standalone file, or the trunk file that packs it
    /// (`spec.md` §3 "Trunk File", §4.A `physical_path`).
    pub fn physical_path(&self, name: &LogicalName) -> Result<PathBuf> {
        let path = self.store_path(name.fields.path_index)?;
        let (dir1, dir2) = name.directory_hash();
        Ok(match name.fields.location {
            Location::Standalone { .. } => {
                path_layout::store_path::physical_path(&path.root, dir1, dir2, name.encoded(), &name.fields.ext)
            }
            Location::Trunk { trunk_id, .. } => path.trunk_dir(dir1, dir2).join(trunk_id.to_string()),
        })
    }

    /// Sidecar metadata file path for a logical name (`spec.md` §4.D
    /// "Set-Metadata / Get-Metadata": `<name>-m`).
    pub fn metadata_path(&self, name: &LogicalName) -> Result<PathBuf> {
        let payload = self.physical_path(name)?;
        let mut file_name = payload.file_name().unwrap_or_default().to_owned();
        file_name.push("-m");
        Ok(payload.with_file_name(file_name))
    }

    pub fn now(&self) -> u32 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
    }
}
