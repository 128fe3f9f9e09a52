//! Trunk allocator (`spec.md` §4.B, component B).
//!
//! Packs writes smaller than `slot_max_size` into fixed-size trunk files
//! instead of giving each one a standalone inode. Every trunk file is owned
//! by exactly one local [`FreeMap`]; a trunk-binlog gives the allocator
//! crash-safe durability independent of the main binlog.

pub mod durable;
pub mod free_map;
pub mod header;
pub mod scan;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub use free_map::{Extent, FreeMap};
pub use header::{TrunkHeader, TRUNK_HEADER_SIZE};

use crate::error::{Result, StorageError};

/// Identifies a trunk file within a store path.
pub type TrunkId = u64;

/// A located, not-yet-written allocation: where the payload (preceded by
/// its [`TrunkHeader`]) should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkSlot {
    pub path_index: u8,
    pub trunk_id: TrunkId,
    pub offset: u64,
    pub alloc_size: u64,
}

/// One record of the trunk-binlog, appended on every allocate/free so the
/// free map can be rebuilt after a restart (`spec.md` §4.B "Durability").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrunkBinlogRecord {
    Alloc { trunk_id: TrunkId, offset: u64, length: u64 },
    Free { trunk_id: TrunkId, offset: u64, length: u64 },
    NewTrunk { trunk_id: TrunkId, size: u64 },
}

impl TrunkBinlogRecord {
    /// Renders this record as the line appended to the trunk-binlog file,
    /// including the trailing newline.
    pub fn encode(&self) -> String {
        match *self {
            TrunkBinlogRecord::NewTrunk { trunk_id, size } => format!("n {trunk_id} {size}\n"),
            TrunkBinlogRecord::Alloc { trunk_id, offset, length } => format!("a {trunk_id} {offset} {length}\n"),
            TrunkBinlogRecord::Free { trunk_id, offset, length } => format!("f {trunk_id} {offset} {length}\n"),
        }
    }

    /// Parses one line (without its trailing newline).
    pub fn parse(line: &str) -> Result<TrunkBinlogRecord> {
        let mut parts = line.split(' ');
        let op = parts.next().ok_or_else(|| StorageError::Protocol("missing trunk-binlog op".to_string()))?;
        let mut next_u64 = |what: &str| -> Result<u64> {
            parts
                .next()
                .ok_or_else(|| StorageError::Protocol(format!("missing trunk-binlog {what}")))?
                .parse::<u64>()
                .map_err(|e| StorageError::Protocol(e.to_string()))
        };
        match op {
            "n" => Ok(TrunkBinlogRecord::NewTrunk { trunk_id: next_u64("trunk_id")?, size: next_u64("size")? }),
            "a" => Ok(TrunkBinlogRecord::Alloc {
                trunk_id: next_u64("trunk_id")?,
                offset: next_u64("offset")?,
                length: next_u64("length")?,
            }),
            "f" => Ok(TrunkBinlogRecord::Free {
                trunk_id: next_u64("trunk_id")?,
                offset: next_u64("offset")?,
                length: next_u64("length")?,
            }),
            other => Err(StorageError::Protocol(format!("unknown trunk-binlog op {other:?}"))),
        }
    }
}

/// Whether this node currently owns trunk-metadata allocation decisions for
/// its group (`spec.md` §4.B "Role").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrunkerRole {
    Trunker,
    NotTrunker,
}

/// Per-path trunk allocator state.
pub struct TrunkAllocator {
    trunk_file_size: u64,
    alignment: u64,
    min_slot_size: u64,
    merge_free_space: bool,
    delete_unused_trunk_files: bool,
    free_maps: Mutex<HashMap<TrunkId, FreeMap>>,
    /// Trunk files fully freed and awaiting physical deletion, surfaced for
    /// the scheduler task to act on.
    pending_deletions: Mutex<Vec<TrunkId>>,
    current_trunk_id: AtomicU64,
    role: Mutex<TrunkerRole>,
    /// Appended to on every mutation; the in-memory mirror of the
    /// trunk-binlog used both for durability replay and for tests.
    binlog: Mutex<Vec<TrunkBinlogRecord>>,
    /// The on-disk trunk-binlog file every `allocate`/`free` durably
    /// appends to. `None` for allocators built with [`TrunkAllocator::new`]
    /// (tests, and in-memory-only uses) that have no backing file.
    binlog_file: Option<durable::TrunkBinlogFile>,
}

impl TrunkAllocator {
    pub fn new(
        trunk_file_size: u64,
        alignment: u64,
        min_slot_size: u64,
        merge_free_space: bool,
        delete_unused_trunk_files: bool,
    ) -> TrunkAllocator {
        TrunkAllocator {
            trunk_file_size,
            alignment,
            min_slot_size: min_slot_size.max(alignment),
            merge_free_space,
            delete_unused_trunk_files,
            free_maps: Mutex::new(HashMap::new()),
            pending_deletions: Mutex::new(Vec::new()),
            current_trunk_id: AtomicU64::new(0),
            role: Mutex::new(TrunkerRole::NotTrunker),
            binlog: Mutex::new(Vec::new()),
            binlog_file: None,
        }
    }

    /// Opens a durable allocator backed by a trunk-binlog file at
    /// `trunk_binlog_path`, rebuilding free-map state from whatever is
    /// already on disk before accepting new allocations (`spec.md` §4.B
    /// "Durability": "on restart the allocator rebuilds its free map by
    /// scanning trunk files and/or replaying trunk-binlog").
    ///
    /// `reload_from_binlog` selects the rebuild strategy: when `true`, state
    /// is replayed from `trunk_binlog_path` (fast, the default); when
    /// `false`, `store_path_roots` is scanned header-by-header instead.
    pub fn open(
        trunk_binlog_path: PathBuf,
        store_path_roots: &[PathBuf],
        reload_from_binlog: bool,
        trunk_file_size: u64,
        alignment: u64,
        min_slot_size: u64,
        merge_free_space: bool,
        delete_unused_trunk_files: bool,
    ) -> Result<TrunkAllocator> {
        let min_slot_size = min_slot_size.max(alignment);

        let (free_maps, binlog_mirror, current_trunk_id) = if reload_from_binlog {
            let records = durable::read_all(&trunk_binlog_path)?;
            let allocator = TrunkAllocator::new(trunk_file_size, alignment, min_slot_size, merge_free_space, delete_unused_trunk_files);
            allocator.reload_from_binlog(&records);
            let free_maps = std::mem::take(&mut *allocator.free_maps.lock().expect("free map mutex poisoned"));
            (free_maps, records, allocator.current_trunk_id())
        } else {
            let (free_maps, max_trunk_id) =
                scan::rebuild_free_maps(store_path_roots, trunk_file_size, merge_free_space)?;
            (free_maps, Vec::new(), max_trunk_id)
        };

        let binlog_file = durable::TrunkBinlogFile::open(&trunk_binlog_path)?;

        Ok(TrunkAllocator {
            trunk_file_size,
            alignment,
            min_slot_size,
            merge_free_space,
            delete_unused_trunk_files,
            free_maps: Mutex::new(free_maps),
            pending_deletions: Mutex::new(Vec::new()),
            current_trunk_id: AtomicU64::new(current_trunk_id),
            role: Mutex::new(TrunkerRole::NotTrunker),
            binlog: Mutex::new(binlog_mirror),
            binlog_file: Some(binlog_file),
        })
    }

    /// Rebuilds the free map by replaying a previously captured
    /// trunk-binlog (`trunk_init_reload_from_binlog`). Scanning trunk file
    /// headers directly (see [`scan::rebuild_free_maps`]) is the slower
    /// alternative [`TrunkAllocator::open`] takes when this flag is off.
    pub fn reload_from_binlog(&self, records: &[TrunkBinlogRecord]) {
        let mut maps = self.free_maps.lock().expect("free map mutex poisoned");
        for record in records {
            match *record {
                TrunkBinlogRecord::NewTrunk { trunk_id, size } => {
                    maps.insert(trunk_id, FreeMap::with_single_extent(size, self.merge_free_space));
                    self.bump_current_trunk(trunk_id);
                }
                TrunkBinlogRecord::Alloc { trunk_id, offset, length } => {
                    if let Some(map) = maps.get_mut(&trunk_id) {
                        // Replaying an allocation just removes the extent again;
                        // allocate() already returns the matching offset because
                        // replay happens in original order.
                        let _ = map.allocate(length, 1).filter(|o| *o == offset);
                    }
                }
                TrunkBinlogRecord::Free { trunk_id, offset, length } => {
                    if let Some(map) = maps.get_mut(&trunk_id) {
                        map.free(offset, length);
                    }
                }
            }
        }
    }

    fn bump_current_trunk(&self, trunk_id: TrunkId) {
        self.current_trunk_id.fetch_max(trunk_id, Ordering::SeqCst);
    }

    /// Allocates a slot for a payload of `size` bytes, creating a new trunk
    /// file when none has enough room. Appends a [`TrunkBinlogRecord::Alloc`]
    /// (and, if a new trunk was opened, a `NewTrunk` record first).
    pub fn allocate(&self, path_index: u8, size: u64) -> Result<TrunkSlot> {
        let needed = size + TRUNK_HEADER_SIZE as u64;
        if needed > self.trunk_file_size {
            return Err(StorageError::NoSpace);
        }
        let slot_size = needed.max(self.min_slot_size);

        let mut maps = self.free_maps.lock().expect("free map mutex poisoned");

        // Try existing trunks first (smallest trunk id with a sufficient extent).
        let mut ids: Vec<TrunkId> = maps.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(offset) = maps.get_mut(&id).and_then(|m| m.allocate(slot_size, self.alignment)) {
                let record = TrunkBinlogRecord::Alloc { trunk_id: id, offset, length: slot_size };
                self.append_binlog_record(&record)?;
                return Ok(TrunkSlot { path_index, trunk_id: id, offset, alloc_size: slot_size });
            }
        }

        // No existing trunk had room: open a new one.
        let new_id = self.current_trunk_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut map = FreeMap::with_single_extent(self.trunk_file_size, self.merge_free_space);
        let offset = map.allocate(slot_size, self.alignment).ok_or(StorageError::NoSpace)?;
        maps.insert(new_id, map);
        drop(maps);

        self.append_binlog_record(&TrunkBinlogRecord::NewTrunk { trunk_id: new_id, size: self.trunk_file_size })?;
        self.append_binlog_record(&TrunkBinlogRecord::Alloc { trunk_id: new_id, offset, length: slot_size })?;

        Ok(TrunkSlot { path_index, trunk_id: new_id, offset, alloc_size: slot_size })
    }

    /// Frees a previously allocated slot, merging neighbors if configured
    /// and scheduling trunk deletion when it becomes entirely free
    /// (`spec.md` §4.B "Free").
    pub fn free(&self, slot: TrunkSlot) -> Result<()> {
        let mut maps = self.free_maps.lock().expect("free map mutex poisoned");
        let map = maps.get_mut(&slot.trunk_id).ok_or(StorageError::TrunkNotFound)?;
        map.free(slot.offset, slot.alloc_size);
        let entirely_free = self.delete_unused_trunk_files && map.is_entirely_free(self.trunk_file_size);
        drop(maps);

        self.append_binlog_record(&TrunkBinlogRecord::Free {
            trunk_id: slot.trunk_id,
            offset: slot.offset,
            length: slot.alloc_size,
        })?;

        if entirely_free {
            self.pending_deletions.lock().expect("deletion queue mutex poisoned").push(slot.trunk_id);
        }

        Ok(())
    }

    /// Records one trunk-binlog entry in the in-memory mirror and, when this
    /// allocator was built via [`TrunkAllocator::open`], durably appends it
    /// to the backing file too (`spec.md` §4.B "Durability": "Every
    /// allocation and free appends a trunk-binlog record").
    fn append_binlog_record(&self, record: &TrunkBinlogRecord) -> Result<()> {
        if let Some(file) = &self.binlog_file {
            file.append(record)?;
        }
        self.binlog.lock().expect("binlog mutex poisoned").push(record.clone());
        Ok(())
    }

    /// Drains the list of trunk files that became entirely free and are
    /// eligible for physical removal.
    pub fn take_pending_deletions(&self) -> Vec<TrunkId> {
        std::mem::take(&mut *self.pending_deletions.lock().expect("deletion queue mutex poisoned"))
    }

    /// Snapshot of the in-memory trunk-binlog, for flushing to disk or for
    /// handing to a new trunker during hand-off.
    pub fn binlog_snapshot(&self) -> Vec<TrunkBinlogRecord> {
        self.binlog.lock().expect("binlog mutex poisoned").clone()
    }

    pub fn role(&self) -> TrunkerRole {
        *self.role.lock().expect("role mutex poisoned")
    }

    pub fn current_trunk_id(&self) -> TrunkId {
        self.current_trunk_id.load(Ordering::SeqCst)
    }

    /// Handles a tracker-driven trunker-role change (`spec.md` §4.G
    /// `CHANGE_TRUNK_SERVER`). When resigning, the outgoing trunker must
    /// have already flushed its trunk-binlog to a durable store before
    /// this is called. When becoming trunker, `resume_from` is the
    /// previous trunker's `current_trunk_file_id`; allocation resumes at
    /// `resume_from + 1` (`spec.md` §6 scenario S6).
    pub fn set_role(&self, role: TrunkerRole, resume_from: Option<TrunkId>) {
        *self.role.lock().expect("role mutex poisoned") = role;
        if let (TrunkerRole::Trunker, Some(id)) = (role, resume_from) {
            self.current_trunk_id.fetch_max(id, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> TrunkAllocator {
        TrunkAllocator::new(1024, 1, 16, true, true)
    }

    #[test]
    fn allocate_then_free_restores_empty_trunk() {
        let alloc = allocator();
        let slot = alloc.allocate(0, 100).unwrap();
        alloc.free(slot).unwrap();
        assert_eq!(alloc.take_pending_deletions(), vec![slot.trunk_id]);
    }

    #[test]
    fn allocate_without_merge_still_frees_bytes() {
        let alloc = TrunkAllocator::new(1024, 1, 16, false, false);
        let slot = alloc.allocate(0, 100).unwrap();
        alloc.free(slot).unwrap();
        assert!(alloc.take_pending_deletions().is_empty());
    }

    #[test]
    fn oversized_write_is_rejected() {
        let alloc = TrunkAllocator::new(1024, 1, 16, true, true);
        assert!(matches!(alloc.allocate(0, 2048), Err(StorageError::NoSpace)));
    }

    #[test]
    fn second_trunk_opens_when_first_is_full() {
        let alloc = TrunkAllocator::new(64, 1, 16, true, false);
        let first = alloc.allocate(0, 40).unwrap();
        let second = alloc.allocate(0, 40).unwrap();
        assert_ne!(first.trunk_id, second.trunk_id);
    }

    #[test]
    fn reload_from_binlog_rebuilds_free_map() {
        let alloc = allocator();
        let slot = alloc.allocate(0, 50).unwrap();
        let records = alloc.binlog_snapshot();

        let fresh = TrunkAllocator::new(1024, 1, 16, true, true);
        fresh.reload_from_binlog(&records);
        // The reloaded allocator should refuse to hand out the same bytes again.
        let next = fresh.allocate(0, 1024 - slot.alloc_size + 1);
        assert!(next.is_err() || next.unwrap().trunk_id != slot.trunk_id);
    }

    #[test]
    fn trunker_handover_resumes_after_outgoing_id() {
        let alloc = TrunkAllocator::new(64, 1, 16, true, false);
        alloc.set_role(TrunkerRole::Trunker, Some(42));
        assert_eq!(alloc.current_trunk_id(), 42);
        let slot = alloc.allocate(0, 10).unwrap();
        assert_eq!(slot.trunk_id, 43);
    }
}
