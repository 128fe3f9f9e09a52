//! Per-command handlers (`spec.md` §4.D), decoupled from wire parsing so
//! they can be exercised directly in tests. Each function does the real
//! local-disk effect: choosing a trunk or standalone slot, moving bytes
//! through the DIO pool, and appending the matching binlog record.

use std::sync::Arc;

use crate::binlog::{BinlogRecord, Op};
use crate::dio::{Job, JobKind, JobOutcome};
use crate::error::{Result, StorageError};
use crate::path_layout::{self, Location, LogicalName};
use crate::storage::Storage;
use crate::trunk::{TrunkHeader, TrunkSlot, TRUNK_HEADER_SIZE};

use super::metadata;

fn source_id(storage: &Storage) -> u32 {
    crc32fast::hash(storage.self_id.as_bytes())
}

async fn write_bytes(storage: &Storage, path: &std::path::Path, offset: u64, data: Vec<u8>) -> Result<()> {
    let idx = storage.dio_writer.pick_thread_index();
    let direct_io = storage.config.write_direct_io;
    match storage.dio_writer.submit(idx, Job { path: path.to_path_buf(), kind: JobKind::Write { offset, data }, direct_io }).await? {
        JobOutcome::BytesWritten(_) => Ok(()),
        other => Err(unexpected_outcome("write", &other)),
    }
}

async fn read_bytes(storage: &Storage, path: &std::path::Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let idx = storage.dio_reader.pick_thread_index();
    let direct_io = storage.config.read_direct_io;
    match storage.dio_reader.submit(idx, Job { path: path.to_path_buf(), kind: JobKind::Read { offset, len }, direct_io }).await? {
        JobOutcome::Bytes(bytes) => Ok(bytes),
        other => Err(unexpected_outcome("read", &other)),
    }
}

/// A DIO worker returned an outcome that doesn't match the job kind it was
/// given (e.g. a read job route landing on the write path's misaligned
/// `O_DIRECT` handling). Surfacing this as [`StorageError::DiskIo`] instead
/// of silently treating it as success keeps misrouted jobs from being
/// mistaken for completed ones.
fn unexpected_outcome(what: &str, outcome: &JobOutcome) -> StorageError {
    StorageError::DiskIo(std::io::Error::new(std::io::ErrorKind::Other, format!("unexpected DIO outcome for {what}: {outcome:?}")))
}

/// Upload / Upload-Appender / Upload-Slave (`spec.md` §4.D). `path_index`
/// of `0xFF` asks the node to pick a path itself (`spec.md` §4.A).
pub async fn upload(storage: &Storage, path_index: u8, ext: &str, data: Vec<u8>, appender: bool) -> Result<LogicalName> {
    let path_index = if path_index == 0xFF { storage.path_selector.pick(&storage.store_paths)? } else { path_index };
    storage.store_path(path_index)?;

    let crc = crc32fast::hash(&data);
    let ts = storage.now();
    let size = data.len() as u64;
    let src_id = source_id(storage);

    let name = if appender || size >= storage.config.slot_max_size {
        let name = path_layout::encode_logical_name(path_index, ts, size, crc, src_id, ext, appender);
        let path = storage.physical_path(&name)?;
        write_bytes(storage, &path, 0, data).await?;
        name
    } else {
        let slot = storage.trunk.allocate(path_index, size)?;
        let name = path_layout::encode_trunk_name(path_index, ts, size, crc, src_id, ext, slot.trunk_id, slot.offset);
        let path = storage.physical_path(&name)?;
        let header = TrunkHeader::new(size as u32, crc, ts, slot.alloc_size as u32);
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(&data);
        write_bytes(storage, &path, slot.offset, buf).await?;
        name
    };

    append_binlog(storage, Op::SourceCreate, &name.local_path(), None).await?;
    Ok(name)
}

/// Download (`spec.md` §4.D). `len == 0` means "to end of file".
pub async fn download(storage: &Storage, name: &LogicalName, offset: u64, len: u64) -> Result<Vec<u8>> {
    let path = storage.physical_path(name)?;
    let remaining = name.fields.size.saturating_sub(offset);
    let want = if len == 0 { remaining } else { len.min(remaining) };

    let base_offset = match name.fields.location {
        Location::Standalone { .. } => offset,
        Location::Trunk { .. } => TRUNK_HEADER_SIZE as u64 + offset,
    };
    read_bytes(storage, &path, base_offset, want as usize).await
}

/// Delete (`spec.md` §4.D): unlinks a standalone file, or frees its trunk
/// slot (reading the slot's own header to learn the rounded allocation
/// size it was given at upload time).
pub async fn delete(storage: &Storage, name: &LogicalName) -> Result<()> {
    let path = storage.physical_path(name)?;
    match name.fields.location {
        Location::Standalone { .. } => {
            let idx = storage.dio_writer.pick_thread_index();
            storage.dio_writer.submit(idx, Job { path, kind: JobKind::Delete, direct_io: false }).await?;
        }
        Location::Trunk { trunk_id, offset } => {
            let header_bytes = read_bytes(storage, &path, offset, TRUNK_HEADER_SIZE).await?;
            let header = TrunkHeader::decode(&header_bytes)?;
            storage.trunk.free(TrunkSlot { path_index: name.fields.path_index, trunk_id, offset, alloc_size: header.alloc_size as u64 })?;
        }
    }
    append_binlog(storage, Op::SourceDelete, &name.local_path(), None).await?;
    Ok(())
}

/// Append (`spec.md` §4.D): legal only on appender-marked files.
pub async fn append(storage: &Storage, name: &LogicalName, data: Vec<u8>) -> Result<()> {
    require_appender(name)?;
    let path = storage.physical_path(name)?;
    let idx = storage.dio_writer.pick_thread_index();
    let data_len = data.len() as u64;
    storage
        .dio_writer
        .submit(idx, Job { path, kind: JobKind::Append { data }, direct_io: storage.config.write_direct_io })
        .await?;
    append_binlog(storage, Op::SourceAppend, &name.local_path(), Some(data_len.to_string())).await?;
    Ok(())
}

/// Modify (`spec.md` §4.D): overwrites `data` at `offset` in an
/// appender-marked file.
pub async fn modify(storage: &Storage, name: &LogicalName, offset: u64, data: Vec<u8>) -> Result<()> {
    require_appender(name)?;
    let path = storage.physical_path(name)?;
    write_bytes(storage, &path, offset, data).await?;
    append_binlog(storage, Op::SourceModify, &name.local_path(), Some(offset.to_string())).await?;
    Ok(())
}

/// Truncate (`spec.md` §4.D): sets an appender-marked file to exactly
/// `new_size` bytes.
pub async fn truncate(storage: &Storage, name: &LogicalName, new_size: u64) -> Result<()> {
    require_appender(name)?;
    let path = storage.physical_path(name)?;
    let idx = storage.dio_writer.pick_thread_index();
    storage
        .dio_writer
        .submit(idx, Job { path, kind: JobKind::Truncate { len: new_size }, direct_io: false })
        .await?;
    append_binlog(storage, Op::SourceTruncate, &name.local_path(), Some(new_size.to_string())).await?;
    Ok(())
}

fn require_appender(name: &LogicalName) -> Result<()> {
    if name.fields.appender {
        Ok(())
    } else {
        Err(StorageError::Protocol("append/modify/truncate require an appender file".to_string()))
    }
}

/// Reads the metadata sidecar for a file, if any.
pub fn get_metadata(storage: &Storage, name: &LogicalName) -> Result<Vec<(String, String)>> {
    let path = storage.metadata_path(name)?;
    match std::fs::read(&path) {
        Ok(bytes) => Ok(metadata::decode(&bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Writes the metadata sidecar, applying overwrite/merge semantics.
pub fn set_metadata(
    storage: &Storage,
    name: &LogicalName,
    incoming: &[(String, String)],
    flag: metadata::SetMetadataFlag,
) -> Result<()> {
    let existing = get_metadata(storage, name)?;
    let merged = metadata::apply(&existing, incoming, flag);
    let path = storage.metadata_path(name)?;
    std::fs::write(&path, metadata::encode(&merged))?;
    Ok(())
}

/// Create-Symlink (`spec.md` §4.D): a new logical name whose payload is a
/// filesystem symlink to an existing local file.
#[cfg(unix)]
pub async fn create_symlink(storage: &Storage, master: &LogicalName, ext: &str) -> Result<LogicalName> {
    let master_path = storage.physical_path(master)?;
    let ts = storage.now();
    let src_id = source_id(storage);
    let name = path_layout::encode_logical_name(master.fields.path_index, ts, master.fields.size, master.fields.crc32, src_id, ext, false);
    let link_path = storage.physical_path(&name)?;
    if let Some(parent) = link_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(&master_path, &link_path)?;
    append_binlog(storage, Op::SourceLink, &name.local_path(), Some(master.local_path())).await?;
    Ok(name)
}

/// Rename (`spec.md` §4.D): moves a file's bytes from one decoded
/// location to another (both already produced by this node's codec).
pub async fn rename(storage: &Storage, old: &LogicalName, new: &LogicalName) -> Result<()> {
    let old_path = storage.physical_path(old)?;
    let new_path = storage.physical_path(new)?;
    if let Some(parent) = new_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&old_path, &new_path)?;
    append_binlog(storage, Op::SourceRename, &old.local_path(), Some(new.local_path())).await?;
    Ok(())
}

/// Query-File-Info (`spec.md` §4.D, §6): everything needed is already
/// embedded in the decoded filename, so this never touches disk.
pub struct FileInfo {
    pub size: u64,
    pub timestamp: u32,
    pub crc32: u32,
}

pub fn query_file_info(name: &LogicalName) -> FileInfo {
    FileInfo { size: name.fields.size, timestamp: name.fields.timestamp, crc32: name.fields.crc32 }
}

async fn append_binlog(storage: &Storage, op: Op, filename: &str, aux: Option<String>) -> Result<()> {
    let mut record = BinlogRecord::new(storage.now(), op, filename.to_string());
    if let Some(aux) = aux {
        record = record.with_aux(aux);
    }
    storage.binlog.append(&record)
}

/// Receive side of replication (`spec.md` §4.D "Sync-*" commands):
/// performs the same local effect as the matching source command, but
/// appends a `REPLICA_*` binlog record instead of a `SOURCE_*` one, and
/// applies the per-op idempotence rules from `spec.md` §4.F.
pub mod sync {
    use super::*;

    /// `SYNC_CREATE_FILE` / `SYNC_UPDATE_FILE`: writes the payload at the
    /// name's decoded location. Create treats an identical-size existing
    /// file as success (`spec.md` §4.D "silently acknowledge").
    pub async fn create_or_update(storage: &Storage, name: &LogicalName, data: Vec<u8>, is_create: bool) -> Result<()> {
        let path = storage.physical_path(name)?;
        if is_create {
            if let Ok(existing) = std::fs::metadata(&path) {
                if existing.len() == data.len() as u64 {
                    return Ok(());
                }
                return Err(StorageError::AlreadyExists);
            }
        }
        match name.fields.location {
            Location::Standalone { .. } => write_bytes(storage, &path, 0, data).await?,
            Location::Trunk { offset, .. } => {
                let header = TrunkHeader::new(name.fields.size as u32, name.fields.crc32, name.fields.timestamp, data.len() as u32);
                let mut buf = header.encode().to_vec();
                buf.extend_from_slice(&data);
                write_bytes(storage, &path, offset, buf).await?;
            }
        }
        let op = if is_create { Op::ReplicaCreate } else { Op::ReplicaUpdate };
        append_binlog(storage, op, &name.local_path(), None).await
    }

    pub async fn delete(storage: &Storage, name: &LogicalName) -> Result<()> {
        match super::delete(storage, name).await {
            Ok(()) => {}
            // Idempotent at the receiver (`spec.md` §4.F "DELETE ... ENOENT is success").
            Err(StorageError::NotFound) => {}
            Err(err) => return Err(err),
        }
        append_binlog(storage, Op::ReplicaDelete, &name.local_path(), None).await
    }

    pub async fn append(storage: &Storage, name: &LogicalName, data: Vec<u8>) -> Result<()> {
        let path = storage.physical_path(name)?;
        std::fs::metadata(&path)?;
        let idx = storage.dio_writer.pick_thread_index();
        let len = data.len() as u64;
        storage.dio_writer.submit(idx, Job { path, kind: JobKind::Append { data }, direct_io: false }).await?;
        append_binlog(storage, Op::ReplicaAppend, &name.local_path(), Some(len.to_string())).await
    }

    pub async fn modify(storage: &Storage, name: &LogicalName, offset: u64, data: Vec<u8>) -> Result<()> {
        let path = storage.physical_path(name)?;
        std::fs::metadata(&path)?;
        write_bytes(storage, &path, offset, data).await?;
        append_binlog(storage, Op::ReplicaModify, &name.local_path(), Some(offset.to_string())).await
    }

    pub async fn truncate(storage: &Storage, name: &LogicalName, new_size: u64) -> Result<()> {
        let path = storage.physical_path(name)?;
        let idx = storage.dio_writer.pick_thread_index();
        storage.dio_writer.submit(idx, Job { path, kind: JobKind::Truncate { len: new_size }, direct_io: false }).await?;
        append_binlog(storage, Op::ReplicaTruncate, &name.local_path(), Some(new_size.to_string())).await
    }

    pub async fn rename(storage: &Storage, old: &LogicalName, new: &LogicalName) -> Result<()> {
        let old_path = storage.physical_path(old)?;
        let new_path = storage.physical_path(new)?;
        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&old_path, &new_path)?;
        append_binlog(storage, Op::ReplicaRename, &old.local_path(), Some(new.local_path())).await
    }

    #[cfg(unix)]
    pub async fn link(storage: &Storage, dest: &LogicalName, src: &LogicalName) -> Result<()> {
        let dest_path = storage.physical_path(dest)?;
        let src_path = storage.physical_path(src)?;
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(&src_path, &dest_path)?;
        append_binlog(storage, Op::ReplicaLink, &dest.local_path(), Some(src.local_path())).await
    }
}

/// Evicts trunk files the allocator marked fully-free, physically
/// deleting them (`spec.md` §4.B "Free"). Driven by the scheduler task.
pub async fn sweep_pending_trunk_deletions(storage: &Arc<Storage>) {
    for trunk_id in storage.trunk.take_pending_deletions() {
        let (dir1, dir2) = path_layout::trunk_directory_hash(trunk_id);
        for path in storage.store_paths.iter() {
            let candidate = path.trunk_dir(dir1, dir2).join(trunk_id.to_string());
            let _ = std::fs::remove_file(&candidate);
        }
    }
}
