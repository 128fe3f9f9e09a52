//! Fallback free-map rebuild: walks `data/trunk/**/**` under each store path
//! and replays the sequential [`TrunkHeader`]s already on disk, used when
//! `trunk_init_reload_from_binlog` is `false` (`spec.md` §4.B "Durability":
//! "... or scan trunk headers ...").
//!
//! Slower than replaying the trunk-binlog since it re-reads every trunk
//! file's headers from disk, but recovers correctly even if the
//! trunk-binlog file itself was lost or truncated.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::free_map::{Extent, FreeMap};
use super::header::{TrunkHeader, TRUNK_HEADER_SIZE};
use super::TrunkId;

/// Scans every trunk file under `store_path_roots`' `data/trunk` trees,
/// returning a free map per trunk id (built from the headers found in use)
/// and the highest trunk id seen, for resuming allocation after it.
pub fn rebuild_free_maps(
    store_path_roots: &[PathBuf],
    trunk_file_size: u64,
    merge_free_space: bool,
) -> Result<(HashMap<TrunkId, FreeMap>, TrunkId)> {
    let mut maps = HashMap::new();
    let mut max_trunk_id: TrunkId = 0;

    for root in store_path_roots {
        let trunk_root = root.join("data").join("trunk");
        if !trunk_root.is_dir() {
            continue;
        }
        for trunk_path in list_trunk_files(&trunk_root)? {
            let Some(trunk_id) = trunk_id_from_path(&trunk_path) else { continue };
            max_trunk_id = max_trunk_id.max(trunk_id);
            let used = scan_trunk_file(&trunk_path)?;
            maps.insert(trunk_id, FreeMap::from_used_extents(trunk_file_size, used, merge_free_space));
        }
    }

    Ok((maps, max_trunk_id))
}

fn list_trunk_files(trunk_root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for dir1 in read_subdirs(trunk_root)? {
        for dir2 in read_subdirs(&dir1)? {
            for entry in std::fs::read_dir(&dir2)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    found.push(entry.path());
                }
            }
        }
    }
    Ok(found)
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut subdirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            subdirs.push(entry.path());
        }
    }
    Ok(subdirs)
}

fn trunk_id_from_path(path: &Path) -> Option<TrunkId> {
    path.file_name()?.to_str()?.parse().ok()
}

/// Walks one trunk file's `TrunkHeader`s sequentially from offset 0,
/// collecting the byte range each live slot occupies (header + payload).
/// Stops at the first unreadable/corrupt header, treating the remainder of
/// the file as free (matches a trunk file that was truncated mid-write).
fn scan_trunk_file(path: &Path) -> Result<Vec<Extent>> {
    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    let mut used = Vec::new();
    let mut offset = 0u64;
    let mut header_buf = [0u8; TRUNK_HEADER_SIZE];

    while offset + TRUNK_HEADER_SIZE as u64 <= len {
        if file.read_exact(&mut header_buf).is_err() {
            break;
        }
        let header = match TrunkHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(_) => break,
        };
        let slot_len = TRUNK_HEADER_SIZE as u64 + header.alloc_size as u64;
        used.push(Extent { offset, length: slot_len });
        offset += slot_len;
        if file.seek(SeekFrom::Start(offset)).is_err() {
            break;
        }
    }

    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_trunk_file(path: &Path, slots: &[(u32, u32)]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = File::create(path).unwrap();
        use std::io::Write;
        for (size, alloc_size) in slots {
            let header = TrunkHeader::new(*size, 0, 0, *alloc_size);
            file.write_all(&header.encode()).unwrap();
            file.write_all(&vec![0u8; *alloc_size as usize]).unwrap();
        }
    }

    #[test]
    fn rebuilds_free_map_from_headers_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let trunk_path = dir.path().join("data").join("trunk").join("00").join("00").join("1");
        write_trunk_file(&trunk_path, &[(50, 64), (20, 32)]);

        let (maps, max_id) = rebuild_free_maps(&[dir.path().to_path_buf()], 1024, true).unwrap();
        assert_eq!(max_id, 1);
        let map = maps.get(&1).unwrap();
        let used_bytes = TRUNK_HEADER_SIZE as u64 * 2 + 64 + 32;
        assert_eq!(map.free_bytes(), 1024 - used_bytes);
    }

    #[test]
    fn empty_store_path_yields_no_trunks() {
        let dir = tempfile::tempdir().unwrap();
        let (maps, max_id) = rebuild_free_maps(&[dir.path().to_path_buf()], 1024, true).unwrap();
        assert!(maps.is_empty());
        assert_eq!(max_id, 0);
    }
}
