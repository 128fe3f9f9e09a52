//! Logical filename codec (`spec.md` §3 "Logical Filename", §4.A, §6).
//!
//! A logical filename is the opaque string a client receives from an
//! upload and later presents to address the file again. It carries enough
//! information (path index, size, crc32, source storage id, timestamp) that
//! a receiver can decode it without touching disk, and it addresses either
//! a standalone file (two-level hashed directory) or a trunk slot
//! (`{trunk-id, offset}`, `spec.md` §3 "Trunk File" invariant: the slot
//! tuple is encoded into the filename so readers locate the payload in
//! O(1)).

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

use crate::error::{Result, StorageError};

/// Base64url alphabet with `.` standing in for the usual `=` padding
/// character, matching the wire format note in `spec.md` §6 ("Base64url
/// variant ... with `-` and `_` and `.` as padding").
const ENGINE: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    base64::engine::GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

/// Where the payload actually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Standalone file under `data/XX/YY/`.
    Standalone { dir1: u8, dir2: u8 },
    /// Slot inside a trunk file (`spec.md` §3 "Trunk File").
    Trunk { trunk_id: u64, offset: u64 },
}

/// Raw fields packed into an encoded filename, before base64 formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilenameFields {
    /// Index of the owning store path (`spec.md` §3 invariant: positions
    /// 1-2 of the encoded name always carry this).
    pub path_index: u8,
    /// Upload timestamp, seconds since epoch.
    pub timestamp: u32,
    /// Payload size in bytes.
    pub size: u64,
    /// CRC32 of the payload.
    pub crc32: u32,
    /// Id of the storage node that created the file.
    pub source_id: u32,
    /// Random disambiguator so identical uploads never collide.
    pub random: u16,
    /// Where the payload lives.
    pub location: Location,
    /// Whether this file was created via Upload-Appender and therefore
    /// accepts Append/Modify/Truncate (`spec.md` §4.D). Always `false` for
    /// trunk-packed files — appender files can grow, so they are never
    /// trunk-packed.
    pub appender: bool,
    /// File extension, without the leading dot, truncated to 6 bytes on
    /// the wire.
    pub ext: String,
}

/// A decoded logical filename together with the group it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalName {
    pub fields: FilenameFields,
    /// Opaque base64 payload, kept around so the struct can re-derive the
    /// exact string a client gave us (`encode(decode(x)) == x`, §8).
    encoded: String,
}

impl LogicalName {
    /// Renders `group/M{path_index:02}/XX/YY/<encoded>.<ext>`, the format
    /// handed back to clients on upload (`spec.md` §6). Trunk-backed files
    /// use the trunk directory hash of their trunk id as `XX/YY` so the
    /// on-disk layout stays two-level regardless of storage kind.
    pub fn wire_path(&self, group: &str) -> String {
        format!("{group}/{}", self.local_path())
    }

    /// Renders `M{path_index:02}/XX/YY/<encoded>.<ext>`: the group-less form
    /// used in binlog records and wire responses, which carry the group
    /// separately (`spec.md` §6 "Persisted state layout", response tables).
    pub fn local_path(&self) -> String {
        let f = &self.fields;
        let (dir1, dir2) = self.directory_hash();
        if f.ext.is_empty() {
            format!("M{:02}/{:02X}/{:02X}/{}", f.path_index, dir1, dir2, self.encoded)
        } else {
            format!("M{:02}/{:02X}/{:02X}/{}.{}", f.path_index, dir1, dir2, self.encoded, f.ext)
        }
    }

    /// The `XX/YY` directory pair this name is addressed under.
    pub fn directory_hash(&self) -> (u8, u8) {
        match self.fields.location {
            Location::Standalone { dir1, dir2 } => (dir1, dir2),
            Location::Trunk { trunk_id, .. } => trunk_directory_hash(trunk_id),
        }
    }

    /// The encoded (pre-extension) portion of the filename.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

/// The `XX/YY` directory pair a trunk file lives under, derived from a
/// hash of its id so trunk files spread evenly without a lookup table
/// (shared by [`LogicalName::directory_hash`] and callers that need to
/// locate a trunk file by id alone, e.g. scheduled cleanup).
pub fn trunk_directory_hash(trunk_id: u64) -> (u8, u8) {
    let hash = crc32fast::hash(&trunk_id.to_be_bytes());
    ((hash & 0xFF) as u8, ((hash >> 8) & 0xFF) as u8)
}

const LOCATION_TRUNK_BIT: u8 = 0x01;
const APPENDER_BIT: u8 = 0x02;

/// `flag(1) || path_index(1) || ts(4) || size(8) || crc32(4) || source_id(4) || random(2) || location(2|16)`
///
/// `flag` bit 0 selects standalone (0) vs. trunk (1) addressing; bit 1
/// marks a standalone file as appender-created (`spec.md` §4.D).
fn pack(fields: &FilenameFields) -> Vec<u8> {
    let mut buf = vec![0u8; 24];
    let mut flag = match fields.location {
        Location::Standalone { .. } => 0,
        Location::Trunk { .. } => LOCATION_TRUNK_BIT,
    };
    if fields.appender {
        flag |= APPENDER_BIT;
    }
    buf[0] = flag;
    buf[1] = fields.path_index;
    BigEndian::write_u32(&mut buf[2..6], fields.timestamp);
    BigEndian::write_u64(&mut buf[6..14], fields.size);
    BigEndian::write_u32(&mut buf[14..18], fields.crc32);
    BigEndian::write_u32(&mut buf[18..22], fields.source_id);
    BigEndian::write_u16(&mut buf[22..24], fields.random);

    match fields.location {
        Location::Standalone { dir1, dir2 } => {
            buf.push(dir1);
            buf.push(dir2);
        }
        Location::Trunk { trunk_id, offset } => {
            let mut tail = [0u8; 16];
            BigEndian::write_u64(&mut tail[0..8], trunk_id);
            BigEndian::write_u64(&mut tail[8..16], offset);
            buf.extend_from_slice(&tail);
        }
    }
    buf
}

fn unpack(buf: &[u8]) -> Result<FilenameFields> {
    if buf.len() < 24 {
        return Err(StorageError::InvalidFilename("too short".to_string()));
    }
    let flag = buf[0];
    let path_index = buf[1];
    let timestamp = BigEndian::read_u32(&buf[2..6]);
    let size = BigEndian::read_u64(&buf[6..14]);
    let crc32 = BigEndian::read_u32(&buf[14..18]);
    let source_id = BigEndian::read_u32(&buf[18..22]);
    let random = BigEndian::read_u16(&buf[22..24]);
    let appender = flag & APPENDER_BIT != 0;

    let location = match flag & LOCATION_TRUNK_BIT {
        0 => {
            if buf.len() != 26 {
                return Err(StorageError::InvalidFilename("bad standalone length".to_string()));
            }
            Location::Standalone { dir1: buf[24], dir2: buf[25] }
        }
        LOCATION_TRUNK_BIT => {
            if buf.len() != 40 {
                return Err(StorageError::InvalidFilename("bad trunk length".to_string()));
            }
            if appender {
                return Err(StorageError::InvalidFilename("trunk files cannot be appenders".to_string()));
            }
            Location::Trunk {
                trunk_id: BigEndian::read_u64(&buf[24..32]),
                offset: BigEndian::read_u64(&buf[32..40]),
            }
        }
        other => return Err(StorageError::InvalidFilename(format!("unknown location flag {other}"))),
    };

    Ok(FilenameFields { path_index, timestamp, size, crc32, source_id, random, location, appender, ext: String::new() })
}

fn random_component() -> u16 {
    rand::thread_rng().gen()
}

/// Encodes a standalone file's fields into a [`LogicalName`]. The two-level
/// directory is derived from a hash of the random disambiguator so repeat
/// uploads spread evenly across `data/XX/YY/` without a directory lookup.
/// `appender` marks the file as created via Upload-Appender, which makes it
/// eligible for Append/Modify/Truncate later (`spec.md` §4.D).
pub fn encode_logical_name(
    path_index: u8,
    timestamp: u32,
    size: u64,
    crc32: u32,
    source_id: u32,
    ext: &str,
    appender: bool,
) -> LogicalName {
    let random = random_component();
    let hash = crc32fast::hash(&random.to_be_bytes());
    let location = Location::Standalone { dir1: (hash & 0xFF) as u8, dir2: ((hash >> 8) & 0xFF) as u8 };
    encode_with_location(path_index, timestamp, size, crc32, source_id, ext, location, appender)
}

/// Encodes a trunk-packed file's fields, addressing the slot directly by
/// `{trunk_id, offset}` (`spec.md` §4.B). Trunk files are never appenders.
pub fn encode_trunk_name(
    path_index: u8,
    timestamp: u32,
    size: u64,
    crc32: u32,
    source_id: u32,
    ext: &str,
    trunk_id: u64,
    offset: u64,
) -> LogicalName {
    encode_with_location(
        path_index,
        timestamp,
        size,
        crc32,
        source_id,
        ext,
        Location::Trunk { trunk_id, offset },
        false,
    )
}

#[allow(clippy::too_many_arguments)]
fn encode_with_location(
    path_index: u8,
    timestamp: u32,
    size: u64,
    crc32: u32,
    source_id: u32,
    ext: &str,
    location: Location,
    appender: bool,
) -> LogicalName {
    use base64::Engine;

    let fields = FilenameFields {
        path_index,
        timestamp,
        size,
        crc32,
        source_id,
        random: random_component(),
        location,
        appender,
        ext: ext.chars().take(6).collect(),
    };
    let encoded = ENGINE.encode(pack(&fields));
    LogicalName { fields, encoded }
}

/// Decodes an encoded filename (the part after `XX/YY/`, optionally
/// carrying a `.ext` suffix) back into its fields.
///
/// Returns [`StorageError::InvalidFilename`] on malformed input, and the
/// caller is expected to further check the path index against its local
/// store path count (`spec.md` §4.A `UnknownPath`).
pub fn decode(encoded: &str) -> Result<LogicalName> {
    use base64::Engine;

    let (body, ext) = match encoded.split_once('.') {
        Some((body, ext)) => (body, ext.to_string()),
        None => (encoded, String::new()),
    };

    let raw = ENGINE.decode(body).map_err(|err| StorageError::InvalidFilename(err.to_string()))?;
    let mut fields = unpack(&raw)?;
    fields.ext = ext;

    Ok(LogicalName { fields, encoded: body.to_string() })
}
