//! Wire protocol framing for the storage port (`spec.md` §6).

pub mod command;
pub mod header;

pub use command::Cmd;
pub use header::{Header, HEADER_SIZE};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, StorageError};

/// Group-name field width on the wire (`spec.md` §6 table: `group:16`).
pub const GROUP_FIELD_LEN: usize = 16;

/// Reads a big-endian `u64` length prefix.
pub fn read_u64(buf: &[u8]) -> Result<u64> {
    if buf.len() < 8 {
        return Err(StorageError::Protocol("truncated u64 field".to_string()));
    }
    Ok(BigEndian::read_u64(&buf[..8]))
}

/// Reads a fixed-width, NUL-padded group name field.
pub fn read_group(buf: &[u8]) -> Result<String> {
    if buf.len() < GROUP_FIELD_LEN {
        return Err(StorageError::Protocol("truncated group field".to_string()));
    }
    let end = buf[..GROUP_FIELD_LEN].iter().position(|b| *b == 0).unwrap_or(GROUP_FIELD_LEN);
    Ok(String::from_utf8_lossy(&buf[..end]).to_string())
}

/// Writes a fixed-width, NUL-padded group name field.
pub fn write_group(group: &str) -> [u8; GROUP_FIELD_LEN] {
    let mut buf = [0u8; GROUP_FIELD_LEN];
    let bytes = group.as_bytes();
    let n = bytes.len().min(GROUP_FIELD_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_field_round_trips() {
        let encoded = write_group("group1");
        assert_eq!(read_group(&encoded).unwrap(), "group1");
    }

    #[test]
    fn group_field_truncates_long_names() {
        let encoded = write_group("this-name-is-way-too-long-for-the-field");
        assert_eq!(encoded.len(), GROUP_FIELD_LEN);
    }
}
