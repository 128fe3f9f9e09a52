//! Storage command codes (`spec.md` §6 wire protocol table). Numbers are
//! stable and match the table exactly.

use num_derive::{FromPrimitive, ToPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Cmd {
    UploadFile = 11,
    DeleteFile = 12,
    GetMetadata = 13,
    DownloadFile = 14,
    SetMetadata = 15,
    CreateLink = 16,
    UploadSlaveFile = 21,
    QueryFileInfo = 22,
    UploadAppenderFile = 23,
    AppendFile = 24,
    ModifyFile = 34,
    TruncateFile = 36,
    RenameFile = 38,
    SyncCreateFile = 80,
    SyncDeleteFile = 81,
    SyncUpdateFile = 82,
    SyncAppendFile = 83,
    SyncModifyFile = 84,
    SyncTruncateFile = 85,
    SyncCreateLink = 86,
    SyncRenameFile = 87,
    ReportServerId = 93,
    ActiveTest = 62,
    Quit = 61,
}

impl Cmd {
    pub fn from_u8(byte: u8) -> Option<Cmd> {
        num_traits::FromPrimitive::from_u8(byte)
    }

    pub fn to_u8(self) -> u8 {
        num_traits::ToPrimitive::to_u8(&self).expect("Cmd always fits in u8")
    }

    /// Whether this command is the receive-side of replication, i.e. it
    /// must emit `REPLICA_*` binlog records instead of `SOURCE_*` ones
    /// (`spec.md` §4.D "Sync-*" commands).
    pub fn is_replica_op(self) -> bool {
        matches!(
            self,
            Cmd::SyncCreateFile
                | Cmd::SyncDeleteFile
                | Cmd::SyncUpdateFile
                | Cmd::SyncAppendFile
                | Cmd::SyncModifyFile
                | Cmd::SyncTruncateFile
                | Cmd::SyncCreateLink
                | Cmd::SyncRenameFile
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_match_the_wire_table() {
        assert_eq!(Cmd::UploadFile.to_u8(), 11);
        assert_eq!(Cmd::DownloadFile.to_u8(), 14);
        assert_eq!(Cmd::SyncRenameFile.to_u8(), 87);
        assert_eq!(Cmd::Quit.to_u8(), 61);
    }

    #[test]
    fn from_u8_round_trips_known_codes() {
        assert_eq!(Cmd::from_u8(11), Some(Cmd::UploadFile));
        assert_eq!(Cmd::from_u8(200), None);
    }

    #[test]
    fn sync_commands_are_flagged_as_replica_ops() {
        assert!(Cmd::SyncCreateFile.is_replica_op());
        assert!(!Cmd::UploadFile.is_replica_op());
    }
}
