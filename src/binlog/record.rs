//! Binlog record format (`spec.md` §3 "Binlog"): `"<ts> <op> <filename> [<aux>]\n"`.

use crate::error::{Result, StorageError};

/// Single-character binlog op-codes. Uppercase is a source op (performed
/// locally by client request); lowercase is the matching replica op
/// (applied from a peer's binlog), per `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SourceCreate,
    SourceAppend,
    SourceDelete,
    SourceUpdate,
    SourceModify,
    SourceTruncate,
    SourceRename,
    SourceLink,
    ReplicaCreate,
    ReplicaAppend,
    ReplicaDelete,
    ReplicaUpdate,
    ReplicaModify,
    ReplicaTruncate,
    ReplicaRename,
    ReplicaLink,
}

impl Op {
    pub fn as_char(self) -> char {
        match self {
            Op::SourceCreate => 'C',
            Op::SourceAppend => 'A',
            Op::SourceDelete => 'D',
            Op::SourceUpdate => 'U',
            Op::SourceModify => 'M',
            Op::SourceTruncate => 'T',
            Op::SourceRename => 'R',
            Op::SourceLink => 'L',
            Op::ReplicaCreate => 'c',
            Op::ReplicaAppend => 'a',
            Op::ReplicaDelete => 'd',
            Op::ReplicaUpdate => 'u',
            Op::ReplicaModify => 'm',
            Op::ReplicaTruncate => 't',
            Op::ReplicaRename => 'r',
            Op::ReplicaLink => 'l',
        }
    }

    pub fn from_char(c: char) -> Result<Op> {
        Ok(match c {
            'C' => Op::SourceCreate,
            'A' => Op::SourceAppend,
            'D' => Op::SourceDelete,
            'U' => Op::SourceUpdate,
            'M' => Op::SourceModify,
            'T' => Op::SourceTruncate,
            'R' => Op::SourceRename,
            'L' => Op::SourceLink,
            'c' => Op::ReplicaCreate,
            'a' => Op::ReplicaAppend,
            'd' => Op::ReplicaDelete,
            'u' => Op::ReplicaUpdate,
            'm' => Op::ReplicaModify,
            't' => Op::ReplicaTruncate,
            'r' => Op::ReplicaRename,
            'l' => Op::ReplicaLink,
            other => return Err(StorageError::Protocol(format!("unknown binlog op {other:?}"))),
        })
    }

    pub fn is_source(self) -> bool {
        self.as_char().is_ascii_uppercase()
    }

    /// The op as it should appear in the replica's own binlog once applied
    /// locally (`spec.md` §4.D "Sync-*" commands emit `REPLICA_*` records).
    pub fn as_replica(self) -> Op {
        match self {
            Op::SourceCreate | Op::ReplicaCreate => Op::ReplicaCreate,
            Op::SourceAppend | Op::ReplicaAppend => Op::ReplicaAppend,
            Op::SourceDelete | Op::ReplicaDelete => Op::ReplicaDelete,
            Op::SourceUpdate | Op::ReplicaUpdate => Op::ReplicaUpdate,
            Op::SourceModify | Op::ReplicaModify => Op::ReplicaModify,
            Op::SourceTruncate | Op::ReplicaTruncate => Op::ReplicaTruncate,
            Op::SourceRename | Op::ReplicaRename => Op::ReplicaRename,
            Op::SourceLink | Op::ReplicaLink => Op::ReplicaLink,
        }
    }
}

/// One parsed binlog line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogRecord {
    pub timestamp: u32,
    pub op: Op,
    pub filename: String,
    /// Optional trailing field: rename/link carry a second filename here,
    /// truncate carries the new size.
    pub aux: Option<String>,
}

impl BinlogRecord {
    pub fn new(timestamp: u32, op: Op, filename: impl Into<String>) -> BinlogRecord {
        BinlogRecord { timestamp, op, filename: filename.into(), aux: None }
    }

    pub fn with_aux(mut self, aux: impl Into<String>) -> BinlogRecord {
        self.aux = Some(aux.into());
        self
    }

    /// Renders this record as the exact line appended to the binlog,
    /// including the trailing newline (`spec.md` §3 format).
    pub fn format(&self) -> String {
        match &self.aux {
            Some(aux) => format!("{} {} {} {}\n", self.timestamp, self.op.as_char(), self.filename, aux),
            None => format!("{} {} {}\n", self.timestamp, self.op.as_char(), self.filename),
        }
    }

    /// Parses one line (without its trailing newline).
    pub fn parse(line: &str) -> Result<BinlogRecord> {
        let mut parts = line.splitn(4, ' ');
        let ts = parts
            .next()
            .ok_or_else(|| StorageError::Protocol("missing timestamp".to_string()))?
            .parse::<u32>()
            .map_err(|e| StorageError::Protocol(e.to_string()))?;
        let op_str = parts.next().ok_or_else(|| StorageError::Protocol("missing op".to_string()))?;
        let op_char = op_str
            .chars()
            .next()
            .ok_or_else(|| StorageError::Protocol("empty op".to_string()))?;
        let op = Op::from_char(op_char)?;
        let filename = parts
            .next()
            .ok_or_else(|| StorageError::Protocol("missing filename".to_string()))?
            .to_string();
        let aux = parts.next().map(|s| s.to_string());

        Ok(BinlogRecord { timestamp: ts, op, filename, aux })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_then_parse_round_trips() {
        let record = BinlogRecord::new(1_700_000_000, Op::SourceCreate, "M00/00/00/abc.txt");
        let line = record.format();
        assert!(line.ends_with('\n'));
        let parsed = BinlogRecord::parse(line.trim_end_matches('\n')).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn aux_field_round_trips() {
        let record =
            BinlogRecord::new(1, Op::SourceRename, "old").with_aux("new");
        let parsed = BinlogRecord::parse(record.format().trim_end_matches('\n')).unwrap();
        assert_eq!(parsed.aux.as_deref(), Some("new"));
    }

    #[test]
    fn source_and_replica_char_case_differ() {
        assert!(Op::SourceCreate.as_char().is_ascii_uppercase());
        assert!(Op::ReplicaCreate.as_char().is_ascii_lowercase());
        assert!(Op::SourceCreate.is_source());
        assert!(!Op::ReplicaCreate.is_source());
    }

    #[test]
    fn as_replica_maps_every_source_op() {
        assert_eq!(Op::SourceCreate.as_replica(), Op::ReplicaCreate);
        assert_eq!(Op::SourceAppend.as_replica(), Op::ReplicaAppend);
    }

    #[test]
    fn parse_rejects_unknown_op() {
        assert!(BinlogRecord::parse("1 Z name").is_err());
    }
}
