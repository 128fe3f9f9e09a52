//! Binlog engine (`spec.md` §4.C, component C): the append-only
//! replication log every mutation is recorded to, with rotation,
//! compression, per-peer readers, and durable checkpoints.

pub mod checkpoint;
pub mod compress;
pub mod reader;
pub mod record;
pub mod writer;

pub use checkpoint::ReaderCheckpoint;
pub use reader::BinlogReader;
pub use record::{BinlogRecord, Op};
pub use writer::{read_binlog_file, BinlogIndex, BinlogWriter};
