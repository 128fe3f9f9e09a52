//! Replication engine (`spec.md` §4.F, component F): one worker per peer,
//! tailing the binlog and pushing conflict-free batches of mutations.

pub mod batch;
pub mod client;
pub mod worker;

pub use batch::{conflict_free_batches, should_sync};
pub use client::{CreateOutcome, SyncClient, TcpSyncClient};
pub use worker::{BatchOutcome, LocalFileSource, PeerWorker, SyncBootstrap};
