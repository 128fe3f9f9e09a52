//! Tracker reporter (`spec.md` §4.G, component G): the client side of the
//! join/heart-beat/disk-usage/sync-timestamp conversation with a tracker
//! server, and the logic for handling its responses.
//!
//! The tracker's own RPC surface (`STORAGE_JOIN`, `STORAGE_BEAT`, ...) is
//! treated as an opaque, already-correct external protocol
//! (`spec.md` §6 "Tracker side (consumed)"); this module only defines the
//! shapes a storage node sends and the decisions it makes from what comes
//! back.

pub mod client;
pub mod reporter;

use async_trait::async_trait;

use crate::error::Result;
use crate::peer::{MergeOutcome, Peer, PeerStatus, PeerTable};
use crate::trunk::{TrunkAllocator, TrunkId, TrunkerRole};

pub use client::TcpTrackerClient;
pub use reporter::run_tracker_reporter;

/// What this node tells a tracker on first connect (`spec.md` §4.G "Join").
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub group: String,
    pub domain: String,
    pub version: String,
    pub port: u16,
    pub store_path_count: u8,
    pub join_time: u32,
    pub up_time: u32,
    pub known_trackers: Vec<String>,
}

/// The tracker's answer to a join: our catch-up assignment and status.
#[derive(Debug, Clone)]
pub struct JoinResponse {
    pub sync_src_id: Option<String>,
    pub until_timestamp: u32,
    pub status: PeerStatus,
}

/// One row of the periodic disk-usage report (`spec.md` §4.G "Disk-usage
/// report").
#[derive(Debug, Clone, Copy)]
pub struct DiskUsageRow {
    pub path_index: u8,
    pub free_mb: u64,
    pub total_mb: u64,
}

/// One row of the sync-timestamp report, sent when `sync_change_count`
/// advances (`spec.md` §4.G "Sync-timestamp report").
#[derive(Debug, Clone)]
pub struct SyncTimestampRow {
    pub peer_id: String,
    pub last_sync_src_timestamp: u32,
}

/// A concise peer summary as carried in a `CHANGE_GROUP_SERVER` response
/// (`FDFSStorageBrief` in `spec.md` §4.G).
#[derive(Debug, Clone)]
pub struct ServerBrief {
    pub id: String,
    pub ip: String,
    pub status: PeerStatus,
}

/// The one-byte flag set a tracker response can carry (`spec.md` §4.G
/// "Responses").
#[derive(Debug, Clone)]
pub enum TrackerFlag {
    ChangeTrackerLeader { leader: ServerBrief },
    ChangeTrunkServer { trunk_server: ServerBrief, current_trunk_file_id: Option<TrunkId> },
    ChangeGroupServer { peers: Vec<ServerBrief> },
}

/// Everything a tracker connection needs to speak (`spec.md` §4.G duties).
/// Implementors only need to move bytes; response interpretation lives in
/// the free functions below so it's testable without a socket.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    async fn join(&self, request: &JoinRequest) -> Result<JoinResponse>;
    async fn heartbeat(&self, stats_changed: bool) -> Result<Vec<TrackerFlag>>;
    async fn report_disk_usage(&self, rows: &[DiskUsageRow]) -> Result<()>;
    async fn report_sync_timestamps(&self, rows: &[SyncTimestampRow]) -> Result<()>;
}

/// Outcome of processing one [`TrackerFlag`], surfaced so the caller (the
/// node's scheduler task) can act: spawn/retire replication workers,
/// flip trunker role, adopt a new leader.
#[derive(Debug)]
pub enum FlagOutcome {
    AdoptedTrackerLeader { leader_id: String },
    BecameTrunker { resume_from: Option<TrunkId> },
    ResignedTrunker,
    GroupMergeResults(Vec<(String, MergeOutcome)>),
}

/// Applies one tracker response flag against local state
/// (`spec.md` §4.B "Role" for trunk hand-off, §4.G "Peer-table merge
/// rules" for group-server changes).
pub fn apply_flag(
    flag: &TrackerFlag,
    self_id: &str,
    peer_table: &PeerTable,
    trunk_allocator: &TrunkAllocator,
) -> FlagOutcome {
    match flag {
        TrackerFlag::ChangeTrackerLeader { leader } => {
            FlagOutcome::AdoptedTrackerLeader { leader_id: leader.id.clone() }
        }
        TrackerFlag::ChangeTrunkServer { trunk_server, current_trunk_file_id } => {
            if trunk_server.id == self_id {
                trunk_allocator.set_role(TrunkerRole::Trunker, *current_trunk_file_id);
                FlagOutcome::BecameTrunker { resume_from: *current_trunk_file_id }
            } else {
                trunk_allocator.set_role(TrunkerRole::NotTrunker, None);
                FlagOutcome::ResignedTrunker
            }
        }
        TrackerFlag::ChangeGroupServer { peers } => {
            let results = peers
                .iter()
                .map(|brief| {
                    let peer = Peer { id: brief.id.clone(), ip: brief.ip.clone(), status: brief.status, last_sync_src_timestamp: 0 };
                    let outcome = peer_table.merge(self_id, &peer);
                    (brief.id.clone(), outcome)
                })
                .collect();
            FlagOutcome::GroupMergeResults(results)
        }
    }
}
