//! Peer table (`spec.md` §3 "Peer Table", §4.G merge rules).
//!
//! Tracks every other storage node in this node's group: connection
//! status, IP, and the last source timestamp we've synced from it. The
//! tracker reporter is the only writer for most status transitions; peers
//! themselves only drive the `OFFLINE <-> ACTIVE` edge via heart-beats.

use std::collections::HashMap;
use std::sync::Mutex;

/// Status lattice a peer moves through (`spec.md` §3). `DELETED`,
/// `IpChanged`, and `Recovery` are terminal or recovery-only states that
/// only the tracker assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Init,
    WaitSync,
    Syncing,
    Offline,
    Online,
    Active,
    Deleted,
    IpChanged,
    Recovery,
}

impl PeerStatus {
    /// Coarse rank used by the merge rules in `spec.md` §4.G: higher means
    /// "more caught up". `Offline`/`Online`/`Active` share a tier above
    /// `WaitSync`/`Syncing`, which sit above `Init`.
    fn rank(self) -> u8 {
        match self {
            PeerStatus::Init => 0,
            PeerStatus::WaitSync | PeerStatus::Syncing => 1,
            PeerStatus::Offline | PeerStatus::Online | PeerStatus::Active => 2,
            PeerStatus::Deleted | PeerStatus::IpChanged | PeerStatus::Recovery => 3,
        }
    }
}

/// One entry of the peer table.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub ip: String,
    pub status: PeerStatus,
    pub last_sync_src_timestamp: u32,
}

impl Peer {
    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Peer {
        Peer { id: id.into(), ip: ip.into(), status: PeerStatus::Init, last_sync_src_timestamp: 0 }
    }
}

/// The outcome of merging one tracker-reported peer entry into the local
/// table, used by the caller to decide whether to spawn/retire a
/// replication worker or emit a diff record (`spec.md` §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A brand-new active peer was inserted; start replication for it.
    Inserted,
    /// An existing peer's status/ip was updated in place.
    Updated,
    /// The tracker-reported status was ignored (stale or incoming-deleted
    /// peer we've never heard of).
    Ignored,
    /// The local copy was demoted because the tracker reports it `Offline`
    /// while we still think it's `Active`/`Online`.
    Demoted,
    /// The peer lags behind us (`WaitSync`/`Syncing`) and is, in fact, us —
    /// the caller should set `need_rejoin_tracker`.
    SelfNeedsRejoin,
    /// The peer lags behind us and is not us; the caller should emit a
    /// `REPLICA_CHG` diff record back to the tracker.
    EmitReplicaChange,
}

/// Thread-safe peer table. A single mutex guards all merges; replication
/// workers take a point-in-time clone for their own bookkeeping
/// (`spec.md` §5 "Peer table" discipline).
pub struct PeerTable {
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable { peers: Mutex::new(HashMap::new()) }
    }

    /// Merges one tracker-reported peer entry, applying the rules from
    /// `spec.md` §4.G "Peer-table merge rules". `self_id` is this node's
    /// own id, needed to detect the `SelfNeedsRejoin` case.
    pub fn merge(&self, self_id: &str, reported: &Peer) -> MergeOutcome {
        let mut peers = self.peers.lock().expect("peer table mutex poisoned");

        match peers.get_mut(&reported.id) {
            None => {
                if matches!(reported.status, PeerStatus::Deleted | PeerStatus::IpChanged) {
                    return MergeOutcome::Ignored;
                }
                peers.insert(reported.id.clone(), reported.clone());
                MergeOutcome::Inserted
            }
            Some(local) => {
                if reported.status == PeerStatus::Offline
                    && matches!(local.status, PeerStatus::Active | PeerStatus::Online)
                {
                    local.status = PeerStatus::Offline;
                    return MergeOutcome::Demoted;
                }

                if matches!(reported.status, PeerStatus::WaitSync | PeerStatus::Syncing)
                    && local.status.rank() > reported.status.rank()
                {
                    if reported.id == self_id {
                        return MergeOutcome::SelfNeedsRejoin;
                    }
                    return MergeOutcome::EmitReplicaChange;
                }

                local.status = reported.status;
                local.ip = reported.ip.clone();
                MergeOutcome::Updated
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.lock().expect("peer table mutex poisoned").get(id).cloned()
    }

    pub fn set_status(&self, id: &str, status: PeerStatus) {
        if let Some(peer) = self.peers.lock().expect("peer table mutex poisoned").get_mut(id) {
            peer.status = status;
        }
    }

    pub fn set_last_sync_src_timestamp(&self, id: &str, ts: u32) {
        if let Some(peer) = self.peers.lock().expect("peer table mutex poisoned").get_mut(id) {
            peer.last_sync_src_timestamp = ts;
        }
    }

    /// Snapshot of every peer, for replication workers and the tracker
    /// reporter to iterate without holding the lock.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().expect("peer table mutex poisoned").values().cloned().collect()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        PeerTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_deleted_peer_is_ignored() {
        let table = PeerTable::new();
        let peer = Peer { status: PeerStatus::Deleted, ..Peer::new("p1", "10.0.0.1") };
        assert_eq!(table.merge("me", &peer), MergeOutcome::Ignored);
        assert!(table.get("p1").is_none());
    }

    #[test]
    fn unknown_active_peer_is_inserted() {
        let table = PeerTable::new();
        let peer = Peer { status: PeerStatus::Active, ..Peer::new("p1", "10.0.0.1") };
        assert_eq!(table.merge("me", &peer), MergeOutcome::Inserted);
        assert_eq!(table.get("p1").unwrap().status, PeerStatus::Active);
    }

    #[test]
    fn active_peer_reported_offline_is_demoted() {
        let table = PeerTable::new();
        table.merge("me", &Peer { status: PeerStatus::Active, ..Peer::new("p1", "10.0.0.1") });
        let outcome =
            table.merge("me", &Peer { status: PeerStatus::Offline, ..Peer::new("p1", "10.0.0.1") });
        assert_eq!(outcome, MergeOutcome::Demoted);
        assert_eq!(table.get("p1").unwrap().status, PeerStatus::Offline);
    }

    #[test]
    fn lagging_self_report_asks_for_rejoin() {
        let table = PeerTable::new();
        table.merge("me", &Peer { status: PeerStatus::Active, ..Peer::new("me", "10.0.0.1") });
        let outcome =
            table.merge("me", &Peer { status: PeerStatus::WaitSync, ..Peer::new("me", "10.0.0.1") });
        assert_eq!(outcome, MergeOutcome::SelfNeedsRejoin);
    }

    #[test]
    fn lagging_other_peer_emits_replica_change() {
        let table = PeerTable::new();
        table.merge("me", &Peer { status: PeerStatus::Active, ..Peer::new("p1", "10.0.0.1") });
        let outcome =
            table.merge("me", &Peer { status: PeerStatus::Syncing, ..Peer::new("p1", "10.0.0.1") });
        assert_eq!(outcome, MergeOutcome::EmitReplicaChange);
    }

    #[test]
    fn snapshot_reflects_all_inserted_peers() {
        let table = PeerTable::new();
        table.merge("me", &Peer { status: PeerStatus::Active, ..Peer::new("p1", "10.0.0.1") });
        table.merge("me", &Peer { status: PeerStatus::Active, ..Peer::new("p2", "10.0.0.2") });
        assert_eq!(table.snapshot().len(), 2);
    }
}
