//! fastdfs-storage - a storage-node reimplementation of FastDFS's
//! upload/download/replication/recovery subsystem.

pub mod binlog;
pub mod config;
pub mod dio;
pub mod error;
pub mod fsm;
pub mod path_layout;
pub mod peer;
pub mod protocol;
pub mod recovery;
pub mod replication;
pub mod server;
pub mod storage;
pub mod sync_state;
pub mod tracker;
pub mod trunk;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::peer::PeerStatus;
use crate::storage::Storage;
use crate::tracker::run_tracker_reporter;

/// Opens a storage node and runs its accept loop, scheduler, tracker
/// reporters, and peer replication workers forever (`spec.md` §5
/// "Scheduling model").
pub async fn serve_forever(config: StorageConfig, self_id: String) -> Result<()> {
    let group = config.group_name.clone();
    let bind_addr = config.bind_addr.clone();
    let tracker_servers = config.tracker_servers.clone();
    let storage = Arc::new(Storage::open(config, group, self_id)?);

    let listener = TcpListener::bind(&bind_addr).await.map_err(error::StorageError::from)?;
    info!(%bind_addr, group = %storage.group, self_id = %storage.self_id, "storage node listening");

    let live_reader_indices: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(server::run_scheduler(storage.clone(), live_reader_indices.clone()));

    // Any peers already known at startup (e.g. recovered from a prior
    // run's persisted state) get a replication worker immediately; every
    // other peer is discovered dynamically via a tracker reporter's
    // `CHANGE_GROUP_SERVER` flag (`spec.md` §4.G).
    for peer in storage.peer_table.snapshot() {
        if matches!(peer.status, PeerStatus::Deleted | PeerStatus::IpChanged) {
            continue;
        }
        tokio::spawn(server::run_peer_replication(storage.clone(), peer, live_reader_indices.clone()));
    }

    let need_rejoin = Arc::new(AtomicBool::new(false));
    for tracker_addr in tracker_servers {
        tokio::spawn(run_tracker_reporter(
            storage.clone(),
            tracker_addr,
            need_rejoin.clone(),
            live_reader_indices.clone(),
        ));
    }

    server::accept_loop(storage, listener).await.map_err(error::StorageError::from)
}
