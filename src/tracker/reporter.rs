//! Tracker reporter worker (`spec.md` §4.G, component G): one task per
//! configured tracker server driving join, heart-beat, disk-usage, and
//! sync-timestamp reporting, and applying whatever flags come back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::peer::MergeOutcome;
use crate::storage::Storage;
use crate::sync_state::{PeerSyncState, SyncStateFile};

use super::{apply_flag, DiskUsageRow, FlagOutcome, JoinRequest, SyncTimestampRow, TcpTrackerClient, TrackerClient};

/// Shared registry of live reader-checkpoint positions, handed to every
/// spawned replication worker (`server::run_peer_replication`'s
/// `live_reader_indices` parameter) so the scheduler's binlog-compression
/// sweep can compute the minimum live reader index across all peers.
pub type LiveReaderIndices = Arc<Mutex<HashMap<String, u32>>>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

/// Connects to `tracker_addr` and runs the join/heart-beat loop forever,
/// reconnecting with `heart_beat_interval` backoff on failure
/// (`spec.md` §4.G). `need_rejoin` is shared across every tracker-reporter
/// task for this node: when any one of them sees itself reported as
/// lagging (`spec.md` §4.G "the peer is actually us" merge rule) it sets
/// the flag, and every reporter (including this one) reconnects and
/// rejoins on the next tick rather than waiting out a stale session.
pub async fn run_tracker_reporter(
    storage: Arc<Storage>,
    tracker_addr: String,
    need_rejoin: Arc<AtomicBool>,
    live_reader_indices: LiveReaderIndices,
) {
    let start_time = now();

    loop {
        let stream = match TcpStream::connect(&tracker_addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%tracker_addr, %err, "failed to connect to tracker, backing off");
                tokio::time::sleep(storage.config.heart_beat_interval).await;
                continue;
            }
        };
        let client = TcpTrackerClient::new(stream, storage.group.clone(), storage.self_id.clone());

        let join_request = JoinRequest {
            group: storage.group.clone(),
            domain: storage.group.clone(),
            version: VERSION.to_string(),
            port: storage.config.bind_addr.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(0),
            store_path_count: storage.store_paths.len() as u8,
            join_time: start_time,
            up_time: now().saturating_sub(start_time),
            known_trackers: vec![tracker_addr.clone()],
        };

        let response = match client.join(&join_request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%tracker_addr, %err, "tracker join failed, retrying");
                tokio::time::sleep(storage.config.heart_beat_interval).await;
                continue;
            }
        };
        info!(%tracker_addr, status = ?response.status, "joined tracker");

        let sync_dir = storage.binlog.sync_dir().to_path_buf();
        if let Some(sync_src_id) = &response.sync_src_id {
            match SyncStateFile::load(&sync_dir) {
                Ok(mut state) => {
                    let assignment = PeerSyncState {
                        sync_src_id_is_us: sync_src_id == &storage.self_id,
                        until_timestamp: response.until_timestamp,
                    };
                    if let Err(err) = state.set_and_save(&sync_dir, sync_src_id, assignment) {
                        warn!(%err, "failed to persist storage_sync.dat");
                    }
                }
                Err(err) => warn!(%err, "failed to load storage_sync.dat"),
            }
        }

        let mut last_sync_change_count: u64 = 0;
        let mut heartbeat_tick = tokio::time::interval(storage.config.heart_beat_interval);
        let mut stat_tick = tokio::time::interval(storage.config.stat_report_interval);

        'connected: loop {
            tokio::select! {
                _ = heartbeat_tick.tick() => {
                    let stats_changed = storage.binlog.write_version() != last_sync_change_count;
                    last_sync_change_count = storage.binlog.write_version();

                    match client.heartbeat(stats_changed).await {
                        Ok(flags) => {
                            for flag in &flags {
                                let outcome = apply_flag(flag, &storage.self_id, &storage.peer_table, &storage.trunk);
                                log_flag_outcome(&tracker_addr, &outcome);
                                if let FlagOutcome::GroupMergeResults(results) = &outcome {
                                    if results.iter().any(|(_, m)| matches!(m, MergeOutcome::SelfNeedsRejoin)) {
                                        need_rejoin.store(true, Ordering::SeqCst);
                                    }
                                    for (peer_id, merge_outcome) in results {
                                        if *merge_outcome == MergeOutcome::Inserted {
                                            if let Some(peer) = storage.peer_table.get(peer_id) {
                                                tokio::spawn(crate::server::run_peer_replication(
                                                    storage.clone(),
                                                    peer,
                                                    live_reader_indices.clone(),
                                                ));
                                            }
                                        }
                                    }
                                    report_sync_timestamps(&client, &storage).await;
                                }
                            }
                        }
                        Err(err) => {
                            warn!(%tracker_addr, %err, "heart-beat failed, reconnecting to tracker");
                            break 'connected;
                        }
                    }

                    if need_rejoin.swap(false, Ordering::SeqCst) {
                        info!(%tracker_addr, "rejoin requested, reconnecting to tracker");
                        break 'connected;
                    }
                }
                _ = stat_tick.tick() => {
                    if let Err(err) = report_disk_usage(&client, &storage).await {
                        warn!(%tracker_addr, %err, "disk usage report failed");
                    }
                }
            }
        }

        tokio::time::sleep(storage.config.heart_beat_interval).await;
    }
}

fn log_flag_outcome(tracker_addr: &str, outcome: &FlagOutcome) {
    match outcome {
        FlagOutcome::AdoptedTrackerLeader { leader_id } => {
            info!(%tracker_addr, %leader_id, "adopted new tracker leader");
        }
        FlagOutcome::BecameTrunker { resume_from } => {
            info!(%tracker_addr, ?resume_from, "became trunker for this group");
        }
        FlagOutcome::ResignedTrunker => {
            info!(%tracker_addr, "resigned trunker role");
        }
        FlagOutcome::GroupMergeResults(results) => {
            for (peer_id, outcome) in results {
                info!(%tracker_addr, %peer_id, ?outcome, "merged group server entry");
            }
        }
    }
}

/// `spec.md` §4.G "Disk-usage report": statvfs each base path and, in
/// `LOAD_BALANCE` mode, let the path selector know the fresh free-space
/// figures so the next upload picks accordingly.
async fn report_disk_usage(client: &TcpTrackerClient, storage: &Storage) -> crate::error::Result<()> {
    let mut rows = Vec::with_capacity(storage.store_paths.len());
    for path in &storage.store_paths {
        let (free_mb, total_mb) = path.refresh_statvfs_mb()?;
        rows.push(DiskUsageRow { path_index: path.index, free_mb, total_mb });
    }
    client.report_disk_usage(&rows).await
}

/// `spec.md` §4.G "Sync-timestamp report": one row per peer, sent when
/// the group-server merge advances anything.
async fn report_sync_timestamps(client: &TcpTrackerClient, storage: &Storage) {
    let rows: Vec<SyncTimestampRow> = storage
        .peer_table
        .snapshot()
        .into_iter()
        .map(|peer| SyncTimestampRow { peer_id: peer.id, last_sync_src_timestamp: peer.last_sync_src_timestamp })
        .collect();
    if let Err(err) = client.report_sync_timestamps(&rows).await {
        warn!(%err, "sync-timestamp report failed");
    }
}
