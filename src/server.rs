//! Process-level wiring (`spec.md` §5 "Concurrency & Resource Model"):
//! the accept loop handing connections to [`crate::fsm::serve_connection`],
//! the scheduler task that drives periodic housekeeping, and the
//! replication workers that tail the binlog out to every known peer.
//!
//! None of these are process-wide singletons — everything here is built
//! from one [`Storage`] and can be stood up more than once in a test
//! process (`spec.md` §9 "Global mutable state").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tracing::{info, warn};

use crate::binlog::{compress::compress_sweep, BinlogReader, ReaderCheckpoint};
use crate::error::Result;
use crate::fsm;
use crate::path_layout;
use crate::peer::Peer;
use crate::replication::{LocalFileSource, PeerWorker, SyncBootstrap, TcpSyncClient};
use crate::storage::Storage;

/// Accepts connections forever, spawning one [`fsm::serve_connection`]
/// task per socket (`spec.md` §5 "accept_threads ... hand new sockets to
/// work_threads network I/O loops"; a multi-threaded tokio runtime plays
/// the role of the work-thread pool here).
pub async fn accept_loop(storage: Arc<Storage>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        socket.set_nodelay(true)?;
        info!(%peer_addr, "accepted storage connection");
        let storage = storage.clone();
        tokio::spawn(async move {
            fsm::serve_connection(storage, socket).await;
        });
    }
}

/// Runs the periodic housekeeping tasks a storage node needs regardless
/// of client traffic (`spec.md` §5 "scheduler thread"): binlog flush,
/// compression sweep, and pending trunk-file deletion.
pub async fn run_scheduler(storage: Arc<Storage>, live_reader_indices: Arc<Mutex<HashMap<String, u32>>>) {
    let mut flush_tick = interval(storage.config.sync_binlog_buff_interval);
    let mut compress_tick = interval(storage.config.binlog_compress_interval);

    loop {
        tokio::select! {
            _ = flush_tick.tick() => {
                if let Err(err) = storage.binlog.flush() {
                    warn!(%err, "scheduled binlog flush failed");
                }
                fsm::commands::sweep_pending_trunk_deletions(&storage).await;
            }
            _ = compress_tick.tick() => {
                let indices: Vec<u32> = live_reader_indices.lock().expect("reader index registry poisoned").values().copied().collect();
                let sync_dir = storage.binlog.sync_dir().to_path_buf();
                match compress_sweep(&sync_dir, &indices) {
                    Ok(new_compress) => info!(new_compress, "binlog compression sweep completed"),
                    Err(err) => warn!(%err, "binlog compression sweep failed"),
                }
            }
        }
    }
}

/// Reads payloads for a replication worker directly off local disk
/// through the decoded filename's physical path, including trunk-packed
/// files (`spec.md` §4.F requires `LocalFileSource` to read through
/// `path_layout`/`trunk`, as opposed to the test-only in-memory source in
/// `replication::worker`'s unit tests).
pub struct StorageFileSource {
    storage: Arc<Storage>,
}

impl StorageFileSource {
    pub fn new(storage: Arc<Storage>) -> StorageFileSource {
        StorageFileSource { storage }
    }

    fn payload_bytes(&self, filename: &str) -> Result<Vec<u8>> {
        let name = path_layout::decode(filename.rsplit('/').next().unwrap_or(filename))?;
        let path = self.storage.physical_path(&name)?;
        let bytes = std::fs::read(&path)?;
        match name.fields.location {
            path_layout::Location::Standalone { .. } => Ok(bytes),
            path_layout::Location::Trunk { .. } => {
                let header_len = crate::trunk::TRUNK_HEADER_SIZE;
                Ok(bytes.get(header_len..).map(|s| s.to_vec()).unwrap_or_default())
            }
        }
    }
}

impl LocalFileSource for StorageFileSource {
    fn read_file(&self, filename: &str) -> Result<Vec<u8>> {
        self.payload_bytes(filename)
    }

    fn read_range(&self, filename: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = self.payload_bytes(filename)?;
        let start = (offset as usize).min(bytes.len());
        let end = ((offset + len) as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }
}

/// Drives one peer's replication worker forever: connects (retrying with
/// `heart_beat_interval` backoff on failure), reports our server id, then
/// tails the binlog and pushes conflict-free batches (`spec.md` §4.F
/// "Steady state loop").
pub async fn run_peer_replication(
    storage: Arc<Storage>,
    peer: Peer,
    live_reader_indices: Arc<Mutex<HashMap<String, u32>>>,
) {
    let sync_dir = storage.binlog.sync_dir().to_path_buf();
    let source = Arc::new(StorageFileSource::new(storage.clone()));

    loop {
        // `peer.ip` is treated as already carrying `host:port` — the peer
        // table has no separate port field (`spec.md` §3 "Peer Table"
        // only lists id/ip/status/last_sync_src_timestamp).
        let stream = match TcpStream::connect(&peer.ip).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(peer = %peer.id, %err, "failed to connect to peer, backing off");
                tokio::time::sleep(storage.config.heart_beat_interval).await;
                continue;
            }
        };
        let client = Arc::new(TcpSyncClient::new(stream));
        if let Err(err) = client.report_server_id(&storage.self_id).await {
            warn!(peer = %peer.id, %err, "failed to report server id to peer");
            tokio::time::sleep(storage.config.heart_beat_interval).await;
            continue;
        }

        let worker = PeerWorker::new(
            peer.id.clone(),
            storage.group.clone(),
            storage.self_id.clone(),
            storage.config.sync_max_threads,
            storage.config.write_mark_file_freq,
            client,
            source.clone(),
        );

        let mut checkpoint = match ReaderCheckpoint::read_from(&sync_dir, &peer.id) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(peer = %peer.id, %err, "failed to read replication checkpoint, starting fresh");
                ReaderCheckpoint::default()
            }
        };
        // `spec.md` §4.F "Bootstrap": a peer with no persisted assignment
        // in `storage_sync.dat` yet only replays records going forward,
        // matching a node that is not itself the designated sync source
        // for this peer.
        if checkpoint == ReaderCheckpoint::default() {
            let bootstrap = crate::sync_state::SyncStateFile::load(&sync_dir)
                .ok()
                .and_then(|state| state.get(&peer.id))
                .map(SyncBootstrap::from)
                .unwrap_or(SyncBootstrap { sync_src_id_is_us: false, until_timestamp: 0 });
            PeerWorker::<TcpSyncClient, StorageFileSource>::apply_bootstrap(&mut checkpoint, bootstrap);
        }

        let mut reader = BinlogReader::new(sync_dir.clone(), checkpoint.binlog_index, checkpoint.binlog_offset);
        let mut synced_since_mark = 0u64;

        loop {
            live_reader_indices.lock().expect("reader index registry poisoned").insert(peer.id.clone(), reader.index());

            let advanced = match worker.run_once(&mut reader, &mut checkpoint, storage.binlog.current_index()).await {
                Ok(advanced) => advanced,
                Err(err) => {
                    warn!(peer = %peer.id, %err, "replication worker failed, reconnecting");
                    break;
                }
            };

            if !advanced {
                tokio::time::sleep(storage.config.heart_beat_interval).await;
                continue;
            }

            synced_since_mark += 1;
            if synced_since_mark >= storage.config.write_mark_file_freq {
                if let Err(err) = checkpoint.write_to(&sync_dir, &peer.id) {
                    warn!(peer = %peer.id, %err, "failed to persist replication checkpoint");
                }
                synced_since_mark = 0;
            }

            match storage.peer_table.get(&peer.id) {
                Some(current) if matches!(
                    current.status,
                    crate::peer::PeerStatus::Deleted | crate::peer::PeerStatus::IpChanged
                ) => {
                    let _ = checkpoint.write_to(&sync_dir, &peer.id);
                    live_reader_indices.lock().expect("reader index registry poisoned").remove(&peer.id);
                    tokio::time::sleep(storage.config.heart_beat_interval * 2).await;
                    return;
                }
                _ => {}
            }
        }
    }
}
