//! Per-peer replication worker (`spec.md` §4.F).
//!
//! One long-lived worker per peer in the group: bootstraps catch-up state
//! from the tracker, then tails the binlog, deciding which records need
//! to go out and pushing them in conflict-free batches.

use std::sync::Arc;

use tracing::{info, warn};

use crate::binlog::{BinlogReader, Op, ReaderCheckpoint};
use crate::error::{Result, StorageError};

use super::batch::{conflict_free_batches, should_sync};
use super::client::{CreateOutcome, SyncClient};

/// Reads local file bytes for a worker to push to its peer. Decoupled
/// from the concrete storage layout so the worker can be tested without a
/// real `Storage` (the production implementation reads through
/// `path_layout`/`trunk`).
pub trait LocalFileSource: Send + Sync {
    fn read_file(&self, filename: &str) -> Result<Vec<u8>>;
    fn read_range(&self, filename: &str, offset: u64, len: u64) -> Result<Vec<u8>>;
}

/// What the tracker told us about this peer on first contact
/// (`spec.md` §4.F "Bootstrap").
#[derive(Debug, Clone, Copy)]
pub struct SyncBootstrap {
    pub sync_src_id_is_us: bool,
    pub until_timestamp: u32,
}

/// Outcome of replicating one batch: either every record in it succeeded,
/// or the earliest-positioned record that failed, so the caller can
/// rewind the reader there (`spec.md` §4.F step 6 and §8 invariant 5).
pub enum BatchOutcome {
    AllSucceeded { advanced_bytes: u64 },
    FailedAt { record_index: usize },
}

pub struct PeerWorker<C: SyncClient, F: LocalFileSource> {
    pub peer_id: String,
    pub group: String,
    pub self_id: String,
    pub sync_max_threads: usize,
    pub write_mark_file_freq: u64,
    client: Arc<C>,
    source: Arc<F>,
}

impl<C: SyncClient, F: LocalFileSource> PeerWorker<C, F> {
    pub fn new(
        peer_id: impl Into<String>,
        group: impl Into<String>,
        self_id: impl Into<String>,
        sync_max_threads: usize,
        write_mark_file_freq: u64,
        client: Arc<C>,
        source: Arc<F>,
    ) -> PeerWorker<C, F> {
        PeerWorker {
            peer_id: peer_id.into(),
            group: group.into(),
            self_id: self_id.into(),
            sync_max_threads: sync_max_threads.max(1),
            write_mark_file_freq,
            client,
            source,
        }
    }

    /// Applies the tracker's bootstrap answer to a fresh checkpoint
    /// (`spec.md` §4.F "Bootstrap"): we only need historical catch-up if
    /// the tracker named us as this peer's sync source.
    pub fn apply_bootstrap(checkpoint: &mut ReaderCheckpoint, bootstrap: SyncBootstrap) {
        checkpoint.need_sync_old = bootstrap.sync_src_id_is_us;
        checkpoint.until_timestamp = bootstrap.until_timestamp;
    }

    /// Sends one record to the peer, applying the per-op fallback rules
    /// from `spec.md` §4.F "Per-op semantics". Returns `Ok(())` once the
    /// record's effect is durably applied at the peer (including the
    /// case where the fallback path succeeded).
    pub async fn send_record(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        match record.op {
            Op::SourceCreate | Op::ReplicaCreate => self.send_create(record).await,
            Op::SourceUpdate | Op::ReplicaUpdate => self.send_update(record).await,
            Op::SourceAppend | Op::ReplicaAppend => self.send_append(record).await,
            Op::SourceModify | Op::ReplicaModify => self.send_modify(record).await,
            Op::SourceTruncate | Op::ReplicaTruncate => self.send_truncate(record).await,
            Op::SourceDelete | Op::ReplicaDelete => self.send_delete(record).await,
            Op::SourceRename | Op::ReplicaRename => self.send_rename(record).await,
            Op::SourceLink | Op::ReplicaLink => self.send_link(record).await,
        }
    }

    async fn send_create(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        let bytes = match self.source.read_file(&record.filename) {
            Ok(bytes) => bytes,
            // The source file was deleted meanwhile: drop the record
            // (`spec.md` §4.F "Receiver ENOENT on source -> drop record").
            Err(StorageError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        match self.client.sync_create(&self.group, &record.filename, record.timestamp, &bytes).await? {
            CreateOutcome::Created => Ok(()),
            // Different size at the peer: switch to a full UPDATE copy.
            CreateOutcome::AlreadyExists => {
                self.client.sync_update(&self.group, &record.filename, record.timestamp, &bytes).await
            }
        }
    }

    async fn send_update(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        let bytes = match self.source.read_file(&record.filename) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.client.sync_update(&self.group, &record.filename, record.timestamp, &bytes).await
    }

    async fn send_append(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        let bytes = match self.source.read_file(&record.filename) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        match self.client.sync_append(&self.group, &record.filename, record.timestamp, &bytes).await {
            // `spec.md` §4.F "APPEND/MODIFY: on receiver ENOENT, fall back
            // to a full UPDATE copy".
            Err(StorageError::NotFound) => {
                self.client.sync_update(&self.group, &record.filename, record.timestamp, &bytes).await
            }
            other => other,
        }
    }

    async fn send_modify(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        let offset: u64 = record.aux.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        let bytes = match self.source.read_file(&record.filename) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        match self.client.sync_modify(&self.group, &record.filename, offset, record.timestamp, &bytes).await {
            Err(StorageError::NotFound) => {
                self.client.sync_update(&self.group, &record.filename, record.timestamp, &bytes).await
            }
            other => other,
        }
    }

    async fn send_truncate(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        let new_size: u64 = record.aux.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        let old_size = match self.source.read_file(&record.filename) {
            Ok(bytes) => bytes.len() as u64,
            Err(StorageError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.client.sync_truncate(&self.group, &record.filename, old_size, new_size, record.timestamp).await
    }

    async fn send_delete(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        // Idempotent at the receiver; `SyncClient::sync_delete` already
        // folds ENOENT into success.
        self.client.sync_delete(&self.group, &record.filename, record.timestamp).await
    }

    async fn send_rename(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        let new_name = record.aux.clone().unwrap_or_default();
        match self.client.sync_rename(&self.group, &record.filename, &new_name, record.timestamp).await {
            // `spec.md` §4.F "RENAME: on receiver ENOENT, fall back to CREATE".
            Err(StorageError::NotFound) => {
                let bytes = self.source.read_file(&new_name)?;
                match self.client.sync_create(&self.group, &new_name, record.timestamp, &bytes).await? {
                    CreateOutcome::Created | CreateOutcome::AlreadyExists => Ok(()),
                }
            }
            other => other,
        }
    }

    async fn send_link(&self, record: &crate::binlog::BinlogRecord) -> Result<()> {
        let src_name = record.aux.clone().unwrap_or_default();
        self.client.sync_link(&self.group, &record.filename, &src_name, record.timestamp).await
    }

    /// Replicates one conflict-free batch of records sequentially (the
    /// concurrency knob is `sync_max_threads` records per batch, not
    /// within-batch parallelism here — callers that want a shared thread
    /// pool across batches drive several `dispatch_batch` futures with
    /// `tokio::join!`/`FuturesUnordered`).
    pub async fn dispatch_batch(&self, records: &[crate::binlog::BinlogRecord]) -> BatchOutcome {
        for (i, record) in records.iter().enumerate() {
            if let Err(err) = self.send_record(record).await {
                warn!(peer = %self.peer_id, filename = %record.filename, %err, "replication send failed, rewinding batch");
                return BatchOutcome::FailedAt { record_index: i };
            }
        }
        let advanced_bytes = records.iter().map(|r| r.format().len() as u64).sum();
        BatchOutcome::AllSucceeded { advanced_bytes }
    }

    /// One steady-state iteration: reads up to `self.sync_max_threads`
    /// pending records from `reader`, filters by [`should_sync`], groups
    /// them into conflict-free batches via [`conflict_free_batches`], and
    /// replicates each batch (`spec.md` §4.F steps 4-7).
    pub async fn run_once(
        &self,
        reader: &mut BinlogReader,
        checkpoint: &mut ReaderCheckpoint,
        current_write_index: u32,
    ) -> Result<bool> {
        let mut pending = Vec::new();
        while pending.len() < self.sync_max_threads * 4 {
            match reader.read_next(current_write_index)? {
                Some(record) => pending.push(record),
                None => break,
            }
        }
        if pending.is_empty() {
            return Ok(false);
        }

        let eligible: Vec<_> = pending
            .into_iter()
            .filter(|r| should_sync(r, checkpoint.need_sync_old, checkpoint.sync_old_done, checkpoint.until_timestamp))
            .collect();

        let batches = conflict_free_batches(&eligible, self.sync_max_threads);
        for batch_indices in batches {
            let batch: Vec<_> = batch_indices.iter().map(|&i| eligible[i].clone()).collect();
            match self.dispatch_batch(&batch).await {
                BatchOutcome::AllSucceeded { .. } => {
                    checkpoint.sync_row_count += batch.len() as u64;
                }
                BatchOutcome::FailedAt { .. } => {
                    // Rewind the cursor to the last durably persisted
                    // checkpoint so the next call re-reads (and re-sends)
                    // this whole pass from there, including any batch that
                    // already succeeded above; that's safe because every
                    // per-op send is either idempotent or
                    // already-applied-is-success (`spec.md` §4.F step 6).
                    reader.seek(checkpoint.binlog_index, checkpoint.binlog_offset);
                    return Ok(false);
                }
            }
        }

        let (index, offset) = reader.position();
        checkpoint.binlog_index = index;
        checkpoint.binlog_offset = offset;
        info!(peer = %self.peer_id, index, offset, "replication checkpoint advanced");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::BinlogRecord;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockClient {
        existing: Mutex<HashMap<String, Vec<u8>>>,
        created: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn new() -> MockClient {
            MockClient { existing: Mutex::new(HashMap::new()), created: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl SyncClient for MockClient {
        async fn report_server_id(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn sync_create(&self, _group: &str, name: &str, _src_ts: u32, bytes: &[u8]) -> Result<CreateOutcome> {
            let mut existing = self.existing.lock().unwrap();
            if let Some(current) = existing.get(name) {
                if current.len() == bytes.len() {
                    return Ok(CreateOutcome::AlreadyExists);
                }
                return Ok(CreateOutcome::AlreadyExists);
            }
            existing.insert(name.to_string(), bytes.to_vec());
            self.created.lock().unwrap().push(name.to_string());
            Ok(CreateOutcome::Created)
        }

        async fn sync_update(&self, _group: &str, name: &str, _src_ts: u32, bytes: &[u8]) -> Result<()> {
            self.existing.lock().unwrap().insert(name.to_string(), bytes.to_vec());
            Ok(())
        }

        async fn sync_append(&self, _group: &str, name: &str, _src_ts: u32, _bytes: &[u8]) -> Result<()> {
            if self.existing.lock().unwrap().contains_key(name) {
                Ok(())
            } else {
                Err(StorageError::NotFound)
            }
        }

        async fn sync_modify(&self, _group: &str, _name: &str, _offset: u64, _src_ts: u32, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn sync_truncate(&self, _group: &str, _name: &str, _old: u64, _new: u64, _src_ts: u32) -> Result<()> {
            Ok(())
        }

        async fn sync_delete(&self, _group: &str, _name: &str, _src_ts: u32) -> Result<()> {
            Ok(())
        }

        async fn sync_rename(&self, _group: &str, _old: &str, _new: &str, _src_ts: u32) -> Result<()> {
            Err(StorageError::NotFound)
        }

        async fn sync_link(&self, _group: &str, _dest: &str, _src: &str, _src_ts: u32) -> Result<()> {
            Ok(())
        }
    }

    struct MockSource {
        files: HashMap<String, Vec<u8>>,
    }

    impl LocalFileSource for MockSource {
        fn read_file(&self, filename: &str) -> Result<Vec<u8>> {
            self.files.get(filename).cloned().ok_or(StorageError::NotFound)
        }

        fn read_range(&self, filename: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
            let bytes = self.read_file(filename)?;
            let start = offset as usize;
            let end = (start + len as usize).min(bytes.len());
            Ok(bytes[start.min(bytes.len())..end].to_vec())
        }
    }

    fn worker(client: Arc<MockClient>, source: Arc<MockSource>) -> PeerWorker<MockClient, MockSource> {
        PeerWorker::new("peer-1", "group1", "self", 4, 500, client, source)
    }

    #[tokio::test]
    async fn create_then_append_falls_back_to_update_on_missing_peer_copy() {
        let mut files = HashMap::new();
        files.insert("f1".to_string(), b"hello world".to_vec());
        let source = Arc::new(MockSource { files });
        let client = Arc::new(MockClient::new());
        let w = worker(client.clone(), source);

        let append = BinlogRecord::new(2, Op::SourceAppend, "f1").with_aux("5");
        w.send_record(&append).await.unwrap();
        assert_eq!(client.existing.lock().unwrap().get("f1").unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn create_of_missing_source_file_is_dropped_silently() {
        let source = Arc::new(MockSource { files: HashMap::new() });
        let client = Arc::new(MockClient::new());
        let w = worker(client, source);
        let create = BinlogRecord::new(1, Op::SourceCreate, "gone");
        assert!(w.send_record(&create).await.is_ok());
    }

    #[tokio::test]
    async fn rename_falls_back_to_create_on_receiver_enoent() {
        let mut files = HashMap::new();
        files.insert("new-name".to_string(), b"payload".to_vec());
        let source = Arc::new(MockSource { files });
        let client = Arc::new(MockClient::new());
        let w = worker(client.clone(), source);
        let rename = BinlogRecord::new(1, Op::SourceRename, "old-name").with_aux("new-name");
        w.send_record(&rename).await.unwrap();
        assert!(client.created.lock().unwrap().contains(&"new-name".to_string()));
    }

    #[tokio::test]
    async fn delete_of_already_missing_file_succeeds() {
        let source = Arc::new(MockSource { files: HashMap::new() });
        let client = Arc::new(MockClient::new());
        let w = worker(client, source);
        let delete = BinlogRecord::new(1, Op::SourceDelete, "already-gone");
        assert!(w.send_record(&delete).await.is_ok());
    }

    /// A client whose first send always fails, to exercise the batch-failure
    /// rewind path in `run_once`.
    struct FlakyClient {
        inner: MockClient,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl SyncClient for FlakyClient {
        async fn report_server_id(&self, id: &str) -> Result<()> {
            self.inner.report_server_id(id).await
        }

        async fn sync_create(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<CreateOutcome> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::RemotePeerDown("simulated".to_string()));
            }
            self.inner.sync_create(group, name, src_ts, bytes).await
        }

        async fn sync_update(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<()> {
            self.inner.sync_update(group, name, src_ts, bytes).await
        }

        async fn sync_append(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<()> {
            self.inner.sync_append(group, name, src_ts, bytes).await
        }

        async fn sync_modify(&self, group: &str, name: &str, offset: u64, src_ts: u32, bytes: &[u8]) -> Result<()> {
            self.inner.sync_modify(group, name, offset, src_ts, bytes).await
        }

        async fn sync_truncate(&self, group: &str, name: &str, old: u64, new: u64, src_ts: u32) -> Result<()> {
            self.inner.sync_truncate(group, name, old, new, src_ts).await
        }

        async fn sync_delete(&self, group: &str, name: &str, src_ts: u32) -> Result<()> {
            self.inner.sync_delete(group, name, src_ts).await
        }

        async fn sync_rename(&self, group: &str, old: &str, new: &str, src_ts: u32) -> Result<()> {
            self.inner.sync_rename(group, old, new, src_ts).await
        }

        async fn sync_link(&self, group: &str, dest: &str, src: &str, src_ts: u32) -> Result<()> {
            self.inner.sync_link(group, dest, src, src_ts).await
        }
    }

    #[tokio::test]
    async fn run_once_rewinds_and_reissues_after_a_batch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let writer = crate::binlog::BinlogWriter::open(dir.path().to_path_buf(), 1024 * 1024, 4096).unwrap();
        writer.append(&BinlogRecord::new(1, Op::SourceCreate, "f1")).unwrap();
        writer.flush().unwrap();

        let mut files = HashMap::new();
        files.insert("f1".to_string(), b"payload".to_vec());
        let source = Arc::new(MockSource { files });
        let client = Arc::new(FlakyClient { inner: MockClient::new(), fail_next: std::sync::atomic::AtomicBool::new(true) });
        let w = PeerWorker::new("peer-1", "group1", "self", 4, 500, client.clone(), source);

        let mut checkpoint = ReaderCheckpoint::default();
        let mut reader = BinlogReader::new(dir.path().to_path_buf(), 0, 0);

        // First pass: the send fails, so the reader must be rewound and no
        // checkpoint progress recorded.
        let advanced = w.run_once(&mut reader, &mut checkpoint, writer.current_index()).await.unwrap();
        assert!(!advanced);
        assert_eq!((checkpoint.binlog_index, checkpoint.binlog_offset), (0, 0));
        assert!(client.inner.created.lock().unwrap().is_empty());

        // Second pass re-reads the same record (now succeeding) and advances.
        let advanced = w.run_once(&mut reader, &mut checkpoint, writer.current_index()).await.unwrap();
        assert!(advanced);
        assert!(client.inner.created.lock().unwrap().contains(&"f1".to_string()));
        assert_ne!((checkpoint.binlog_index, checkpoint.binlog_offset), (0, 0));
    }
}
