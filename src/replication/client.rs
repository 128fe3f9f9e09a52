//! Wire-level client side of a replication worker: the commands a source
//! storage issues against a peer (`spec.md` §4.F "Per-op semantics", §6
//! `SYNC_*` command table).

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, StorageError};
use crate::protocol::{write_group, Cmd, Header, GROUP_FIELD_LEN};

/// Outcome of a `SYNC_CREATE_FILE`/`SYNC_UPDATE_FILE` send
/// (`spec.md` §4.F: "Receiver may respond EEXIST with identical size ->
/// treated as success; with different size -> sender switches to
/// UPDATE"). The receiver is the one comparing sizes; the sender only
/// ever observes `Created` or `AlreadyExists`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Connection to one peer storage, used by a [`super::worker::PeerWorker`]
/// to push replicated mutations. Implementors only need to speak the
/// `SYNC_*` half of the wire protocol in `spec.md` §6.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn report_server_id(&self, id: &str) -> Result<()>;

    async fn sync_create(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<CreateOutcome>;

    async fn sync_update(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<()>;

    async fn sync_append(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<()>;

    async fn sync_modify(&self, group: &str, name: &str, offset: u64, src_ts: u32, bytes: &[u8]) -> Result<()>;

    async fn sync_truncate(&self, group: &str, name: &str, old_size: u64, new_size: u64, src_ts: u32) -> Result<()>;

    /// Idempotent: a missing file on the receiver is treated as success
    /// (`spec.md` §4.F "DELETE ... receiver idempotent").
    async fn sync_delete(&self, group: &str, name: &str, src_ts: u32) -> Result<()>;

    async fn sync_rename(&self, group: &str, old_name: &str, new_name: &str, src_ts: u32) -> Result<()>;

    async fn sync_link(&self, group: &str, dest_name: &str, src_name: &str, src_ts: u32) -> Result<()>;
}

/// A [`SyncClient`] that speaks the real wire protocol over a single
/// persistent `TcpStream`.
pub struct TcpSyncClient {
    stream: tokio::sync::Mutex<TcpStream>,
}

impl TcpSyncClient {
    pub fn new(stream: TcpStream) -> TcpSyncClient {
        TcpSyncClient { stream: tokio::sync::Mutex::new(stream) }
    }

    async fn request(&self, cmd: Cmd, body: &[u8]) -> Result<(u8, Vec<u8>)> {
        let mut stream = self.stream.lock().await;
        let header = Header::new(body.len() as u64, cmd.to_u8(), 0);
        header.write_to(&mut *stream).await?;
        stream.write_all(body).await.map_err(StorageError::from)?;

        let response = Header::read_from(&mut *stream).await?;
        let mut payload = vec![0u8; response.body_len as usize];
        stream.read_exact(&mut payload).await.map_err(StorageError::from)?;
        Ok((response.status, payload))
    }
}

fn u64_be(v: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, v);
    buf
}

fn u32_be(v: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, v);
    buf
}

/// Maps the one-byte wire status onto `Ok`/`NotFound`/`AlreadyExists`/`DiskIo`.
fn status_to_result(status: u8) -> Result<()> {
    match status {
        0 => Ok(()),
        2 => Err(StorageError::NotFound),
        17 => Err(StorageError::AlreadyExists),
        other => Err(StorageError::Protocol(format!("peer returned status {other}"))),
    }
}

#[async_trait]
impl SyncClient for TcpSyncClient {
    async fn report_server_id(&self, id: &str) -> Result<()> {
        let mut body = vec![0u8; 16];
        let bytes = id.as_bytes();
        let n = bytes.len().min(16);
        body[..n].copy_from_slice(&bytes[..n]);
        let (status, _) = self.request(Cmd::ReportServerId, &body).await?;
        status_to_result(status)
    }

    async fn sync_create(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<CreateOutcome> {
        let mut body = Vec::with_capacity(16 + GROUP_FIELD_LEN + name.len() + bytes.len());
        body.extend_from_slice(&u64_be(name.len() as u64));
        body.extend_from_slice(&u64_be(bytes.len() as u64));
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(bytes);
        let (status, _) = self.request(Cmd::SyncCreateFile, &body).await?;
        match status {
            0 => Ok(CreateOutcome::Created),
            17 => Ok(CreateOutcome::AlreadyExists),
            other => Err(StorageError::Protocol(format!("peer returned status {other}"))),
        }
    }

    async fn sync_update(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(16 + GROUP_FIELD_LEN + name.len() + bytes.len());
        body.extend_from_slice(&u64_be(name.len() as u64));
        body.extend_from_slice(&u64_be(bytes.len() as u64));
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(bytes);
        let (status, _) = self.request(Cmd::SyncUpdateFile, &body).await?;
        status_to_result(status)
    }

    async fn sync_append(&self, group: &str, name: &str, src_ts: u32, bytes: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(24 + GROUP_FIELD_LEN + name.len() + bytes.len());
        body.extend_from_slice(&u64_be(name.len() as u64));
        body.extend_from_slice(&u64_be(0));
        body.extend_from_slice(&u64_be(bytes.len() as u64));
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(bytes);
        let (status, _) = self.request(Cmd::SyncAppendFile, &body).await?;
        status_to_result(status)
    }

    async fn sync_modify(&self, group: &str, name: &str, offset: u64, src_ts: u32, bytes: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(24 + GROUP_FIELD_LEN + name.len() + bytes.len());
        body.extend_from_slice(&u64_be(name.len() as u64));
        body.extend_from_slice(&u64_be(offset));
        body.extend_from_slice(&u64_be(bytes.len() as u64));
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(bytes);
        let (status, _) = self.request(Cmd::SyncModifyFile, &body).await?;
        status_to_result(status)
    }

    async fn sync_truncate(&self, group: &str, name: &str, old_size: u64, new_size: u64, src_ts: u32) -> Result<()> {
        let mut body = Vec::with_capacity(24 + GROUP_FIELD_LEN + name.len());
        body.extend_from_slice(&u64_be(name.len() as u64));
        body.extend_from_slice(&u64_be(old_size));
        body.extend_from_slice(&u64_be(new_size));
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(name.as_bytes());
        let (status, _) = self.request(Cmd::SyncTruncateFile, &body).await?;
        status_to_result(status)
    }

    async fn sync_delete(&self, group: &str, name: &str, src_ts: u32) -> Result<()> {
        let mut body = Vec::with_capacity(4 + GROUP_FIELD_LEN + name.len());
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(name.as_bytes());
        let (status, _) = self.request(Cmd::SyncDeleteFile, &body).await?;
        match status {
            0 | 2 => Ok(()),
            other => Err(StorageError::Protocol(format!("peer returned status {other}"))),
        }
    }

    async fn sync_rename(&self, group: &str, old_name: &str, new_name: &str, src_ts: u32) -> Result<()> {
        let mut body = Vec::with_capacity(20 + GROUP_FIELD_LEN + old_name.len() + new_name.len());
        body.extend_from_slice(&u64_be(old_name.len() as u64));
        body.extend_from_slice(&u64_be(new_name.len() as u64));
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(old_name.as_bytes());
        body.extend_from_slice(new_name.as_bytes());
        let (status, _) = self.request(Cmd::SyncRenameFile, &body).await?;
        status_to_result(status)
    }

    async fn sync_link(&self, group: &str, dest_name: &str, src_name: &str, src_ts: u32) -> Result<()> {
        let mut body = Vec::with_capacity(20 + GROUP_FIELD_LEN + dest_name.len() + src_name.len());
        body.extend_from_slice(&u64_be(dest_name.len() as u64));
        body.extend_from_slice(&u64_be(src_name.len() as u64));
        body.extend_from_slice(&u32_be(src_ts));
        body.extend_from_slice(&write_group(group));
        body.extend_from_slice(dest_name.as_bytes());
        body.extend_from_slice(src_name.as_bytes());
        let (status, _) = self.request(Cmd::SyncCreateLink, &body).await?;
        status_to_result(status)
    }
}
