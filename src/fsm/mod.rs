//! File service state machine (`spec.md` §4.D, component D): wire-level
//! request/response framing over the per-command handlers in
//! [`commands`]. One connection, one command in flight at a time —
//! `INIT -> RECV_BODY -> DIO_IN_FLIGHT -> SEND_RESPONSE -> INIT/CLOSE`.
//! The idle timeout applies to `INIT`/`RECV_BODY`; once a command's body
//! is fully read, the connection blocks on DIO/replication-free local
//! work until the response is ready (`spec.md` §4.D, §5 "Suspension
//! points").

pub mod commands;
pub mod metadata;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::path_layout::{self, LogicalName};
use crate::protocol::{read_group, write_group, Cmd, Header, GROUP_FIELD_LEN};
use crate::storage::Storage;

use metadata::SetMetadataFlag;

/// Drives one accepted connection until the client sends `QUIT`, an idle
/// timeout elapses, or a protocol-level error forces a close.
pub async fn serve_connection(storage: Arc<Storage>, mut stream: TcpStream) {
    loop {
        let header = match timeout(storage.config.network_idle_timeout, Header::read_from(&mut stream)).await {
            Ok(Ok(header)) => header,
            Ok(Err(_)) => return,
            Err(_) => return,
        };

        let Some(cmd) = Cmd::from_u8(header.cmd) else {
            let _ = respond(&mut stream, StorageError::Protocol(format!("unknown command {}", header.cmd)), &[]).await;
            return;
        };

        if cmd == Cmd::Quit {
            return;
        }

        let mut body = vec![0u8; header.body_len as usize];
        match timeout(storage.config.network_idle_timeout, stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }

        match dispatch(&storage, cmd, &body).await {
            Ok(response) => {
                if respond_ok(&mut stream, &response).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let fatal = err.is_fatal();
                if respond(&mut stream, err, &[]).await.is_err() || fatal {
                    if fatal {
                        warn!("fatal error servicing connection, closing");
                    }
                    return;
                }
            }
        }
    }
}

async fn respond_ok(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let header = Header::new(body.len() as u64, 0, 0);
    header.write_to(stream).await.map_err(to_io)?;
    stream.write_all(body).await
}

async fn respond(stream: &mut TcpStream, err: StorageError, body: &[u8]) -> std::io::Result<()> {
    let status = err.status_code() as u8;
    let header = Header::new(body.len() as u64, 0, status);
    header.write_to(stream).await.map_err(to_io)?;
    stream.write_all(body).await
}

fn to_io(_: StorageError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "header write failed")
}

/// Parses `cmd`'s request body (`spec.md` §6 wire table), runs the
/// matching [`commands`] function, and renders the response body.
async fn dispatch(storage: &Storage, cmd: Cmd, body: &[u8]) -> Result<Vec<u8>> {
    match cmd {
        Cmd::UploadFile | Cmd::UploadAppenderFile => {
            let (path_index, ext, data) = parse_upload(body)?;
            let name = commands::upload(storage, path_index, &ext, data, cmd == Cmd::UploadAppenderFile).await?;
            Ok(upload_response(storage, &name))
        }
        Cmd::UploadSlaveFile => {
            // `master-filename-len:8, file-size:8, prefix:16, ext:6, master, bytes`
            // (`spec.md` §6). `prefix` is accepted but not folded into the
            // generated name: this codec always mints a fresh opaque
            // filename, so there is no human-readable slave suffix to
            // splice a prefix into the way stock FastDFS does.
            if body.len() < 38 {
                return Err(StorageError::Protocol("truncated upload-slave body".to_string()));
            }
            let master_name_len = path_layout_u64(&body[0..8]) as usize;
            let _file_size = path_layout_u64(&body[8..16]);
            let ext = String::from_utf8_lossy(&body[32..38]).trim_end_matches('\0').to_string();
            let rest = &body[38..];
            if rest.len() < master_name_len {
                return Err(StorageError::Protocol("truncated upload-slave body".to_string()));
            }
            let master = decode_local_name(std::str::from_utf8(&rest[..master_name_len]).unwrap_or_default())?;
            let data = rest[master_name_len..].to_vec();
            let name = commands::upload(storage, master.fields.path_index, &ext, data, false).await?;
            Ok(upload_response(storage, &name))
        }
        Cmd::DownloadFile => {
            if body.len() < 16 + GROUP_FIELD_LEN {
                return Err(StorageError::Protocol("truncated download body".to_string()));
            }
            let offset = path_layout_u64(&body[0..8]);
            let len = path_layout_u64(&body[8..16]);
            let _group = read_group(&body[16..16 + GROUP_FIELD_LEN])?;
            let name = decode_local_name(std::str::from_utf8(&body[16 + GROUP_FIELD_LEN..]).unwrap_or_default())?;
            commands::download(storage, &name, offset, len).await
        }
        Cmd::DeleteFile => {
            let (_, name) = parse_group_and_name(body)?;
            commands::delete(storage, &name).await?;
            Ok(Vec::new())
        }
        Cmd::GetMetadata => {
            let (_, name) = parse_group_and_name(body)?;
            Ok(metadata::encode(&commands::get_metadata(storage, &name)?))
        }
        Cmd::SetMetadata => {
            if body.len() < 17 {
                return Err(StorageError::Protocol("truncated set-metadata body".to_string()));
            }
            let name_len = path_layout_u64(&body[0..8]) as usize;
            let meta_len = path_layout_u64(&body[8..16]) as usize;
            let flag = SetMetadataFlag::from_byte(body[16]);
            let rest = &body[17..];
            if rest.len() < GROUP_FIELD_LEN + name_len + meta_len {
                return Err(StorageError::Protocol("truncated set-metadata body".to_string()));
            }
            let _group = read_group(&rest[..GROUP_FIELD_LEN])?;
            let name_bytes = &rest[GROUP_FIELD_LEN..GROUP_FIELD_LEN + name_len];
            let meta_bytes = &rest[GROUP_FIELD_LEN + name_len..GROUP_FIELD_LEN + name_len + meta_len];
            let name = decode_local_name(std::str::from_utf8(name_bytes).unwrap_or_default())?;
            let pairs = metadata::decode(meta_bytes);
            commands::set_metadata(storage, &name, &pairs, flag)?;
            Ok(Vec::new())
        }
        Cmd::CreateLink => {
            // `group:16, master-name, prefix, ext, src-name` per the wire
            // table, but prefix/ext/src-name carry no length prefix of
            // their own on the wire; we fold them into "the rest of the
            // body is the master name" the same way `group:16, name` is
            // handled elsewhere, and derive the link's extension from the
            // decoded master name rather than a separately-framed field.
            if body.len() < GROUP_FIELD_LEN {
                return Err(StorageError::Protocol("truncated create-link body".to_string()));
            }
            let group = read_group(&body[..GROUP_FIELD_LEN])?;
            let rest = std::str::from_utf8(&body[GROUP_FIELD_LEN..])
                .map_err(|_| StorageError::Protocol("create-link name is not utf-8".to_string()))?;
            let master = decode_local_name(rest)?;
            let name = commands::create_symlink(storage, &master, &master.fields.ext).await?;
            let mut out = write_group(&group).to_vec();
            out.extend_from_slice(name.local_path().as_bytes());
            Ok(out)
        }
        Cmd::AppendFile => {
            if body.len() < 16 {
                return Err(StorageError::Protocol("truncated append body".to_string()));
            }
            let name_len = path_layout_u64(&body[0..8]) as usize;
            let _size = path_layout_u64(&body[8..16]);
            let rest = &body[16..];
            if rest.len() < name_len {
                return Err(StorageError::Protocol("truncated append body".to_string()));
            }
            let name = decode_local_name(std::str::from_utf8(&rest[..name_len]).unwrap_or_default())?;
            let data = rest[name_len..].to_vec();
            commands::append(storage, &name, data).await?;
            Ok(Vec::new())
        }
        Cmd::ModifyFile => {
            if body.len() < 24 {
                return Err(StorageError::Protocol("truncated modify body".to_string()));
            }
            let name_len = path_layout_u64(&body[0..8]) as usize;
            let offset = path_layout_u64(&body[8..16]);
            let _mod_len = path_layout_u64(&body[16..24]);
            let rest = &body[24..];
            if rest.len() < name_len {
                return Err(StorageError::Protocol("truncated modify body".to_string()));
            }
            let name = decode_local_name(std::str::from_utf8(&rest[..name_len]).unwrap_or_default())?;
            let data = rest[name_len..].to_vec();
            commands::modify(storage, &name, offset, data).await?;
            Ok(Vec::new())
        }
        Cmd::TruncateFile => {
            if body.len() < 16 {
                return Err(StorageError::Protocol("truncated truncate body".to_string()));
            }
            let name_len = path_layout_u64(&body[0..8]) as usize;
            let remain_size = path_layout_u64(&body[8..16]);
            let rest = &body[16..];
            if rest.len() < name_len {
                return Err(StorageError::Protocol("truncated truncate body".to_string()));
            }
            let name = decode_local_name(std::str::from_utf8(&rest[..name_len]).unwrap_or_default())?;
            commands::truncate(storage, &name, remain_size).await?;
            Ok(Vec::new())
        }
        Cmd::RenameFile => {
            if body.len() < 16 {
                return Err(StorageError::Protocol("truncated rename body".to_string()));
            }
            let old_len = path_layout_u64(&body[0..8]) as usize;
            let new_len = path_layout_u64(&body[8..16]) as usize;
            let rest = &body[16..];
            if rest.len() < old_len + new_len {
                return Err(StorageError::Protocol("truncated rename body".to_string()));
            }
            let old = decode_local_name(std::str::from_utf8(&rest[..old_len]).unwrap_or_default())?;
            let new = decode_local_name(std::str::from_utf8(&rest[old_len..old_len + new_len]).unwrap_or_default())?;
            commands::rename(storage, &old, &new).await?;
            Ok(Vec::new())
        }
        Cmd::QueryFileInfo => {
            let (_, name) = parse_group_and_name(body)?;
            let info = commands::query_file_info(&name);
            let mut out = Vec::with_capacity(24);
            out.extend_from_slice(&info.size.to_be_bytes());
            out.extend_from_slice(&(info.timestamp as u64).to_be_bytes());
            out.extend_from_slice(&info.crc32.to_be_bytes());
            out.extend_from_slice(&[0u8; 16]);
            Ok(out)
        }
        Cmd::SyncCreateFile | Cmd::SyncUpdateFile => {
            let (name, data) = parse_sync_payload(body)?;
            commands::sync::create_or_update(storage, &name, data, cmd == Cmd::SyncCreateFile).await?;
            Ok(Vec::new())
        }
        Cmd::SyncDeleteFile => {
            if body.len() < 4 + GROUP_FIELD_LEN {
                return Err(StorageError::Protocol("truncated sync-delete body".to_string()));
            }
            let rest = &body[4..];
            let _group = read_group(&rest[..GROUP_FIELD_LEN])?;
            let name = decode_local_name(std::str::from_utf8(&rest[GROUP_FIELD_LEN..]).unwrap_or_default())?;
            commands::sync::delete(storage, &name).await?;
            Ok(Vec::new())
        }
        Cmd::SyncAppendFile | Cmd::SyncModifyFile => {
            if body.len() < 24 {
                return Err(StorageError::Protocol("truncated sync-append/modify body".to_string()));
            }
            let name_len = path_layout_u64(&body[0..8]) as usize;
            let start = path_layout_u64(&body[8..16]);
            let len = path_layout_u64(&body[16..24]) as usize;
            let rest = &body[24..];
            if rest.len() < 4 + GROUP_FIELD_LEN + name_len + len {
                return Err(StorageError::Protocol("truncated sync-append/modify body".to_string()));
            }
            let rest = &rest[4..];
            let _group = read_group(&rest[..GROUP_FIELD_LEN])?;
            let rest = &rest[GROUP_FIELD_LEN..];
            let name = decode_local_name(std::str::from_utf8(&rest[..name_len]).unwrap_or_default())?;
            let data = rest[name_len..name_len + len].to_vec();
            if cmd == Cmd::SyncAppendFile {
                commands::sync::append(storage, &name, data).await?;
            } else {
                commands::sync::modify(storage, &name, start, data).await?;
            }
            Ok(Vec::new())
        }
        Cmd::SyncTruncateFile => {
            if body.len() < 24 {
                return Err(StorageError::Protocol("truncated sync-truncate body".to_string()));
            }
            let name_len = path_layout_u64(&body[0..8]) as usize;
            let _old_size = path_layout_u64(&body[8..16]);
            let new_size = path_layout_u64(&body[16..24]);
            let rest = &body[24..];
            if rest.len() < 4 + GROUP_FIELD_LEN + name_len {
                return Err(StorageError::Protocol("truncated sync-truncate body".to_string()));
            }
            let rest = &rest[4..];
            let _group = read_group(&rest[..GROUP_FIELD_LEN])?;
            let name = decode_local_name(std::str::from_utf8(&rest[GROUP_FIELD_LEN..GROUP_FIELD_LEN + name_len]).unwrap_or_default())?;
            commands::sync::truncate(storage, &name, new_size).await?;
            Ok(Vec::new())
        }
        Cmd::SyncCreateLink => {
            let (dest, src) = parse_sync_names(body)?;
            commands::sync::link(storage, &dest, &src).await?;
            Ok(Vec::new())
        }
        Cmd::SyncRenameFile => {
            // Same two-name wire shape as `SYNC_CREATE_LINK`; here the
            // first name is the rename's source (old) and the second its
            // destination (new), matching `SyncClient::sync_rename`'s
            // `(old_name, new_name)` send order.
            let (old, new) = parse_sync_names(body)?;
            commands::sync::rename(storage, &old, &new).await?;
            Ok(Vec::new())
        }
        Cmd::ReportServerId => {
            if body.len() < 16 {
                return Err(StorageError::Protocol("truncated report-server-id body".to_string()));
            }
            let id = String::from_utf8_lossy(&body[..16]).trim_end_matches('\0').to_string();
            info!(peer = %id, "peer reported its server id");
            Ok(Vec::new())
        }
        Cmd::ActiveTest => Ok(Vec::new()),
        Cmd::Quit => unreachable!("handled by the caller before dispatch"),
    }
}

fn parse_upload(body: &[u8]) -> Result<(u8, String, Vec<u8>)> {
    if body.len() < 15 {
        return Err(StorageError::Protocol("truncated upload body".to_string()));
    }
    let path_index = body[0];
    let _size = path_layout_u64(&body[1..9]);
    let ext = String::from_utf8_lossy(&body[9..15]).trim_end_matches('\0').to_string();
    Ok((path_index, ext, body[15..].to_vec()))
}

fn upload_response(storage: &Storage, name: &LogicalName) -> Vec<u8> {
    let mut out = write_group(&storage.group).to_vec();
    out.extend_from_slice(name.local_path().as_bytes());
    out
}

fn parse_group_and_name(body: &[u8]) -> Result<(String, LogicalName)> {
    if body.len() < GROUP_FIELD_LEN {
        return Err(StorageError::Protocol("truncated body, missing group field".to_string()));
    }
    let group = read_group(&body[..GROUP_FIELD_LEN])?;
    let name = decode_local_name(std::str::from_utf8(&body[GROUP_FIELD_LEN..]).unwrap_or_default())?;
    Ok((group, name))
}

fn parse_sync_payload(body: &[u8]) -> Result<(LogicalName, Vec<u8>)> {
    if body.len() < 20 + GROUP_FIELD_LEN {
        return Err(StorageError::Protocol("truncated sync-create/update body".to_string()));
    }
    let name_len = path_layout_u64(&body[0..8]) as usize;
    let size = path_layout_u64(&body[8..16]) as usize;
    let rest = &body[20..];
    if rest.len() < GROUP_FIELD_LEN + name_len + size {
        return Err(StorageError::Protocol("truncated sync-create/update body".to_string()));
    }
    let _group = read_group(&rest[..GROUP_FIELD_LEN])?;
    let rest = &rest[GROUP_FIELD_LEN..];
    let name = decode_local_name(std::str::from_utf8(&rest[..name_len]).unwrap_or_default())?;
    let data = rest[name_len..name_len + size].to_vec();
    Ok((name, data))
}

fn parse_sync_names(body: &[u8]) -> Result<(LogicalName, LogicalName)> {
    if body.len() < 20 + GROUP_FIELD_LEN {
        return Err(StorageError::Protocol("truncated sync-link/rename body".to_string()));
    }
    let dest_len = path_layout_u64(&body[0..8]) as usize;
    let src_len = path_layout_u64(&body[8..16]) as usize;
    let rest = &body[20..];
    if rest.len() < GROUP_FIELD_LEN + dest_len + src_len {
        return Err(StorageError::Protocol("truncated sync-link/rename body".to_string()));
    }
    let _group = read_group(&rest[..GROUP_FIELD_LEN])?;
    let rest = &rest[GROUP_FIELD_LEN..];
    let dest = decode_local_name(std::str::from_utf8(&rest[..dest_len]).unwrap_or_default())?;
    let src = decode_local_name(std::str::from_utf8(&rest[dest_len..dest_len + src_len]).unwrap_or_default())?;
    Ok((dest, src))
}

/// Decodes a wire-carried name, which may be `group/M00/XX/YY/<enc>.ext`
/// or the group-less `M00/XX/YY/<enc>.ext` form; only the encoded segment
/// matters to [`path_layout::decode`].
fn decode_local_name(wire: &str) -> Result<LogicalName> {
    let segment = wire.rsplit('/').next().unwrap_or(wire);
    path_layout::decode(segment)
}

fn path_layout_u64(buf: &[u8]) -> u64 {
    crate::protocol::read_u64(buf).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn test_storage() -> (Arc<Storage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::default();
        config.store_paths = vec![dir.path().to_path_buf()];
        config.disk_reader_threads = 1;
        config.disk_writer_threads = 1;
        let storage = Storage::open(config, "group1".to_string(), "self".to_string()).unwrap();
        (Arc::new(storage), dir)
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_through_dispatch() {
        let (storage, _dir) = test_storage();
        let mut upload_body = vec![0xFFu8];
        upload_body.extend_from_slice(&5u64.to_be_bytes());
        upload_body.extend_from_slice(b"txt\0\0\0");
        upload_body.extend_from_slice(b"hello");

        let response = dispatch(&storage, Cmd::UploadFile, &upload_body).await.unwrap();
        let filename = String::from_utf8(response[GROUP_FIELD_LEN..].to_vec()).unwrap();

        let mut download_body = vec![0u8; 8];
        download_body.extend_from_slice(&0u64.to_be_bytes());
        download_body.extend_from_slice(&write_group("group1"));
        download_body.extend_from_slice(filename.as_bytes());

        let downloaded = dispatch(&storage, Cmd::DownloadFile, &download_body).await.unwrap();
        assert_eq!(downloaded, b"hello");
    }

    #[tokio::test]
    async fn active_test_returns_an_empty_body() {
        let (storage, _dir) = test_storage();
        let response = dispatch(&storage, Cmd::ActiveTest, &[]).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_file_surfaces_not_found() {
        let (storage, _dir) = test_storage();
        let name = path_layout::encode_logical_name(0, 1, 5, 1, 1, "txt", false);
        let mut body = write_group("group1").to_vec();
        body.extend_from_slice(name.local_path().as_bytes());
        let err = dispatch(&storage, Cmd::DeleteFile, &body).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }
}
