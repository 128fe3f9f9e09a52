//! Wire-level client for the tracker's own RPC surface (`spec.md` §6
//! "Tracker side (consumed)"). That surface is opaque and the tracker is
//! treated as correct/authoritative, with only the request/response shapes
//! given in §4.G. This module picks one concrete framing (the same
//! `{body_len:8, cmd:1, status:1}` header used on the storage port, with a
//! tracker-local command set) so the reporter has something real to drive.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Result, StorageError};
use crate::peer::PeerStatus;
use crate::protocol::{read_group, write_group, Header, GROUP_FIELD_LEN};
use crate::trunk::TrunkId;

use super::{
    DiskUsageRow, JoinRequest, JoinResponse, ServerBrief, SyncTimestampRow, TrackerClient, TrackerFlag,
};

/// Tracker-local command bytes. Distinct numbering from `protocol::Cmd`
/// since these never cross the storage port.
mod cmd {
    pub const JOIN: u8 = 1;
    pub const BEAT: u8 = 2;
    pub const REPORT_DISK_USAGE: u8 = 3;
    pub const REPORT_SYNC_TIMESTAMPS: u8 = 4;
}

/// Flag tag bytes prefixing each entry of a heartbeat response
/// (`spec.md` §4.G "Responses").
mod flag {
    pub const CHANGE_TRACKER_LEADER: u8 = 1;
    pub const CHANGE_TRUNK_SERVER: u8 = 2;
    pub const CHANGE_GROUP_SERVER: u8 = 3;
}

fn status_byte(status: PeerStatus) -> u8 {
    match status {
        PeerStatus::Init => 0,
        PeerStatus::WaitSync => 1,
        PeerStatus::Syncing => 2,
        PeerStatus::Offline => 3,
        PeerStatus::Online => 4,
        PeerStatus::Active => 5,
        PeerStatus::Deleted => 6,
        PeerStatus::IpChanged => 7,
        PeerStatus::Recovery => 8,
    }
}

fn status_from_byte(byte: u8) -> PeerStatus {
    match byte {
        1 => PeerStatus::WaitSync,
        2 => PeerStatus::Syncing,
        3 => PeerStatus::Offline,
        4 => PeerStatus::Online,
        5 => PeerStatus::Active,
        6 => PeerStatus::Deleted,
        7 => PeerStatus::IpChanged,
        8 => PeerStatus::Recovery,
        _ => PeerStatus::Init,
    }
}

fn write_server_brief(out: &mut Vec<u8>, brief: &ServerBrief) {
    out.extend_from_slice(&write_group(&brief.id));
    out.extend_from_slice(&write_group(&brief.ip));
    out.push(status_byte(brief.status));
}

fn read_server_brief(buf: &[u8]) -> Result<(ServerBrief, usize)> {
    if buf.len() < GROUP_FIELD_LEN * 2 + 1 {
        return Err(StorageError::Protocol("truncated server brief".to_string()));
    }
    let id = read_group(&buf[..GROUP_FIELD_LEN])?;
    let ip = read_group(&buf[GROUP_FIELD_LEN..GROUP_FIELD_LEN * 2])?;
    let status = status_from_byte(buf[GROUP_FIELD_LEN * 2]);
    Ok((ServerBrief { id, ip, status }, GROUP_FIELD_LEN * 2 + 1))
}

/// A [`TrackerClient`] that speaks this module's framing over a single
/// persistent `TcpStream`, mirroring `replication::client::TcpSyncClient`.
pub struct TcpTrackerClient {
    stream: Mutex<TcpStream>,
    group: String,
    self_id: String,
}

impl TcpTrackerClient {
    pub fn new(stream: TcpStream, group: String, self_id: String) -> TcpTrackerClient {
        TcpTrackerClient { stream: Mutex::new(stream), group, self_id }
    }

    async fn request(&self, cmd: u8, body: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        let header = Header::new(body.len() as u64, cmd, 0);
        header.write_to(&mut *stream).await?;
        stream.write_all(body).await.map_err(StorageError::from)?;

        let response = Header::read_from(&mut *stream).await?;
        let mut payload = vec![0u8; response.body_len as usize];
        stream.read_exact(&mut payload).await.map_err(StorageError::from)?;
        if response.status != 0 {
            return Err(StorageError::Protocol(format!("tracker returned status {}", response.status)));
        }
        Ok(payload)
    }

    fn parse_flags(&self, mut buf: &[u8]) -> Result<Vec<TrackerFlag>> {
        let mut flags = Vec::new();
        while !buf.is_empty() {
            let tag = buf[0];
            buf = &buf[1..];
            match tag {
                flag::CHANGE_TRACKER_LEADER => {
                    let (leader, used) = read_server_brief(buf)?;
                    buf = &buf[used..];
                    flags.push(TrackerFlag::ChangeTrackerLeader { leader });
                }
                flag::CHANGE_TRUNK_SERVER => {
                    let (trunk_server, used) = read_server_brief(buf)?;
                    buf = &buf[used..];
                    if buf.len() < 9 {
                        return Err(StorageError::Protocol("truncated trunk server flag".to_string()));
                    }
                    let has_id = buf[0] != 0;
                    let id = BigEndian::read_u64(&buf[1..9]);
                    buf = &buf[9..];
                    flags.push(TrackerFlag::ChangeTrunkServer {
                        trunk_server,
                        current_trunk_file_id: has_id.then_some(id as TrunkId),
                    });
                }
                flag::CHANGE_GROUP_SERVER => {
                    if buf.len() < 2 {
                        return Err(StorageError::Protocol("truncated group server flag".to_string()));
                    }
                    let count = BigEndian::read_u16(&buf[0..2]) as usize;
                    buf = &buf[2..];
                    let mut peers = Vec::with_capacity(count);
                    for _ in 0..count {
                        let (brief, used) = read_server_brief(buf)?;
                        buf = &buf[used..];
                        peers.push(brief);
                    }
                    flags.push(TrackerFlag::ChangeGroupServer { peers });
                }
                other => return Err(StorageError::Protocol(format!("unknown tracker flag tag {other}"))),
            }
        }
        Ok(flags)
    }
}

#[async_trait]
impl TrackerClient for TcpTrackerClient {
    async fn join(&self, request: &JoinRequest) -> Result<JoinResponse> {
        let mut body = Vec::new();
        body.extend_from_slice(&write_group(&request.group));
        body.extend_from_slice(&write_group(&request.domain));
        body.extend_from_slice(&write_group(&request.version));
        body.extend_from_slice(&request.port.to_be_bytes());
        body.push(request.store_path_count);
        body.extend_from_slice(&request.join_time.to_be_bytes());
        body.extend_from_slice(&request.up_time.to_be_bytes());
        body.extend_from_slice(&(request.known_trackers.len() as u16).to_be_bytes());
        for tracker in &request.known_trackers {
            body.extend_from_slice(&write_group(tracker));
        }

        let payload = self.request(cmd::JOIN, &body).await?;
        if payload.len() < 5 {
            return Err(StorageError::Protocol("truncated join response".to_string()));
        }
        let has_src = payload[0] != 0;
        let sync_src_id = has_src.then(|| read_group(&payload[1..1 + GROUP_FIELD_LEN])).transpose()?;
        let offset = 1 + GROUP_FIELD_LEN;
        let until_timestamp = BigEndian::read_u32(&payload[offset..offset + 4]);
        let status = status_from_byte(payload[offset + 4]);
        Ok(JoinResponse { sync_src_id, until_timestamp, status })
    }

    async fn heartbeat(&self, stats_changed: bool) -> Result<Vec<TrackerFlag>> {
        let mut body = Vec::with_capacity(1 + GROUP_FIELD_LEN * 2);
        body.push(stats_changed as u8);
        body.extend_from_slice(&write_group(&self.group));
        body.extend_from_slice(&write_group(&self.self_id));
        let payload = self.request(cmd::BEAT, &body).await?;
        self.parse_flags(&payload)
    }

    async fn report_disk_usage(&self, rows: &[DiskUsageRow]) -> Result<()> {
        let mut body = Vec::with_capacity(1 + rows.len() * 17);
        body.push(rows.len() as u8);
        for row in rows {
            body.push(row.path_index);
            body.extend_from_slice(&row.free_mb.to_be_bytes());
            body.extend_from_slice(&row.total_mb.to_be_bytes());
        }
        self.request(cmd::REPORT_DISK_USAGE, &body).await?;
        Ok(())
    }

    async fn report_sync_timestamps(&self, rows: &[SyncTimestampRow]) -> Result<()> {
        let mut body = Vec::with_capacity(2 + rows.len() * (GROUP_FIELD_LEN + 4));
        body.extend_from_slice(&(rows.len() as u16).to_be_bytes());
        for row in rows {
            body.extend_from_slice(&write_group(&row.peer_id));
            body.extend_from_slice(&row.last_sync_src_timestamp.to_be_bytes());
        }
        self.request(cmd::REPORT_SYNC_TIMESTAMPS, &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_brief_round_trips() {
        let brief = ServerBrief { id: "s1".to_string(), ip: "10.0.0.1".to_string(), status: PeerStatus::Active };
        let mut buf = Vec::new();
        write_server_brief(&mut buf, &brief);
        let (decoded, used) = read_server_brief(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded.id, brief.id);
        assert_eq!(decoded.ip, brief.ip);
        assert_eq!(decoded.status, brief.status);
    }
}
