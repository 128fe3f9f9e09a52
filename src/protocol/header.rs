//! Fixed 10-byte wire header: `{body_len:int64BE, cmd:u8, status:u8}`
//! (`spec.md` §4.D, §6).

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StorageError};

pub const HEADER_SIZE: usize = 10;

/// A parsed request/response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub body_len: u64,
    pub cmd: u8,
    pub status: u8,
}

impl Header {
    pub fn new(body_len: u64, cmd: u8, status: u8) -> Header {
        Header { body_len, cmd, status }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        BigEndian::write_i64(&mut buf[0..8], self.body_len as i64);
        buf[8] = self.cmd;
        buf[9] = self.status;
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Header> {
        let body_len = BigEndian::read_i64(&buf[0..8]);
        if body_len < 0 {
            return Err(StorageError::Protocol(format!("negative body length {body_len}")));
        }
        Ok(Header { body_len: body_len as u64, cmd: buf[8], status: buf[9] })
    }

    pub async fn read_from(stream: &mut (impl AsyncRead + Unpin)) -> Result<Header> {
        let mut buf = [0u8; HEADER_SIZE];
        stream.read_exact(&mut buf).await.map_err(StorageError::from)?;
        Header::decode(&buf)
    }

    pub async fn write_to(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
        stream.write_all(&self.encode()).await.map_err(StorageError::from)
    }
}
