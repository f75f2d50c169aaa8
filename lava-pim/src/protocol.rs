//! Refresh request header
//!
//! A refresh is one fixed-size header sent over TCP. The server scans,
//! publishes and writes the same header back; there is no payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PimError, Result};

pub const HEADER_LEN: usize = 16;

/// Op code clients use for a refresh
pub const OP_REFRESH: u16 = 1;

/// Big-endian on the wire: op, ref, length, version, reserved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshHeader {
    pub op_code: u16,
    pub ref_code: u16,
    pub length: u32,
    pub version: u32,
    /// Callers put the process group of interest here
    pub reserved: u32,
}

impl RefreshHeader {
    pub fn refresh(pgid: u32) -> Self {
        Self {
            op_code: OP_REFRESH,
            reserved: pgid,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.op_code.to_be_bytes());
        buf[2..4].copy_from_slice(&self.ref_code.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            op_code: u16_at(0),
            ref_code: u16_at(2),
            length: u32_at(4),
            version: u32_at(8),
            reserved: u32_at(12),
        }
    }
}

pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RefreshHeader> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => PimError::Protocol("short header".to_string()),
        _ => PimError::Io(e),
    })?;
    Ok(RefreshHeader::decode(&buf))
}

pub async fn write_header<W: AsyncWrite + Unpin>(writer: &mut W, header: &RefreshHeader) -> Result<()> {
    writer.write_all(&header.encode()).await?;
    writer.flush().await?;
    Ok(())
}
