//! Refresh client for snapshot consumers

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{PimError, Result};
use crate::protocol::{read_header, write_header, RefreshHeader};

/// Longest we wait for the PIM to scan and reply
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Ask the PIM at `addr` for a fresh snapshot; returns once it is published
pub async fn request_refresh(addr: SocketAddr, header: RefreshHeader) -> Result<RefreshHeader> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_header(&mut stream, &header).await?;
        read_header(&mut stream).await
    };
    let reply = timeout(REFRESH_TIMEOUT, exchange)
        .await
        .map_err(|_| PimError::Protocol(format!("no reply from {addr}")))??;

    if reply != header {
        return Err(PimError::Protocol(format!(
            "reply op {} does not echo request op {}",
            reply.op_code, header.op_code
        )));
    }
    Ok(reply)
}
