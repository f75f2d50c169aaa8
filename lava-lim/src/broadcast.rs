//! Load broadcast payload, publishers and the table of peer loads

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use tracing::{debug, warn};

use crate::error::{LimError, Result};
use crate::host::HostStatus;

/// Largest payload we put in one datagram
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexValue {
    pub name: String,
    pub value: f64,
}

/// What a host tells its peers every exchange interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBroadcast {
    pub host: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub status: HostStatus,
    /// Index values before run-queue scaling, in vector order
    pub indices: Vec<IndexValue>,
    /// Shared resource values this host currently owns
    #[serde(default)]
    pub shared: Vec<(String, String)>,
}

impl LoadBroadcast {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(LimError::Protocol(format!(
                "load broadcast of {} bytes exceeds {}",
                bytes.len(),
                MAX_DATAGRAM
            )));
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.indices.iter().find(|i| i.name == name).map(|i| i.value)
    }
}

/// Unix seconds to a UTC timestamp, falling back to the wall clock
pub fn timestamp(now: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now)
}

/// Somewhere load broadcasts go
pub trait LoadPublisher: Send {
    fn publish(&mut self, payload: &LoadBroadcast) -> Result<()>;
}

/// Sends each broadcast as one JSON datagram to every configured peer
pub struct UdpPublisher {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl UdpPublisher {
    pub fn new(peers: &[String]) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let mut resolved = Vec::new();
        for peer in peers {
            match peer.to_socket_addrs() {
                Ok(addrs) => resolved.extend(addrs.take(1)),
                Err(e) => warn!("cannot resolve peer {}: {}", peer, e),
            }
        }
        Ok(Self {
            socket,
            peers: resolved,
        })
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }
}

impl LoadPublisher for UdpPublisher {
    fn publish(&mut self, payload: &LoadBroadcast) -> Result<()> {
        let bytes = payload.to_bytes()?;
        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(&bytes, peer) {
                warn!("load broadcast to {} failed: {}", peer, e);
            }
        }
        debug!("broadcast seq {} to {} peers", payload.seq, self.peers.len());
        Ok(())
    }
}

/// Keeps every payload in memory
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    pub sent: Vec<LoadBroadcast>,
}

impl LoadPublisher for RecordingPublisher {
    fn publish(&mut self, payload: &LoadBroadcast) -> Result<()> {
        self.sent.push(payload.clone());
        Ok(())
    }
}

/// Latest payload heard from each host
#[derive(Debug, Default)]
pub struct ClusterLoadTable {
    hosts: HashMap<String, LoadBroadcast>,
}

impl ClusterLoadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `payload` unless we already hold a newer one from that host
    pub fn record(&mut self, payload: LoadBroadcast) -> bool {
        if let Some(existing) = self.hosts.get(&payload.host) {
            if existing.seq >= payload.seq && existing.timestamp >= payload.timestamp {
                debug!("stale load from {} (seq {})", payload.host, payload.seq);
                return false;
            }
        }
        self.hosts.insert(payload.host.clone(), payload);
        true
    }

    pub fn get(&self, host: &str) -> Option<&LoadBroadcast> {
        self.hosts.get(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// First of `candidates` that is `local` or has reported since `fresh_since`
    pub fn elect_master<'a>(&self, candidates: &'a [String], local: &str, fresh_since: i64) -> Option<&'a str> {
        candidates
            .iter()
            .find(|host| {
                host.as_str() == local
                    || self
                        .hosts
                        .get(host.as_str())
                        .is_some_and(|p| p.timestamp.timestamp() >= fresh_since)
            })
            .map(String::as_str)
    }

    /// Hosts reporting busy in their last payload
    pub fn busy_hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self
            .hosts
            .values()
            .filter(|p| p.status.busy)
            .map(|p| p.host.as_str())
            .collect();
        hosts.sort_unstable();
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(host: &str, seq: u64, at: i64, busy: bool) -> LoadBroadcast {
        LoadBroadcast {
            host: host.to_string(),
            seq,
            timestamp: timestamp(at),
            status: HostStatus {
                busy,
                ..Default::default()
            },
            indices: vec![IndexValue {
                name: "r1m".to_string(),
                value: 0.5,
            }],
            shared: vec![("licA".to_string(), "5".to_string())],
        }
    }

    #[test]
    fn test_payload_json() {
        let sent = payload("hostA", 3, 1_700_000_000, false);
        let decoded = LoadBroadcast::from_bytes(&sent.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, sent);
        assert_eq!(decoded.value("r1m"), Some(0.5));
        assert!(LoadBroadcast::from_bytes(b"{not json").is_err());
    }

    #[test]
    fn test_table_keeps_newest() {
        let mut table = ClusterLoadTable::new();
        assert!(table.record(payload("hostB", 2, 100, true)));
        assert!(!table.record(payload("hostB", 1, 90, false)));
        assert!(table.get("hostB").unwrap().status.busy);
        assert!(table.record(payload("hostB", 3, 130, false)));
        assert!(table.record(payload("hostC", 1, 130, true)));
        assert_eq!(table.len(), 2);
        assert_eq!(table.busy_hosts(), vec!["hostC"]);
    }

    #[test]
    fn test_restarted_peer_is_accepted() {
        let mut table = ClusterLoadTable::new();
        table.record(payload("hostB", 50, 100, false));
        // Sequence restarted but the payload is newer
        assert!(table.record(payload("hostB", 1, 200, false)));
    }

    #[test]
    fn test_master_moves_past_silent_hosts() {
        let order: Vec<String> = ["hostA", "hostB", "hostC"].iter().map(|h| h.to_string()).collect();
        let mut table = ClusterLoadTable::new();
        assert_eq!(table.elect_master(&order, "hostC", 0), Some("hostC"));

        table.record(payload("hostB", 1, 100, false));
        assert_eq!(table.elect_master(&order, "hostC", 50), Some("hostB"));
        assert_eq!(table.elect_master(&order, "hostC", 101), Some("hostC"));
        assert_eq!(table.elect_master(&order, "hostA", 200), Some("hostA"));
        assert_eq!(table.elect_master(&order, "hostZ", 200), None);
    }

    #[test]
    fn test_udp_publisher_delivers() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let addr = receiver.local_addr().unwrap().to_string();

        let mut publisher = UdpPublisher::new(&[addr]).unwrap();
        let sent = payload("hostA", 1, 100, false);
        publisher.publish(&sent).unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(LoadBroadcast::from_bytes(&buf[..n]).unwrap(), sent);
    }
}
