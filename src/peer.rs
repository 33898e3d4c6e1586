//! # BitTorrent Peer Information
//!
//! This module defines the `Peer` address type and decodes the compact peer
//! lists returned by trackers.
//!
//! ## Compact Peer Format
//!
//! The compact format consists of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! - IP address in network byte order (big-endian)
//! - Port number in network byte order (big-endian)

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;

use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

const PEER_SIZE: usize = 6;

/// Size of a peer identifier in bytes
pub const PEER_ID_SIZE: usize = 20;

/// Network address of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }

    /// Socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV4> for Peer {
    fn from(addr: SocketAddrV4) -> Self {
        Peer::new(*addr.ip(), addr.port())
    }
}

/// Decodes a compact peer list into peers, preserving input order.
///
/// # Errors
///
/// Returns an error if the list length is not a multiple of 6 bytes.
pub fn unmarshal(tracker_peers: &[u8]) -> Result<Vec<Peer>> {
    if tracker_peers.len() % PEER_SIZE != 0 {
        return Err(anyhow!(
            "received malformed peers: {} bytes is not a multiple of {}",
            tracker_peers.len(),
            PEER_SIZE
        ));
    }

    let mut peers = Vec::with_capacity(tracker_peers.len() / PEER_SIZE);
    for record in tracker_peers.chunks_exact(PEER_SIZE) {
        let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
        let port = Cursor::new(&record[4..6]).read_u16::<BigEndian>()?;
        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}

/// Generates a random 20-byte peer id for this run.
pub fn generate_peer_id() -> [u8; PEER_ID_SIZE] {
    let mut peer_id = [0; PEER_ID_SIZE];
    rand::thread_rng().fill(&mut peer_id[..]);
    peer_id
}
