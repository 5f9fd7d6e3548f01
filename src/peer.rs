//! # Peer Addressing
//!
//! Trackers return peers in a compact binary encoding: 6 bytes per peer,
//! an IPv4 address in network order followed by a big-endian port. This
//! module decodes that blob into peer records ready to be dialed.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

// Size of a compact peer record: 4 bytes for the IP, 2 for the port
const PEER_SIZE: usize = 6;

pub type PeerId = u32;

/// A remote peer in the swarm.
#[derive(Clone)]
pub struct Peer {
    /// Identifier assigned to this peer for internal tracking
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port the peer is listening on
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decode a compact peer list received from a tracker.
///
/// # Arguments
///
/// * `buf` - Concatenated 6-byte peer records.
///
pub fn unmarshal(buf: &[u8]) -> Result<Vec<Peer>> {
    // Check the blob is made of whole peer records
    if !buf.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received malformed peers from tracker"));
    }

    let nb_peers = buf.len() / PEER_SIZE;
    let mut peers: Vec<Peer> = Vec::with_capacity(nb_peers);

    for i in 0..nb_peers {
        let offset = i * PEER_SIZE;

        // Read peer IP address
        let ip = Ipv4Addr::new(
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        );

        // Read peer port
        let mut port_cursor = Cursor::new(&buf[offset + 4..offset + 6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer {
            id: i as PeerId,
            ip,
            port,
        });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmarshal_compact_peer_list() {
        let buf = vec![192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x04, 0xD2];
        let peers = unmarshal(&buf).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(peers[1].port, 1234);
    }

    #[test]
    fn unmarshal_rejects_truncated_record() {
        let buf = vec![127, 0, 0, 1, 0x00];
        assert!(unmarshal(&buf).is_err());
    }

    #[test]
    fn unmarshal_empty_list() {
        let peers = unmarshal(&[]).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn peer_formats_as_host_port() {
        let peer = Peer {
            id: 0,
            ip: Ipv4Addr::new(127, 0, 0, 1),
            port: 6881,
        };
        assert_eq!(peer.to_string(), "127.0.0.1:6881");
    }
}
