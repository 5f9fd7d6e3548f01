//! # BitTorrent Handshake
//!
//! The handshake is the fixed-layout message that opens every peer
//! connection and mutually confirms the torrent being exchanged:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of the protocol identifier (19)
//! - **pstr**: Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros, reserved for extensions
//! - **info_hash**: 20 bytes - SHA-1 of the torrent info dictionary
//! - **peer_id**: 20 bytes - Identifier of the sending peer
//!
//! With the standard protocol identifier the whole exchange is 68 bytes
//! in each direction. The info hash is what keeps a peer from joining
//! the wrong swarm: both sides must present the same value.

use anyhow::{anyhow, Result};

use std::io::Read;

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Handshake message exchanged when a peer connection opens.
pub struct Handshake {
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte identifier of the sending peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build a new handshake with the standard protocol identifier.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte identifier of this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent info dictionary.
    ///
    pub fn new(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.as_bytes().to_vec(),
            info_hash,
            peer_id,
        }
    }

    /// Serialize handshake.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(49 + self.pstr.len());

        // Add protocol identifier length
        serialized.push(self.pstr.len() as u8);

        // Add protocol identifier
        serialized.extend_from_slice(&self.pstr);

        // Add reserved bytes
        serialized.extend_from_slice(&[0; 8]);

        // Add info hash
        serialized.extend_from_slice(&self.info_hash);

        // Add peer id
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }
}

/// Read a handshake from a stream.
///
/// A zero protocol identifier length is a fatal decode error.
pub fn read<R: Read>(reader: &mut R) -> Result<Handshake> {
    // Read protocol identifier length
    let mut len_buf = [0; 1];
    if reader.read_exact(&mut len_buf).is_err() {
        return Err(anyhow!(
            "could not read handshake length received from peer"
        ));
    }
    let pstrlen = len_buf[0] as usize;
    if pstrlen == 0 {
        return Err(anyhow!("invalid handshake length received from peer"));
    }

    // Read the remainder: protocol identifier, reserved bytes, info hash, peer id
    let mut handshake_buf: Vec<u8> = vec![0; pstrlen + 48];
    if reader.read_exact(&mut handshake_buf).is_err() {
        return Err(anyhow!("could not read handshake received from peer"));
    }

    let pstr = handshake_buf[0..pstrlen].to_vec();
    let info_hash = handshake_buf[(pstrlen + 8)..(pstrlen + 28)].to_vec();
    let peer_id = handshake_buf[(pstrlen + 28)..].to_vec();

    Ok(Handshake {
        pstr,
        info_hash,
        peer_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn serialize_layout() {
        let handshake = Handshake::new(vec![0x70; 20], vec![0x69; 20]);
        let serialized = handshake.serialize();

        assert_eq!(serialized.len(), 68);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0; 8]);
        assert_eq!(&serialized[28..48], &[0x69; 20]);
        assert_eq!(&serialized[48..68], &[0x70; 20]);
    }

    #[test]
    fn read_reverses_serialize() {
        let handshake = Handshake::new(vec![0x70; 20], vec![0x69; 20]);
        let serialized = handshake.serialize();

        let received = read(&mut Cursor::new(&serialized)).unwrap();
        assert_eq!(received.pstr, handshake.pstr);
        assert_eq!(received.info_hash, handshake.info_hash);
        assert_eq!(received.peer_id, handshake.peer_id);
    }

    #[test]
    fn read_rejects_zero_pstrlen() {
        let buf = vec![0; 68];
        assert!(read(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn read_rejects_truncated_handshake() {
        let handshake = Handshake::new(vec![0x70; 20], vec![0x69; 20]);
        let serialized = handshake.serialize();
        assert!(read(&mut Cursor::new(&serialized[0..40])).is_err());
    }
}
