//! # Peer Session
//!
//! A session wraps the TCP connection to a single remote peer. Opening a
//! session dials the peer, exchanges handshakes, validates the info hash
//! and receives the peer's initial bitfield; only fully established
//! sessions are handed to download workers.
//!
//! ## Session State
//!
//! - **Choked**: the peer will not answer our requests. Every session
//!   starts choked and is flipped by inbound UNCHOKE/CHOKE messages.
//! - **Bitfield**: the pieces the peer claims to have, extended by
//!   inbound HAVE messages.
//!
//! ## Write Coordination
//!
//! The download worker and the keep-alive driver both write frames on
//! the same connection. A shared lock serializes those writes so a
//! keep-alive can never be interleaved inside another frame.

use crate::bitfield::Bitfield;
use crate::handshake::{self, Handshake};
use crate::message::{
    self, Message, MESSAGE_BITFIELD, MESSAGE_CHOKE, MESSAGE_INTERESTED, MESSAGE_KEEPALIVE,
    MESSAGE_NOT_INTERESTED, MESSAGE_UNCHOKE,
};
use crate::peer::{Peer, PeerId};

use anyhow::{anyhow, Result};

use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Timeout applied to the dial and to the handshake exchange
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
// Timeout applied to the initial bitfield read
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// An established session with a remote peer.
///
/// The session owns the connection: dropping it closes the socket.
pub struct Client {
    /// Information about the remote peer
    peer: Peer,
    /// 20-byte unique identifier of this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent info dictionary
    info_hash: Vec<u8>,
    /// TCP connection to the peer
    conn: TcpStream,
    /// Pieces the peer claims to have
    bitfield: Bitfield,
    /// Whether the peer currently chokes us
    choked: bool,
    /// Serializes frame writes between the worker and the keep-alive driver
    write_lock: Arc<Mutex<()>>,
}

impl Client {
    /// Open a session with a remote peer.
    ///
    /// Dials the peer, performs the handshake and receives the initial
    /// bitfield, each step under its own deadline. A session that fails
    /// any step is never returned and its connection is closed.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer information including IP address and port.
    /// * `peer_id` - 20-byte identifier of this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent info dictionary.
    ///
    pub fn new(peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>) -> Result<Client> {
        // Open connection with remote peer
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = match TcpStream::connect_timeout(&peer_socket, DIAL_TIMEOUT) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not connect to peer {}", peer)),
        };

        let mut client = Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: Bitfield::default(),
            choked: true,
            write_lock: Arc::new(Mutex::new(())),
        };

        // Handshake with remote peer under a short deadline
        client.set_connection_timeout(Some(HANDSHAKE_TIMEOUT))?;
        client.handshake_with_peer()?;
        client.set_connection_timeout(None)?;

        // Receive the initial bitfield under its own deadline
        client.set_connection_timeout(Some(BITFIELD_TIMEOUT))?;
        client.recv_bitfield()?;
        client.set_connection_timeout(None)?;

        info!("Connected to peer {:?}", client.peer.id);

        Ok(client)
    }

    /// Returns whether the peer currently chokes this client.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Check if the peer has a piece available for download.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Mark a piece as available in the peer's bitfield.
    pub fn set_piece(&mut self, index: u32) {
        self.bitfield.set_piece(index)
    }

    /// Set or clear the read/write deadline on the connection.
    pub fn set_connection_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        // Set write timeout
        if self.conn.set_write_timeout(timeout).is_err() {
            return Err(anyhow!("could not set write timeout"));
        }

        // Set read timeout
        if self.conn.set_read_timeout(timeout).is_err() {
            return Err(anyhow!("could not set read timeout"));
        }

        Ok(())
    }

    /// Exchange handshakes and validate the info hash they carry.
    fn handshake_with_peer(&mut self) -> Result<()> {
        // Send handshake to remote peer
        let handshake = Handshake::new(self.peer_id.clone(), self.info_hash.clone());
        if self.conn.write_all(&handshake.serialize()).is_err() {
            return Err(anyhow!("could not send handshake to peer"));
        }

        // Check info hash received from remote peer
        let handshake_received = handshake::read(&mut self.conn)?;
        if handshake_received.info_hash != self.info_hash {
            return Err(anyhow!("invalid info hash received from peer"));
        }

        Ok(())
    }

    /// Receive the initial bitfield, which must be the first message.
    fn recv_bitfield(&mut self) -> Result<()> {
        let message = message::read(&mut self.conn)?;
        if message.id != MESSAGE_BITFIELD {
            return Err(anyhow!(
                "expected MESSAGE_BITFIELD from peer, got id {}",
                message.id
            ));
        }

        info!("Receive MESSAGE_BITFIELD from peer {:?}", self.peer.id);

        // Store bitfield
        self.bitfield = Bitfield::from_bytes(message.payload);

        Ok(())
    }

    /// Read one message from the peer.
    ///
    /// Blocks until a frame arrives or the connection deadline expires.
    pub fn read_message(&mut self) -> Result<Message> {
        let message = message::read(&mut self.conn)?;

        if message.id == MESSAGE_KEEPALIVE {
            info!("Receive KEEP_ALIVE from peer {:?}", self.peer.id);
        }

        Ok(message)
    }

    /// Process a CHOKE message from the peer.
    pub fn read_choke(&mut self) {
        info!("Receive MESSAGE_CHOKE from peer {:?}", self.peer.id);
        self.choked = true
    }

    /// Process an UNCHOKE message from the peer.
    pub fn read_unchoke(&mut self) {
        info!("Receive MESSAGE_UNCHOKE from peer {:?}", self.peer.id);
        self.choked = false
    }

    /// Process a HAVE message and update the peer's bitfield.
    pub fn read_have(&mut self, message: &Message) -> Result<()> {
        info!("Receive MESSAGE_HAVE from peer {:?}", self.peer.id);

        // Get piece index
        let index = message::parse_have(message)?;

        // Update bitfield
        self.set_piece(index);

        Ok(())
    }

    /// Serialize and write one frame under the session write lock.
    fn send_message(&mut self, message: &Message, name: &str) -> Result<()> {
        let message_encoded = message.serialize()?;

        let _guard = self.write_lock.lock().unwrap();
        if self.conn.write_all(&message_encoded).is_err() {
            return Err(anyhow!("could not send {} to peer", name));
        }

        Ok(())
    }

    /// Send a CHOKE message to the peer.
    #[allow(dead_code)]
    pub fn send_choke(&mut self) -> Result<()> {
        info!("Send MESSAGE_CHOKE to peer {:?}", self.peer.id);
        self.send_message(&Message::new(MESSAGE_CHOKE), "MESSAGE_CHOKE")
    }

    /// Send an UNCHOKE message to the peer.
    pub fn send_unchoke(&mut self) -> Result<()> {
        info!("Send MESSAGE_UNCHOKE to peer {:?}", self.peer.id);
        self.send_message(&Message::new(MESSAGE_UNCHOKE), "MESSAGE_UNCHOKE")
    }

    /// Send an INTERESTED message to the peer.
    pub fn send_interested(&mut self) -> Result<()> {
        info!("Send MESSAGE_INTERESTED to peer {:?}", self.peer.id);
        self.send_message(&Message::new(MESSAGE_INTERESTED), "MESSAGE_INTERESTED")
    }

    /// Send a NOT INTERESTED message to the peer.
    #[allow(dead_code)]
    pub fn send_not_interested(&mut self) -> Result<()> {
        info!("Send MESSAGE_NOT_INTERESTED to peer {:?}", self.peer.id);
        self.send_message(
            &Message::new(MESSAGE_NOT_INTERESTED),
            "MESSAGE_NOT_INTERESTED",
        )
    }

    /// Send a HAVE message announcing a completed piece.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        let message = message::format_have(index)?;

        info!("Send MESSAGE_HAVE to peer {:?}", self.peer.id);

        self.send_message(&message, "MESSAGE_HAVE")
    }

    /// Send a REQUEST message asking the peer for a block.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Zero-based byte offset within the piece.
    /// * `length` - Number of bytes to request.
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let message = message::format_request(index, begin, length)?;

        info!(
            "Send MESSAGE_REQUEST for piece {:?} [{:?}:{:?}] to peer {:?}",
            index,
            begin,
            begin + length,
            self.peer.id
        );

        self.send_message(&message, "MESSAGE_REQUEST")
    }

    /// Send a PIECE message carrying a block of data.
    #[allow(dead_code)]
    pub fn send_piece(&mut self, index: u32, begin: u32, block: &[u8]) -> Result<()> {
        let message = message::format_piece(index, begin, block)?;

        info!(
            "Send MESSAGE_PIECE for piece {:?} [{:?}:{:?}] to peer {:?}",
            index,
            begin,
            begin + block.len() as u32,
            self.peer.id
        );

        self.send_message(&message, "MESSAGE_PIECE")
    }

    /// Send a keep-alive frame to the peer.
    #[allow(dead_code)]
    pub fn send_keep_alive(&mut self) -> Result<()> {
        info!("Send KEEP_ALIVE to peer {:?}", self.peer.id);
        self.send_message(&Message::new(MESSAGE_KEEPALIVE), "KEEP_ALIVE")
    }

    /// Build a write handle for the keep-alive driver.
    ///
    /// The handle shares this session's write lock, so keep-alive frames
    /// never interleave with the worker's own sends.
    pub fn keep_alive_sender(&self) -> Result<KeepAliveSender> {
        let conn = match self.conn.try_clone() {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not clone connection to peer")),
        };

        Ok(KeepAliveSender::new(
            self.peer.id,
            conn,
            Arc::clone(&self.write_lock),
        ))
    }
}

/// Write half of a session, used by the keep-alive driver.
pub struct KeepAliveSender {
    peer_id: PeerId,
    conn: TcpStream,
    write_lock: Arc<Mutex<()>>,
}

impl KeepAliveSender {
    pub(crate) fn new(peer_id: PeerId, conn: TcpStream, write_lock: Arc<Mutex<()>>) -> Self {
        KeepAliveSender {
            peer_id,
            conn,
            write_lock,
        }
    }

    /// Returns the id of the peer behind this handle.
    pub fn peer(&self) -> PeerId {
        self.peer_id
    }

    /// Send a keep-alive frame on the session.
    pub fn send_keep_alive(&mut self) -> Result<()> {
        let message_encoded = Message::new(MESSAGE_KEEPALIVE).serialize()?;

        let _guard = self.write_lock.lock().unwrap();
        if self.conn.write_all(&message_encoded).is_err() {
            return Err(anyhow!("could not send KEEP_ALIVE to peer {:?}", self.peer_id));
        }

        Ok(())
    }
}
