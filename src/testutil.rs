//! Test fixtures: a scripted remote peer serving pieces over loopback.
//!
//! The seeder speaks just enough of the peer wire protocol for the
//! session, worker and coordinator tests: it answers the handshake,
//! advertises a configurable bitfield, unchokes on INTERESTED and
//! serves REQUEST messages from an in-memory artifact. A corrupt seeder
//! flips every byte it serves and drops the session once one piece has
//! been fully delivered, which exercises the requeue paths.

use crate::handshake::{self, Handshake};
use crate::message::{self, Message, MESSAGE_BITFIELD, MESSAGE_INTERESTED, MESSAGE_REQUEST};
use crate::peer::Peer;

use std::io::Write;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

/// Behavior of a scripted seeder.
pub struct SeederConfig {
    /// Info hash echoed in the handshake reply
    pub info_hash: Vec<u8>,
    /// The whole artifact the seeder serves from
    pub data: Vec<u8>,
    /// Piece size used to resolve request offsets
    pub piece_length: u32,
    /// Raw payload of the initial BITFIELD message
    pub bitfield: Vec<u8>,
    /// Flip every served byte, and drop the session after one piece
    pub corrupt: bool,
    /// Send CHOKE after serving the first count, UNCHOKE after the second
    pub choke_window: Option<(u32, u32)>,
}

impl SeederConfig {
    pub fn new(info_hash: Vec<u8>, data: Vec<u8>, piece_length: u32, bitfield: Vec<u8>) -> Self {
        SeederConfig {
            info_hash,
            data,
            piece_length,
            bitfield,
            corrupt: false,
            choke_window: None,
        }
    }

    fn piece_size(&self, index: u32) -> u32 {
        let begin = index * self.piece_length;
        let end = (begin + self.piece_length).min(self.data.len() as u32);
        end - begin
    }
}

/// Spawn a seeder for a single inbound session and return its address.
pub fn spawn_seeder(config: SeederConfig) -> (Peer, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) => return,
        };

        // Handshake exchange
        let received = match handshake::read(&mut stream) {
            Ok(received) => received,
            Err(_) => return,
        };
        assert_eq!(received.pstr, b"BitTorrent protocol");
        let reply = Handshake::new(vec![b's'; 20], config.info_hash.clone());
        if stream.write_all(&reply.serialize()).is_err() {
            return;
        }

        // Initial bitfield
        let bitfield = Message::new_with_payload(MESSAGE_BITFIELD, config.bitfield.clone());
        if stream.write_all(&bitfield.serialize().unwrap()).is_err() {
            return;
        }

        serve(&mut stream, &config);
    });

    let peer = Peer {
        id: 0,
        ip: Ipv4Addr::LOCALHOST,
        port,
    };
    (peer, handle)
}

fn serve(stream: &mut TcpStream, config: &SeederConfig) {
    let mut nb_served: u32 = 0;

    loop {
        let message = match message::read(stream) {
            Ok(message) => message,
            Err(_) => return,
        };

        match message.id {
            MESSAGE_INTERESTED => {
                let unchoke = Message::new(message::MESSAGE_UNCHOKE);
                if stream.write_all(&unchoke.serialize().unwrap()).is_err() {
                    return;
                }
            }
            MESSAGE_REQUEST => {
                let (index, begin, length) = match message::parse_request(&message) {
                    Ok(triple) => triple,
                    Err(_) => return,
                };

                let offset = (index * config.piece_length + begin) as usize;
                let end = offset + length as usize;
                if end > config.data.len() {
                    return;
                }

                let mut block = config.data[offset..end].to_vec();
                if config.corrupt {
                    for byte in &mut block {
                        *byte ^= 0xFF;
                    }
                }

                let piece = message::format_piece(index, begin, &block).unwrap();
                if stream.write_all(&piece.serialize().unwrap()).is_err() {
                    return;
                }
                nb_served += 1;

                if let Some((choke_after, unchoke_after)) = config.choke_window {
                    if nb_served == choke_after {
                        let choke = Message::new(message::MESSAGE_CHOKE);
                        if stream.write_all(&choke.serialize().unwrap()).is_err() {
                            return;
                        }
                    }
                    if nb_served == unchoke_after {
                        let unchoke = Message::new(message::MESSAGE_UNCHOKE);
                        if stream.write_all(&unchoke.serialize().unwrap()).is_err() {
                            return;
                        }
                    }
                }

                // A corrupt seeder drops the session once the piece is
                // fully served, so its worker fails over to other peers
                if config.corrupt && begin + length >= config.piece_size(index) {
                    return;
                }
            }
            _ => {}
        }
    }
}
