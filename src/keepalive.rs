//! # Keep-Alive Driver
//!
//! Peers drop connections that stay silent for too long, so a keep-alive
//! frame must flow on every session at a regular cadence. The driver owns
//! a write handle for each open session and fans a periodic tick out to
//! all of them. The BitTorrent convention is any period under two
//! minutes; the coordinator runs the driver at 120 seconds.

use crate::client::KeepAliveSender;

use crossbeam_channel::tick;

use std::thread;
use std::time::Duration;

/// Periodically sends keep-alive frames on every registered session.
pub struct KeepAliveDriver {
    /// One write handle per open session
    senders: Vec<KeepAliveSender>,
    /// Period between keep-alive rounds
    period: Duration,
}

impl KeepAliveDriver {
    /// Build a driver over the given session handles.
    pub fn new(senders: Vec<KeepAliveSender>, period: Duration) -> KeepAliveDriver {
        KeepAliveDriver { senders, period }
    }

    /// Start the driver in a background thread.
    ///
    /// Send failures are swallowed: a broken session fails its worker
    /// through the read path anyway.
    pub fn spawn(mut self) {
        thread::spawn(move || {
            let ticker = tick(self.period);
            for _ in ticker.iter() {
                for sender in &mut self.senders {
                    if sender.send_keep_alive().is_err() {
                        debug!("Could not send KEEP_ALIVE to peer {:?}", sender.peer());
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::{self, MESSAGE_KEEPALIVE};

    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    #[test]
    fn driver_ticks_keep_alives_on_every_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = TcpStream::connect(addr).unwrap();
        let sender = KeepAliveSender::new(0, conn, Arc::new(Mutex::new(())));

        KeepAliveDriver::new(vec![sender], Duration::from_millis(10)).spawn();

        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // At least two rounds of keep-alive frames
        for _ in 0..2 {
            let received = message::read(&mut stream).unwrap();
            assert_eq!(received.id, MESSAGE_KEEPALIVE);
            assert!(received.payload.is_empty());
        }
    }
}
