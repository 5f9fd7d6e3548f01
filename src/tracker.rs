//! # Tracker Announce
//!
//! Trackers are the HTTP side of peer discovery: the client announces
//! itself with the torrent info hash and gets back a compact list of
//! peers in the swarm. Every tracker named by the torrent is queried in
//! parallel and the answers are merged, so a single dead tracker never
//! blocks a download.

use crate::peer::{self, Peer};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Timeout on tracker announce requests
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// BencodeTracker structure.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Seconds to wait before refreshing the peer list
    interval: u32,
    // Compact peer records
    peers: ByteBuf,
}

/// Query every tracker and collect the peers they return.
///
/// # Arguments
///
/// * `tiers` - Tracker URL tiers from the torrent metadata.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - 20-byte identifier of this client.
/// * `port` - Port number that the client is listening on.
/// * `length` - Total file size in bytes.
///
pub fn request_peers(
    tiers: &[Vec<String>],
    info_hash: &[u8],
    peer_id: &[u8],
    port: u16,
    length: u32,
) -> Result<Vec<Peer>> {
    // Flatten tiers into a unique list of tracker URLs
    let mut unique_urls = HashSet::new();
    for tier in tiers {
        for url in tier {
            unique_urls.insert(url.clone());
        }
    }
    if unique_urls.is_empty() {
        return Err(anyhow!("no tracker urls available"));
    }

    // Query all trackers in parallel
    let all_peers_bytes = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for tracker_url in unique_urls {
        let info_hash = info_hash.to_vec();
        let peer_id = peer_id.to_vec();
        let all_peers_bytes = Arc::clone(&all_peers_bytes);

        handles.push(thread::spawn(move || {
            match announce(&tracker_url, &info_hash, &peer_id, port, length) {
                Ok(peers_bytes) => all_peers_bytes.lock().unwrap().push(peers_bytes),
                Err(e) => debug!("Skipping tracker {}: {}", tracker_url, e),
            }
        }));
    }

    // Wait for all announces to settle
    for handle in handles {
        let _ = handle.join();
    }

    // Decode and deduplicate peers by address
    let all_peers_bytes = all_peers_bytes.lock().unwrap();
    let mut seen = HashSet::new();
    let mut peers: Vec<Peer> = Vec::new();
    for peers_bytes in all_peers_bytes.iter() {
        let decoded = match peer::unmarshal(peers_bytes) {
            Ok(decoded) => decoded,
            Err(_) => continue,
        };
        for peer in decoded {
            if seen.insert((peer.ip, peer.port)) {
                peers.push(peer);
            }
        }
    }

    if peers.is_empty() {
        return Err(anyhow!("could not get peers from any tracker"));
    }

    // Assign sequential ids used in worker logs
    for (i, peer) in peers.iter_mut().enumerate() {
        peer.id = i as u32;
    }

    Ok(peers)
}

/// Announce to a single tracker and return its compact peer blob.
fn announce(
    announce_url: &str,
    info_hash: &[u8],
    peer_id: &[u8],
    port: u16,
    length: u32,
) -> Result<Vec<u8>> {
    let full_url = build_tracker_url(announce_url, info_hash, peer_id, port, length)?;

    // Build blocking HTTP client
    let client = match reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(_) => return Err(anyhow!("could not build http client")),
    };

    // Send GET request to the tracker
    let response = match client.get(&full_url).send() {
        Ok(response) => match response.bytes() {
            Ok(bytes) => bytes,
            Err(_) => return Err(anyhow!("could not read tracker response")),
        },
        Err(_) => return Err(anyhow!("could not reach tracker")),
    };

    // Deserialize bencoded tracker response
    let tracker_bencode = match de::from_bytes::<BencodeTracker>(&response) {
        Ok(bencode) => bencode,
        Err(_) => return Err(anyhow!("could not decode tracker response")),
    };

    debug!(
        "Tracker {} refresh interval: {}s",
        announce_url, tracker_bencode.interval
    );

    Ok(tracker_bencode.peers.to_vec())
}

/// Build the announce URL with percent-encoded binary fields.
fn build_tracker_url(
    announce: &str,
    info_hash: &[u8],
    peer_id: &[u8],
    port: u16,
    length: u32,
) -> Result<String> {
    // Validate the tracker URL from the torrent
    let base_url = match Url::parse(announce) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse tracker url")),
    };

    // Binary fields are percent-encoded byte by byte
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode(info_hash),
        percent_encode(peer_id),
        port,
        length
    );

    let mut full_url = base_url.to_string();
    if full_url.contains('?') {
        full_url.push('&');
    } else {
        full_url.push('?');
    }
    full_url.push_str(&query);

    Ok(full_url)
}

/// Percent-encode every byte as %XX.
fn percent_encode(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encode_binary_bytes() {
        assert_eq!(percent_encode(&[0x00, 0x12, 0xAB, 0xFF]), "%00%12%AB%FF");
    }

    #[test]
    fn build_tracker_url_with_query() {
        let info_hash = vec![
            216, 247, 57, 206, 195, 40, 149, 108, 204, 91, 191, 31, 134, 217, 253, 207, 219, 168,
            206, 182,
        ];
        let peer_id = vec![
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ];

        let url = build_tracker_url(
            "http://bt.example.com:6969/announce",
            &info_hash,
            &peer_id,
            6881,
            351272960,
        )
        .unwrap();

        assert_eq!(
            url,
            "http://bt.example.com:6969/announce?info_hash=%D8%F7%39%CE%C3%28%95%6C%CC%5B%BF%1F%86%D9%FD%CF%DB%A8%CE%B6&peer_id=%01%02%03%04%05%06%07%08%09%0A%0B%0C%0D%0E%0F%10%11%12%13%14&port=6881&uploaded=0&downloaded=0&left=351272960&compact=1&event=started"
        );
    }

    #[test]
    fn build_tracker_url_appends_to_existing_query() {
        let url = build_tracker_url(
            "http://bt.example.com/announce?key=abc",
            &[0xAA; 20],
            &[0xBB; 20],
            6881,
            1024,
        )
        .unwrap();

        assert!(url.starts_with("http://bt.example.com/announce?key=abc&info_hash="));
    }

    #[test]
    fn build_tracker_url_rejects_invalid_url() {
        assert!(build_tracker_url("not a url", &[0xAA; 20], &[0xBB; 20], 6881, 1024).is_err());
    }
}
