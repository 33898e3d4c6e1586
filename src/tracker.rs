//! # Tracker Requests
//!
//! Asks HTTP trackers for peers. Every tracker URL is queried in parallel and
//! the compact peer lists of all successful answers are merged.

use crate::peer::{self, Peer, PEER_ID_SIZE};
use crate::piece::HASH_SIZE;

use anyhow::{anyhow, Result};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

/// Default port for BitTorrent client connections
pub const DEFAULT_PORT: u16 = 6881;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Characters sent verbatim in binary query parameters (RFC 3986 unreserved)
const BINARY_PARAM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'~')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

#[derive(Debug, Deserialize)]
struct BencodeTracker {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: Option<u64>,
    // Compact peer list
    #[serde(default)]
    peers: Option<ByteBuf>,
}

/// Builds the announce URL for a tracker.
///
/// # Arguments
///
/// * `announce` - The tracker URL.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - 20-byte string used as a unique ID for the client.
/// * `port` - Port number that the client is listening on.
/// * `left` - Number of bytes still to download.
///
pub fn build_tracker_url(
    announce: &str,
    info_hash: &[u8; HASH_SIZE],
    peer_id: &[u8; PEER_ID_SIZE],
    port: u16,
    left: u64,
) -> Result<String> {
    let base_url = Url::parse(announce)
        .map_err(|e| anyhow!("could not parse tracker url '{}': {}", announce, e))?;

    // Binary values are encoded by hand, Url would re-encode the percent signs
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode(info_hash, BINARY_PARAM),
        percent_encode(peer_id, BINARY_PARAM),
        port,
        left
    );

    let mut url = base_url.to_string();
    url.push(if base_url.query().is_some() { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

/// Decodes a bencoded tracker response into its peer list.
pub fn parse_tracker_response(buf: &[u8]) -> Result<Vec<Peer>> {
    let response = serde_bencode::from_bytes::<BencodeTracker>(buf)
        .map_err(|e| anyhow!("could not decode tracker response: {}", e))?;

    if let Some(reason) = response.failure_reason {
        return Err(anyhow!("tracker refused request: {}", reason));
    }

    let peers = response
        .peers
        .ok_or_else(|| anyhow!("tracker response has no peers"))?;

    if let Some(interval) = response.interval {
        debug!("Tracker asks to refresh peers every {}s", interval);
    }

    peer::unmarshal(&peers)
}

fn announce(
    client: &reqwest::blocking::Client,
    tracker_url: &str,
    info_hash: &[u8; HASH_SIZE],
    peer_id: &[u8; PEER_ID_SIZE],
    port: u16,
    left: u64,
) -> Result<Vec<Peer>> {
    let url = build_tracker_url(tracker_url, info_hash, peer_id, port, left)?;
    let response = client.get(&url).send()?.error_for_status()?.bytes()?;
    parse_tracker_response(&response)
}

/// Requests peers from every tracker in parallel.
///
/// Trackers that fail are logged and skipped. Peers announced by several
/// trackers appear once.
///
/// # Errors
///
/// Returns an error when no tracker answered with at least one peer.
pub fn request_peers(
    tracker_urls: &[String],
    info_hash: &[u8; HASH_SIZE],
    peer_id: &[u8; PEER_ID_SIZE],
    port: u16,
    left: u64,
) -> Result<Vec<Peer>> {
    if tracker_urls.is_empty() {
        return Err(anyhow!("no tracker URLs available"));
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()?;

    let handles: Vec<_> = tracker_urls
        .iter()
        .map(|tracker_url| {
            let client = client.clone();
            let tracker_url = tracker_url.clone();
            let info_hash = *info_hash;
            let peer_id = *peer_id;

            thread::spawn(move || {
                match announce(&client, &tracker_url, &info_hash, &peer_id, port, left) {
                    Ok(peers) => {
                        info!("Tracker {} returned {} peers", tracker_url, peers.len());
                        peers
                    }
                    Err(e) => {
                        warn!("Tracker {} failed: {}", tracker_url, e);
                        vec![]
                    }
                }
            })
        })
        .collect();

    let mut responses = vec![];
    for handle in handles {
        match handle.join() {
            Ok(peers) => responses.push(peers),
            Err(_) => error!("Error: tracker thread panicked"),
        }
    }

    let peers = merge_peers(responses);
    if peers.is_empty() {
        return Err(anyhow!("could not get peers from any tracker"));
    }

    Ok(peers)
}

/// Flattens peer lists, keeping the first occurrence of every address.
fn merge_peers(responses: Vec<Vec<Peer>>) -> Vec<Peer> {
    let mut seen = HashSet::new();
    responses
        .into_iter()
        .flatten()
        .filter(|peer| seen.insert(*peer))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn tracker_url_encodes_binary_params() {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xd8;
        info_hash[1] = b'a';
        info_hash[2] = b' ';
        let peer_id = *b"-TX0001-abcdefghijkl";

        let url = build_tracker_url(
            "http://tracker.example:6969/announce",
            &info_hash,
            &peer_id,
            6881,
            150,
        )
        .unwrap();

        assert_eq!(
            url,
            "http://tracker.example:6969/announce?info_hash=%D8a%20%00%00%00%00%00%00%00%00%00%00%00%00%00%00%00%00%00\
             &peer_id=-TX0001-abcdefghijkl&port=6881&uploaded=0&downloaded=0&left=150&compact=1"
        );
    }

    #[test]
    fn tracker_url_keeps_existing_query() {
        let url = build_tracker_url(
            "http://tracker.example/announce?key=abc",
            &[0; 20],
            &[0; 20],
            6881,
            0,
        )
        .unwrap();
        assert!(url.starts_with("http://tracker.example/announce?key=abc&info_hash="));
    }

    #[test]
    fn tracker_url_rejects_garbage() {
        assert!(build_tracker_url("not a url", &[0; 20], &[0; 20], 6881, 0).is_err());
    }

    #[test]
    fn parse_compact_response() {
        let mut buf = b"d8:intervali900e5:peers12:".to_vec();
        buf.extend_from_slice(&[192, 168, 1, 2, 0x1a, 0xe1, 10, 0, 0, 1, 0x1a, 0xe9]);
        buf.push(b'e');

        let peers = parse_tracker_response(&buf).unwrap();
        assert_eq!(
            peers,
            vec![
                Peer::new(Ipv4Addr::new(192, 168, 1, 2), 6881),
                Peer::new(Ipv4Addr::new(10, 0, 0, 1), 6889),
            ]
        );
    }

    #[test]
    fn parse_failure_response() {
        let buf = b"d14:failure reason15:torrent unknowne";
        let err = parse_tracker_response(buf).unwrap_err();
        assert!(err.to_string().contains("torrent unknown"));
    }

    #[test]
    fn parse_rejects_bad_peer_list() {
        let buf = b"d8:intervali900e5:peers5:abcdee";
        assert!(parse_tracker_response(buf).is_err());
        assert!(parse_tracker_response(b"d8:intervali900ee").is_err());
        assert!(parse_tracker_response(b"not bencode").is_err());
    }

    #[test]
    fn merge_removes_duplicates_in_order() {
        let a = Peer::new(Ipv4Addr::new(1, 1, 1, 1), 1);
        let b = Peer::new(Ipv4Addr::new(2, 2, 2, 2), 2);
        let c = Peer::new(Ipv4Addr::new(1, 1, 1, 1), 3);

        let merged = merge_peers(vec![vec![a, b], vec![], vec![b, c, a]]);
        assert_eq!(merged, vec![a, b, c]);
    }

    #[test]
    fn no_trackers_no_peers() {
        assert!(request_peers(&[], &[0; 20], &[0; 20], 6881, 0).is_err());
    }
}
