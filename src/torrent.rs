//! # Torrent Files
//!
//! Loads the metadata of a single-file torrent and turns it into a
//! [`Descriptor`] for the piece exchange.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **announce-list**: Tiers of tracker URLs (optional, takes precedence)
//! - **info**: Dictionary with file information and piece hashes
//!   - **pieces**: Concatenated SHA-1 hashes for integrity verification
//!   - **piece length**: Size of each piece (typically 256KB-1MB)
//!   - **length**: Total file size
//!   - **name**: Suggested filename
//!
//! The info hash is the SHA-1 of the `info` dictionary exactly as bencoded,
//! keys this client does not know about included.

use crate::exchange::Descriptor;
use crate::piece::HASH_SIZE;

use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use std::fs;
use std::path::Path;

/// Metadata of a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    pub tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    pub info_hash: [u8; HASH_SIZE],
    /// One 20-byte SHA-1 hash per piece
    pub piece_hashes: Vec<[u8; HASH_SIZE]>,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u32,
    /// Total size of the file in bytes
    pub length: u64,
    /// Suggested filename from torrent metadata
    pub name: String,
}

#[derive(Deserialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Absent from multi-file torrents
    #[serde(default)]
    length: Option<u64>,
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Kept raw so the info hash covers every key
    info: Value,
}

impl TorrentFile {
    /// Opens and parses a torrent file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<TorrentFile> {
        let path = path.as_ref();
        let buf = fs::read(path)
            .with_context(|| format!("could not read torrent '{}'", path.display()))?;
        TorrentFile::from_bytes(&buf)
    }

    /// Parses bencoded torrent metadata.
    pub fn from_bytes(buf: &[u8]) -> Result<TorrentFile> {
        let bencode = serde_bencode::from_bytes::<BencodeTorrent>(buf)
            .map_err(|e| anyhow!("could not decode torrent: {}", e))?;

        let raw_info = serde_bencode::to_bytes(&bencode.info)?;
        let mut info_hash = [0; HASH_SIZE];
        info_hash.copy_from_slice(&Sha1::digest(&raw_info));

        let info = serde_bencode::from_bytes::<BencodeInfo>(&raw_info)
            .map_err(|e| anyhow!("could not decode torrent info: {}", e))?;

        let length = info
            .length
            .ok_or_else(|| anyhow!("multi-file torrents are not supported"))?;

        // Use announce-list when present, shuffling each tier as per BEP 12
        let tiers = if !bencode.announce_list.is_empty() {
            let mut tiers = bencode.announce_list;
            let mut rng = rand::thread_rng();
            for tier in &mut tiers {
                tier.shuffle(&mut rng);
            }
            tiers
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce]]
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        };

        Ok(TorrentFile {
            tiers,
            info_hash,
            piece_hashes: split_pieces_hashes(&info.pieces)?,
            piece_length: info.piece_length,
            length,
            name: info.name,
        })
    }

    /// Every tracker URL, in tier order, without duplicates.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = vec![];
        for url in self.tiers.iter().flatten() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Builds the piece exchange descriptor, checking its consistency.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let descriptor = Descriptor::new(
            self.info_hash,
            self.piece_hashes.clone(),
            self.piece_length,
            self.length,
        )?;
        Ok(descriptor)
    }
}

/// Splits the concatenated `pieces` string into 20-byte SHA-1 hashes.
fn split_pieces_hashes(pieces: &[u8]) -> Result<Vec<[u8; HASH_SIZE]>> {
    if pieces.len() % HASH_SIZE != 0 {
        return Err(anyhow!(
            "torrent is invalid: pieces length {} is not a multiple of {}",
            pieces.len(),
            HASH_SIZE
        ));
    }

    let hashes = pieces
        .chunks_exact(HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0; HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-file torrent with two pieces of a 150-byte file. `extra` is
    /// appended to the info dictionary, after its last standard key.
    fn torrent_bytes(pieces: &[u8], extra: &str) -> Vec<u8> {
        let mut buf = b"d8:announce31:http://tracker.example/announce4:infod".to_vec();
        buf.extend_from_slice(b"6:lengthi150e4:name8:file.bin12:piece lengthi100e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(pieces);
        buf.extend_from_slice(extra.as_bytes());
        buf.extend_from_slice(b"ee");
        buf
    }

    fn expected_info_hash(buf: &[u8]) -> [u8; 20] {
        let start = buf.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(&buf[start..buf.len() - 1]));
        hash
    }

    #[test]
    fn parse_single_file_torrent() {
        let buf = torrent_bytes(&[0xab; 40], "");
        let torrent = TorrentFile::from_bytes(&buf).unwrap();

        assert_eq!(
            torrent.tiers,
            vec![vec!["http://tracker.example/announce".to_string()]]
        );
        assert_eq!(torrent.name, "file.bin");
        assert_eq!(torrent.piece_length, 100);
        assert_eq!(torrent.length, 150);
        assert_eq!(torrent.piece_hashes, vec![[0xab; 20], [0xab; 20]]);
        assert_eq!(torrent.info_hash, expected_info_hash(&buf));

        let descriptor = torrent.descriptor().unwrap();
        assert_eq!(descriptor.piece_count(), 2);
        assert_eq!(descriptor.piece_size(1), 50);
    }

    #[test]
    fn info_hash_covers_unknown_keys() {
        let plain = TorrentFile::from_bytes(&torrent_bytes(&[1; 40], "")).unwrap();

        let buf = torrent_bytes(&[1; 40], "7:privatei1e");
        let private = TorrentFile::from_bytes(&buf).unwrap();

        assert_ne!(plain.info_hash, private.info_hash);
        assert_eq!(private.info_hash, expected_info_hash(&buf));
    }

    #[test]
    fn rejects_truncated_piece_hashes() {
        let buf = torrent_bytes(&[0; 30], "");
        assert!(TorrentFile::from_bytes(&buf).is_err());
    }

    #[test]
    fn descriptor_rejects_wrong_piece_count() {
        let buf = torrent_bytes(&[0; 60], "");
        let torrent = TorrentFile::from_bytes(&buf).unwrap();
        assert!(torrent.descriptor().is_err());
    }

    #[test]
    fn announce_list_takes_precedence() {
        let buf = b"d8:announce5:a-url13:announce-listll5:b-url5:c-urlel5:a-urlee4:infod6:lengthi0e4:name1:x12:piece lengthi16e6:pieces0:ee";
        let torrent = TorrentFile::from_bytes(buf).unwrap();

        assert_eq!(torrent.tiers.len(), 2);
        let mut first = torrent.tiers[0].clone();
        first.sort();
        assert_eq!(first, vec!["b-url".to_string(), "c-url".to_string()]);
        assert_eq!(torrent.tiers[1], vec!["a-url".to_string()]);

        let urls = torrent.tracker_urls();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[2], "a-url");
    }

    #[test]
    fn rejects_multi_file_and_trackerless_torrents() {
        let multi = b"d8:announce5:a-url4:infod5:filesld6:lengthi1e4:pathl1:aeee4:name1:x12:piece lengthi16e6:pieces0:ee";
        assert!(TorrentFile::from_bytes(multi).is_err());

        let trackerless = b"d4:infod6:lengthi0e4:name1:x12:piece lengthi16e6:pieces0:ee";
        assert!(TorrentFile::from_bytes(trackerless).is_err());
    }
}
