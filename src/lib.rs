//! # Torrex
//!
//! A BitTorrent peer wire protocol engine and piece exchange.
//!
//! ## Layers
//!
//! - **Wire**: [`message`] framing, [`handshake`], [`bitfield`]
//! - **Peer session**: [`client`] owns one authenticated connection
//! - **Exchange**: [`exchange`] runs one [`worker`] per peer over a shared
//!   [`picker`] and yields each verified piece exactly once
//! - **Collaborators**: [`torrent`] metadata and [`tracker`] peer discovery
//!
//! ## Example
//!
//! ```no_run
//! use torrex::exchange::Exchange;
//! use torrex::peer::generate_peer_id;
//! use torrex::torrent::TorrentFile;
//! use torrex::tracker;
//!
//! # fn main() -> anyhow::Result<()> {
//! let torrent = TorrentFile::open("debian.iso.torrent")?;
//! let peer_id = generate_peer_id();
//! let peers = tracker::request_peers(
//!     &torrent.tracker_urls(),
//!     &torrent.info_hash,
//!     &peer_id,
//!     tracker::DEFAULT_PORT,
//!     torrent.length,
//! )?;
//!
//! let data = Exchange::new(torrent.descriptor()?, peers, peer_id).download(|_| {})?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod bitfield;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod torrent;
pub mod tracker;
pub mod worker;
