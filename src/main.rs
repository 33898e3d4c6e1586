//! # Torrex BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Usage
//!
//! ```bash
//! torrex <torrent_file>
//! torrex <torrent_file> -o <output_file>
//! ```
//!
//! Logs go to stderr and are controlled with `RUST_LOG`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use torrex::config::{ExchangeConfig, DEFAULT_BACKLOG, DEFAULT_BLOCK_SIZE};
use torrex::exchange::Exchange;
use torrex::peer::generate_peer_id;
use torrex::torrent::TorrentFile;
use torrex::tracker::{self, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Port announced to the trackers
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Largest block requested at once, in bytes
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Maximum number of unanswered requests per peer
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: u32,

    /// Seconds allowed to download one piece from a peer
    #[arg(long, default_value_t = 30)]
    piece_timeout: u64,
}

impl Args {
    fn config(&self) -> ExchangeConfig {
        ExchangeConfig {
            block_size: self.block_size,
            backlog: self.backlog,
            piece_timeout: Duration::from_secs(self.piece_timeout),
            ..Default::default()
        }
    }
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Asks before replacing an existing file.
fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("Output file '{}' already exists.", path.display());
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(input == "y" || input == "yes")
}

fn progress_bar(length: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn run(args: Args) -> Result<()> {
    let config = args.config();
    config.validate()?;

    if !args.torrent.exists() {
        return Err(anyhow!(
            "could not find torrent file: {}",
            args.torrent.display()
        ));
    }

    let torrent = TorrentFile::open(&args.torrent)?;
    let descriptor = torrent.descriptor()?;

    let output = match &args.output {
        Some(output) => output.clone(),
        None => PathBuf::from(sanitize_filename(&torrent.name)),
    };

    if output.exists() && !confirm_overwrite(&output)? {
        println!("Download cancelled.");
        return Ok(());
    }

    let peer_id = generate_peer_id();
    let peers = tracker::request_peers(
        &torrent.tracker_urls(),
        &torrent.info_hash,
        &peer_id,
        args.port,
        torrent.length,
    )?;

    println!(
        "Downloading {:?} ({} pieces, {} peers)",
        torrent.name,
        descriptor.piece_count(),
        peers.len()
    );

    let pb = progress_bar(torrent.length)?;
    let data = Exchange::with_config(descriptor, peers, peer_id, config)
        .download(|piece| pb.inc(piece.data.len() as u64))?;
    pb.finish();

    fs::write(&output, &data)
        .map_err(|e| anyhow!("could not write data to file '{}': {}", output.display(), e))?;

    println!("Saved in \"{}\".", output.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    let args = Args::parse();

    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("debian.iso"), "debian.iso");
    }

    #[test]
    fn sanitize_falls_back_to_default() {
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
        assert_eq!(sanitize_filename(".."), "download");
    }

    #[test]
    fn args_map_to_config() {
        let args = Args::parse_from([
            "torrex",
            "file.torrent",
            "--block-size",
            "8192",
            "--backlog",
            "3",
            "--piece-timeout",
            "10",
        ]);
        let config = args.config();

        assert_eq!(config.block_size, 8192);
        assert_eq!(config.backlog, 3);
        assert_eq!(config.piece_timeout, Duration::from_secs(10));
        assert_eq!(args.port, DEFAULT_PORT);
        assert!(args.output.is_none());
    }
}
