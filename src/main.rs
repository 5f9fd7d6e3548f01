//! # Remora BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol implementation
//! - Basic multitracker support
//! - Multi-peer concurrent downloading
//! - Piece verification with SHA-1 hashing
//! - Periodic keep-alives on every peer session
//! - Progress tracking with visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! remora <torrent_file>
//! remora <torrent_file> <output_file>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads torrent, assembles results
//! - **Worker threads**: Each drives the download loop for one peer
//! - **Keep-alive thread**: Keeps every peer session from idling out
//! - **Channels**: Coordinate piece work distribution and result collection

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod handshake;
mod keepalive;
mod message;
mod peer;
mod piece;
#[cfg(test)]
mod testutil;
mod torrent;
mod tracker;
mod worker;

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use clap::Parser;
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Output filename (defaults to the name from the torrent)
    output: Option<String>,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    // Check if torrent file exists
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    // Parse torrent metadata
    let torrent = Torrent::open(Path::new(&args.torrent))?;

    // Determine output filename, sanitized to be safe
    let default_filename = sanitize_filename(torrent.name());
    let output_filename = args.output.as_deref().unwrap_or(&default_filename);
    let output_filepath = Path::new(output_filename);

    // Check if output file already exists
    if output_filepath.exists() {
        println!("Output file '{}' already exists.", output_filename);
        print!("Do you want to overwrite it? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        if input != "y" && input != "yes" {
            println!("Download cancelled.");
            return Ok(());
        }
    }

    // Create output file
    let mut output_file = match File::create(output_filepath) {
        Ok(file) => file,
        Err(e) => {
            return Err(anyhow!(
                "could not create output file '{}': {}",
                output_filename,
                e
            ))
        }
    };

    // Download torrent
    let data: Vec<u8> = torrent.download()?;

    // Save data to file
    if let Err(e) = output_file.write_all(&data) {
        return Err(anyhow!(
            "could not write data to file '{}': {}",
            output_filename,
            e
        ));
    }

    println!("Saved in \"{}\".", output_filename);

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
