//! PBD CLI
//!
//! Maintenance tools for persistent binary deque directories.
//!
//! # Commands
//!
//! - `inspect` - List segments, states, id ranges and durable cursors
//! - `verify` - Check framing and checksums of every segment
//! - `dump` - Print entries in read order
//! - `truncate-to` - Drop every entry whose ids start after a given id

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Persistent binary deque maintenance tools.
#[derive(Parser)]
#[command(name = "pbd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the deque
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// Name shared by the deque's files
    #[arg(global = true, short, long)]
    nonce: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List segments and durable cursors
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify framing and checksums without modifying anything
    Verify,

    /// Print entries in read order
    Dump {
        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Drop every entry whose ids start after ENTRY_ID
    TruncateTo {
        /// Last entry id to keep
        entry_id: i64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let target = |command: &str| -> Result<(PathBuf, String), String> {
        let dir = cli
            .dir
            .clone()
            .ok_or_else(|| format!("Deque directory required for {command}"))?;
        let nonce = cli
            .nonce
            .clone()
            .ok_or_else(|| format!("Deque nonce required for {command}"))?;
        Ok((dir, nonce))
    };

    match &cli.command {
        Commands::Inspect { format } => {
            let (dir, nonce) = target("inspect")?;
            commands::inspect::run(&dir, &nonce, format)?;
        }
        Commands::Verify => {
            let (dir, nonce) = target("verify")?;
            commands::verify::run(&dir, &nonce)?;
        }
        Commands::Dump { limit } => {
            let (dir, nonce) = target("dump")?;
            commands::dump::run(&dir, &nonce, *limit)?;
        }
        Commands::TruncateTo { entry_id } => {
            let (dir, nonce) = target("truncate-to")?;
            commands::truncate::run(&dir, &nonce, *entry_id)?;
        }
        Commands::Version => {
            println!("PBD CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("PBD Core v{}", pbd_core::VERSION);
        }
    }

    Ok(())
}
