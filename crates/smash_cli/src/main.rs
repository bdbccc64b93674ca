//! Smash CLI
//!
//! Command-line tools for exercising and debugging Smash sessions.
//!
//! # Commands
//!
//! - `simulate` - Run several participants against an in-process server
//! - `inspect-rows` - Decode a saved GetRows response body
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Smash session tools.
#[derive(Parser)]
#[command(name = "smash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run participants against an in-process reference server
    Simulate {
        /// Number of participants
        #[arg(short, long, default_value = "3")]
        clients: usize,

        /// Records each participant adds
        #[arg(short, long, default_value = "10")]
        records: usize,

        /// Poll every M milliseconds instead of long polling
        #[arg(long)]
        refresh_ms: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Decode a GetRows response body and list its rows
    InspectRows {
        /// File holding the JSON response body
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            clients,
            records,
            refresh_ms,
            format,
        } => {
            commands::simulate::run(clients, records, refresh_ms, &format)?;
        }
        Commands::InspectRows { file, format } => {
            commands::inspect_rows::run(&file, &format)?;
        }
        Commands::Version => {
            println!("Smash CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
