//! treesync CLI
//!
//! Command-line tools for inspecting replication journals.
//!
//! # Commands
//!
//! - `inspect` - Decode a journal file and summarize it
//! - `list` - List journal files in timestamp order

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// treesync journal tools.
#[derive(Parser)]
#[command(name = "treesync")]
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
    /// Decode a transmission or response and print a summary
    Inspect {
        /// Journal file to decode
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List journal files, oldest first
    List {
        /// Journal directory
        dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { file, format } => {
            commands::inspect::run(&file, &format)?;
        }
        Commands::List { dir, format } => {
            commands::list::run(&dir, &format)?;
        }
        Commands::Version => {
            println!("treesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Wire protocol v{}", treesync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
