//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Verify two in-memory devices against each other and print the SAS
    Simulate {
        /// Delivery delay between the devices in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Render SAS strings from raw bytes
    Sas {
        /// Six (emoji and decimal) or five (decimal only) bytes as hex
        bytes: String,
    },
    /// Show the stored verified state
    Status {
        /// State file to read instead of the default location
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}
