//! # djafs CLI
//!
//! Command-line interface for the djafs append-only archive filesystem.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod convert;
mod count;
mod mount;
mod seed;
mod validate;

/// djafs - append-only content-addressable archive filesystem
#[derive(Parser)]
#[command(name = "djafs")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a djafs storage root at a mountpoint
    Mount(mount::MountArgs),
    /// Convert a directory tree into djafs archives
    Convert(convert::ConvertArgs),
    /// Validate archives for corruption and consistency
    Validate(validate::ValidateArgs),
    /// Count files in a directory tree
    Count(count::CountArgs),
    /// Generate a tree of test files
    Seed(seed::SeedArgs),
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
    djafs_config::logging::init_logging();

    match Cli::parse().command {
        Commands::Mount(args) => mount::run(args),
        Commands::Convert(args) => convert::run(args),
        Commands::Validate(args) => validate::run(args),
        Commands::Count(args) => count::run(args),
        Commands::Seed(args) => seed::run(args),
    }
}
