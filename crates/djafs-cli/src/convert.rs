//! `djafs convert -i IN -o OUT [--dry-run]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use djafs_config::Config;
use djafs_store::{convert_tree, ConvertOptions, StoreLayout};

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Input directory to convert
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output djafs storage root
    #[arg(short, long)]
    pub output: PathBuf,

    /// Soft cap on files per archive (overrides configuration)
    #[arg(short = 's', long)]
    pub size: Option<usize>,

    /// Show what would be done without making changes
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: ConvertArgs) -> Result<()> {
    let config = Config::load_for_root(&args.output).context("failed to load configuration")?;
    let opts = ConvertOptions {
        dry_run: args.dry_run,
        target_files_per_archive: args
            .size
            .unwrap_or(config.archive.target_files_per_archive),
        bucket_fill_threshold: config.archive.bucket_fill_threshold,
    };

    let layout = StoreLayout::new(&args.output);
    let (boundaries, stats) =
        convert_tree(&args.input, &layout, &opts).context("conversion failed")?;

    if args.dry_run {
        println!("Would create {} archives:", boundaries.len());
        for (i, boundary) in boundaries.iter().enumerate() {
            println!(
                "  {}: {} (include subdirs: {})",
                i + 1,
                boundary.path.display(),
                boundary.include_subdirs
            );
        }
        println!("{} files, {} bytes", stats.files, stats.bytes);
        return Ok(());
    }

    println!("Conversion complete!");
    println!("  Archives:  {}", stats.boundaries);
    println!("  Files:     {}", stats.files);
    println!("  Bytes:     {}", stats.bytes);
    println!("  Storage:   {}", args.output.display());
    Ok(())
}
