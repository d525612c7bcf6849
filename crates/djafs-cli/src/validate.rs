//! `djafs validate -p PATH [-r] [--dry-run] [--remove-backup]`
//!
//! Exits 0 when every detected error was repaired (or none existed), 1
//! otherwise.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use djafs_validate::{preview_repair, repair_archive, validate_storage, RepairOptions};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// djafs storage directory to validate
    #[arg(short, long)]
    pub path: PathBuf,

    /// Attempt to repair archives with errors
    #[arg(short, long)]
    pub repair: bool,

    /// Preview repairs without modifying files (requires --repair)
    #[arg(long)]
    pub dry_run: bool,

    /// Remove .bak files after successful repair
    #[arg(long)]
    pub remove_backup: bool,

    /// Verbose per-archive output
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(args: ValidateArgs) -> Result<()> {
    if !args.path.exists() {
        bail!("storage directory does not exist: {}", args.path.display());
    }
    if args.dry_run && !args.repair {
        bail!("--dry-run requires --repair");
    }

    let reports = validate_storage(&args.path).context("validation walk failed")?;

    let mut total_errors = 0usize;
    let mut archives_with_errors = 0usize;
    let mut archives_repaired = 0usize;

    for report in &reports {
        if report.issues.is_empty() {
            if args.verbose {
                println!("Archive {} is valid", report.path.display());
            }
            continue;
        }

        archives_with_errors += 1;
        total_errors += report.issues.len();
        println!(
            "Archive {} has {} errors:",
            report.path.display(),
            report.issues.len()
        );
        for issue in &report.issues {
            println!("  - {issue}");
        }

        if !args.repair {
            continue;
        }
        if args.dry_run {
            let stats = preview_repair(&report.issues);
            println!("  Preview: {stats}");
            continue;
        }

        match repair_archive(
            &report.path,
            &report.issues,
            RepairOptions {
                remove_backup: args.remove_backup,
            },
        ) {
            Ok(stats) if !stats.is_noop() => {
                let remaining = djafs_validate::validate_archive(&report.path);
                if remaining.is_empty() {
                    println!("Successfully repaired {}: {stats}", report.path.display());
                    archives_repaired += 1;
                } else {
                    println!(
                        "Warning: archive still has {} errors after repair",
                        remaining.len()
                    );
                }
            }
            Ok(_) => println!("No repairs were possible for {}", report.path.display()),
            Err(e) => println!("Repair failed: {e}"),
        }
    }

    println!();
    println!("Validation complete:");
    println!("  Archives checked: {}", reports.len());
    println!("  Archives with errors: {archives_with_errors}");
    println!("  Total errors: {total_errors}");
    if args.repair && !args.dry_run {
        println!("  Archives repaired: {archives_repaired}");
    }

    if archives_with_errors > archives_repaired && !args.dry_run {
        std::process::exit(1);
    }
    Ok(())
}
