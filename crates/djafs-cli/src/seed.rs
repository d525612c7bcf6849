//! `djafs seed -o OUT [-c COUNT]`
//!
//! Generates small JSON files in a `YYYY/MM/DD/HH/MM/SS` hierarchy for
//! exercising convert and mount. Payloads are drawn from a fixed pool so
//! the output exercises deduplication too.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::Args;

#[derive(Args, Debug)]
pub struct SeedArgs {
    /// Output directory
    #[arg(short, long)]
    pub output: PathBuf,

    /// Number of files to generate
    #[arg(short, long, default_value_t = 10_000)]
    pub count: usize,

    /// Pool of distinct payloads to draw from
    #[arg(long, default_value_t = 50)]
    pub pool: usize,
}

pub fn run(args: SeedArgs) -> Result<()> {
    std::fs::create_dir_all(&args.output).context("failed to create output directory")?;

    let pool: Vec<String> = (0..args.pool.max(1))
        .map(|i| format!("{{\"record\":\"{:08x}-{:04x}\"}}\n", i * 2_654_435_761u64 as usize, i))
        .collect();

    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut created = 0usize;
    // Spread files over a year of seconds, stepping deterministically so a
    // re-run reproduces the same tree.
    let mut tick = 0i64;
    while created < args.count {
        let stamp = base + Duration::seconds(tick * 61 + (tick % 7) * 3601);
        tick += 1;

        let dir = args.output.join(stamp.format("%Y/%m/%d/%H/%M").to_string());
        std::fs::create_dir_all(&dir)?;
        let file = dir.join(format!("{}.json", stamp.format("%S")));
        if file.exists() {
            continue;
        }
        std::fs::write(&file, pool[created % pool.len()].as_bytes())?;
        created += 1;

        if created % 10_000 == 0 {
            println!("Progress: {created} files created");
        }
    }

    println!("Created {created} files in {}", args.output.display());
    Ok(())
}
