//! `djafs count [PATH]`

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

#[derive(Args, Debug)]
pub struct CountArgs {
    /// Directory to count files in
    #[arg(default_value = "./")]
    pub path: PathBuf,

    /// Print progress every 10,000 files
    #[arg(long)]
    pub progress: bool,
}

pub fn run(args: CountArgs) -> Result<()> {
    let mut count = 0u64;
    for entry in walkdir::WalkDir::new(&args.path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            count += 1;
            if args.progress && count % 10_000 == 0 {
                println!("Progress: {count} files counted");
            }
        }
    }
    println!("{count}");
    Ok(())
}
