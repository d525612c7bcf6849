//! `djafs mount STORAGE MOUNTPOINT`

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::info;

use djafs_config::Config;
use djafs_fs::VirtualTree;
use djafs_fuse::DjaFuse;
use djafs_store::GcDriver;

#[derive(Args, Debug)]
pub struct MountArgs {
    /// djafs storage root directory
    pub storage: PathBuf,

    /// Directory to mount the virtual tree at
    pub mountpoint: PathBuf,
}

/// Whether one path is a prefix of the other, after normalization.
fn paths_overlap(a: &Path, b: &Path) -> bool {
    let a = std::fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let b = std::fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    a.starts_with(&b) || b.starts_with(&a)
}

pub fn run(args: MountArgs) -> Result<()> {
    if paths_overlap(&args.storage, &args.mountpoint) {
        bail!(
            "storage path and mountpoint cannot overlap: storage={}, mount={}",
            args.storage.display(),
            args.mountpoint.display()
        );
    }
    std::fs::create_dir_all(&args.storage).context("failed to create storage directory")?;

    println!("djafs {} starting...", djafs_lookup::version());

    let config = Config::load_for_root(&args.storage).context("failed to load configuration")?;
    let tree = Arc::new(
        VirtualTree::new(&args.storage, &config).context("failed to open storage root")?,
    );
    let gc = GcDriver::spawn(
        tree.hot_cache(),
        Duration::from_secs(config.gc.interval_secs),
    );

    // Break the blocking mount loop on SIGINT/SIGTERM by unmounting.
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let flag = Arc::clone(&shutdown);
        let mountpoint = args.mountpoint.clone();
        unsafe {
            signal_hook::low_level::register(signal, move || {
                if !flag.swap(true, Ordering::SeqCst) {
                    let _ = std::process::Command::new("fusermount")
                        .arg("-u")
                        .arg(&mountpoint)
                        .spawn();
                }
            })
            .context("failed to install signal handler")?;
        }
    }

    info!(
        storage = %args.storage.display(),
        mountpoint = %args.mountpoint.display(),
        "mounting djafs"
    );
    let result = DjaFuse::new(Arc::clone(&tree)).mount(&args.mountpoint);

    // Stop the ticker and drain staged writes before reporting.
    gc.stop();
    result.context("mount failed")?;
    info!("unmounted; shutdown complete");
    Ok(())
}
