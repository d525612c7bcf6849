//! Boundary planner.
//!
//! Partitions an input tree into archive roots so that no planned archive
//! holds many more than the target number of files. Each boundary is either
//! *recursive* (the archive takes the whole subtree) or *files-only* (the
//! archive takes just the directory's direct files, its subdirectories
//! having been split out into their own boundaries).

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Result, StoreError};

/// One planned archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    pub path: PathBuf,
    pub include_subdirs: bool,
}

/// Count regular files under `path`, recursively, stopping early once the
/// count passes `target`. Returns the count and whether it exceeded the
/// target.
pub fn count_files_under(path: &Path, target: usize) -> Result<(usize, bool)> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Err(StoreError::ExpectedDirectory(path.to_path_buf()));
    }

    let mut count = 0usize;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
            let ft = match entry.file_type() {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            if ft.is_dir() {
                stack.push(entry.path());
            } else if ft.is_file() {
                count += 1;
                if count > target {
                    return Ok((count, true));
                }
            }
        }
    }
    Ok((count, false))
}

/// Plan archive boundaries for the tree rooted at `root`.
///
/// A directory whose recursive file count fits the target becomes one
/// recursive boundary. Otherwise each subdirectory is planned on its own,
/// and the directory's direct files (if any) get a files-only boundary.
/// Sibling subtrees are emitted before their parent's files-only boundary,
/// so deeper boundaries come first. The union of emitted boundaries covers
/// every regular file exactly once.
pub fn plan_boundaries(root: &Path, target: usize) -> Result<Vec<Boundary>> {
    let mut out = Vec::new();
    plan_dir(root, target, &mut out)?;
    Ok(out)
}

fn plan_dir(dir: &Path, target: usize, out: &mut Vec<Boundary>) -> Result<()> {
    let (_, over) = count_files_under(dir, target)?;
    if !over {
        out.push(Boundary {
            path: dir.to_path_buf(),
            include_subdirs: true,
        });
        return Ok(());
    }

    let mut subdirs = Vec::new();
    let mut has_direct_files = false;
    for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let ft = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        if ft.is_dir() {
            subdirs.push(entry.path());
        } else if ft.is_file() {
            has_direct_files = true;
        }
    }
    subdirs.sort();

    for sub in subdirs {
        plan_dir(&sub, target, out)?;
    }
    if has_direct_files {
        out.push(Boundary {
            path: dir.to_path_buf(),
            include_subdirs: false,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::write(path, b"x").unwrap();
    }

    fn mkdir(path: &Path) {
        fs::create_dir_all(path).unwrap();
    }

    #[test]
    fn test_small_tree_is_one_recursive_boundary() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("a"));
        touch(&temp.path().join("b"));

        let boundaries = plan_boundaries(temp.path(), 5).unwrap();
        assert_eq!(
            boundaries,
            vec![Boundary {
                path: temp.path().to_path_buf(),
                include_subdirs: true
            }]
        );
    }

    #[test]
    fn test_empty_dir_is_one_recursive_boundary() {
        let temp = TempDir::new().unwrap();
        let boundaries = plan_boundaries(temp.path(), 0).unwrap();
        assert_eq!(boundaries.len(), 1);
        assert!(boundaries[0].include_subdirs);
    }

    #[test]
    fn test_split_tree_partition() {
        // root/{f1,f2,f3, sub1/{g1..g10}, sub2/{h1,h2,h3}}, target 5:
        // sub1 splits files-only, sub2 stays recursive, root keeps its
        // direct files.
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for f in ["f1", "f2", "f3"] {
            touch(&root.join(f));
        }
        mkdir(&root.join("sub1"));
        for i in 1..=10 {
            touch(&root.join("sub1").join(format!("g{i}")));
        }
        mkdir(&root.join("sub2"));
        for i in 1..=3 {
            touch(&root.join("sub2").join(format!("h{i}")));
        }

        let boundaries = plan_boundaries(root, 5).unwrap();
        let set: HashSet<(PathBuf, bool)> = boundaries
            .into_iter()
            .map(|b| (b.path, b.include_subdirs))
            .collect();

        let expected: HashSet<(PathBuf, bool)> = [
            (root.join("sub1"), false),
            (root.join("sub2"), true),
            (root.to_path_buf(), false),
        ]
        .into_iter()
        .collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn test_deeper_boundaries_come_before_parent_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(&root.join("top"));
        mkdir(&root.join("sub"));
        for i in 0..4 {
            touch(&root.join("sub").join(format!("{i}")));
        }

        let boundaries = plan_boundaries(root, 2).unwrap();
        let parent_pos = boundaries
            .iter()
            .position(|b| b.path == root && !b.include_subdirs)
            .unwrap();
        let child_pos = boundaries
            .iter()
            .position(|b| b.path == root.join("sub"))
            .unwrap();
        assert!(child_pos < parent_pos);
    }

    #[test]
    fn test_zero_target_with_files_splits_to_leaves() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        mkdir(&root.join("a"));
        touch(&root.join("a").join("f"));

        let boundaries = plan_boundaries(root, 0).unwrap();
        // a/ has one file > 0, no subdirs: it becomes a files-only boundary.
        assert_eq!(
            boundaries,
            vec![Boundary {
                path: root.join("a"),
                include_subdirs: false
            }]
        );
    }

    #[test]
    fn test_count_stops_early_on_overage() {
        let temp = TempDir::new().unwrap();
        for i in 0..10 {
            touch(&temp.path().join(format!("{i}")));
        }
        let (count, over) = count_files_under(temp.path(), 3).unwrap();
        assert!(over);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_count_rejects_file_argument() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        touch(&file);
        assert!(matches!(
            count_files_under(&file, 1),
            Err(StoreError::ExpectedDirectory(_))
        ));
    }
}
