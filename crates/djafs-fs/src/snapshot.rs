//! Snapshot queries over lookup logs.
//!
//! A snapshot stamp is either the literal `latest` or a point in time; the
//! live view of a name at time `t` is its most recent entry with
//! `modified <= t`, and the name is deleted iff that entry is a tombstone.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use djafs_lookup::{LookupEntry, LookupLog};

/// Parsed snapshot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStamp {
    /// The most recent state
    Latest,
    /// The state at an exact instant
    At(DateTime<Utc>),
}

impl SnapshotStamp {
    /// The cutoff to filter entries by; `None` means no cutoff.
    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        match self {
            SnapshotStamp::Latest => None,
            SnapshotStamp::At(t) => Some(*t),
        }
    }
}

/// Parse a snapshot identifier: `latest`, a `YYYY-MM-DD` day (end-of-day
/// UTC), or an exact RFC-3339 instant.
pub fn parse_snapshot_stamp(name: &str) -> Option<SnapshotStamp> {
    if name == "latest" {
        return Some(SnapshotStamp::Latest);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(name) {
        return Some(SnapshotStamp::At(ts.with_timezone(&Utc)));
    }
    if let Ok(date) = name.parse::<NaiveDate>() {
        let end_of_day = date.and_hms_opt(23, 59, 59)?;
        return Some(SnapshotStamp::At(Utc.from_utc_datetime(&end_of_day)));
    }
    None
}

/// The entry governing `rel_name` at `cutoff` (or the latest when `None`).
/// Returns `None` when the name does not exist at that time or its most
/// recent entry is a tombstone.
pub fn resolve_at<'a>(
    log: &'a LookupLog,
    rel_name: &str,
    cutoff: Option<DateTime<Utc>>,
) -> Option<&'a LookupEntry> {
    let mut best: Option<&LookupEntry> = None;
    for entry in log.iter() {
        if entry.name != rel_name {
            continue;
        }
        if let Some(t) = cutoff {
            if entry.modified > t {
                continue;
            }
        }
        match best {
            Some(b) if b.modified >= entry.modified => {}
            _ => best = Some(entry),
        }
    }
    best.filter(|e| !e.is_tombstone())
}

/// Snapshot identifiers advertised under `/snapshots` for a set of logs:
/// `latest`, every observed `YYYY-MM-DD` day, and every exact stamp from
/// the last seven days.
pub fn list_snapshot_stamps<'a>(
    logs: impl Iterator<Item = &'a LookupLog>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut stamps = BTreeSet::new();
    for log in logs {
        for entry in log.iter() {
            stamps.insert(entry.modified.format("%Y-%m-%d").to_string());
            if now - entry.modified < Duration::days(7) {
                stamps.insert(entry.modified.format("%Y-%m-%dT%H:%M:%SZ").to_string());
            }
        }
    }
    let mut out = vec!["latest".to_string()];
    out.extend(stamps);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn entry(name: &str, target: &str, secs: i64) -> LookupEntry {
        LookupEntry {
            size: 1,
            inode: 1,
            modified: ts(secs),
            name: name.into(),
            target: target.into(),
        }
    }

    fn history() -> LookupLog {
        let mut log = LookupLog::new();
        log.append(entry("x", "v1", 100));
        log.append(entry("x", "v2", 200));
        log.append(LookupEntry::tombstone("x", 3, ts(300)));
        log.append(entry("x", "v3", 400));
        log
    }

    #[test]
    fn test_latest_sees_newest_version() {
        let log = history();
        let got = resolve_at(&log, "x", None).unwrap();
        assert_eq!(got.target, "v3");
    }

    #[test]
    fn test_cutoff_selects_version_in_effect() {
        let log = history();
        assert_eq!(resolve_at(&log, "x", Some(ts(150))).unwrap().target, "v1");
        assert_eq!(resolve_at(&log, "x", Some(ts(200))).unwrap().target, "v2");
    }

    #[test]
    fn test_cutoff_inside_deletion_window_is_gone() {
        let log = history();
        assert!(resolve_at(&log, "x", Some(ts(350))).is_none());
    }

    #[test]
    fn test_before_creation_is_gone() {
        let log = history();
        assert!(resolve_at(&log, "x", Some(ts(50))).is_none());
    }

    #[test]
    fn test_unknown_name_is_gone() {
        let log = history();
        assert!(resolve_at(&log, "y", None).is_none());
    }

    #[test]
    fn test_parse_latest_and_rfc3339() {
        assert_eq!(parse_snapshot_stamp("latest"), Some(SnapshotStamp::Latest));
        let stamp = parse_snapshot_stamp("2024-03-01T12:30:00Z").unwrap();
        assert_eq!(
            stamp,
            SnapshotStamp::At(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_day_is_end_of_day_utc() {
        let stamp = parse_snapshot_stamp("2024-03-01").unwrap();
        assert_eq!(
            stamp,
            SnapshotStamp::At(Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_snapshot_stamp("yesterday").is_none());
        assert!(parse_snapshot_stamp("2024-13-99").is_none());
    }

    #[test]
    fn test_stamp_listing() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let mut log = LookupLog::new();
        // Recent entry: day stamp plus exact stamp.
        log.append(LookupEntry {
            size: 1,
            inode: 1,
            modified: Utc.with_ymd_and_hms(2024, 3, 9, 8, 30, 0).unwrap(),
            name: "recent".into(),
            target: "t".into(),
        });
        // Old entry: day stamp only.
        log.append(LookupEntry {
            size: 1,
            inode: 2,
            modified: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            name: "old".into(),
            target: "t".into(),
        });

        let stamps = list_snapshot_stamps(std::iter::once(&log), now);
        assert_eq!(stamps[0], "latest");
        assert!(stamps.contains(&"2024-03-09".to_string()));
        assert!(stamps.contains(&"2024-03-09T08:30:00Z".to_string()));
        assert!(stamps.contains(&"2023-01-01".to_string()));
        assert!(!stamps.contains(&"2023-01-01T00:00:00Z".to_string()));
    }
}
