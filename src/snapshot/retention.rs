//! Tiered snapshot retention.
//!
//! Four independent buckets (hourly/daily/weekly/monthly). Within each
//! bucket's age window the newest snapshot per bucket key is preserved;
//! the preserve set is the union across buckets and everything else is
//! deleted.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::Retention;

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Compute the set of snapshot names the tiered policy preserves.
pub fn preserved_names(
    records: &[SnapshotRecord],
    retention: &Retention,
    now: DateTime<Utc>,
) -> HashSet<String> {
    // Newest first, so the first snapshot seen per bucket key wins.
    let mut sorted: Vec<&SnapshotRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.created.cmp(&a.created));

    let mut preserve: HashSet<String> = HashSet::new();

    if let Some(hourly) = retention.hourly.filter(|n| *n > 0) {
        let window_secs = i64::from(hourly) * 3600;
        collect_bucket(&sorted, &mut preserve, |r| {
            let age = (now - r.created).num_seconds();
            (age <= window_secs).then(|| r.created.format("%Y-%m-%d-%H").to_string())
        });
    }

    if let Some(daily) = retention.daily.filter(|n| *n > 0) {
        let window_days = i64::from(daily);
        collect_bucket(&sorted, &mut preserve, |r| {
            let age = (now - r.created).num_days();
            (age <= window_days).then(|| r.created.format("%Y-%m-%d").to_string())
        });
    }

    if let Some(weekly) = retention.weekly.filter(|n| *n > 0) {
        let window_days = i64::from(weekly) * 7;
        collect_bucket(&sorted, &mut preserve, |r| {
            let age = (now - r.created).num_days();
            (age <= window_days).then(|| r.created.format("%Y-W%W").to_string())
        });
    }

    if let Some(monthly) = retention.monthly.filter(|n| *n > 0) {
        let window_days = i64::from(monthly) * 30;
        collect_bucket(&sorted, &mut preserve, |r| {
            let age = (now - r.created).num_days();
            (age <= window_days).then(|| r.created.format("%Y-%m").to_string())
        });
    }

    preserve
}

fn collect_bucket<F>(sorted: &[&SnapshotRecord], preserve: &mut HashSet<String>, bucket_key: F)
where
    F: Fn(&SnapshotRecord) -> Option<String>,
{
    let mut buckets: HashMap<String, &SnapshotRecord> = HashMap::new();
    for record in sorted {
        if let Some(key) = bucket_key(record) {
            buckets.entry(key).or_insert(record);
        }
    }
    preserve.extend(buckets.values().map(|r| r.name.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(name: &str, ts: &str) -> SnapshotRecord {
        SnapshotRecord {
            name: name.to_string(),
            created: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    fn retention(
        hourly: Option<u32>,
        daily: Option<u32>,
        weekly: Option<u32>,
        monthly: Option<u32>,
    ) -> Retention {
        Retention {
            hourly,
            daily,
            weekly,
            monthly,
            yearly: None,
        }
    }

    #[test]
    fn test_hourly_keeps_newest_per_hour() {
        let records = vec![
            record("a", "2025-06-15T11:10:00Z"),
            record("b", "2025-06-15T11:40:00Z"),
            record("c", "2025-06-15T10:30:00Z"),
        ];
        let keep = preserved_names(&records, &retention(Some(24), None, None, None), now());
        // b is newer than a inside the 11:00 bucket.
        assert!(keep.contains("b"));
        assert!(!keep.contains("a"));
        assert!(keep.contains("c"));
    }

    #[test]
    fn test_hourly_window_excludes_old_snapshots() {
        let records = vec![
            record("recent", "2025-06-15T10:00:00Z"),
            record("old", "2025-06-14T10:00:00Z"),
        ];
        // 2-hour window: only the recent one qualifies.
        let keep = preserved_names(&records, &retention(Some(2), None, None, None), now());
        assert!(keep.contains("recent"));
        assert!(!keep.contains("old"));
    }

    #[test]
    fn test_daily_buckets() {
        let records = vec![
            record("d1-early", "2025-06-14T02:00:00Z"),
            record("d1-late", "2025-06-14T20:00:00Z"),
            record("d2", "2025-06-13T12:00:00Z"),
            record("ancient", "2025-05-01T12:00:00Z"),
        ];
        let keep = preserved_names(&records, &retention(None, Some(7), None, None), now());
        assert!(keep.contains("d1-late"));
        assert!(!keep.contains("d1-early"));
        assert!(keep.contains("d2"));
        assert!(!keep.contains("ancient"));
    }

    #[test]
    fn test_union_of_buckets() {
        let records = vec![
            record("newest", "2025-06-15T11:00:00Z"),
            record("yesterday", "2025-06-14T11:00:00Z"),
            record("last-month", "2025-05-20T11:00:00Z"),
        ];
        let keep = preserved_names(&records, &retention(Some(24), Some(7), None, Some(3)), now());
        assert!(keep.contains("newest"));
        assert!(keep.contains("yesterday"));
        assert!(keep.contains("last-month"));
    }

    #[test]
    fn test_empty_retention_preserves_nothing() {
        let records = vec![record("a", "2025-06-15T11:00:00Z")];
        let keep = preserved_names(&records, &retention(None, None, None, None), now());
        assert!(keep.is_empty());
    }

    #[test]
    fn test_zero_bucket_is_disabled() {
        let records = vec![record("a", "2025-06-15T11:00:00Z")];
        let keep = preserved_names(&records, &retention(Some(0), None, None, None), now());
        assert!(keep.is_empty());
    }

    #[test]
    fn test_no_retained_snapshot_older_than_largest_window() {
        let records = vec![
            record("in-window", "2025-06-01T00:00:00Z"),
            record("out-of-window", "2025-02-01T00:00:00Z"),
        ];
        let keep = preserved_names(&records, &retention(Some(24), Some(7), Some(4), Some(3)), now());
        assert!(keep.contains("in-window"));
        assert!(!keep.contains("out-of-window"));
    }
}
