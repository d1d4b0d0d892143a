//! The retention policy engine: a pure function
//! `(snapshots, policy) -> (keep, destroy)`.
//!
//! Sorts newest-first, walks the list once, and accumulates a keep-set
//! against a bank of count- and within-buckets.

use crate::dataset::Snapshot;
use crate::duration::KeepDuration;
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use std::collections::HashSet;

/// Declarative retention configuration. All fields default to their
/// disabling value: zero for counts, zero-duration for within-buckets, unset
/// for name/tags.
#[derive(Debug, Clone, Default)]
pub struct KeepPolicy {
    pub last: u32,
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,

    pub within: KeepDuration,
    pub within_hourly: KeepDuration,
    pub within_daily: KeepDuration,
    pub within_weekly: KeepDuration,
    pub within_monthly: KeepDuration,
    pub within_yearly: KeepDuration,

    pub name: Option<Regex>,
    pub tags: HashSet<String>,
}

/// A bucket-key function of a timestamp. `last` has no real bucketing
/// function: every snapshot is its own bucket, which we model with a
/// monotonically increasing counter rather than a calendar key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BucketKey {
    Unique(u64),
    Hourly(i32, u32, u32, u32),
    Daily(i32, u32, u32),
    Weekly(i32, u32),
    Monthly(i32, u32),
    Yearly(i32),
}

fn hourly_key(t: DateTime<Utc>) -> BucketKey {
    BucketKey::Hourly(t.year(), t.month(), t.day(), t.hour())
}
fn daily_key(t: DateTime<Utc>) -> BucketKey {
    BucketKey::Daily(t.year(), t.month(), t.day())
}
fn weekly_key(t: DateTime<Utc>) -> BucketKey {
    let iso = t.iso_week();
    BucketKey::Weekly(iso.year(), iso.week())
}
fn monthly_key(t: DateTime<Utc>) -> BucketKey {
    BucketKey::Monthly(t.year(), t.month())
}
fn yearly_key(t: DateTime<Utc>) -> BucketKey {
    BucketKey::Yearly(t.year())
}

struct CountBucket {
    key_fn: fn(DateTime<Utc>) -> BucketKey,
    remaining: u32,
    last_key: Option<BucketKey>,
}

struct WithinBucket {
    key_fn: fn(DateTime<Utc>) -> BucketKey,
    duration: KeepDuration,
    cutoff: DateTime<Utc>,
    last_key: Option<BucketKey>,
}

/// Partitions `snapshots` into `(keep, destroy)` under `policy`. Pure and
/// total: no I/O, no panics.
///
/// `now` is captured once by the caller and passed in so a single instant is
/// shared across grouped invocations.
pub fn apply_policy(
    snapshots: &[Snapshot],
    policy: &KeepPolicy,
    now: DateTime<Utc>,
) -> (Vec<Snapshot>, Vec<Snapshot>) {
    let mut sorted: Vec<&Snapshot> = snapshots.iter().collect();
    // Newest first; ties broken by (shortname, dataset) for determinism.
    sorted.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.shortname.cmp(&b.shortname))
            .then_with(|| a.dataset.cmp(&b.dataset))
    });

    let mut unique_counter: u64 = 0;
    let mut count_buckets = [
        CountBucket { key_fn: |_| unreachable!(), remaining: policy.last, last_key: None },
        CountBucket { key_fn: hourly_key, remaining: policy.hourly, last_key: None },
        CountBucket { key_fn: daily_key, remaining: policy.daily, last_key: None },
        CountBucket { key_fn: weekly_key, remaining: policy.weekly, last_key: None },
        CountBucket { key_fn: monthly_key, remaining: policy.monthly, last_key: None },
        CountBucket { key_fn: yearly_key, remaining: policy.yearly, last_key: None },
    ];

    let mut within_buckets = [
        WithinBucket { key_fn: |_| unreachable!(), duration: policy.within, cutoff: policy.within.before(now), last_key: None },
        WithinBucket { key_fn: hourly_key, duration: policy.within_hourly, cutoff: policy.within_hourly.before(now), last_key: None },
        WithinBucket { key_fn: daily_key, duration: policy.within_daily, cutoff: policy.within_daily.before(now), last_key: None },
        WithinBucket { key_fn: weekly_key, duration: policy.within_weekly, cutoff: policy.within_weekly.before(now), last_key: None },
        WithinBucket { key_fn: monthly_key, duration: policy.within_monthly, cutoff: policy.within_monthly.before(now), last_key: None },
        WithinBucket { key_fn: yearly_key, duration: policy.within_yearly, cutoff: policy.within_yearly.before(now), last_key: None },
    ];

    let mut keep = Vec::new();
    let mut destroy = Vec::new();

    for snap in sorted {
        let mut keep_snap = false;

        if let Some(re) = &policy.name {
            if re.is_match(&snap.shortname) {
                keep_snap = true;
            }
        }
        if !policy.tags.is_empty() {
            if let Some(tags) = &snap.tags {
                if policy.tags.iter().all(|t| tags.contains(t)) {
                    keep_snap = true;
                }
            }
        }

        for (idx, bucket) in count_buckets.iter_mut().enumerate() {
            if bucket.remaining == 0 {
                continue;
            }
            let key = if idx == 0 {
                unique_counter += 1;
                BucketKey::Unique(unique_counter)
            } else {
                (bucket.key_fn)(snap.timestamp)
            };
            if bucket.last_key != Some(key) {
                keep_snap = true;
                bucket.last_key = Some(key);
                bucket.remaining -= 1;
            }
        }

        for (idx, bucket) in within_buckets.iter_mut().enumerate() {
            if bucket.duration.is_zero() {
                continue;
            }
            if snap.timestamp <= bucket.cutoff {
                continue;
            }
            let key = if idx == 0 {
                unique_counter += 1;
                BucketKey::Unique(unique_counter)
            } else {
                (bucket.key_fn)(snap.timestamp)
            };
            if bucket.last_key != Some(key) {
                keep_snap = true;
                bucket.last_key = Some(key);
            }
        }

        if keep_snap {
            keep.push(snap.clone());
        } else {
            destroy.push(snap.clone());
        }
    }

    debug_assert_eq!(keep.len() + destroy.len(), snapshots.len());
    (keep, destroy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    fn snap(shortname: &str, timestamp: DateTime<Utc>) -> Snapshot {
        Snapshot {
            dataset: "pool/x".to_owned(),
            shortname: shortname.to_owned(),
            timestamp,
            guid: 0,
            holds: 0,
            tags: None,
        }
    }

    fn hourly_snaps_2024_01_01() -> Vec<Snapshot> {
        (0..24).map(|h| snap(&format!("{h:02}"), at(2024, 1, 1, h))).collect()
    }

    /// hourly=5 keeps the five newest hourly buckets.
    #[test]
    fn hourly_count_keeps_five_newest() {
        let snaps = hourly_snaps_2024_01_01();
        let policy = KeepPolicy { hourly: 5, ..Default::default() };
        let now = at(2024, 1, 1, 23);
        let (keep, destroy) = apply_policy(&snaps, &policy, now);
        let mut kept_names: Vec<&str> = keep.iter().map(|s| s.shortname.as_str()).collect();
        kept_names.sort();
        assert_eq!(kept_names, vec!["19", "20", "21", "22", "23"]);
        assert_eq!(destroy.len(), 19);
    }

    /// daily=2 plus within_hourly=6h at now=23:30: the within-window overlay
    /// widens the keep-set beyond what the daily bucket alone would keep.
    #[test]
    fn within_hourly_overlay_widens_daily_keep_set() {
        let snaps = hourly_snaps_2024_01_01();
        let policy = KeepPolicy {
            daily: 2,
            within_hourly: KeepDuration { hours: 6, ..Default::default() },
            ..Default::default()
        };
        let now = at(2024, 1, 1, 23) + chrono::Duration::minutes(30);
        let (keep, _destroy) = apply_policy(&snaps, &policy, now);
        let mut kept_names: Vec<&str> = keep.iter().map(|s| s.shortname.as_str()).collect();
        kept_names.sort();
        assert_eq!(kept_names, vec!["18", "19", "20", "21", "22", "23"]);
    }

    /// A name-regex override keeps the matched snapshot alone.
    #[test]
    fn name_override_keeps_matched_snapshot_alone() {
        let mut snaps = hourly_snaps_2024_01_01();
        snaps.push(snap("keepme-a", at(2024, 1, 1, 12)));
        let policy = KeepPolicy {
            name: Some(Regex::from_str("^keepme-").unwrap()),
            ..Default::default()
        };
        let (keep, destroy) = apply_policy(&snaps, &policy, at(2024, 1, 2, 0));
        assert_eq!(keep.len(), 1);
        assert_eq!(keep[0].shortname, "keepme-a");
        assert_eq!(destroy.len(), 24);
    }

    /// All-zero policy with empty overrides keeps nothing.
    #[test]
    fn all_zero_policy_keeps_nothing() {
        let snaps = hourly_snaps_2024_01_01();
        let policy = KeepPolicy::default();
        let (keep, destroy) = apply_policy(&snaps, &policy, at(2024, 1, 2, 0));
        assert!(keep.is_empty());
        assert_eq!(destroy.len(), snaps.len());
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let policy = KeepPolicy { last: 3, ..Default::default() };
        let (keep, destroy) = apply_policy(&[], &policy, Utc::now());
        assert!(keep.is_empty());
        assert!(destroy.is_empty());
    }

    #[test]
    fn tags_override_requires_superset() {
        let mut kept = snap("a", at(2024, 1, 1, 0));
        kept.tags = Some(["prod", "db"].into_iter().map(String::from).collect());
        let mut not_kept = snap("b", at(2024, 1, 1, 1));
        not_kept.tags = Some(["prod"].into_iter().map(String::from).collect());
        let policy = KeepPolicy {
            tags: ["prod", "db"].into_iter().map(String::from).collect(),
            ..Default::default()
        };
        let (keep, destroy) = apply_policy(&[kept, not_kept], &policy, at(2024, 1, 2, 0));
        assert_eq!(keep.len(), 1);
        assert_eq!(keep[0].shortname, "a");
        assert_eq!(destroy.len(), 1);
    }

    #[test]
    fn last_keeps_every_snapshot_as_its_own_bucket() {
        let snaps = hourly_snaps_2024_01_01();
        let policy = KeepPolicy { last: 3, ..Default::default() };
        let (keep, _) = apply_policy(&snaps, &policy, at(2024, 1, 2, 0));
        assert_eq!(keep.len(), 3);
        let mut names: Vec<&str> = keep.iter().map(|s| s.shortname.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["21", "22", "23"]);
    }

    #[test]
    fn keep_union_destroy_partitions_input() {
        let snaps = hourly_snaps_2024_01_01();
        let policy = KeepPolicy { daily: 1, within_hourly: KeepDuration { hours: 3, ..Default::default() }, ..Default::default() };
        let (keep, destroy) = apply_policy(&snaps, &policy, at(2024, 1, 1, 23));
        assert_eq!(keep.len() + destroy.len(), snaps.len());
        let mut all: HashSet<u64> = HashSet::new();
        for s in keep.iter().chain(destroy.iter()) {
            assert!(all.insert(s.timestamp.timestamp() as u64), "snapshot present in both keep and destroy");
        }
    }
}
