//! Immutable value objects for the snapshot model.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;

/// The literal property value meaning "no tags set", distinct from an empty tag set.
pub const TAG_UNSET_SENTINEL: &str = "-";

/// An immutable point-in-time reference to a dataset's state.
///
/// Composite identity is `dataset@shortname`; equality is structural over all
/// fields (derived `PartialEq`).
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub dataset: String,
    pub shortname: String,
    pub timestamp: DateTime<Utc>,
    pub guid: u64,
    pub holds: u32,
    pub tags: Option<HashSet<String>>,
}

impl Snapshot {
    pub fn longname(&self) -> String {
        format!("{}@{}", self.dataset, self.shortname)
    }

    /// Returns a copy re-parented to `dataset`, preserving everything else including `guid`.
    pub fn with_dataset(&self, dataset: &str) -> Snapshot {
        Snapshot { dataset: dataset.to_owned(), ..self.clone() }
    }

    /// Parses the comma-joined custom tag property. `-` means unset (`None`);
    /// any other string (including the empty string) is a tag set.
    pub fn parse_tags_property(value: &str) -> Option<HashSet<String>> {
        if value == TAG_UNSET_SENTINEL {
            None
        } else if value.is_empty() {
            Some(HashSet::new())
        } else {
            Some(value.split(',').map(str::to_owned).collect())
        }
    }

    /// Serializes a tag set back to the comma-joined property representation.
    pub fn format_tags_property(tags: &Option<HashSet<String>>) -> String {
        match tags {
            None => TAG_UNSET_SENTINEL.to_owned(),
            Some(set) => {
                let mut sorted: Vec<&str> = set.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                sorted.join(",")
            }
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.longname())
    }
}

/// A filesystem tree rooted under a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub guid: u64,
}

/// The top-level storage container; first path component of any dataset name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
    pub guid: u64,
}

impl Pool {
    /// First `/`-separated component of a dataset name.
    pub fn name_of(dataset: &str) -> &str {
        dataset.split('/').next().unwrap_or(dataset)
    }
}

/// A named lease `(snapshot_longname, tag)` on a snapshot. Holds are a multiset
/// on a snapshot; the filesystem refuses to destroy a snapshot with >=1 hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hold {
    pub snapshot_longname: String,
    pub tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(dataset: &str, shortname: &str, guid: u64) -> Snapshot {
        Snapshot {
            dataset: dataset.to_owned(),
            shortname: shortname.to_owned(),
            timestamp: Utc::now(),
            guid,
            holds: 0,
            tags: None,
        }
    }

    #[test]
    fn longname_joins_dataset_and_shortname() {
        let s = snap("tank/webdata", "2024-01-01", 42);
        assert_eq!(s.longname(), "tank/webdata@2024-01-01");
    }

    #[test]
    fn with_dataset_preserves_everything_else() {
        let s = snap("tank/webdata", "2024-01-01", 42);
        let moved = s.with_dataset("backup/webdata");
        assert_eq!(moved.dataset, "backup/webdata");
        assert_eq!(moved.shortname, s.shortname);
        assert_eq!(moved.timestamp, s.timestamp);
        assert_eq!(moved.guid, s.guid);
        assert_eq!(moved.holds, s.holds);
        assert_eq!(moved.tags, s.tags);
    }

    #[test]
    fn tags_property_unset_sentinel_is_none() {
        assert_eq!(Snapshot::parse_tags_property("-"), None);
    }

    #[test]
    fn tags_property_empty_string_is_empty_set() {
        assert_eq!(Snapshot::parse_tags_property(""), Some(HashSet::new()));
    }

    #[test]
    fn tags_property_splits_on_comma() {
        let tags = Snapshot::parse_tags_property("a,b,c").unwrap();
        assert_eq!(tags, ["a", "b", "c"].into_iter().map(String::from).collect());
    }

    #[test]
    fn format_tags_property_round_trips_sorted() {
        let tags = Some(["b", "a"].into_iter().map(String::from).collect());
        assert_eq!(Snapshot::format_tags_property(&tags), "a,b");
    }

    #[test]
    fn pool_name_of_first_component() {
        assert_eq!(Pool::name_of("tank/webdata/logs"), "tank");
        assert_eq!(Pool::name_of("tank"), "tank");
    }
}
