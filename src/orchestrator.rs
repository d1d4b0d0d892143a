//! The command orchestrator: per-subcommand glue that constructs a policy or
//! filter, calls the retention engine or the replication engine, renders
//! results, and honors `--dry-run`.

use crate::cli::{GroupBy, TagArgs, TagOp, TagSource};
use crate::dataset::Snapshot;
use crate::duration::KeepDuration;
use crate::error::AppError;
use crate::machine::{Machine, SortKey, TAG_PROPERTY};
use crate::replicate::{self, ReplicationOpts};
use crate::retention::{apply_policy, KeepPolicy};
use chrono::Utc;
use itertools::Itertools;
use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Draws a random 10-character alphanumeric shortname (exactly 10 characters
/// from `[a-zA-Z0-9]`), used when `create` is given no `--name`.
fn random_shortname() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

pub fn create(
    machine: &Machine,
    dataset: &str,
    recursive: bool,
    name: Option<String>,
    tags: Vec<String>,
) -> Result<(), AppError> {
    let shortname = name.unwrap_or_else(random_shortname);
    let longname = format!("{dataset}@{shortname}");
    let mut properties = HashMap::new();
    if !tags.is_empty() {
        let tag_set: HashSet<String> = tags.into_iter().collect();
        properties.insert(TAG_PROPERTY.to_owned(), Snapshot::format_tags_property(&Some(tag_set)));
    }
    machine.create_snapshot(&longname, recursive, &properties)?;
    info!("created {longname}");
    Ok(())
}

pub fn list(machine: &Machine, dataset: Option<&str>, recursive: bool) -> Result<(), AppError> {
    let snaps = machine.list_snapshots(dataset, recursive, Some(SortKey::Creation), false)?;
    print_table(&snaps);
    Ok(())
}

/// Fixed column layout, `" | "`-separated, right-padded to the max width per
/// column, with a `-`-rule line sized to the row width.
fn print_table(snaps: &[Snapshot]) {
    let headers = ["DATASET", "SNAPSHOT", "TAGS", "CREATED", "HOLDS"];
    let rows: Vec<[String; 5]> = snaps
        .iter()
        .map(|s| {
            [
                s.dataset.clone(),
                s.shortname.clone(),
                render_tags(&s.tags),
                s.timestamp.to_rfc3339(),
                s.holds.to_string(),
            ]
        })
        .collect();

    let mut widths: [usize; 5] = std::array::from_fn(|i| headers[i].len());
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let render = |cells: &[String; 5]| -> String {
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c:width$}", width = widths[i]))
            .join(" | ")
    };

    let header_row = render(&headers.map(String::from));
    println!("{header_row}");
    println!("{}", "-".repeat(header_row.len()));
    for row in &rows {
        println!("{}", render(row));
    }
}

/// The literal `NONE` for unset tags; a present-but-empty tag set renders as `""`.
fn render_tags(tags: &Option<HashSet<String>>) -> String {
    match tags {
        None => "NONE".to_owned(),
        Some(set) => {
            let mut sorted: Vec<&str> = set.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.join(",")
        }
    }
}

/// Derives a tag set from the `name` or `property` source.
/// `name` splits the shortname on `_`, discarding empty components, and
/// drops the first component (the "base" name); the remainder are tags.
/// `property` reads a named user property and splits its value on `,`.
/// Returns `None` when the source yields nothing (distinct from an empty set).
fn derive_tags_from_source(
    machine: &Machine,
    longname: &str,
    shortname: &str,
    source: TagSource,
    property: Option<&str>,
) -> Result<Option<HashSet<String>>, AppError> {
    match source {
        TagSource::Name => {
            let mut parts = shortname.split('_').filter(|s| !s.is_empty());
            let _base = parts.next();
            let rest: HashSet<String> = parts.map(str::to_owned).collect();
            if rest.is_empty() {
                Ok(None)
            } else {
                Ok(Some(rest))
            }
        }
        TagSource::Property => {
            let prop = property
                .ok_or_else(|| AppError::InputError("--source=property requires --property NAME".into()))?;
            let value = machine.get_raw_property(longname, prop)?;
            Ok(Snapshot::parse_tags_property(&value))
        }
    }
}

pub fn tag(machine: &Machine, dataset: &str, op: &TagOp) -> Result<(), AppError> {
    let args: &TagArgs = match op {
        TagOp::Set(a) | TagOp::Add(a) | TagOp::Remove(a) => a,
    };
    let longname = format!("{dataset}@{}", args.shortname);
    let current = machine
        .get_snapshots(&[longname.clone()])?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::InputError(format!("{longname}: no such snapshot")))?;

    let derived = derive_tags_from_source(machine, &longname, &args.shortname, args.source, args.property.as_deref())?;

    // A source that yields no tags is a no-op for every operation, including
    // SET: it leaves the snapshot's tags untouched rather than clearing them.
    let new_tags = match (op, derived) {
        (_, None) => {
            info!("{longname}: source yielded no tags, leaving tags untouched");
            return Ok(());
        }
        (TagOp::Set(_), Some(set)) => Some(set),
        (TagOp::Add(_), Some(add)) => {
            let mut merged = current.tags.clone().unwrap_or_default();
            merged.extend(add);
            Some(merged)
        }
        (TagOp::Remove(_), Some(remove)) => {
            let mut merged = current.tags.clone().unwrap_or_default();
            merged.retain(|t| !remove.contains(t));
            Some(merged)
        }
    };

    machine.set_tags(&longname, &new_tags)?;
    info!("tagged {longname}: {}", render_tags(&new_tags));
    Ok(())
}

pub struct PruneArgs {
    pub last: u32,
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
    pub within: Option<String>,
    pub within_hourly: Option<String>,
    pub within_daily: Option<String>,
    pub within_weekly: Option<String>,
    pub within_monthly: Option<String>,
    pub within_yearly: Option<String>,
    pub keep_name: Option<String>,
    pub keep_tag: Vec<String>,
    pub tag_group: Vec<String>,
    pub group_by: GroupBy,
}

fn parse_duration_flag(value: &Option<String>) -> Result<KeepDuration, AppError> {
    match value {
        None => Ok(KeepDuration::default()),
        Some(s) => KeepDuration::from_str(s).map_err(|e| AppError::InputError(e.to_string())),
    }
}

fn build_policy(args: &PruneArgs) -> Result<KeepPolicy, AppError> {
    let name = match &args.keep_name {
        None => None,
        Some(pattern) => Some(Regex::new(pattern).map_err(|e| AppError::InputError(e.to_string()))?),
    };
    Ok(KeepPolicy {
        last: args.last,
        hourly: args.hourly,
        daily: args.daily,
        weekly: args.weekly,
        monthly: args.monthly,
        yearly: args.yearly,
        within: parse_duration_flag(&args.within)?,
        within_hourly: parse_duration_flag(&args.within_hourly)?,
        within_daily: parse_duration_flag(&args.within_daily)?,
        within_weekly: parse_duration_flag(&args.within_weekly)?,
        within_monthly: parse_duration_flag(&args.within_monthly)?,
        within_yearly: parse_duration_flag(&args.within_yearly)?,
        name,
        tags: args.keep_tag.iter().cloned().collect(),
    })
}

/// Parses the repeatable `--tag a,b,c` groups into tag sets.
fn parse_tag_groups(groups: &[String]) -> HashSet<Vec<String>> {
    groups
        .iter()
        .map(|g| {
            let mut parts: Vec<String> = g.split(',').map(str::to_owned).collect();
            parts.sort();
            parts
        })
        .collect()
}

fn passes_tag_filter(snap: &Snapshot, groups: &HashSet<Vec<String>>) -> bool {
    if groups.is_empty() {
        return true;
    }
    groups.iter().any(|g| match &snap.tags {
        Some(tags) => g.iter().all(|t| tags.contains(t)),
        None => g.is_empty(),
    })
}

pub fn prune(
    machine: &Machine,
    dataset: &str,
    recursive: bool,
    dry_run: bool,
    args: PruneArgs,
) -> Result<(), AppError> {
    let policy = build_policy(&args)?;
    let tag_groups = parse_tag_groups(&args.tag_group);
    let group_by = args.group_by;

    let all = machine.list_snapshots(Some(dataset), recursive, None, false)?;
    let candidates: Vec<Snapshot> = all.into_iter().filter(|s| passes_tag_filter(s, &tag_groups)).collect();

    let now = Utc::now();
    let groups: HashMap<String, Vec<Snapshot>> = match group_by {
        GroupBy::Dataset => candidates.into_iter().into_group_map_by(|s| s.dataset.clone()),
        GroupBy::None => {
            let mut m = HashMap::new();
            m.insert(String::new(), candidates);
            m
        }
    };

    let mut total_keep = 0usize;
    let mut total_input = 0usize;
    let mut to_destroy: HashMap<String, Vec<String>> = HashMap::new();

    for (_, snaps) in groups {
        total_input += snaps.len();
        let (keep, destroy) = apply_policy(&snaps, &policy, now);
        total_keep += keep.len();
        for s in destroy {
            to_destroy.entry(s.dataset.clone()).or_default().push(s.shortname);
        }
    }

    if total_input > 0 && total_keep == 0 {
        return Err(AppError::RefuseDestroyAll { dataset: dataset.to_owned() });
    }

    for (ds, shortnames) in &to_destroy {
        if dry_run {
            for name in shortnames {
                info!("[dry-run] would destroy {ds}@{name}");
            }
            continue;
        }
        let destroyed = machine.destroy_snapshots(ds, shortnames)?;
        if !destroyed {
            warn!("{ds}@{}: destroy refused (held); skipped", shortnames.join(","));
        }
    }

    Ok(())
}

pub fn push(
    local_dataset: &str,
    target: &str,
    port: Option<u16>,
    init: bool,
    recursive: bool,
    dry_run: bool,
) -> Result<(), AppError> {
    let (mut remote, remote_dataset) = parse_remote_spec(target)?;
    remote.port = port;
    let src = Machine::Local;
    let dst = Machine::Remote(remote);
    let opts = ReplicationOpts { initialize: init, recursive, dry_run };
    replicate::replicate(&src, local_dataset, &dst, &remote_dataset, &opts)
}

pub fn pull(
    local_dataset: &str,
    target: &str,
    port: Option<u16>,
    init: bool,
    recursive: bool,
    dry_run: bool,
) -> Result<(), AppError> {
    let (mut remote, remote_dataset) = parse_remote_spec(target)?;
    remote.port = port;
    let src = Machine::Remote(remote);
    let dst = Machine::Local;
    let opts = ReplicationOpts { initialize: init, recursive, dry_run };
    replicate::replicate(&src, &remote_dataset, &dst, local_dataset, &opts)
}

/// Parses the `push`/`pull` positional `[USER@]HOST:DATASET`.
fn parse_remote_spec(spec: &str) -> Result<(crate::machine::RemoteHost, String), AppError> {
    let (host_part, dataset) = spec
        .split_once(':')
        .ok_or_else(|| AppError::InputError(format!("{spec}: expected [USER@]HOST:DATASET")))?;
    if dataset.is_empty() {
        return Err(AppError::InputError(format!("{spec}: empty dataset after ':'")));
    }
    let (user, host) = match host_part.split_once('@') {
        Some((u, h)) => (Some(u.to_owned()), h.to_owned()),
        None => (None, host_part.to_owned()),
    };
    if host.is_empty() {
        return Err(AppError::InputError(format!("{spec}: empty host before ':'")));
    }
    Ok((crate::machine::RemoteHost { host, user, port: None }, dataset.to_owned()))
}

pub fn version() {
    println!("zfsnappr {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_shortname_is_ten_alphanumeric_chars() {
        let s = random_shortname();
        assert_eq!(s.len(), 10);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn tag_groups_pass_filter_on_subset() {
        let mut groups = HashSet::new();
        groups.insert(vec!["db".to_owned(), "prod".to_owned()]);
        let mut snap = Snapshot {
            dataset: "p/x".into(),
            shortname: "a".into(),
            timestamp: Utc::now(),
            guid: 0,
            holds: 0,
            tags: Some(["db", "prod", "extra"].into_iter().map(String::from).collect()),
        };
        assert!(passes_tag_filter(&snap, &groups));
        snap.tags = Some(["db"].into_iter().map(String::from).collect());
        assert!(!passes_tag_filter(&snap, &groups));
    }

    #[test]
    fn empty_tag_groups_pass_everything() {
        let groups = HashSet::new();
        let snap = Snapshot {
            dataset: "p/x".into(),
            shortname: "a".into(),
            timestamp: Utc::now(),
            guid: 0,
            holds: 0,
            tags: None,
        };
        assert!(passes_tag_filter(&snap, &groups));
    }
}
