//! CLI surface: top-level flags shared by every subcommand, plus one variant
//! per subcommand. Parsed with `clap`'s derive API.

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "zfsnappr",
    version,
    about = "Snapshot lifecycle manager: tagging, retention policy, and incremental send/receive replication."
)]
pub struct Cli {
    /// Dataset to operate on. Required by create/list/tag/prune/push/pull.
    #[arg(short = 'd', long, global = true)]
    pub dataset: Option<String>,

    /// Recurse into child datasets.
    #[arg(short = 'r', long, global = true)]
    pub recursive: bool,

    /// Print what would happen without mutating anything.
    #[arg(short = 'n', long = "dry-run", global = true)]
    pub dry_run: bool,

    /// Increase this tool's own logging verbosity.
    #[arg(short = 'v', long = "app-verbose", global = true)]
    pub app_verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Take a new snapshot of -d/--dataset.
    Create {
        /// Explicit shortname; if omitted, a random 10-character alphanumeric name is generated.
        #[arg(long)]
        name: Option<String>,
        /// Tags to attach at creation time (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List snapshots of -d/--dataset (or every dataset, if omitted).
    List,

    /// Set, add, or remove tags on a snapshot of -d/--dataset.
    Tag {
        #[command(subcommand)]
        op: TagOp,
    },

    /// Apply a retention policy to -d/--dataset and destroy what falls out of it.
    Prune {
        #[arg(long = "keep-last", default_value_t = 0)]
        last: u32,
        #[arg(long = "keep-hourly", default_value_t = 0)]
        hourly: u32,
        #[arg(long = "keep-daily", default_value_t = 0)]
        daily: u32,
        #[arg(long = "keep-weekly", default_value_t = 0)]
        weekly: u32,
        #[arg(long = "keep-monthly", default_value_t = 0)]
        monthly: u32,
        #[arg(long = "keep-yearly", default_value_t = 0)]
        yearly: u32,

        #[arg(long = "keep-within")]
        within: Option<String>,
        #[arg(long = "keep-within-hourly")]
        within_hourly: Option<String>,
        #[arg(long = "keep-within-daily")]
        within_daily: Option<String>,
        #[arg(long = "keep-within-weekly")]
        within_weekly: Option<String>,
        #[arg(long = "keep-within-monthly")]
        within_monthly: Option<String>,
        #[arg(long = "keep-within-yearly")]
        within_yearly: Option<String>,

        /// Regex; snapshots whose shortname matches are kept unconditionally.
        #[arg(long = "keep-name")]
        keep_name: Option<String>,
        /// Tag required to be present (repeatable); a snapshot carrying all of
        /// them is kept unconditionally.
        #[arg(long = "keep-tag")]
        keep_tag: Vec<String>,

        /// Restricts pruning to snapshots whose tags are a superset of one of
        /// these comma-encoded groups (repeatable). Omit to consider every snapshot.
        #[arg(long = "tag")]
        tag_group: Vec<String>,

        #[arg(long = "group-by", value_enum, default_value_t = GroupBy::Dataset)]
        group_by: GroupBy,
    },

    /// Push -d/--dataset to a remote dataset, sending only what it lacks.
    Push {
        /// `[USER@]HOST:DATASET`
        target: String,
        #[arg(short = 'p', long)]
        port: Option<u16>,
        /// Permit an initial full transfer when the destination has no snapshots.
        #[arg(long)]
        init: bool,
    },

    /// Pull a remote dataset into -d/--dataset, receiving only what's missing locally.
    Pull {
        /// `[USER@]HOST:DATASET`
        target: String,
        #[arg(short = 'p', long)]
        port: Option<u16>,
        #[arg(long)]
        init: bool,
    },

    /// Print this tool's own version.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum TagOp {
    Set(TagArgs),
    Add(TagArgs),
    Remove(TagArgs),
}

#[derive(Args, Debug)]
pub struct TagArgs {
    /// Shortname of the snapshot to tag (under -d/--dataset).
    pub shortname: String,

    #[arg(long, value_enum, default_value_t = TagSource::Name)]
    pub source: TagSource,

    /// Named user property to read tags from, when --source=property.
    #[arg(long)]
    pub property: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagSource {
    Name,
    Property,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupBy {
    Dataset,
    None,
}
