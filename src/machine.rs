//! The filesystem agent: a thin, stateless façade over the filesystem's
//! command-line interface. Every method maps to exactly one external
//! invocation. Two variants: `Local` runs the command directly, `Remote`
//! prepends a secure-shell invocation.

use crate::dataset::{Dataset, Hold, Pool, Snapshot};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::thread::sleep;
use std::time::Duration;
use subprocess::{Exec, ExitStatus, Popen, Redirection};
use thiserror::Error;

/// The namespaced custom property under which tags are stored.
pub const TAG_PROPERTY: &str = "tool:tags";

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("no such dataset")]
    NoDataset,
    #[error("invalid character in snapshot name")]
    InvalidCharacter,
    #[error("the name is already in use")]
    NameAlreadyInUse,
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn { cmd: String, source: std::io::Error },
    #[error("`{cmd}` exited with status {status}: {stderr}")]
    Exit {
        cmd: String,
        status: i32,
        stderr: String,
    },
    #[error("could not parse output of `{cmd}`: {reason}")]
    Parse { cmd: String, reason: String },
}

/// How a `list_snapshots` call should be sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Creation,
}

/// A remote host spec: a secure-shell target plus optional user and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

impl std::fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@{}", self.host)
        } else {
            write!(f, "{}", self.host)
        }
    }
}

/// Thin, stateless façade over the filesystem's command interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Machine {
    Local,
    Remote(RemoteHost),
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Machine::Local => write!(f, "localhost"),
            Machine::Remote(r) => write!(f, "{r}"),
        }
    }
}

impl Machine {
    /// Builds the argv for one invocation, prefixing a secure-shell call when remote.
    fn argv(&self, args: &[&str]) -> Vec<String> {
        match self {
            Machine::Local => args.iter().map(|s| s.to_string()).collect(),
            Machine::Remote(r) => {
                let mut v = vec!["ssh".to_string()];
                if let Some(port) = r.port {
                    v.push("-p".to_string());
                    v.push(port.to_string());
                }
                v.push(r.to_string());
                v.push("--".to_string());
                v.extend(args.iter().map(|s| s.to_string()));
                v
            }
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, AgentError> {
        let argv = self.argv(args);
        let cmd = argv.join(" ");
        let capture = Exec::cmd(&argv[0])
            .args(&argv[1..])
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .map_err(|e| AgentError::Spawn {
                cmd: cmd.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;
        if !capture.exit_status.success() {
            return Err(classify_exit(&cmd, &capture.exit_status, capture.stderr_str()));
        }
        Ok(capture.stdout_str())
    }

    /// Like `run`, but tolerates the exit codes in `tolerated` (returns `Ok(None)`
    /// for those, vs. `Ok(Some(stdout))` on success).
    fn run_tolerating(
        &self,
        args: &[&str],
        tolerated: &[i32],
    ) -> Result<Option<String>, AgentError> {
        let argv = self.argv(args);
        let cmd = argv.join(" ");
        let capture = Exec::cmd(&argv[0])
            .args(&argv[1..])
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .map_err(|e| AgentError::Spawn {
                cmd: cmd.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;
        if capture.exit_status.success() {
            return Ok(Some(capture.stdout_str()));
        }
        if let ExitStatus::Exited(code) = capture.exit_status {
            if tolerated.contains(&(code as i32)) {
                return Ok(None);
            }
        }
        Err(classify_exit(&cmd, &capture.exit_status, capture.stderr_str()))
    }

    /// Ordered sequence of snapshots under `dataset` (or every dataset, if
    /// unset), with the properties this tool cares about.
    pub fn list_snapshots(
        &self,
        dataset: Option<&str>,
        recursive: bool,
        sort_by: Option<SortKey>,
        reverse: bool,
    ) -> Result<Vec<Snapshot>, AgentError> {
        let columns = format!("name,creation,guid,userrefs,{TAG_PROPERTY}");
        let mut args = vec!["zfs", "list", "-Hp", "-t", "snapshot"];
        if dataset.is_some() {
            args.push(if recursive { "-r" } else { "-d1" });
        }
        args.push("-o");
        args.push(&columns);
        let sort_prop = sort_by.map(|key| match key {
            SortKey::Name => "name",
            SortKey::Creation => "creation",
        });
        if let Some(prop) = sort_prop {
            args.push(if reverse { "-S" } else { "-s" });
            args.push(prop);
        }
        if let Some(ds) = dataset {
            args.push(ds);
        }
        let out = self.run(&args)?;
        parse_snapshot_list(&out)
    }

    /// Batch property fetch by identity.
    pub fn get_snapshots(&self, longnames: &[String]) -> Result<Vec<Snapshot>, AgentError> {
        if longnames.is_empty() {
            return Ok(Vec::new());
        }
        let props = format!("name,creation,guid,userrefs,{TAG_PROPERTY}");
        let mut args: Vec<&str> = vec!["zfs", "get", "-Hp", "-o", "name,property,value", &props];
        for n in longnames {
            args.push(n.as_str());
        }
        let out = self.run(&args)?;
        parse_get_properties(&out)
    }

    pub fn list_datasets(&self) -> Result<Vec<Dataset>, AgentError> {
        let out = self.run(&["zfs", "list", "-Hp", "-o", "name,guid"])?;
        let mut v = Vec::new();
        for line in out.lines() {
            let mut f = line.split('\t');
            let name = f.next().ok_or_else(|| parse_err("zfs list", "missing name"))?;
            let guid = f
                .next()
                .ok_or_else(|| parse_err("zfs list", "missing guid"))?
                .parse()
                .map_err(|_| parse_err("zfs list", "bad guid"))?;
            v.push(Dataset { name: name.to_owned(), guid });
        }
        Ok(v)
    }

    /// Reads a single named property's raw string value off `longname`, used
    /// by the `tag` subcommand's `property` source.
    pub fn get_raw_property(&self, longname: &str, property: &str) -> Result<String, AgentError> {
        let out = self.run(&["zfs", "get", "-Hp", "-o", "value", property, longname])?;
        Ok(out.trim().to_owned())
    }

    pub fn get_dataset(&self, name: &str) -> Result<Dataset, AgentError> {
        let out = self.run(&["zfs", "get", "-Hp", "-o", "value", "guid", name])?;
        let guid: u64 = out
            .trim()
            .parse()
            .map_err(|_| parse_err("zfs get guid", "not an integer"))?;
        Ok(Dataset { name: name.to_owned(), guid })
    }

    pub fn get_pool_from_dataset(&self, dataset: &str) -> Result<Pool, AgentError> {
        let name = Pool::name_of(dataset).to_owned();
        let out = self.run(&["zfs", "get", "-Hp", "-o", "value", "guid", &name])?;
        let guid: u64 = out
            .trim()
            .parse()
            .map_err(|_| parse_err("zfs get guid", "not an integer"))?;
        Ok(Pool { name, guid })
    }

    pub fn create_snapshot(
        &self,
        longname: &str,
        recursive: bool,
        properties: &HashMap<String, String>,
    ) -> Result<(), AgentError> {
        let mut args = vec!["zfs", "snapshot"];
        if recursive {
            args.push("-r");
        }
        let prop_strs: Vec<String> = properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
        for p in &prop_strs {
            args.push("-o");
            args.push(p);
        }
        args.push(longname);
        self.run(&args).map_err(|e| match e {
            AgentError::Exit { stderr, .. } if stderr.contains("invalid character") => {
                AgentError::InvalidCharacter
            }
            AgentError::Exit { stderr, .. } if stderr.contains("dataset does not exist") => {
                AgentError::NoDataset
            }
            AgentError::Exit { stderr, .. } if stderr.contains("already exists") => {
                AgentError::NameAlreadyInUse
            }
            other => other,
        })?;
        Ok(())
    }

    pub fn rename_snapshot(&self, longname: &str, new_shortname: &str) -> Result<(), AgentError> {
        let (dataset, _) = split_longname(longname)?;
        let new_longname = format!("{dataset}@{new_shortname}");
        self.run(&["zfs", "rename", longname, &new_longname])?;
        Ok(())
    }

    /// A single invocation with a comma-joined shortname list under one
    /// dataset. Exit code 1 (hold-refused) is tolerated.
    pub fn destroy_snapshots(&self, dataset: &str, shortnames: &[String]) -> Result<bool, AgentError> {
        if shortnames.is_empty() {
            return Ok(true);
        }
        let target = format!("{dataset}@{}", shortnames.join(","));
        let result = self.run_tolerating(&["zfs", "destroy", &target], &[1])?;
        Ok(result.is_some())
    }

    pub fn set_tags(&self, longname: &str, tags: &Option<HashSet<String>>) -> Result<(), AgentError> {
        let value = Snapshot::format_tags_property(tags);
        let assignment = format!("{TAG_PROPERTY}={value}");
        self.run(&["zfs", "set", &assignment, longname])?;
        Ok(())
    }

    pub fn hold(&self, longnames: &[String], tag: &str) -> Result<(), AgentError> {
        if longnames.is_empty() {
            return Ok(());
        }
        let mut args = vec!["zfs", "hold", tag];
        for n in longnames {
            args.push(n.as_str());
        }
        self.run(&args)?;
        Ok(())
    }

    pub fn release(&self, longnames: &[String], tag: &str) -> Result<(), AgentError> {
        if longnames.is_empty() {
            return Ok(());
        }
        let mut args = vec!["zfs", "release", tag];
        for n in longnames {
            args.push(n.as_str());
        }
        self.run(&args)?;
        Ok(())
    }

    pub fn get_holds(&self, longnames: &[String]) -> Result<HashSet<Hold>, AgentError> {
        if longnames.is_empty() {
            return Ok(HashSet::new());
        }
        let mut args = vec!["zfs", "holds", "-H"];
        for n in longnames {
            args.push(n.as_str());
        }
        let out = self.run(&args)?;
        let mut holds = HashSet::new();
        for line in out.lines() {
            let mut f = line.split('\t');
            let name = f.next().ok_or_else(|| parse_err("zfs holds", "missing name"))?;
            let tag = f.next().ok_or_else(|| parse_err("zfs holds", "missing tag"))?;
            holds.insert(Hold {
                snapshot_longname: name.to_owned(),
                tag: tag.to_owned(),
            });
        }
        Ok(holds)
    }

    pub fn has_hold(&self, longname: &str, tag: &str) -> Result<bool, AgentError> {
        let holds = self.get_holds(&[longname.to_owned()])?;
        Ok(holds
            .iter()
            .any(|h| h.snapshot_longname == longname && h.tag == tag))
    }

    /// Starts `zfs send`; stdout is a readable byte stream owned by the returned handle.
    pub fn send_snapshot_async(
        &self,
        longname: &str,
        base_longname: Option<&str>,
    ) -> Result<ChildHandle, AgentError> {
        let mut args = vec!["zfs", "send"];
        if let Some(base) = base_longname {
            args.push("-i");
            args.push(base);
        }
        args.push(longname);
        self.spawn_async(&args, None)
    }

    /// Starts `zfs receive`; `stdin` becomes the receive process's standard input.
    pub fn receive_snapshot_async(
        &self,
        dataset: &str,
        stdin: File,
        properties: &HashMap<String, String>,
    ) -> Result<ChildHandle, AgentError> {
        let mut args = vec!["zfs", "receive"];
        let prop_strs: Vec<String> = properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
        for p in &prop_strs {
            args.push("-o");
            args.push(p);
        }
        args.push(dataset);
        self.spawn_async(&args, Some(stdin))
    }

    fn spawn_async(&self, args: &[&str], stdin: Option<File>) -> Result<ChildHandle, AgentError> {
        let argv = self.argv(args);
        let cmd = argv.join(" ");
        let mut exec = Exec::cmd(&argv[0])
            .args(&argv[1..])
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe);
        exec = match stdin {
            Some(f) => exec.stdin(Redirection::File(f)),
            None => exec.stdin(Redirection::None),
        };
        let popen = exec.popen().map_err(|e| AgentError::Spawn {
            cmd: cmd.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        Ok(ChildHandle { popen, cmd })
    }
}

fn parse_err(cmd: &str, reason: &str) -> AgentError {
    AgentError::Parse {
        cmd: cmd.to_owned(),
        reason: reason.to_owned(),
    }
}

fn classify_exit(cmd: &str, status: &ExitStatus, stderr: String) -> AgentError {
    if stderr.ends_with("dataset does not exist\n") || stderr.contains("dataset does not exist") {
        return AgentError::NoDataset;
    }
    let code = match status {
        ExitStatus::Exited(c) => *c as i32,
        ExitStatus::Signaled(s) => -(*s as i32),
        _ => -1,
    };
    AgentError::Exit {
        cmd: cmd.to_owned(),
        status: code,
        stderr,
    }
}

fn split_longname(longname: &str) -> Result<(&str, &str), AgentError> {
    longname
        .split_once('@')
        .ok_or_else(|| parse_err(longname, "missing '@' separator"))
}

/// Parses `zfs list -Hp -o name,creation,guid,userrefs,tool:tags -t snapshot` output.
fn parse_snapshot_list(output: &str) -> Result<Vec<Snapshot>, AgentError> {
    let mut out = Vec::new();
    for line in output.lines() {
        let mut f = line.split('\t');
        let longname = f.next().ok_or_else(|| parse_err("zfs list", "missing name"))?;
        let (dataset, shortname) = split_longname(longname)?;
        let creation: i64 = f
            .next()
            .ok_or_else(|| parse_err("zfs list", "missing creation"))?
            .parse()
            .map_err(|_| parse_err("zfs list", "bad creation"))?;
        let guid: u64 = f
            .next()
            .ok_or_else(|| parse_err("zfs list", "missing guid"))?
            .parse()
            .map_err(|_| parse_err("zfs list", "bad guid"))?;
        let holds: u32 = f
            .next()
            .ok_or_else(|| parse_err("zfs list", "missing userrefs"))?
            .parse()
            .map_err(|_| parse_err("zfs list", "bad userrefs"))?;
        let tag_value = f.next().unwrap_or("-");
        out.push(Snapshot {
            dataset: dataset.to_owned(),
            shortname: shortname.to_owned(),
            timestamp: Utc.timestamp_opt(creation, 0).single().ok_or_else(|| {
                parse_err("zfs list", "creation out of range")
            })?,
            guid,
            holds,
            tags: Snapshot::parse_tags_property(tag_value),
        });
    }
    Ok(out)
}

/// Parses `zfs get -Hp -o name,property,value name,creation,guid,userrefs,tool:tags <targets...>`
/// output: N properties x M targets, one row per (target, property) pair.
fn parse_get_properties(output: &str) -> Result<Vec<Snapshot>, AgentError> {
    let mut by_target: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut order = Vec::new();
    for line in output.lines() {
        let mut f = line.split('\t');
        let name = f.next().ok_or_else(|| parse_err("zfs get", "missing name"))?;
        let property = f.next().ok_or_else(|| parse_err("zfs get", "missing property"))?;
        let value = f.next().ok_or_else(|| parse_err("zfs get", "missing value"))?;
        if !by_target.contains_key(name) {
            order.push(name.to_owned());
        }
        by_target
            .entry(name.to_owned())
            .or_default()
            .insert(property.to_owned(), value.to_owned());
    }
    let mut out = Vec::with_capacity(order.len());
    for longname in order {
        let props = &by_target[&longname];
        let (dataset, shortname) = split_longname(&longname)?;
        let creation: i64 = props
            .get("creation")
            .ok_or_else(|| parse_err("zfs get", "missing creation"))?
            .parse()
            .map_err(|_| parse_err("zfs get", "bad creation"))?;
        let guid: u64 = props
            .get("guid")
            .ok_or_else(|| parse_err("zfs get", "missing guid"))?
            .parse()
            .map_err(|_| parse_err("zfs get", "bad guid"))?;
        let holds: u32 = props
            .get("userrefs")
            .ok_or_else(|| parse_err("zfs get", "missing userrefs"))?
            .parse()
            .map_err(|_| parse_err("zfs get", "bad userrefs"))?;
        let tag_value = props.get(TAG_PROPERTY).map(String::as_str).unwrap_or("-");
        out.push(Snapshot {
            dataset: dataset.to_owned(),
            shortname: shortname.to_owned(),
            timestamp: Utc
                .timestamp_opt(creation, 0)
                .single()
                .ok_or_else(|| parse_err("zfs get", "creation out of range"))?,
            guid,
            holds,
            tags: Snapshot::parse_tags_property(tag_value),
        });
    }
    Ok(out)
}

/// A running child process, as started by `send_snapshot_async`/`receive_snapshot_async`.
/// Exposes a non-blocking status query, a terminate operation, and a final exit
/// code; the agent does not wait for it.
pub struct ChildHandle {
    popen: Popen,
    cmd: String,
}

impl ChildHandle {
    /// Non-blocking poll; `None` means still running.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        self.popen.poll()
    }

    pub fn terminate(&mut self) {
        let _ = self.popen.terminate();
    }

    /// Takes ownership of the process's stdout, for piping into a receive.
    pub fn take_stdout(&mut self) -> Option<File> {
        self.popen.stdout.take()
    }

    pub fn stderr_to_string(&mut self) -> String {
        use std::io::Read;
        let mut s = String::new();
        if let Some(mut f) = self.popen.stderr.take() {
            let _ = f.read_to_string(&mut s);
        }
        s
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Blocks until exit, polling every `interval`. Used by the supervisor.
    pub fn wait_polling(&mut self, interval: Duration) -> ExitStatus {
        loop {
            if let Some(status) = self.poll() {
                return status;
            }
            sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_local_is_unprefixed() {
        let m = Machine::Local;
        assert_eq!(m.argv(&["zfs", "list"]), vec!["zfs", "list"]);
    }

    #[test]
    fn argv_remote_prepends_ssh() {
        let m = Machine::Remote(RemoteHost {
            host: "backup".to_owned(),
            user: Some("alice".to_owned()),
            port: Some(2222),
        });
        assert_eq!(
            m.argv(&["zfs", "list"]),
            vec!["ssh", "-p", "2222", "alice@backup", "--", "zfs", "list"]
        );
    }

    #[test]
    fn parse_snapshot_list_reads_fields() {
        let out = "tank/data@a\t1700000000\t42\t1\ttag1,tag2\n\
                    tank/data@b\t1700003600\t43\t0\t-\n";
        let snaps = parse_snapshot_list(out).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].shortname, "a");
        assert_eq!(snaps[0].guid, 42);
        assert_eq!(snaps[0].holds, 1);
        assert_eq!(
            snaps[0].tags,
            Some(["tag1", "tag2"].into_iter().map(String::from).collect())
        );
        assert_eq!(snaps[1].tags, None);
    }

    #[test]
    fn parse_get_properties_groups_by_target() {
        let out = "tank/data@a\tcreation\t1700000000\n\
                    tank/data@a\tguid\t42\n\
                    tank/data@a\tuserrefs\t0\n\
                    tank/data@a\ttool:tags\t-\n";
        let snaps = parse_get_properties(out).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].guid, 42);
        assert_eq!(snaps[0].tags, None);
    }

    #[test]
    fn split_longname_requires_at_sign() {
        assert!(split_longname("no-at-sign").is_err());
        assert_eq!(split_longname("a/b@c").unwrap(), ("a/b", "c"));
    }
}
