//! The replication engine: brings a destination dataset up to date with a
//! source dataset by locating a common-ancestor snapshot by guid, driving an
//! incremental send/receive pipeline, and managing the cryptographic holds
//! that pin the send-base and the just-received tip on both sides.

use crate::dataset::{Hold, Snapshot};
use crate::error::AppError;
use crate::machine::{AgentError, ChildHandle, Machine, SortKey};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;
use subprocess::ExitStatus;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ReplicationOpts {
    pub initialize: bool,
    pub recursive: bool,
    pub dry_run: bool,
}

/// Entry point for `push`/`pull`: replicates `src_dataset` on `src_machine`
/// onto `dst_dataset` on `dst_machine`.
pub fn replicate(
    src_machine: &Machine,
    src_dataset: &str,
    dst_machine: &Machine,
    dst_dataset: &str,
    opts: &ReplicationOpts,
) -> Result<(), AppError> {
    if opts.recursive {
        replicate_recursive(src_machine, src_dataset, dst_machine, dst_dataset, opts)
    } else {
        let s = src_machine.list_snapshots(Some(src_dataset), false, Some(SortKey::Creation), true)?;
        replicate_one(src_machine, src_dataset, &s, dst_machine, dst_dataset, opts)
    }
}

/// Groups a recursive listing by dataset and replicates each child
/// independently into the correspondingly-suffixed destination dataset.
/// A failure in one child does not roll back others.
fn replicate_recursive(
    src_machine: &Machine,
    src_dataset: &str,
    dst_machine: &Machine,
    dst_dataset: &str,
    opts: &ReplicationOpts,
) -> Result<(), AppError> {
    let all = src_machine.list_snapshots(Some(src_dataset), true, Some(SortKey::Creation), true)?;
    let mut by_dataset: HashMap<String, Vec<Snapshot>> = HashMap::new();
    for s in all {
        by_dataset.entry(s.dataset.clone()).or_default().push(s);
    }
    let mut datasets: Vec<String> = by_dataset.keys().cloned().collect();
    datasets.sort();

    let single_opts = ReplicationOpts { recursive: false, ..*opts };
    let mut first_err = None;
    for ds in datasets {
        let suffix = ds.strip_prefix(src_dataset).unwrap_or("");
        let child_dst = format!("{dst_dataset}{suffix}");
        let snaps = &by_dataset[&ds];
        if let Err(e) = replicate_one(src_machine, &ds, snaps, dst_machine, &child_dst, &single_opts) {
            warn!("replication of {ds} into {child_dst} failed: {e}");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The non-recursive replication of one (src_dataset, dst_dataset) pair.
/// `s` is the source's snapshot list, newest-first.
fn replicate_one(
    src_machine: &Machine,
    src_dataset: &str,
    s: &[Snapshot],
    dst_machine: &Machine,
    dst_dataset: &str,
    opts: &ReplicationOpts,
) -> Result<(), AppError> {
    if s.is_empty() {
        debug!("{src_dataset} has no snapshots; nothing to replicate");
        return Ok(());
    }

    let d = match dst_machine.list_snapshots(Some(dst_dataset), false, Some(SortKey::Creation), true) {
        Ok(v) => v,
        Err(AgentError::NoDataset) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let needs_initial_transfer = d.is_empty();
    let b = if needs_initial_transfer {
        if !opts.initialize {
            return Err(AppError::NotInitialized { dataset: dst_dataset.to_owned() });
        }
        s.len()
    } else {
        match s.iter().position(|x| x.guid == d[0].guid) {
            Some(idx) => idx,
            None => {
                return Err(AppError::Diverged {
                    src: src_dataset.to_owned(),
                    dst: dst_dataset.to_owned(),
                })
            }
        }
    };

    if b == 0 {
        debug!("{dst_dataset} already up to date with {src_dataset}");
        return Ok(());
    }

    if opts.dry_run {
        info!("[dry-run] would transfer {b} snapshot(s) from {src_dataset} to {dst_dataset}");
        return Ok(());
    }

    let b = if needs_initial_transfer {
        initial_transfer(src_machine, s, dst_machine, dst_dataset)?;
        s.len() - 1
    } else {
        b
    };

    if b == 0 {
        return Ok(());
    }

    let g_dst = dst_machine.get_dataset(dst_dataset)?.guid;
    let g_src = src_machine.get_dataset(src_dataset)?.guid;
    let tag_src = format!("sendbase-{g_dst}");
    let tag_dst = format!("recvbase-{g_src}");

    cleanup_stale_holds(src_machine, s, &tag_src)?;
    let d_current = dst_machine.list_snapshots(Some(dst_dataset), false, None, false)?;
    cleanup_stale_holds(dst_machine, &d_current, &tag_dst)?;

    transfer_loop(src_machine, s, dst_machine, dst_dataset, b, &tag_src, &tag_dst)
}

/// Sends `s[-1]` (the oldest source snapshot) with no base and receives it
/// with `{readonly=on, atime=off}` so the destination is immediately a sane
/// replica target.
fn initial_transfer(
    src_machine: &Machine,
    s: &[Snapshot],
    dst_machine: &Machine,
    dst_dataset: &str,
) -> Result<(), AppError> {
    let oldest = s.last().expect("caller checked s is non-empty");
    info!("initial full send of {} to {dst_dataset}", oldest.longname());
    let props = HashMap::from([
        ("readonly".to_string(), "on".to_string()),
        ("atime".to_string(), "off".to_string()),
    ]);
    let mut send_h = src_machine.send_snapshot_async(&oldest.longname(), None)?;
    let stdout = send_h.take_stdout().expect("send stdout is piped");
    let mut recv_h = dst_machine.receive_snapshot_async(dst_dataset, stdout, &props)?;
    let (send_status, recv_status) = supervise(&mut send_h, &mut recv_h);
    if !send_status.success() || !recv_status.success() {
        return Err(AppError::TransferFailed { index: s.len() - 1 });
    }
    Ok(())
}

/// For `i` from `b-1` down to `0` (oldest untransferred first): send, receive,
/// propagate tags, place holds on the new tips, and release holds on the
/// previous ones.
fn transfer_loop(
    src_machine: &Machine,
    s: &[Snapshot],
    dst_machine: &Machine,
    dst_dataset: &str,
    b: usize,
    tag_src: &str,
    tag_dst: &str,
) -> Result<(), AppError> {
    for i in (0..b).rev() {
        let base = &s[i + 1];
        let cur = &s[i];
        info!("sending {} (base {})", cur.longname(), base.longname());

        let mut send_h = src_machine.send_snapshot_async(&cur.longname(), Some(&base.longname()))?;
        let stdout = send_h.take_stdout().expect("send stdout is piped");
        let mut recv_h = dst_machine.receive_snapshot_async(dst_dataset, stdout, &HashMap::new())?;

        let (send_status, recv_status) = supervise(&mut send_h, &mut recv_h);
        if !send_status.success() || !recv_status.success() {
            return Err(AppError::TransferFailed { index: i });
        }

        let dst_copy = cur.with_dataset(dst_dataset);
        dst_machine.set_tags(&dst_copy.longname(), &cur.tags)?;

        src_machine.hold(&[cur.longname()], tag_src)?;
        dst_machine.hold(&[dst_copy.longname()], tag_dst)?;

        if src_machine.has_hold(&base.longname(), tag_src)? {
            src_machine.release(&[base.longname()], tag_src)?;
        }
        let prev_dst_tip = base.with_dataset(dst_dataset);
        if dst_machine.has_hold(&prev_dst_tip.longname(), tag_dst)? {
            dst_machine.release(&[prev_dst_tip.longname()], tag_dst)?;
        }
    }
    Ok(())
}

/// Releases `tag` from every snapshot in `snaps` that carries it, except the
/// newest one. Idempotent; safe to run before every transfer.
fn cleanup_stale_holds(machine: &Machine, snaps: &[Snapshot], tag: &str) -> Result<(), AppError> {
    let candidates: Vec<String> = snaps.iter().filter(|s| s.holds > 0).map(Snapshot::longname).collect();
    if candidates.is_empty() {
        return Ok(());
    }
    let holds = machine.get_holds(&candidates)?;
    let mut holders: Vec<&Snapshot> = snaps
        .iter()
        .filter(|s| {
            holds.contains(&Hold {
                snapshot_longname: s.longname(),
                tag: tag.to_owned(),
            })
        })
        .collect();
    if holders.len() <= 1 {
        return Ok(());
    }
    holders.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let stale: Vec<String> = holders[1..].iter().map(|s| s.longname()).collect();
    debug!("releasing stale hold '{tag}' from {} snapshot(s)", stale.len());
    machine.release(&stale, tag)?;
    Ok(())
}

/// Polls both child handles every [`POLL_INTERVAL`] until both have exited.
/// If either exits non-zero before the other, the survivor is terminated
/// promptly rather than left to block on a broken pipe.
fn supervise(send: &mut ChildHandle, recv: &mut ChildHandle) -> (ExitStatus, ExitStatus) {
    loop {
        let send_status = send.poll();
        let recv_status = recv.poll();
        match (send_status, recv_status) {
            (Some(ss), Some(rs)) => return (ss, rs),
            (Some(ss), None) => {
                if !ss.success() {
                    recv.terminate();
                }
                return (ss, recv.wait_polling(POLL_INTERVAL));
            }
            (None, Some(rs)) => {
                if !rs.success() {
                    send.terminate();
                }
                return (send.wait_polling(POLL_INTERVAL), rs);
            }
            (None, None) => sleep(POLL_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snap(dataset: &str, shortname: &str, guid: u64, hour: u32) -> Snapshot {
        Snapshot {
            dataset: dataset.to_owned(),
            shortname: shortname.to_owned(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            guid,
            holds: 0,
            tags: None,
        }
    }

    /// src [g1..g5] newest-first, dst [g3,g4,g5]: the base index should land
    /// on g3 (index 2).
    #[test]
    fn base_index_is_first_common_guid() {
        let s = vec![
            snap("p/x", "s5", 5, 4),
            snap("p/x", "s4", 4, 3),
            snap("p/x", "s3", 3, 2),
            snap("p/x", "s2", 2, 1),
            snap("p/x", "s1", 1, 0),
        ];
        let d0_guid = 3u64;
        let b = s.iter().position(|x| x.guid == d0_guid).unwrap();
        assert_eq!(b, 2);
        // transfer loop would run i = 1, 0: send s2 (base s3), then send s1 (base s2).
        let order: Vec<usize> = (0..b).rev().collect();
        assert_eq!(order, vec![1, 0]);
    }

    /// No snapshot in src matches dst's tip guid: the pair has diverged.
    #[test]
    fn diverged_pair_has_no_matching_guid() {
        let s = vec![snap("p/x", "s3", 3, 2), snap("p/x", "s2", 2, 1), snap("p/x", "s1", 1, 0)];
        let dst_tip_guid = 999u64;
        assert!(s.iter().position(|x| x.guid == dst_tip_guid).is_none());
    }

    #[test]
    fn cleanup_keeps_only_newest_holder() {
        let mut newer = snap("p/x", "newer", 2, 5);
        newer.holds = 1;
        let mut older = snap("p/x", "older", 1, 1);
        older.holds = 1;
        let snaps = vec![newer.clone(), older.clone()];
        // This exercises the selection logic only (no real machine involved):
        // the function under test calls get_holds, which we can't invoke
        // without a real agent, so we replicate its post-filter ordering here.
        let mut holders: Vec<&Snapshot> = snaps.iter().collect();
        holders.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        assert_eq!(holders[0].shortname, "newer");
        assert_eq!(holders[1..].len(), 1);
    }
}
