//! Longitudinal store of every descendant PID observed under the supervised
//! child.
//!
//! Records enter either from the sampling walk ([`ProcessHistory::check`])
//! or from lifecycle FIFO announcements ([`ProcessHistory::pid_new`]).
//! Precise end-of-life figures ([`ProcessHistory::pid_done`]) freeze a
//! record's CPU times; sampling only ever discovers terminations between
//! ticks. All calls run on the supervisor's single thread, so interleavings
//! reduce to call order.

use std::collections::{BTreeMap, HashSet, btree_map::Entry};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::collector::snapshot::{PidInfo, SnapshotSource};
use crate::collector::traits::FileSystem;

pub struct ProcessHistory<F: FileSystem> {
    source: SnapshotSource<F>,
    root: Option<i32>,
    /// Every descendant ever observed, keyed (and iterated) by pid.
    status: BTreeMap<i32, PidInfo>,
}

impl<F: FileSystem> ProcessHistory<F> {
    pub fn new(source: SnapshotSource<F>) -> Self {
        Self {
            source,
            root: None,
            status: BTreeMap::new(),
        }
    }

    pub fn source(&self) -> &SnapshotSource<F> {
        &self.source
    }

    pub fn root(&self) -> Option<i32> {
        self.root
    }

    /// Sets the root of the descendant walk and records it immediately, so
    /// the summary contains the supervised child even if it exits before the
    /// first sampling tick.
    pub fn set_root(&mut self, pid: i32) {
        self.root = Some(pid);
        if let Entry::Vacant(slot) = self.status.entry(pid) {
            slot.insert(self.source.probe(pid));
        }
    }

    /// Handles a FIFO `execve`/`START` announcement. Idempotent. The kernel
    /// is consulted for the canonical record; the FIFO payload fills in the
    /// identity only when the process is already gone.
    pub fn pid_new(&mut self, pid: i32, cmd: &str, argv: &[String]) {
        if self.status.contains_key(&pid) {
            return;
        }
        debug!("pid {} started: {} {:?}", pid, cmd, argv);
        let mut info = self.source.probe(pid);
        if !info.valid() {
            let name = cmd.rsplit('/').next().unwrap_or(cmd);
            info.set_fallback_identity(name, cmd);
        }
        self.status.insert(pid, info);
    }

    /// Handles a FIFO `exit`/`done` report. A report for a PID never seen is
    /// dropped; we do not fabricate records from FIFO data alone.
    pub fn pid_done(&mut self, pid: i32, utime: f64, stime: f64) {
        match self.status.get_mut(&pid) {
            Some(info) => info.set_precise_finish(utime, stime, Utc::now()),
            None => debug!("fifo exit for unknown pid {} dropped", pid),
        }
    }

    /// The sampling step: walk the descendant tree in a fresh snapshot,
    /// folding each process into the store. Anything that was active but is
    /// no longer reachable has terminated between ticks and is stamped with
    /// a finish time now. This is the only exit path without a FIFO report.
    pub fn check(&mut self) {
        self.check_at(Utc::now());
    }

    fn check_at(&mut self, now: DateTime<Utc>) {
        let mut snap = self.source.snapshot();

        let active_before: Vec<i32> = self
            .status
            .iter()
            .filter(|(_, info)| info.active())
            .map(|(pid, _)| *pid)
            .collect();

        let mut seen = HashSet::new();
        if let Some(root) = self.root {
            for pid in snap.descendants_of(root) {
                seen.insert(pid);
                match self.status.entry(pid) {
                    Entry::Occupied(mut slot) => {
                        // A finished entry still visible in the table (zombie,
                        // or a recycled pid number) keeps its recorded end of
                        // life; only live entries track the sample.
                        if slot.get().active()
                            && let Some(fresh) = snap.take(pid)
                        {
                            slot.get_mut().update_stats(&fresh);
                        }
                    }
                    Entry::Vacant(slot) => {
                        if let Some(info) = snap.take(pid) {
                            slot.insert(info);
                        }
                    }
                }
            }
        }

        for pid in active_before {
            if !seen.contains(&pid)
                && let Some(info) = self.status.get_mut(&pid)
            {
                debug!("pid {} vanished between ticks", pid);
                info.mark_finished(now);
            }
        }
    }

    /// Sum of utime/stime over all entries, active and finished.
    pub fn get_cumulative_times(&self) -> (f64, f64) {
        self.status
            .values()
            .fold((0.0, 0.0), |(u, s), info| (u + info.utime(), s + info.stime()))
    }

    /// All entries in stable pid order.
    pub fn status(&self) -> impl Iterator<Item = (i32, &PidInfo)> {
        self.status.iter().map(|(pid, info)| (*pid, info))
    }

    pub fn get(&self, pid: i32) -> Option<&PidInfo> {
        self.status.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}
