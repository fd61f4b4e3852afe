//! On-demand snapshots of the kernel process table.
//!
//! One pass over `{proc}/` yields a [`SystemProcessState`]: a `pid → PidInfo`
//! map plus a `ppid → [pid]` index for walking descendant trees. A snapshot
//! lives only for the duration of one sampling tick; the longitudinal store
//! is `ProcessHistory`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::clock::{self, BootAnchor};
use crate::collector::parser::{PidStat, parse_pid_stat, parse_smaps_pss};
use crate::collector::traits::FileSystem;

/// One record per observed PID.
///
/// `vm_size`/`vm_rss` retain their observed peak across updates. Once
/// precise end-of-life figures have arrived from the lifecycle FIFO,
/// `utime`/`stime` are frozen and later samples no longer touch them.
#[derive(Debug, Clone)]
pub struct PidInfo {
    pid: i32,
    ppid: i32,
    name: String,
    exe: PathBuf,
    vm_size: u64,
    vm_rss: u64,
    utime: f64,
    stime: f64,
    start_time: DateTime<Utc>,
    active: bool,
    finish_time: Option<DateTime<Utc>>,
    have_precise_finish_data: bool,
    valid: bool,
}

impl PidInfo {
    /// Builds a record from a parsed `/proc/[pid]/stat`.
    fn from_stat(stat: &PidStat, exe: PathBuf, anchor: &BootAnchor) -> Self {
        Self {
            pid: stat.pid,
            ppid: stat.ppid,
            name: stat.comm.clone(),
            exe,
            vm_size: stat.vsize,
            vm_rss: stat.rss.max(0) as u64 * clock::page_size(),
            utime: clock::jiffies_to_secs(stat.utime),
            stime: clock::jiffies_to_secs(stat.stime),
            start_time: anchor.start_time(stat.starttime),
            active: true,
            finish_time: None,
            have_precise_finish_data: false,
            valid: true,
        }
    }

    /// Builds an invalid zero-field record for a PID whose kernel data could
    /// not be read. `start_time` is the observation instant.
    pub fn stub(pid: i32) -> Self {
        Self {
            pid,
            ppid: 0,
            name: String::new(),
            exe: PathBuf::new(),
            vm_size: 0,
            vm_rss: 0,
            utime: 0.0,
            stime: 0.0,
            start_time: Utc::now(),
            active: true,
            finish_time: None,
            have_precise_finish_data: false,
            valid: false,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn ppid(&self) -> i32 {
        self.ppid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn vm_size(&self) -> u64 {
        self.vm_size
    }

    pub fn vm_rss(&self) -> u64 {
        self.vm_rss
    }

    pub fn utime(&self) -> f64 {
        self.utime
    }

    pub fn stime(&self) -> f64 {
        self.stime
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.finish_time
    }

    pub fn have_precise_finish_data(&self) -> bool {
        self.have_precise_finish_data
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Overrides name and exe, used only when the kernel never yielded data
    /// for this PID and the lifecycle FIFO carried a command name.
    pub fn set_fallback_identity(&mut self, name: &str, exe: &str) {
        if !self.valid {
            if self.name.is_empty() {
                self.name = name.to_string();
            }
            if self.exe.as_os_str().is_empty() {
                self.exe = PathBuf::from(exe);
            }
        }
    }

    /// Folds a freshly sampled record into this one.
    ///
    /// Memory figures are peak-retained. CPU times follow the sample unless
    /// precise finish data has already been recorded. Identity fields track
    /// the kernel (comm changes on exec).
    pub fn update_stats(&mut self, fresh: &PidInfo) {
        self.vm_size = self.vm_size.max(fresh.vm_size);
        self.vm_rss = self.vm_rss.max(fresh.vm_rss);
        if !self.have_precise_finish_data {
            self.utime = fresh.utime;
            self.stime = fresh.stime;
        }
        if fresh.valid {
            self.ppid = fresh.ppid;
            self.name = fresh.name.clone();
            self.exe = fresh.exe.clone();
            self.start_time = fresh.start_time;
            self.valid = true;
        }
    }

    /// Marks the process as terminated at `now` (sampling discovered it
    /// missing). No-op when already finished.
    pub fn mark_finished(&mut self, now: DateTime<Utc>) {
        if self.active {
            self.active = false;
            self.finish_time = Some(now);
        }
    }

    /// Records precise end-of-life figures delivered by the lifecycle FIFO.
    /// From here on sampled utime/stime are ignored.
    pub fn set_precise_finish(&mut self, utime: f64, stime: f64, now: DateTime<Utc>) {
        if self.have_precise_finish_data {
            return;
        }
        self.utime = utime;
        self.stime = stime;
        self.have_precise_finish_data = true;
        self.mark_finished(now);
    }

    /// One `runtime_summary` line for this process.
    pub fn summary_line(&self, now: DateTime<Utc>) -> String {
        let end = self.finish_time.unwrap_or(now);
        let elapsed = (end - self.start_time)
            .num_microseconds()
            .map(|us| us as f64 * 1e-6)
            .unwrap_or(0.0)
            .max(0.0);
        let (ucpu, scpu) = if elapsed > 0.0 {
            (self.utime / elapsed * 100.0, self.stime / elapsed * 100.0)
        } else {
            (0.0, 0.0)
        };
        format!(
            "pid={} name={} exe={} ppid={} vm_size={} vm_rss={} utime={:.3} stime={:.3} \
             start={} end={} elapsed={:.3} ucpu={:.1}% scpu={:.1}% precise_finish={} valid={}",
            self.pid,
            self.name,
            self.exe.display(),
            self.ppid,
            self.vm_size,
            self.vm_rss,
            self.utime,
            self.stime,
            self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            match self.finish_time {
                Some(t) => t.to_rfc3339_opts(SecondsFormat::Millis, true),
                None => "-".to_string(),
            },
            elapsed,
            ucpu,
            scpu,
            self.have_precise_finish_data,
            self.valid,
        )
    }
}

impl std::fmt::Display for PidInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary_line(Utc::now()))
    }
}

/// Ephemeral result of one pass over the kernel process table.
#[derive(Debug, Default)]
pub struct SystemProcessState {
    by_pid: HashMap<i32, PidInfo>,
    children: HashMap<i32, Vec<i32>>,
}

impl SystemProcessState {
    pub fn get(&self, pid: i32) -> Option<&PidInfo> {
        self.by_pid.get(&pid)
    }

    /// Moves a record out of the snapshot (for insertion into the history).
    pub fn take(&mut self, pid: i32) -> Option<PidInfo> {
        self.by_pid.remove(&pid)
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.by_pid.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }

    /// All PIDs reachable from `root` through the ppid index, root first
    /// (BFS). Only PIDs present in this snapshot are returned.
    pub fn descendants_of(&self, root: i32) -> Vec<i32> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(root);

        while let Some(pid) = queue.pop_front() {
            if !seen.insert(pid) || !self.by_pid.contains_key(&pid) {
                continue;
            }
            out.push(pid);
            if let Some(kids) = self.children.get(&pid) {
                queue.extend(kids.iter().copied());
            }
        }
        out
    }
}

/// Reads the kernel process table into [`SystemProcessState`] values.
pub struct SnapshotSource<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    anchor: BootAnchor,
}

impl<F: FileSystem> SnapshotSource<F> {
    /// Creates a source rooted at `proc_path` (usually `/proc`) and resolves
    /// the boot-time anchor once.
    pub fn new(fs: F, proc_path: impl Into<PathBuf>) -> Self {
        let proc_path = proc_path.into();
        let anchor = BootAnchor::detect(&fs, &proc_path);
        Self {
            fs,
            proc_path,
            anchor,
        }
    }

    pub fn anchor(&self) -> BootAnchor {
        self.anchor
    }

    /// Constructs the PidInfo for one live PID. Unreadable or unparsable
    /// kernel data yields an invalid stub rather than an error.
    pub fn probe(&self, pid: i32) -> PidInfo {
        let dir = self.proc_path.join(pid.to_string());
        let content = match self.fs.read_to_string(&dir.join("stat")) {
            Ok(c) => c,
            Err(_) => return PidInfo::stub(pid),
        };
        let stat = match parse_pid_stat(&content) {
            Ok(s) => s,
            Err(e) => {
                debug!("pid {}: {}", pid, e);
                return PidInfo::stub(pid);
            }
        };
        let exe = self.fs.read_link(&dir.join("exe")).unwrap_or_default();
        PidInfo::from_stat(&stat, exe, &self.anchor)
    }

    /// Enumerates the process table. Entries that vanish mid-pass or fail to
    /// parse become invalid stubs; enumeration failure yields an empty state.
    pub fn snapshot(&self) -> SystemProcessState {
        let mut state = SystemProcessState::default();

        let entries = match self.fs.read_dir(&self.proc_path) {
            Ok(e) => e,
            Err(e) => {
                warn!("cannot enumerate {}: {}", self.proc_path.display(), e);
                return state;
            }
        };

        for entry in entries {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(pid) = name.parse::<i32>() else {
                continue;
            };
            let info = self.probe(pid);
            if info.valid() {
                state.children.entry(info.ppid()).or_default().push(pid);
            }
            state.by_pid.insert(pid, info);
        }

        state
    }

    /// Proportional set size in bytes, summed over the mappings of `pid`.
    /// Missing or unreadable smaps yields 0. On-demand; not part of the
    /// sampling hot path.
    pub fn vm_pss(&self, pid: i32) -> u64 {
        let path = self.proc_path.join(pid.to_string()).join("smaps");
        match self.fs.read_to_string(&path) {
            Ok(content) => parse_smaps_pss(&content),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    fn tree_fs() -> MockFs {
        let mut fs = MockFs::new();
        fs.add_file("/proc/stat", "cpu 1 2 3 4\nbtime 1700000000\n");
        fs.add_process(1, "init", 0, 10, 5, 1, 1_000_000, 100, Some("/sbin/init"));
        fs.add_process(100, "sh", 1, 20, 10, 5000, 2_000_000, 200, Some("/bin/sh"));
        fs.add_process(101, "sleep", 100, 1, 1, 5100, 500_000, 50, Some("/bin/sleep"));
        fs.add_process(102, "sleep", 100, 2, 1, 5100, 500_000, 50, Some("/bin/sleep"));
        fs.add_process(999, "other", 1, 0, 0, 4000, 100_000, 10, None);
        fs
    }

    #[test]
    fn test_snapshot_enumerates_numeric_entries() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let state = source.snapshot();
        assert_eq!(state.len(), 5);
        assert!(state.contains(1));
        assert!(state.contains(999));
        // "stat" and "self" style entries are not PIDs.
        assert!(!state.contains(0));
    }

    #[test]
    fn test_snapshot_fields() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let state = source.snapshot();
        let sh = state.get(100).unwrap();
        assert_eq!(sh.name(), "sh");
        assert_eq!(sh.ppid(), 1);
        assert_eq!(sh.exe(), Path::new("/bin/sh"));
        assert_eq!(sh.vm_size(), 2_000_000);
        assert_eq!(sh.vm_rss(), 200 * clock::page_size());
        assert!((sh.utime() - clock::jiffies_to_secs(20)).abs() < 1e-9);
        assert!(sh.active());
        assert!(sh.valid());
        assert_eq!(
            sh.start_time(),
            source.anchor().start_time(5000)
        );
    }

    #[test]
    fn test_descendants_bfs() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let state = source.snapshot();
        let tree = state.descendants_of(100);
        assert_eq!(tree[0], 100);
        assert_eq!(tree.len(), 3);
        assert!(tree.contains(&101));
        assert!(tree.contains(&102));
        // Unrelated process is not part of the walk.
        assert!(!tree.contains(&999));
    }

    #[test]
    fn test_descendants_of_missing_root() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let state = source.snapshot();
        assert!(state.descendants_of(4242).is_empty());
    }

    #[test]
    fn test_unparsable_stat_becomes_invalid_stub() {
        let mut fs = tree_fs();
        fs.add_file("/proc/300/stat", "garbage with no parens");
        let source = SnapshotSource::new(fs, "/proc");
        let state = source.snapshot();
        let stub = state.get(300).unwrap();
        assert!(!stub.valid());
        assert_eq!(stub.vm_size(), 0);
        // The rest of the snapshot survives.
        assert_eq!(state.len(), 6);
    }

    #[test]
    fn test_probe_missing_pid() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let info = source.probe(31337);
        assert!(!info.valid());
        assert_eq!(info.pid(), 31337);
    }

    #[test]
    fn test_vm_pss() {
        let mut fs = tree_fs();
        fs.add_file(
            "/proc/100/smaps",
            "Pss:                  12 kB\nPss:                  96 kB\n",
        );
        let source = SnapshotSource::new(fs, "/proc");
        assert_eq!(source.vm_pss(100), 108 * 1024);
        assert_eq!(source.vm_pss(101), 0);
    }

    #[test]
    fn test_update_stats_peak_memory() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let mut info = source.probe(100);
        let mut shrunk = source.probe(100);
        shrunk.vm_size = 1;
        shrunk.vm_rss = 1;
        shrunk.utime = 30.0;
        info.update_stats(&shrunk);
        assert_eq!(info.vm_size(), 2_000_000);
        assert_eq!(info.vm_rss(), 200 * clock::page_size());
        assert!((info.utime() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_precise_finish_freezes_times() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let mut info = source.probe(100);
        let now = Utc::now();
        info.set_precise_finish(1.5, 0.5, now);
        assert!(!info.active());
        assert!(info.have_precise_finish_data());
        assert_eq!(info.finish_time(), Some(now));

        let fresh = source.probe(100);
        info.update_stats(&fresh);
        assert!((info.utime() - 1.5).abs() < 1e-9);
        assert!((info.stime() - 0.5).abs() < 1e-9);

        // A second precise report does not overwrite the first.
        info.set_precise_finish(9.0, 9.0, Utc::now());
        assert!((info.utime() - 1.5).abs() < 1e-9);
        assert_eq!(info.finish_time(), Some(now));
    }

    #[test]
    fn test_summary_line_shape() {
        let source = SnapshotSource::new(tree_fs(), "/proc");
        let mut info = source.probe(101);
        let now = info.start_time() + chrono::Duration::seconds(10);
        info.mark_finished(now);
        let line = info.summary_line(now);
        assert!(line.starts_with("pid=101 name=sleep exe=/bin/sleep ppid=100 "));
        assert!(line.contains("elapsed=10.000"));
        assert!(line.contains("precise_finish=false"));
        assert!(line.ends_with("valid=true"));
    }
}
