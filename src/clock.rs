//! Time base: kernel tick conversions and the boot-time anchor.
//!
//! All wall-clock quantities use `chrono::DateTime<Utc>` with microsecond
//! resolution. Kernel-reported process start times are expressed in jiffies
//! since boot; [`BootAnchor`] pins them to real time via a process-wide boot
//! offset in centiseconds since the epoch.

use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use nix::unistd::{SysconfVar, sysconf};
use tracing::{debug, warn};

use crate::collector::parser::{parse_boot_time, parse_pid_stat};
use crate::collector::traits::FileSystem;

/// Kernel clock ticks per second (USER_HZ). Queried once via sysconf;
/// 100 on every mainstream Linux configuration.
pub fn clock_ticks_per_second() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(t)) if t > 0 => t as u64,
        _ => 100,
    })
}

/// System page size in bytes, for scaling the rss field of `/proc/[pid]/stat`.
pub fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(p)) if p > 0 => p as u64,
        _ => 4096,
    })
}

/// Converts a jiffy count to seconds.
pub fn jiffies_to_secs(jiffies: u64) -> f64 {
    jiffies as f64 / clock_ticks_per_second() as f64
}

/// Converts a jiffy count to centiseconds.
fn jiffies_to_cs(jiffies: u64) -> i64 {
    (jiffies as i128 * 100 / clock_ticks_per_second() as i128) as i64
}

/// POSIX seconds-since-epoch as a float, microsecond resolution.
pub fn epoch_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp_micros() as f64 * 1e-6
}

/// Anchors kernel start-times-in-jiffies to real time.
///
/// The offset is the boot instant in centiseconds since the epoch, so that
/// `start = offset + jiffies_as_cs(starttime)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootAnchor {
    offset_cs: i64,
}

impl BootAnchor {
    /// Computes the boot offset, preferring the high-resolution method.
    ///
    /// 1. Read the supervisor's own starttime jiffies from
    ///    `{proc}/self/stat` and subtract from the current wall time.
    /// 2. Fall back to the `btime` field of `{proc}/stat`, which has only
    ///    one-second granularity and skews start times of short-lived
    ///    processes.
    pub fn detect<F: FileSystem>(fs: &F, proc_path: &Path) -> Self {
        let now_cs = Utc::now().timestamp_millis() / 10;

        let self_stat = proc_path.join("self").join("stat");
        match fs
            .read_to_string(&self_stat)
            .map_err(|e| e.to_string())
            .and_then(|c| parse_pid_stat(&c).map_err(|e| e.to_string()))
        {
            Ok(stat) => {
                let offset_cs = now_cs - jiffies_to_cs(stat.starttime);
                if offset_cs > 0 {
                    debug!("boot offset {}cs from {}", offset_cs, self_stat.display());
                    return Self { offset_cs };
                }
                warn!("implausible boot offset {}cs, falling back", offset_cs);
            }
            Err(e) => warn!("cannot read {}: {}", self_stat.display(), e),
        }

        let stat_path = proc_path.join("stat");
        match fs
            .read_to_string(&stat_path)
            .map_err(|e| e.to_string())
            .and_then(|c| parse_boot_time(&c).map_err(|e| e.to_string()))
        {
            Ok(btime) => Self {
                offset_cs: btime as i64 * 100,
            },
            Err(e) => {
                warn!("cannot read btime from {}: {}", stat_path.display(), e);
                Self { offset_cs: 0 }
            }
        }
    }

    /// Builds an anchor from a known offset, for tests.
    pub fn from_offset_cs(offset_cs: i64) -> Self {
        Self { offset_cs }
    }

    /// Absolute start time for a process with the given starttime jiffies.
    pub fn start_time(&self, starttime_jiffies: u64) -> DateTime<Utc> {
        let ms = (self.offset_cs + jiffies_to_cs(starttime_jiffies)) * 10;
        DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_jiffies_to_secs() {
        let tick = clock_ticks_per_second();
        assert!(tick > 0);
        assert!((jiffies_to_secs(tick) - 1.0).abs() < 1e-9);
        assert!((jiffies_to_secs(tick * 3 / 2) - 1.5).abs() < 0.02);
    }

    #[test]
    fn test_epoch_seconds() {
        let t = DateTime::from_timestamp_millis(1_700_000_000_500).unwrap();
        assert!((epoch_seconds(t) - 1_700_000_000.5).abs() < 1e-6);
    }

    #[test]
    fn test_start_time_from_anchor() {
        // Boot at epoch second 1_700_000_000, process started 5 seconds in.
        let anchor = BootAnchor::from_offset_cs(1_700_000_000 * 100);
        let tick = clock_ticks_per_second();
        let start = anchor.start_time(tick * 5);
        assert_eq!(start.timestamp_millis(), 1_700_000_005_000);
    }

    #[test]
    fn test_detect_high_resolution() {
        let mut fs = MockFs::new();
        // A process that started one minute after boot.
        let tick = clock_ticks_per_second();
        fs.add_file(
            "/proc/self/stat",
            format!(
                "42 (shepherd) S 1 42 42 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 {} 1000000 100 0",
                tick * 60
            ),
        );
        let anchor = BootAnchor::detect(&fs, Path::new("/proc"));
        let now_cs = Utc::now().timestamp_millis() / 10;
        // offset = now - 60s worth of jiffies, within a second of slack.
        let expected = now_cs - 60 * 100;
        assert!((anchor.offset_cs - expected).abs() < 100);
    }

    #[test]
    fn test_detect_falls_back_to_btime() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/stat", "cpu 1 2 3 4\nbtime 1700000000\nctxt 5\n");
        let anchor = BootAnchor::detect(&fs, Path::new("/proc"));
        assert_eq!(anchor, BootAnchor::from_offset_cs(170_000_000_000));
    }

    #[test]
    fn test_detect_unreadable() {
        let fs = MockFs::new();
        let anchor = BootAnchor::detect(&fs, Path::new("/proc"));
        assert_eq!(anchor, BootAnchor::from_offset_cs(0));
    }
}
