//! End-to-end supervision scenarios against real processes.
//!
//! These drive the full supervisor (spawn, poll loop, sampler, drain)
//! with an in-memory block writer and real `/bin/sh` / `/bin/echo`
//! workloads, so they only run on Linux.

#![cfg(target_os = "linux")]

use std::time::Duration;

use p3x_shepherd::client::MemoryWriter;
use p3x_shepherd::collector::{RealFs, SnapshotSource};
use p3x_shepherd::history::ProcessHistory;
use p3x_shepherd::supervisor::{ShepherdError, Supervisor, SupervisorOptions};

fn options(command: &str, args: &[&str], dir: &tempfile::TempDir) -> SupervisorOptions {
    let mut opts = SupervisorOptions::new(command, args.iter().map(|s| s.to_string()).collect());
    opts.fifo_path = dir.path().join("shepherd.fifo");
    opts
}

fn supervise_with(opts: SupervisorOptions) -> (i32, Supervisor<RealFs, MemoryWriter>) {
    let history = ProcessHistory::new(SnapshotSource::new(RealFs::new(), "/proc"));
    let mut supervisor = Supervisor::new(opts, MemoryWriter::new(), history);
    let code = supervisor.run().expect("supervision failed");
    (code, supervisor)
}

fn text(writer: &MemoryWriter, key: &str) -> String {
    String::from_utf8(writer.payload(key)).unwrap()
}

#[test]
fn happy_path_echo() {
    let dir = tempfile::tempdir().unwrap();
    let (code, sup) = supervise_with(options("/bin/echo", &["hello"], &dir));
    assert_eq!(code, 0);

    let w = sup.writer();

    let pid_block = text(w, "pid");
    assert!(pid_block.ends_with('\n'));
    let pid: i32 = pid_block.trim_end().parse().expect("pid block is decimal");
    assert!(pid > 0);

    assert!(text(w, "stdout").starts_with("hello\n"));
    assert_eq!(w.count("stdout.EOF"), 1);
    assert_eq!(w.count("stderr.EOF"), 1);

    assert_eq!(text(w, "exitcode"), "0\n");
    // Terminal reconciliation runs exactly once.
    assert_eq!(w.count("exitcode"), 1);

    assert!(!text(w, "hostname").trim_end().is_empty());

    let summary = text(w, "runtime_summary");
    let lines: Vec<&str> = summary.lines().collect();
    assert!(lines.len() >= 2, "summary has an entry plus the aggregate");
    assert!(lines[0].starts_with(&format!("pid={} ", pid)));
    assert!(lines.last().unwrap().starts_with("aggregate utime="));
}

#[test]
fn nonzero_child_exit_is_reported_in_band() {
    let dir = tempfile::tempdir().unwrap();
    let (code, sup) = supervise_with(options("/bin/sh", &["-c", "exit 7"], &dir));
    // The child's failure is the payload, not the shepherd's status.
    assert_eq!(code, 7);
    assert_eq!(text(sup.writer(), "exitcode"), "7\n");
}

#[test]
fn sampler_emits_utilization_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options("/bin/sh", &["-c", "sleep 3"], &dir);
    opts.measurement_interval = Duration::from_secs(1);
    let (code, sup) = supervise_with(opts);
    assert_eq!(code, 0);

    let w = sup.writer();
    assert!(
        w.count("dynamic_utilization") >= 2,
        "expected at least two ticks, got {}",
        w.count("dynamic_utilization")
    );
    for line in text(w, "dynamic_utilization").lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 3, "timestamp, utime, stime: {:?}", line);
        assert!(fields[0].parse::<f64>().unwrap() > 1e9, "epoch seconds");
        assert!(fields[1].parse::<f64>().is_ok());
        assert!(fields[2].parse::<f64>().is_ok());
    }
}

#[test]
fn cpu_bound_child_accumulates_utime() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(
        "/bin/sh",
        &["-c", "i=0; while [ \"$i\" -lt 500000 ]; do i=$((i+1)); done"],
        &dir,
    );
    opts.measurement_interval = Duration::from_secs(1);
    let (code, sup) = supervise_with(opts);
    assert_eq!(code, 0);

    let blocks = text(sup.writer(), "dynamic_utilization");
    let utimes: Vec<f64> = blocks
        .lines()
        .map(|l| l.split('\t').nth(1).unwrap().parse().unwrap())
        .collect();
    assert!(!utimes.is_empty());
    // The final record comes from the kernel's rusage for children and
    // reflects all CPU the loop burned.
    let last = *utimes.last().unwrap();
    assert!(last > 0.01, "expected measurable CPU time, got {}", last);
    for pair in utimes.windows(2) {
        assert!(pair[1] >= pair[0] - 1e-6, "utime never decreases: {:?}", utimes);
    }
}

#[test]
fn grandchildren_appear_in_runtime_summary() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options("/bin/sh", &["-c", "sleep 2 & sleep 2 & wait"], &dir);
    opts.measurement_interval = Duration::from_secs(1);
    let (code, sup) = supervise_with(opts);
    assert_eq!(code, 0);

    let w = sup.writer();
    let root_pid: i32 = text(w, "pid").trim_end().parse().unwrap();

    let summary = text(w, "runtime_summary");
    let entries: Vec<&str> = summary.lines().filter(|l| l.starts_with("pid=")).collect();
    assert!(
        entries.len() >= 3,
        "shell and both sleeps tracked: {:?}",
        entries
    );

    let sleeps: Vec<&str> = entries
        .iter()
        .copied()
        .filter(|l| l.contains("name=sleep"))
        .collect();
    assert!(sleeps.len() >= 2, "both sleeps sampled: {:?}", entries);
    for line in &sleeps {
        assert!(
            line.contains(&format!("ppid={} ", root_pid)),
            "sleep parented to the shell: {}",
            line
        );
    }
    for line in &entries {
        assert!(line.contains("valid=true"), "kernel-backed entry: {}", line);
    }
}

#[test]
fn missing_command_fails_before_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options("definitely-not-a-real-command-p3x", &[], &dir);
    let history = ProcessHistory::new(SnapshotSource::new(RealFs::new(), "/proc"));
    let mut supervisor = Supervisor::new(opts, MemoryWriter::new(), history);

    let err = supervisor.run().expect_err("command cannot exist");
    let ShepherdError::CommandNotFound { searched, .. } = &err else {
        panic!("expected CommandNotFound, got {}", err);
    };
    assert!(!searched.is_empty());
    assert!(err.to_string().contains("PATH"));

    // Nothing was published: the child never ran.
    assert_eq!(supervisor.writer().count("pid"), 0);
}

#[test]
fn fifo_exit_record_provides_precise_finish_data() {
    let dir = tempfile::tempdir().unwrap();
    // The child reports its own end of life on the control FIFO the way the
    // preload library would: 1.5s user, 0.25s system.
    let script = r#"printf 'exit\n%d\nstatline\n1\n500000\n0\n250000\n' $$ > "$P3_SHEPHERD_FIFO""#;
    let (code, sup) = supervise_with(options("/bin/sh", &["-c", script], &dir));
    assert_eq!(code, 0);

    let root_pid: i32 = text(sup.writer(), "pid").trim_end().parse().unwrap();
    let info = sup.history().get(root_pid).expect("root tracked");
    assert!(info.have_precise_finish_data());
    assert!((info.utime() - 1.5).abs() < 1e-9);
    assert!((info.stime() - 0.25).abs() < 1e-9);

    let summary = text(sup.writer(), "runtime_summary");
    let root_line = summary
        .lines()
        .find(|l| l.starts_with(&format!("pid={} ", root_pid)))
        .expect("root summary line");
    assert!(root_line.contains("precise_finish=true"));
    assert!(root_line.contains("utime=1.500"));
}

#[test]
fn fifo_path_is_removed_after_supervision() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options("/bin/echo", &["bye"], &dir);
    let fifo_path = opts.fifo_path.clone();
    let (_, _sup) = supervise_with(opts);
    assert!(!fifo_path.exists());
}
