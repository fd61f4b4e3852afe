//! Top-level supervision state machine.
//!
//! One supervisor wraps one task invocation: it spawns the command with the
//! preload environment, multiplexes the child's stdout/stderr pipes and the
//! lifecycle FIFO on a single `poll(2)` loop, samples the descendant process
//! tree on a deadline-driven timer, and on teardown publishes the exit code
//! and the per-process runtime summary.
//!
//! Everything runs on one thread; callbacks run to completion, so the
//! history and the pipe counter need no locks. The only potentially blocking
//! step is the terminal child reap, which is a bounded `try_wait` loop.

use std::fmt;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::resource::{UsageWho, getrusage};
use tracing::{debug, info, warn};

use crate::client::BlockWriter;
use crate::clock;
use crate::collector::traits::FileSystem;
use crate::fifo::{self, FifoListener, FifoRead, FifoRecord};
use crate::history::ProcessHistory;

/// Fatal supervision errors; all occur before or at child spawn.
#[derive(Debug)]
pub enum ShepherdError {
    /// The command was not found on the executable search path.
    CommandNotFound {
        command: String,
        searched: Vec<PathBuf>,
    },
    /// The control FIFO could not be created.
    FifoCreateFailed { path: PathBuf, source: io::Error },
    /// The child process could not be spawned.
    ChildSpawnFailed { command: PathBuf, source: io::Error },
}

impl fmt::Display for ShepherdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShepherdError::CommandNotFound { command, searched } => {
                writeln!(f, "cannot find command {} in PATH:", command)?;
                for dir in searched {
                    writeln!(f, "\t{}", dir.display())?;
                }
                Ok(())
            }
            ShepherdError::FifoCreateFailed { path, source } => {
                write!(f, "error creating fifo at {}: {}", path.display(), source)
            }
            ShepherdError::ChildSpawnFailed { command, source } => {
                write!(f, "error spawning {}: {}", command.display(), source)
            }
        }
    }
}

impl std::error::Error for ShepherdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShepherdError::CommandNotFound { .. } => None,
            ShepherdError::FifoCreateFailed { source, .. } => Some(source),
            ShepherdError::ChildSpawnFailed { source, .. } => Some(source),
        }
    }
}

/// Configuration for one supervised invocation.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub command: String,
    pub args: Vec<String>,
    pub measurement_interval: Duration,
    pub fifo_path: PathBuf,
    pub preload_path: PathBuf,
}

impl SupervisorOptions {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            measurement_interval: Duration::from_secs(10),
            fifo_path: fifo::default_fifo_path(),
            preload_path: PathBuf::from("./p3x-preload.so"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Running,
    Draining,
    Finished,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Stdout,
    Stderr,
    Fifo,
}

/// Per-read buffer capacity for the child's stream pipes.
const PIPE_READ_CAPACITY: usize = 4096;

/// Upper bound on the terminal child reap.
const REAP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Supervisor<F: FileSystem, W: BlockWriter> {
    opts: SupervisorOptions,
    writer: W,
    history: ProcessHistory<F>,
    fifo: FifoListener,
    state: State,
    pipes_waiting: u8,
    next_tick: Option<Instant>,
}

impl<F: FileSystem, W: BlockWriter> Supervisor<F, W> {
    pub fn new(opts: SupervisorOptions, writer: W, history: ProcessHistory<F>) -> Self {
        let fifo = FifoListener::new(&opts.fifo_path);
        Self {
            opts,
            writer,
            history,
            fifo,
            state: State::Starting,
            pipes_waiting: 2,
            next_tick: None,
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn set_state(&mut self, next: State) {
        debug!("state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn history(&self) -> &ProcessHistory<F> {
        &self.history
    }

    /// Runs the supervision to completion and returns the child's exit code.
    ///
    /// The shepherd's own exit status does not reflect the child's; a
    /// non-zero child is a normal termination. Errors are only possible
    /// before the child runs; once spawned, every path reaches the drain and
    /// publishes at least `exitcode` and the runtime summary.
    pub fn run(&mut self) -> Result<i32, ShepherdError> {
        let cmd_path = locate_command(&self.opts.command)?;

        self.fifo
            .create()
            .map_err(|source| ShepherdError::FifoCreateFailed {
                path: self.opts.fifo_path.clone(),
                source,
            })?;

        let mut child = Command::new(&cmd_path)
            .args(&self.opts.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("LD_PRELOAD", &self.opts.preload_path)
            .env("P3_SHEPHERD_FIFO", self.fifo.path())
            .spawn()
            .map_err(|source| ShepherdError::ChildSpawnFailed {
                command: cmd_path.clone(),
                source,
            })?;

        let pid = child.id() as i32;
        info!("supervising {} as pid {}", cmd_path.display(), pid);
        self.history.set_root(pid);
        self.emit("pid", format!("{}\n", pid).as_bytes(), true);

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let hostname = resolve_hostname();
        self.emit("hostname", format!("{}\n", hostname).as_bytes(), true);

        self.set_state(State::Running);
        self.pipes_waiting = 2;
        self.next_tick = Some(Instant::now() + self.opts.measurement_interval);

        while self.pipes_waiting > 0 {
            self.poll_once(&mut stdout, &mut stderr);
        }

        self.set_state(State::Draining);
        self.next_tick = None;
        // Dispatch lifecycle records already buffered in the FIFO, then
        // cancel the listener and remove the path.
        while let FifoRead::Data(data) = self.fifo.read() {
            self.dispatch_fifo(&data);
        }
        self.fifo.shutdown();

        let code = self.drain(&mut child);

        self.set_state(State::Finished);
        if let Err(e) = self.writer.finish() {
            warn!("upstream flush failed: {}", e);
        }
        Ok(code)
    }

    /// One turn of the event loop: wait for readiness on the open sources
    /// (with the sampler or FIFO-reopen deadline as the timeout), then
    /// service whatever became ready.
    fn poll_once(&mut self, stdout: &mut Option<ChildStdout>, stderr: &mut Option<ChildStderr>) {
        self.fifo.maintain(Instant::now());

        let mut ready: Vec<Source> = Vec::with_capacity(3);
        {
            let mut fds: Vec<PollFd> = Vec::with_capacity(3);
            let mut tags: Vec<Source> = Vec::with_capacity(3);
            if let Some(out) = stdout.as_ref() {
                fds.push(PollFd::new(out.as_fd(), PollFlags::POLLIN));
                tags.push(Source::Stdout);
            }
            if let Some(err) = stderr.as_ref() {
                fds.push(PollFd::new(err.as_fd(), PollFlags::POLLIN));
                tags.push(Source::Stderr);
            }
            if let Some(f) = self.fifo.pollable() {
                fds.push(PollFd::new(f.as_fd(), PollFlags::POLLIN));
                tags.push(Source::Fifo);
            }

            match poll(&mut fds, self.poll_timeout(Instant::now())) {
                Ok(0) => {}
                Ok(_) => {
                    for (fd, tag) in fds.iter().zip(tags.iter()) {
                        // POLLHUP/POLLERR also mean "go read": the read will
                        // observe EOF or the error and count the pipe done.
                        if !fd.revents().unwrap_or(PollFlags::empty()).is_empty() {
                            ready.push(*tag);
                        }
                    }
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => warn!("poll failed: {}", e),
            }
        }

        // Lifecycle records are dispatched before pipe EOFs so a record that
        // arrived in the same wakeup as the final EOF is not lost.
        if ready.iter().any(|s| matches!(s, Source::Fifo)) {
            self.pump_fifo();
        }
        for source in ready {
            match source {
                Source::Stdout => self.pump_pipe(stdout, "stdout"),
                Source::Stderr => self.pump_pipe(stderr, "stderr"),
                Source::Fifo => {}
            }
        }

        if let Some(due) = self.next_tick
            && Instant::now() >= due
        {
            self.tick();
        }
    }

    /// Timeout until the next deadline: sampler tick or FIFO reopen.
    fn poll_timeout(&self, now: Instant) -> PollTimeout {
        let deadline = match (self.next_tick, self.fifo.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match deadline {
            // Capped at u16::MAX ms; the loop recomputes the deadline after
            // a spurious wakeup.
            Some(due) => PollTimeout::from(
                due.saturating_duration_since(now)
                    .as_millis()
                    .min(u16::MAX as u128) as u16,
            ),
            None => PollTimeout::NONE,
        }
    }

    /// Services one readable child stream: forward a chunk, or close on EOF.
    /// Read errors other than retryable ones count as EOF so the supervisor
    /// always makes progress toward the drain.
    fn pump_pipe<R: Read>(&mut self, slot: &mut Option<R>, key: &str) {
        let mut buf = [0u8; PIPE_READ_CAPACITY];
        let result = match slot.as_mut() {
            Some(pipe) => pipe.read(&mut buf),
            None => return,
        };
        match result {
            Ok(0) => self.pipe_eof(slot, key),
            Ok(n) => self.emit(key, &buf[..n], false),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("{} read error, treating as EOF: {}", key, e);
                self.pipe_eof(slot, key);
            }
        }
    }

    fn pipe_eof<R>(&mut self, slot: &mut Option<R>, key: &str) {
        debug!("{} closed", key);
        *slot = None;
        self.emit(&format!("{}.EOF", key), b"", false);
        self.pipes_waiting = self.pipes_waiting.saturating_sub(1);
    }

    fn pump_fifo(&mut self) {
        match self.fifo.read() {
            FifoRead::Data(data) => self.dispatch_fifo(&data),
            FifoRead::Eof => debug!("fifo writer closed, reopening"),
            FifoRead::WouldBlock | FifoRead::Idle => {}
        }
    }

    fn dispatch_fifo(&mut self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        match fifo::parse_record(&text) {
            Ok(FifoRecord::Started { pid, cmd, argv }) => {
                self.history.pid_new(pid, &cmd, &argv);
            }
            Ok(FifoRecord::Exited { pid, utime, stime }) => {
                self.history.pid_done(pid, utime, stime);
            }
            Err(e) => {
                warn!("fifo record dropped: {}", e);
                return;
            }
        }
        // Reconcile against the kernel right away: a Started record folds
        // the new process into the sampled set, an Exited one lets the walk
        // notice anything that vanished with it.
        self.history.check();
    }

    /// Sampler firing: walk the tree, publish cumulative utilization, re-arm
    /// while any pipe is still open.
    fn tick(&mut self) {
        self.history.check();
        let (utime, stime) = self.history.get_cumulative_times();
        debug!("tick: utime={} stime={}", utime, stime);
        self.emit_utilization(utime, stime);
        self.next_tick = if self.pipes_waiting > 0 {
            Some(Instant::now() + self.opts.measurement_interval)
        } else {
            None
        };
    }

    fn emit_utilization(&mut self, utime: f64, stime: f64) {
        let line = format!(
            "{:.6}\t{}\t{}\n",
            clock::epoch_seconds(Utc::now()),
            utime,
            stime
        );
        self.emit("dynamic_utilization", line.as_bytes(), false);
    }

    /// Terminal reconciliation: reap the child, publish the exit code, the
    /// kernel's aggregate rusage for children, and the per-process summary.
    fn drain(&mut self, child: &mut Child) -> i32 {
        let code = reap_child(child);
        info!("child exit code {}", code);
        self.emit("exitcode", format!("{}\n", code).as_bytes(), true);

        match getrusage(UsageWho::RUSAGE_CHILDREN) {
            Ok(usage) => {
                let ut = usage.user_time();
                let st = usage.system_time();
                let utime = ut.tv_sec() as f64 + ut.tv_usec() as f64 * 1e-6;
                let stime = st.tv_sec() as f64 + st.tv_usec() as f64 * 1e-6;
                debug!("children rusage utime={} stime={}", utime, stime);
                self.emit_utilization(utime, stime);
            }
            Err(e) => warn!("getrusage failed: {}", e),
        }

        // Stamp finish times on anything sampling never saw die.
        self.history.check();

        let now = Utc::now();
        let lines: Vec<String> = self
            .history
            .status()
            .map(|(_, info)| info.summary_line(now))
            .collect();
        for line in lines {
            self.emit("runtime_summary", format!("{}\n", line).as_bytes(), false);
        }
        let (utime, stime) = self.history.get_cumulative_times();
        self.emit(
            "runtime_summary",
            format!("aggregate utime={} stime={}\n", utime, stime).as_bytes(),
            true,
        );
        code
    }

    /// Best-effort block emission; a failing writer never disturbs
    /// supervision.
    fn emit(&mut self, key: &str, data: &[u8], flush: bool) {
        if let Err(e) = self.writer.write_block(key, data, flush) {
            warn!("upstream write for block {} failed: {}", key, e);
        }
    }
}

/// Reaps the child without risking an unbounded block: descendants that
/// inherited the pipes may outlive the child itself, so the pipes closing
/// does not guarantee an immediately reapable status.
fn reap_child(child: &mut Child) -> i32 {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return exit_code_of(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!(
                        "child pid {} not reapable within {:?}, assuming exit 0",
                        child.id(),
                        REAP_TIMEOUT
                    );
                    return 0;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!("wait failed: {}, assuming exit 0", e);
                return 0;
            }
        }
    }
}

/// Exit code for the `exitcode` block; a signal death N maps to 128+N.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| 128 + sig).unwrap_or(0)
    }
}

/// Resolves the command to execute: verbatim when it contains a path
/// separator, otherwise searched on PATH.
pub fn locate_command(command: &str) -> Result<PathBuf, ShepherdError> {
    if command.contains('/') {
        return Ok(PathBuf::from(command));
    }
    let searched: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default();
    match search_in(&searched, command) {
        Some(found) => Ok(found),
        None => Err(ShepherdError::CommandNotFound {
            command: command.to_string(),
            searched,
        }),
    }
}

fn search_in(dirs: &[PathBuf], command: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The canonical hostname if DNS can provide one, else the plain hostname.
fn resolve_hostname() -> String {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    match canonical_hostname(&host) {
        Some(fqdn) => fqdn,
        None => {
            debug!("canonical name lookup failed for {}", host);
            host
        }
    }
}

fn canonical_hostname(host: &str) -> Option<String> {
    use std::ffi::{CStr, CString};

    let c_host = CString::new(host).ok()?;
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = libc::AI_CANONNAME;
    let mut res: *mut libc::addrinfo = std::ptr::null_mut();

    // SAFETY: hints and res outlive the call; the result list is released
    // with freeaddrinfo on every path that received one.
    let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), std::ptr::null(), &hints, &mut res) };
    if rc != 0 || res.is_null() {
        return None;
    }
    unsafe {
        let canon = (*res).ai_canonname;
        let name = if canon.is_null() {
            None
        } else {
            CStr::from_ptr(canon).to_str().ok().map(str::to_owned)
        };
        libc::freeaddrinfo(res);
        name
    }
}
