//! Lifecycle FIFO: the control channel from the preload library.
//!
//! A shared object injected into the child's address space reports process
//! lifecycle events (exec, start, exit with rusage) as newline-separated
//! ASCII records on a named FIFO. Records are framed by write boundaries:
//! one record per write, relying on the preload library keeping each write
//! under PIPE_BUF so the kernel delivers it atomically. The first line is
//! the record kind.
//!
//! The listener opens the FIFO read-only and non-blocking, and reopens it
//! whenever the last writer closes, until the supervisor drains. A FIFO
//! without writers reads as immediate EOF, so reopening is paced by a short
//! backoff to keep the event loop from spinning before the first writer
//! arrives.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::collector::parser::ParseError;

/// One parsed lifecycle record.
#[derive(Debug, Clone, PartialEq)]
pub enum FifoRecord {
    /// `execve` or `START`: a process began (or replaced) an image.
    Started {
        pid: i32,
        cmd: String,
        argv: Vec<String>,
    },
    /// `exit` or `done`: a process ended, with precise rusage times.
    Exited { pid: i32, utime: f64, stime: f64 },
}

/// Parses one FIFO record. The first line discriminates the kind:
///
/// | kind            | following lines                                          |
/// |-----------------|----------------------------------------------------------|
/// | `execve`        | pid, progname, cmd, argv...                              |
/// | `START`         | pid, (ignored), cmd, argv...                             |
/// | `exit` / `done` | pid, statline, utime_sec, utime_usec, stime_sec, stime_usec |
pub fn parse_record(data: &str) -> Result<FifoRecord, ParseError> {
    let lines: Vec<&str> = data.lines().collect();
    let kind = *lines
        .first()
        .ok_or_else(|| ParseError::new("empty fifo record"))?;

    let field = |idx: usize| -> Result<&str, ParseError> {
        lines
            .get(idx)
            .copied()
            .ok_or_else(|| ParseError::new(format!("{} record truncated at field {}", kind, idx)))
    };
    let int_field = |idx: usize| -> Result<u64, ParseError> {
        field(idx)?
            .trim()
            .parse()
            .map_err(|_| ParseError::new(format!("{} record: bad integer at field {}", kind, idx)))
    };

    match kind {
        "execve" | "START" => {
            let pid = int_field(1)? as i32;
            // Field 2 is the progname for execve, ignored for START; the
            // command path in field 3 is what the history consumes.
            let cmd = field(3)?.to_string();
            let argv = lines[4.min(lines.len())..]
                .iter()
                .map(|s| s.to_string())
                .collect();
            Ok(FifoRecord::Started { pid, cmd, argv })
        }
        "exit" | "done" => {
            let pid = int_field(1)? as i32;
            let utime = int_field(3)? as f64 + int_field(4)? as f64 * 1e-6;
            let stime = int_field(5)? as f64 + int_field(6)? as f64 * 1e-6;
            Ok(FifoRecord::Exited { pid, utime, stime })
        }
        other => Err(ParseError::new(format!(
            "unknown fifo record kind '{}'",
            other
        ))),
    }
}

/// Outcome of one non-blocking read attempt.
#[derive(Debug)]
pub enum FifoRead {
    /// One record's worth of bytes.
    Data(Vec<u8>),
    /// Nothing available right now.
    WouldBlock,
    /// Last writer closed; the listener entered its reopen backoff.
    Eof,
    /// Not currently open (closed, or waiting out the backoff).
    Idle,
}

#[derive(Debug)]
enum FifoState {
    Closed,
    Open(File),
    Backoff(Instant),
}

/// Delay before reopening after EOF.
const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

/// Read buffer size; one record per read (see module docs).
const READ_CAPACITY: usize = 4096;

/// Owns the FIFO special file from creation to unlink.
#[derive(Debug)]
pub struct FifoListener {
    path: PathBuf,
    state: FifoState,
}

/// Process-unique FIFO path in the temp directory.
pub fn default_fifo_path() -> PathBuf {
    std::env::temp_dir().join(format!("p3x-shepherd-{}.fifo", std::process::id()))
}

impl FifoListener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: FifoState::Closed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the FIFO special file (mode 0600) and opens the read side.
    pub fn create(&mut self) -> io::Result<()> {
        nix::unistd::mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(io::Error::from)?;
        debug!("fifo created at {}", self.path.display());
        self.open()
    }

    fn open(&mut self) -> io::Result<()> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)?;
        self.state = FifoState::Open(file);
        Ok(())
    }

    /// The open file to include in the poll set, if any.
    pub fn pollable(&self) -> Option<&File> {
        match &self.state {
            FifoState::Open(f) => Some(f),
            _ => None,
        }
    }

    /// When the reopen backoff expires, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            FifoState::Backoff(at) => Some(*at),
            _ => None,
        }
    }

    /// Reopens the FIFO once the backoff has expired.
    pub fn maintain(&mut self, now: Instant) {
        let due = matches!(&self.state, FifoState::Backoff(at) if now >= *at);
        if due && let Err(e) = self.open() {
            warn!("fifo reopen failed: {}", e);
            self.state = FifoState::Backoff(now + REOPEN_BACKOFF);
        }
    }

    /// One non-blocking read; at most one record per call.
    pub fn read(&mut self) -> FifoRead {
        let FifoState::Open(file) = &mut self.state else {
            return FifoRead::Idle;
        };

        let mut buf = [0u8; READ_CAPACITY];
        match file.read(&mut buf) {
            Ok(0) => {
                self.state = FifoState::Backoff(Instant::now() + REOPEN_BACKOFF);
                FifoRead::Eof
            }
            Ok(n) => FifoRead::Data(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => FifoRead::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => FifoRead::WouldBlock,
            Err(e) => {
                warn!("fifo read error: {}", e);
                self.state = FifoState::Backoff(Instant::now() + REOPEN_BACKOFF);
                FifoRead::Eof
            }
        }
    }

    /// Cancels listening and unlinks the FIFO path. Idempotent.
    pub fn shutdown(&mut self) {
        self.state = FifoState::Closed;
        if std::fs::remove_file(&self.path).is_ok() {
            debug!("fifo removed at {}", self.path.display());
        }
    }
}

impl Drop for FifoListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
