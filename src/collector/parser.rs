//! Parsers for `/proc` filesystem files.
//!
//! These are pure functions that parse the content of various `/proc` files
//! into structured data. They are designed to be easily testable with string
//! inputs.

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Fields of `/proc/[pid]/stat` consumed by the shepherd.
///
/// Raw kernel units: times in jiffies, `vsize` in bytes, `rss` in pages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PidStat {
    pub pid: i32,
    pub comm: String,
    pub ppid: i32,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
    pub vsize: u64,
    pub rss: i64,
}

/// Parses `/proc/[pid]/stat` content.
///
/// The format is tricky because the comm field can contain spaces and
/// parentheses; it is delimited by the first `(` and the *last* `)`.
/// Format: pid (comm) state ppid pgrp session tty_nr ...
pub fn parse_pid_stat(content: &str) -> Result<PidStat, ParseError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;

    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: i32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;

    let comm = content[open_paren + 1..close_paren].to_string();

    // Fields after the closing ')': index 0 is the state character,
    // 1 ppid, 11 utime, 12 stime, 19 starttime, 20 vsize, 21 rss.
    let remaining = &content[close_paren + 1..];
    let fields: Vec<&str> = remaining.split_whitespace().collect();

    if fields.len() < 22 {
        return Err(ParseError::new(format!(
            "not enough fields in stat: expected 22+, got {}",
            fields.len()
        )));
    }

    let parse_field = |idx: usize, name: &str| -> Result<i64, ParseError> {
        fields
            .get(idx)
            .ok_or_else(|| ParseError::new(format!("missing field {}", name)))?
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    };

    let parse_field_u64 = |idx: usize, name: &str| -> Result<u64, ParseError> {
        fields
            .get(idx)
            .ok_or_else(|| ParseError::new(format!("missing field {}", name)))?
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    };

    Ok(PidStat {
        pid,
        comm,
        ppid: parse_field(1, "ppid")? as i32,
        utime: parse_field_u64(11, "utime")?,
        stime: parse_field_u64(12, "stime")?,
        starttime: parse_field_u64(19, "starttime")?,
        vsize: parse_field_u64(20, "vsize")?,
        rss: parse_field(21, "rss")?,
    })
}

/// Sums the `Pss:` lines of `/proc/[pid]/smaps` content, returning bytes.
///
/// Lines look like `Pss:                 164 kB`; one line per mapping.
pub fn parse_smaps_pss(content: &str) -> u64 {
    let mut total = 0u64;
    for line in content.lines() {
        let Some(rest) = line.strip_prefix("Pss:") else {
            continue;
        };
        if let Some(kb) = rest.split_whitespace().next()
            && let Ok(val) = kb.parse::<u64>()
        {
            total += val * 1024;
        }
    }
    total
}

/// Extracts the `btime` field (boot time, seconds since epoch) from
/// `/proc/stat` content.
pub fn parse_boot_time(content: &str) -> Result<u64, ParseError> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("btime") {
            return parts
                .next()
                .ok_or_else(|| ParseError::new("btime without value"))?
                .parse()
                .map_err(|_| ParseError::new("invalid btime"));
        }
    }
    Err(ParseError::new("no btime line in /proc/stat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_stat_basic() {
        let content = "1234 (bash) S 1233 1234 1234 34816 1235 4194304 5000 50000 10 20 100 50 200 100 20 0 1 0 100000 25000000 2000 18446744073709551615 0 0 0 0 0 0 65536 3670020 1266777851 0 0 0 17 2 0 0 5 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_pid_stat(content).unwrap();

        assert_eq!(stat.pid, 1234);
        assert_eq!(stat.comm, "bash");
        assert_eq!(stat.ppid, 1233);
        assert_eq!(stat.utime, 100);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.starttime, 100000);
        assert_eq!(stat.vsize, 25000000);
        assert_eq!(stat.rss, 2000);
    }

    #[test]
    fn test_parse_pid_stat_with_spaces_in_comm() {
        let content = "5000 (Web Content) S 4999 5000 4999 0 -1 4194304 100000 0 500 0 5000 1000 0 0 20 0 20 0 500000 2000000000 50000 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_pid_stat(content).unwrap();

        assert_eq!(stat.pid, 5000);
        assert_eq!(stat.comm, "Web Content");
        assert_eq!(stat.ppid, 4999);
    }

    #[test]
    fn test_parse_pid_stat_with_parentheses_in_comm() {
        let content = "5001 (test(1)) S 1 5001 5001 0 -1 4194304 1000 0 0 0 10 5 0 0 20 0 1 0 500100 10000000 1000 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_pid_stat(content).unwrap();

        assert_eq!(stat.pid, 5001);
        assert_eq!(stat.comm, "test(1)");
        assert_eq!(stat.utime, 10);
        assert_eq!(stat.stime, 5);
    }

    #[test]
    fn test_parse_pid_stat_zombie() {
        let content = "4000 (defunct) Z 1000 4000 1000 0 -1 4194308 0 0 0 0 0 0 0 0 20 0 1 0 400000 0 0 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 -1 0 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_pid_stat(content).unwrap();

        assert_eq!(stat.pid, 4000);
        assert_eq!(stat.ppid, 1000);
        assert_eq!(stat.vsize, 0);
        assert_eq!(stat.rss, 0);
    }

    #[test]
    fn test_parse_pid_stat_truncated() {
        let content = "1234 (bash) S 1233 1234";
        assert!(parse_pid_stat(content).is_err());
    }

    #[test]
    fn test_parse_pid_stat_garbage() {
        assert!(parse_pid_stat("").is_err());
        assert!(parse_pid_stat("not a stat line").is_err());
        assert!(parse_pid_stat(") ( backwards").is_err());
    }

    #[test]
    fn test_parse_smaps_pss() {
        let content = "\
00400000-0040c000 r-xp 00000000 08:01 1234 /bin/cat
Size:                 48 kB
Pss:                  12 kB
Shared_Clean:         44 kB
7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0 [stack]
Size:                132 kB
Pss:                  96 kB
Private_Dirty:        96 kB
";
        assert_eq!(parse_smaps_pss(content), (12 + 96) * 1024);
    }

    #[test]
    fn test_parse_smaps_pss_empty() {
        assert_eq!(parse_smaps_pss(""), 0);
        assert_eq!(parse_smaps_pss("Size: 48 kB\n"), 0);
    }

    #[test]
    fn test_parse_boot_time() {
        let content = "\
cpu  10000 500 3000 80000 1000 200 100 0 0 0
cpu0 2500 125 750 20000 250 50 25 0 0 0
ctxt 500000
btime 1700000000
processes 10000
procs_running 2
";
        assert_eq!(parse_boot_time(content).unwrap(), 1700000000);
    }

    #[test]
    fn test_parse_boot_time_missing() {
        assert!(parse_boot_time("cpu 1 2 3\nctxt 5\n").is_err());
    }
}
