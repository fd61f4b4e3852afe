//! Upstream block writer: named, ordered, best-effort blocks.
//!
//! The supervisor emits everything it knows through one operation,
//! `write_block(key, bytes, flush)`. Keys are free-form labels (`stdout`,
//! `exitcode`, `runtime_summary`, ...) understood by the application
//! service. Delivery is best effort: a failing writer never disturbs
//! supervision.

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use tracing::{debug, warn};

/// Ordered, best-effort append channel for named blocks.
///
/// Per-key block order is preserved by every implementation; across keys no
/// ordering is promised. `flush` asks the writer to push buffered data out.
pub trait BlockWriter {
    fn write_block(&mut self, key: &str, data: &[u8], flush: bool) -> io::Result<()>;

    /// Final flush, called once when supervision ends.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: BlockWriter + ?Sized> BlockWriter for Box<W> {
    fn write_block(&mut self, key: &str, data: &[u8], flush: bool) -> io::Result<()> {
        (**self).write_block(key, data, flush)
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

/// Ships blocks to the application service over HTTP.
///
/// Bytes are buffered per key and posted when a flush is requested, when a
/// buffer passes the threshold, or on [`finish`](BlockWriter::finish). An
/// empty block (an EOF marker) is posted immediately so the service sees the
/// stream boundary. Failures are logged and dropped; the service is expected
/// to tolerate gaps.
pub struct AppServiceClient {
    http: reqwest::blocking::Client,
    base_url: String,
    task_id: String,
    pending: HashMap<String, Vec<u8>>,
}

/// Buffered bytes per key before an unforced post.
const POST_THRESHOLD: usize = 64 * 1024;

impl AppServiceClient {
    pub fn new(app_service_url: &str, task_id: &str) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: app_service_url.trim_end_matches('/').to_string(),
            task_id: task_id.to_string(),
            pending: HashMap::new(),
        }
    }

    fn block_url(&self, key: &str) -> String {
        format!("{}/task/{}/block/{}", self.base_url, self.task_id, key)
    }

    fn post(&mut self, key: &str, body: Vec<u8>) {
        let url = self.block_url(key);
        match self.http.post(&url).body(body).send() {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!("app service rejected block {}: {}", key, resp.status()),
            Err(e) => warn!("app service unreachable for block {}: {}", key, e),
        }
    }

    fn flush_key(&mut self, key: &str) {
        if let Some(buf) = self.pending.remove(key)
            && !buf.is_empty()
        {
            self.post(key, buf);
        }
    }
}

impl BlockWriter for AppServiceClient {
    fn write_block(&mut self, key: &str, data: &[u8], flush: bool) -> io::Result<()> {
        if data.is_empty() {
            // Stream boundary marker: push pending bytes, then the marker.
            self.flush_key(key);
            self.post(key, Vec::new());
            return Ok(());
        }

        let buf = self.pending.entry(key.to_string()).or_default();
        buf.extend_from_slice(data);
        if flush || buf.len() >= POST_THRESHOLD {
            self.flush_key(key);
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let keys: Vec<String> = self.pending.keys().cloned().collect();
        for key in keys {
            self.flush_key(&key);
        }
        Ok(())
    }
}

/// Local fallback used when no `--app-service` is configured: child stream
/// payloads go to the shepherd's own stdout/stderr, control keys are logged.
#[derive(Debug, Default)]
pub struct ConsoleWriter;

impl ConsoleWriter {
    pub fn new() -> Self {
        Self
    }
}

impl BlockWriter for ConsoleWriter {
    fn write_block(&mut self, key: &str, data: &[u8], _flush: bool) -> io::Result<()> {
        match key {
            "stdout" => {
                let mut out = io::stdout().lock();
                out.write_all(data)?;
                out.flush()
            }
            "stderr" => {
                let mut err = io::stderr().lock();
                err.write_all(data)?;
                err.flush()
            }
            _ => {
                debug!("block {} ({} bytes): {}", key, data.len(), String::from_utf8_lossy(data).trim_end());
                Ok(())
            }
        }
    }
}

/// Collects blocks in memory, for tests and inspection.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    blocks: Vec<Block>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub key: String,
    pub data: Vec<u8>,
    pub flush: bool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// All payload bytes written under `key`, concatenated in order.
    pub fn payload(&self, key: &str) -> Vec<u8> {
        self.blocks
            .iter()
            .filter(|b| b.key == key)
            .flat_map(|b| b.data.iter().copied())
            .collect()
    }

    /// Number of blocks written under `key`.
    pub fn count(&self, key: &str) -> usize {
        self.blocks.iter().filter(|b| b.key == key).count()
    }
}

impl BlockWriter for MemoryWriter {
    fn write_block(&mut self, key: &str, data: &[u8], flush: bool) -> io::Result<()> {
        self.blocks.push(Block {
            key: key.to_string(),
            data: data.to_vec(),
            flush,
        });
        Ok(())
    }
}
