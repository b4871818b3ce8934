// Logging for the streaming host.
//
// Plane threads emit events at datagram rate when a peer misbehaves, so the
// writer must never block on a slow terminal: lines go through a bounded
// channel and are discarded under pressure, with the discard count surfaced
// once the writer catches up. Filter directives come from `LUMEN_LOG`.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FILTER_ENV: &str = "LUMEN_LOG";

// Deep enough to absorb a burst of per-datagram warnings without stalling a
// plane thread.
const QUEUE_DEPTH: usize = 4096;

/// Non-blocking stderr writer. Full queue means the line is dropped and
/// counted, never that the caller waits.
#[derive(Clone)]
pub struct StderrWriter {
    sender: Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl Default for StderrWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StderrWriter {
    pub fn new() -> StderrWriter {
        let (sender, receiver) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let dropped = Arc::new(AtomicU64::new(0));
        let counter = dropped.clone();
        thread::spawn(move || drain(receiver, counter));
        StderrWriter { sender, dropped }
    }

    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn drain(receiver: Receiver<Vec<u8>>, dropped: Arc<AtomicU64>) {
    let mut stderr = std::io::stderr();
    let mut reported = 0u64;
    while let Ok(line) = receiver.recv() {
        let _ = stderr.write_all(&line);
        let total = dropped.load(Ordering::Relaxed);
        if total > reported {
            let _ = writeln!(stderr, "log backlog: {} lines discarded", total - reported);
            reported = total;
        }
    }
}

impl std::io::Write for StderrWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.sender.try_send(buf.to_vec()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn init() {
    let writer = StderrWriter::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_env_var(FILTER_ENV)
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(move || writer.clone()),
        )
        .init();
}
