//! Protocol traffic trace, one line per framed message.
//!
//! ```text
//! [   12.034] <- {"seq":3,"type":"request","command":"threads"}
//! [   12.035] -> {"seq":7,"type":"response","request_seq":3,...}
//! ```

use anyhow::Context;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Direction of a traced protocol message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
    /// Message received from the client.
    Incoming,
    /// Message sent to the client.
    Outgoing,
}

impl Direction {
    fn arrow(self) -> &'static str {
        match self {
            Direction::Incoming => "<-",
            Direction::Outgoing => "->",
        }
    }
}

type Sink = Box<dyn Write + Send>;

/// Shared append-only trace of the protocol traffic. Clones write to the same sink.
#[derive(Clone)]
pub struct FileTracer {
    sink: Arc<Mutex<Sink>>,
    started: Instant,
}

impl std::fmt::Debug for FileTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTracer").finish_non_exhaustive()
    }
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self::with_sink(Box::new(file)))
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            started: Instant::now(),
        }
    }

    /// Record one framed payload. Trace failures never affect the session.
    pub fn message(&self, direction: Direction, payload: &[u8]) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let line = format!(
            "[{elapsed:9.3}] {} {}",
            direction.arrow(),
            String::from_utf8_lossy(payload)
        );
        if let Err(e) = self.write_line(&line) {
            log::debug!(target: "dap", "trace write: {e}");
        }
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "trace sink poisoned"))?;
        writeln!(sink, "{line}")?;
        sink.flush()
    }
}
