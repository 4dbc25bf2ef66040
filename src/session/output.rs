//! Debuggee output capture.
//!
//! Each output pipe gets its own reader thread. A reader forwards chunks in the order
//! the pipe delivers them, so every stream is reproduced without gaps; there is no
//! ordering between the two streams.

use crate::dap::protocol::{Event, OutputCategory, OutputEventBody};
use crate::session::emitter::Emitter;
use os_pipe::PipeReader;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use timeout_readwrite::TimeoutReader;

const CHUNK_SIZE: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reader release flag. Readers stop at their next poll once it is raised.
#[derive(Default, Clone)]
pub struct Handle {
    flag: Arc<AtomicBool>,
}

impl Handle {
    fn release(&self) {
        self.flag.store(true, Ordering::SeqCst)
    }

    fn released(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Turns raw chunks into text without splitting multi-byte sequences.
///
/// An incomplete sequence at the end of a chunk is kept until the next chunk
/// arrives. Invalid bytes become U+FFFD.
#[derive(Default, Debug)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left at end-of-stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Drains debuggee output pipes into `output` events.
pub struct OutputMultiplexer {
    handle: Handle,
    done: Receiver<OutputCategory>,
    readers: usize,
}

impl OutputMultiplexer {
    /// Start a reader for every present stream.
    pub fn start(stdout: Option<PipeReader>, stderr: Option<PipeReader>, emitter: Emitter) -> Self {
        let handle = Handle::default();
        let (done_tx, done) = mpsc::channel();
        let mut readers = 0;

        for (pipe, category) in [(stdout, OutputCategory::Stdout), (stderr, OutputCategory::Stderr)] {
            let Some(pipe) = pipe else {
                continue;
            };
            let stream = TimeoutReader::new(pipe, POLL_INTERVAL);
            let (handle, emitter, done_tx) = (handle.clone(), emitter.clone(), done_tx.clone());
            let spawned = thread::Builder::new()
                .name(format!("output-{category:?}").to_lowercase())
                .spawn(move || read_stream(stream, category, handle, emitter, done_tx));
            match spawned {
                Ok(_) => readers += 1,
                Err(e) => log::error!(target: "output", "spawn {category:?} reader: {e}"),
            }
        }

        Self {
            handle,
            done,
            readers,
        }
    }

    /// Wait until every reader reached end-of-stream or `timeout` expired, then
    /// release the readers. Returns true when all streams were fully drained.
    ///
    /// Calling it again is harmless.
    pub fn drain(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.readers > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(left) {
                Ok(category) => {
                    log::debug!(target: "output", "{category:?} stream drained");
                    self.readers -= 1;
                }
                Err(_) => break,
            }
        }
        self.handle.release();
        let drained = self.readers == 0;
        if !drained {
            log::warn!(target: "output", "{} output stream(s) released before end-of-stream", self.readers);
        }
        drained
    }
}

impl Drop for OutputMultiplexer {
    fn drop(&mut self) {
        self.handle.release()
    }
}

fn read_stream<R: Read>(
    mut stream: R,
    category: OutputCategory,
    handle: Handle,
    emitter: Emitter,
    done: Sender<OutputCategory>,
) {
    let mut decoder = Utf8Carry::default();
    let mut chunk = [0u8; CHUNK_SIZE];
    let emit = |output: String| {
        if !output.is_empty() {
            emitter.event(Event::Output(OutputEventBody { category, output }));
        }
    };

    loop {
        if handle.released() {
            break;
        }
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => emit(decoder.decode(&chunk[..n])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!(target: "output", "read {category:?} stream: {e}");
                break;
            }
        }
    }
    emit(decoder.finish());
    let _ = done.send(category);
}
