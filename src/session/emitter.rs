//! Single funnel for everything the client observes.
//!
//! Responses and events from every thread go through one channel into one writer
//! thread. That thread owns the outgoing sequence counter and the frame writer, so
//! sequence numbers are strictly increasing in write order and frames never interleave.

use crate::dap::protocol::{DapEvent, DapResponse, Event};
use crate::dap::transport::FrameWriter;
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A response before the emitter assigns its sequence number.
#[derive(Debug)]
pub struct Reply {
    pub request_seq: i64,
    pub command: String,
    pub success: bool,
    pub message: Option<String>,
    pub body: Option<Value>,
}

enum Outgoing {
    Response(Reply),
    Event(Event),
    Close(Sender<()>),
}

#[derive(Clone)]
pub struct Emitter {
    tx: Sender<Outgoing>,
    failed: Arc<AtomicBool>,
}

impl Emitter {
    pub fn start<W: Write + Send + 'static>(writer: FrameWriter<W>) -> Self {
        let (tx, rx) = mpsc::channel();
        let failed = Arc::new(AtomicBool::new(false));
        let spawned = {
            let failed = failed.clone();
            thread::Builder::new()
                .name("dap-emitter".to_string())
                .spawn(move || emit_loop(rx, writer, failed))
        };
        if let Err(e) = spawned {
            log::error!(target: "dap", "spawn emitter thread: {e}");
            failed.store(true, Ordering::SeqCst);
        }

        Self { tx, failed }
    }

    pub fn respond(&self, reply: Reply) {
        self.send(Outgoing::Response(reply))
    }

    pub fn event(&self, event: Event) {
        self.send(Outgoing::Event(event))
    }

    /// True after any write to the transport failed.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Write pending frames and release the transport. Anything sent afterwards is
    /// dropped.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(Outgoing::Close(ack_tx));
        ack_rx.recv_timeout(timeout).is_ok()
    }

    fn send(&self, out: Outgoing) {
        if self.tx.send(out).is_err() {
            log::debug!(target: "dap", "emitter is closed, message dropped");
        }
    }
}

fn emit_loop<W: Write>(rx: Receiver<Outgoing>, writer: FrameWriter<W>, failed: Arc<AtomicBool>) {
    let mut seq: i64 = 0;
    let mut close_ack = None;
    for out in &rx {
        let payload = match out {
            Outgoing::Close(ack) => {
                close_ack = Some(ack);
                break;
            }
            Outgoing::Response(reply) => {
                seq += 1;
                serde_json::to_vec(&DapResponse {
                    seq,
                    r#type: "response",
                    request_seq: reply.request_seq,
                    success: reply.success,
                    command: reply.command,
                    message: reply.message,
                    body: reply.body,
                })
            }
            Outgoing::Event(event) => {
                seq += 1;
                log::debug!(target: "dap", "event `{}` seq {seq}", event.name());
                serde_json::to_vec(&DapEvent {
                    seq,
                    r#type: "event",
                    event,
                })
            }
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                log::error!(target: "dap", "serialize outgoing message: {e}");
                continue;
            }
        };

        if failed.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(e) = writer.write_frame(&payload) {
            log::error!(target: "dap", "write to client: {e}");
            failed.store(true, Ordering::SeqCst);
        }
    }

    drop(rx);
    drop(writer);
    if let Some(ack) = close_ack {
        let _ = ack.send(());
    }
}
