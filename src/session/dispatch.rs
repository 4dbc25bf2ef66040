//! Request decoding, validation and routing.
//!
//! Every request gets exactly one response. Decode failures, sequence violations,
//! state violations and handler failures all become error responses here; only
//! fatal errors are reported back to the run loop.

use crate::dap::protocol::{Command, Request, SetBreakpointsResponseBody};
use crate::session::emitter::Reply;
use crate::session::error::AdapterError;
use crate::session::state::{allowed_states, describe};
use crate::session::{body, Handled, SessionCore};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// What the run loop does after a message.
#[derive(Debug)]
pub(super) enum Flow {
    Continue,
    Exit,
    Fatal(String),
}

impl SessionCore {
    pub(super) fn dispatch(self: &Arc<Self>, payload: &[u8]) -> Flow {
        let request = match Request::decode(payload) {
            Ok(request) => request,
            Err(undecodable) => {
                log::warn!(target: "dap", "rejected message: {}", undecodable.error);
                let command = undecodable.command.unwrap_or_default();
                self.respond_error(
                    undecodable.seq.unwrap_or(0),
                    &command,
                    &AdapterError::from(undecodable.error),
                );
                return Flow::Continue;
            }
        };

        let name = request.command.name();
        log::info!(target: "dap", "request `{name}` seq {}", request.seq);

        if let Err(e) = self.check_sequence(request.seq) {
            log::warn!(target: "dap", "{e}");
            self.respond_error(request.seq, name, &e);
            return Flow::Continue;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.route(&request)))
            .unwrap_or_else(|_| Err(AdapterError::Panicked(name)));

        let flow = match &result {
            Err(e) if e.is_fatal() => Flow::Fatal(e.to_string()),
            Ok(_) if matches!(request.command, Command::Disconnect(_)) => Flow::Exit,
            _ => Flow::Continue,
        };
        self.finish_request(request.seq, name, result);
        flow
    }

    /// Request sequence numbers are client-owned, they only have to grow.
    fn check_sequence(&self, seq: i64) -> Result<(), AdapterError> {
        let mut inner = self.lock();
        match inner.last_seq {
            Some(last) if seq <= last => Err(AdapterError::SequenceViolation { seq, last }),
            _ => {
                inner.last_seq = Some(seq);
                Ok(())
            }
        }
    }

    fn route(self: &Arc<Self>, request: &Request) -> Result<Handled, AdapterError> {
        let state = self.lock().state;
        let allowed = allowed_states(&request.command);
        if !allowed.contains(&state) {
            return Err(AdapterError::InvalidState {
                command: request.command.name(),
                state,
                expected: describe(allowed),
            });
        }

        match &request.command {
            Command::Initialize(args) => self.initialize(args),
            Command::Launch(args) => self.launch(args),
            Command::Attach(args) => self.attach(args),
            Command::SetBreakpoints(args) => self.set_breakpoints(args),
            Command::SetExceptionBreakpoints(_) => {
                body(SetBreakpointsResponseBody { breakpoints: vec![] })
            }
            Command::ConfigurationDone => self.configuration_done(),
            Command::Terminate => self.terminate(),
            Command::Disconnect(args) => self.disconnect(args),
            other => self.handle_execution(request.seq, other),
        }
    }

    /// Send the response for a handled request.
    pub(super) fn finish_request(
        &self,
        seq: i64,
        command: &str,
        result: Result<Handled, AdapterError>,
    ) {
        match result {
            Ok(Handled::Deferred) => {}
            Ok(Handled::Reply { body, then }) => {
                self.emitter.respond(Reply {
                    request_seq: seq,
                    command: command.to_string(),
                    success: true,
                    message: None,
                    body,
                });
                for event in then {
                    self.emitter.event(event);
                }
            }
            Err(e) => {
                log::warn!(target: "dap", "request `{command}` seq {seq} failed: {e}");
                self.respond_error(seq, command, &e);
            }
        }
    }

    fn respond_error(&self, seq: i64, command: &str, error: &AdapterError) {
        self.emitter.respond(Reply {
            request_seq: seq,
            command: command.to_string(),
            success: false,
            message: Some(error.to_string()),
            body: serde_json::to_value(error.to_body()).ok(),
        });
    }
}
