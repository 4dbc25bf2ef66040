//! Typed Debug Adapter Protocol messages.
//!
//! Requests are decoded in two steps: the envelope (`seq`, `type`, `command`) first,
//! then the arguments against the schema of that exact command. Anything that does
//! not fit is reported as a [`DecodeError`], never as a partially filled request.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use strum_macros::IntoStaticStr;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),
    #[error("message has no valid `{0}` field")]
    MissingField(&'static str),
    #[error("unexpected message type `{0}`, only requests are accepted")]
    UnexpectedType(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("invalid arguments for `{command}`: {reason}")]
    InvalidArguments { command: String, reason: String },
}

impl DecodeError {
    pub fn invalid_arguments(command: &str, reason: impl ToString) -> Self {
        DecodeError::InvalidArguments {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A decoded client request.
#[derive(Debug, Clone)]
pub struct Request {
    pub seq: i64,
    pub command: Command,
}

/// Result of decoding a payload: either a request or the reason it is not one.
///
/// `seq` and `command` are kept whenever they could be read, so the error response
/// can still be correlated by the client.
#[derive(Debug)]
pub struct Undecodable {
    pub seq: Option<i64>,
    pub command: Option<String>,
    pub error: DecodeError,
}

impl Request {
    pub fn decode(payload: &[u8]) -> Result<Request, Undecodable> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| Undecodable {
            seq: None,
            command: None,
            error: DecodeError::InvalidJson(e),
        })?;

        let seq = value.get("seq").and_then(Value::as_i64);
        let command = value
            .get("command")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let fail = |error| Undecodable {
            seq,
            command: command.clone(),
            error,
        };

        match value.get("type").and_then(Value::as_str) {
            Some("request") => {}
            Some(other) => return Err(fail(DecodeError::UnexpectedType(other.to_string()))),
            None => return Err(fail(DecodeError::MissingField("type"))),
        }
        let seq = seq.ok_or_else(|| fail(DecodeError::MissingField("seq")))?;
        let name = command
            .as_deref()
            .ok_or_else(|| fail(DecodeError::MissingField("command")))?;

        let command = Command::decode(name, value.get("arguments").cloned()).map_err(fail)?;
        Ok(Request { seq, command })
    }
}

/// Closed set of supported requests with their typed arguments.
#[derive(Debug, Clone, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum Command {
    Initialize(InitializeArguments),
    Launch(LaunchArguments),
    Attach(AttachArguments),
    SetBreakpoints(SetBreakpointsArguments),
    SetExceptionBreakpoints(SetExceptionBreakpointsArguments),
    ConfigurationDone,
    Continue(ContinueArguments),
    Next(StepArguments),
    StepIn(StepArguments),
    StepOut(StepArguments),
    Pause(PauseArguments),
    Threads,
    StackTrace(StackTraceArguments),
    Scopes(ScopesArguments),
    Variables(VariablesArguments),
    Evaluate(EvaluateArguments),
    Terminate,
    Disconnect(DisconnectArguments),
}

impl Command {
    pub fn decode(command: &str, arguments: Option<Value>) -> Result<Command, DecodeError> {
        fn args<T: DeserializeOwned>(command: &str, arguments: Option<Value>) -> Result<T, DecodeError> {
            let arguments = match arguments {
                None | Some(Value::Null) => Value::Object(Default::default()),
                Some(v) => v,
            };
            serde_json::from_value(arguments).map_err(|e| DecodeError::invalid_arguments(command, e))
        }

        let cmd = match command {
            "initialize" => Command::Initialize(args(command, arguments)?),
            "launch" => Command::Launch(args(command, arguments)?),
            "attach" => Command::Attach(args(command, arguments)?),
            "setBreakpoints" => Command::SetBreakpoints(args(command, arguments)?),
            "setExceptionBreakpoints" => Command::SetExceptionBreakpoints(args(command, arguments)?),
            "configurationDone" => Command::ConfigurationDone,
            "continue" => Command::Continue(args(command, arguments)?),
            "next" => Command::Next(args(command, arguments)?),
            "stepIn" => Command::StepIn(args(command, arguments)?),
            "stepOut" => Command::StepOut(args(command, arguments)?),
            "pause" => Command::Pause(args(command, arguments)?),
            "threads" => Command::Threads,
            "stackTrace" => Command::StackTrace(args(command, arguments)?),
            "scopes" => Command::Scopes(args(command, arguments)?),
            "variables" => Command::Variables(args(command, arguments)?),
            "evaluate" => Command::Evaluate(args(command, arguments)?),
            "terminate" => Command::Terminate,
            "disconnect" => Command::Disconnect(args(command, arguments)?),
            other => return Err(DecodeError::UnknownCommand(other.to_string())),
        };
        Ok(cmd)
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    #[serde(rename = "clientID")]
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    #[serde(rename = "adapterID")]
    pub adapter_id: Option<String>,
    #[serde(default = "default_true")]
    pub lines_start_at1: bool,
    #[serde(default = "default_true")]
    pub columns_start_at1: bool,
    pub path_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// `null` value means "remove from the environment".
    #[serde(default)]
    pub env: HashMap<String, Option<String>>,
    #[serde(default)]
    pub no_debug: bool,
    #[serde(default)]
    pub stop_on_entry: bool,
    #[serde(default)]
    pub source_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProcessId {
    Number(u32),
    Text(String),
}

impl ProcessId {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ProcessId::Number(n) => Some(*n),
            ProcessId::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    pub process_id: ProcessId,
    #[serde(default)]
    pub source_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: i64,
    pub column: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    pub source: Source,
    #[serde(default)]
    pub breakpoints: Option<Vec<SourceBreakpoint>>,
    /// Deprecated form, used only when `breakpoints` is absent.
    #[serde(default)]
    pub lines: Option<Vec<i64>>,
    #[serde(default)]
    pub source_modified: bool,
}

impl SetBreakpointsArguments {
    /// Requested lines in client numbering.
    pub fn requested_lines(&self) -> Vec<i64> {
        match (&self.breakpoints, &self.lines) {
            (Some(bps), _) => bps.iter().map(|bp| bp.line).collect(),
            (None, Some(lines)) => lines.clone(),
            (None, None) => vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExceptionBreakpointsArguments {
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueArguments {
    pub thread_id: i64,
    #[serde(default)]
    pub single_thread: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepArguments {
    pub thread_id: i64,
    #[serde(default)]
    pub single_thread: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseArguments {
    pub thread_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: i64,
    pub start_frame: Option<i64>,
    pub levels: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: i64,
    pub start: Option<i64>,
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    pub frame_id: Option<i64>,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectArguments {
    #[serde(default)]
    pub restart: bool,
    pub terminate_debuggee: Option<bool>,
}

/// DAP response envelope.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    #[serde(flatten)]
    pub event: Event,
}

/// Body of a failed response: `{"error": {"id": .., "format": ..}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponseBody {
    pub error: ErrorMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub id: u32,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, IntoStaticStr)]
#[serde(tag = "event", content = "body", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Event {
    Initialized,
    Stopped(StoppedEventBody),
    Continued(ContinuedEventBody),
    Exited(ExitedEventBody),
    Terminated,
    Output(OutputEventBody),
    Breakpoint(BreakpointEventBody),
}

impl Event {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    pub all_threads_stopped: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hit_breakpoint_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: i64,
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    pub exit_code: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputCategory {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEventBody {
    pub category: OutputCategory,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakpointEventReason {
    Changed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointEventBody {
    pub reason: BreakpointEventReason,
    pub breakpoint: Breakpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: i64,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_terminate_request: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_evaluate_for_hovers: bool,
    pub supports_stepping_granularity: bool,
    pub supports_single_thread_execution_requests: bool,
    pub supports_delayed_stack_trace_loading: bool,
    pub supports_restart_request: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsResponseBody {
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponseBody {
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadsResponseBody {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub line: i64,
    pub column: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponseBody {
    pub stack_frames: Vec<StackFrame>,
    pub total_frames: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopesResponseBody {
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariablesResponseBody {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponseBody {
    pub result: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
}
