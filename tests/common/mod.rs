#![allow(dead_code)]

use anyhow::anyhow;
use os_pipe::{PipeReader, PipeWriter};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tether::backend::{
    AttachConfig, Backend, BackendCapabilities, BackendError, BackendEvent, BreakpointHandle,
    BreakpointInstall, DebuggeeIo, FrameInfo, LaunchConfig, LineTable, ScopeInfo, StepKind,
    StopReason, ThreadId, ThreadInfo, VarHandle, VariableInfo,
};
use tether::session::{AdapterError, Session, SessionConfig};
use timeout_readwrite::TimeoutReader;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub const MAIN_THREAD: ThreadId = 1;
pub const WORKER_THREAD: ThreadId = 2;
pub const SOURCE: &str = "/work/app/Program.cs";
pub const OTHER_SOURCE: &str = "/work/app/Worker.cs";
pub const DEBUGGEE_PID: u32 = 4242;

/// Behaviour of a [`ScriptedBackend`].
pub struct Script {
    pub capabilities: BackendCapabilities,
    pub line_tables: HashMap<String, LineTable>,
    /// Installations are reported verified right away.
    pub verify_on_insert: bool,
    pub launch_error: Option<String>,
    /// Resume calls block this long before answering.
    pub resume_delay: Option<Duration>,
    pub threads: Vec<ThreadInfo>,
    pub frames: HashMap<ThreadId, Vec<FrameInfo>>,
    pub scopes: Vec<ScopeInfo>,
    pub variables: HashMap<u64, Vec<VariableInfo>>,
    pub evaluations: HashMap<String, VariableInfo>,
    /// `threads` panics inside the backend.
    pub panic_on_threads: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: BackendCapabilities {
                stop_the_world: true,
                supports_stepping: true,
                supports_pause: true,
                supports_evaluate: true,
                supports_breakpoints: true,
            },
            line_tables: HashMap::from([
                (
                    SOURCE.to_string(),
                    LineTable::new([5, 6, 7, 10, 12, 20, 21], [3..=13, 18..=22]),
                ),
                (
                    OTHER_SOURCE.to_string(),
                    LineTable::new([3, 4, 8], [2..=9]),
                ),
            ]),
            verify_on_insert: true,
            launch_error: None,
            resume_delay: None,
            threads: vec![
                ThreadInfo {
                    id: MAIN_THREAD,
                    name: "main".to_string(),
                },
                ThreadInfo {
                    id: WORKER_THREAD,
                    name: "worker".to_string(),
                },
            ],
            frames: HashMap::from([(
                MAIN_THREAD,
                vec![
                    FrameInfo {
                        name: "Program.Work".to_string(),
                        source: Some(SOURCE.to_string()),
                        line: 6,
                        column: 9,
                    },
                    FrameInfo {
                        name: "Program.Main".to_string(),
                        source: Some(SOURCE.to_string()),
                        line: 20,
                        column: 5,
                    },
                    FrameInfo {
                        name: "[external code]".to_string(),
                        source: None,
                        line: 0,
                        column: 0,
                    },
                ],
            )]),
            scopes: vec![ScopeInfo {
                name: "Locals".to_string(),
                handle: VarHandle(100),
                expensive: false,
            }],
            variables: HashMap::from([
                (
                    100,
                    vec![
                        VariableInfo {
                            name: "count".to_string(),
                            value: "3".to_string(),
                            type_name: Some("int".to_string()),
                            children: None,
                        },
                        VariableInfo {
                            name: "items".to_string(),
                            value: "{int[2]}".to_string(),
                            type_name: Some("int[]".to_string()),
                            children: Some(VarHandle(101)),
                        },
                    ],
                ),
                (
                    101,
                    vec![
                        VariableInfo {
                            name: "[0]".to_string(),
                            value: "7".to_string(),
                            type_name: Some("int".to_string()),
                            children: None,
                        },
                        VariableInfo {
                            name: "[1]".to_string(),
                            value: "9".to_string(),
                            type_name: Some("int".to_string()),
                            children: None,
                        },
                    ],
                ),
            ]),
            evaluations: HashMap::from([(
                "count * 2".to_string(),
                VariableInfo {
                    name: "count * 2".to_string(),
                    value: "6".to_string(),
                    type_name: Some("int".to_string()),
                    children: None,
                },
            )]),
            panic_on_threads: false,
        }
    }
}

/// In-process backend driven by the test.
///
/// Every backend call is recorded; the test pushes debuggee notifications and output
/// by hand.
pub struct ScriptedBackend {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    events: Mutex<Option<Sender<BackendEvent>>>,
    stdout: Mutex<Option<PipeWriter>>,
    stderr: Mutex<Option<PipeWriter>>,
    installed: Mutex<HashMap<u64, (String, u32)>>,
    next_handle: AtomicU64,
    alive: AtomicBool,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: Mutex::default(),
            events: Mutex::default(),
            stdout: Mutex::default(),
            stderr: Mutex::default(),
            installed: Mutex::default(),
            next_handle: AtomicU64::new(1),
            alive: AtomicBool::new(false),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Handle of the installation at `line` of `source`.
    pub fn handle_at(&self, source: &str, line: u32) -> Option<BreakpointHandle> {
        self.installed
            .lock()
            .unwrap()
            .iter()
            .find(|(_, (s, l))| s == source && *l == line)
            .map(|(h, _)| BreakpointHandle(*h))
    }

    pub fn emit(&self, event: BackendEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.send(event).unwrap();
        }
    }

    pub fn stop(&self, thread_id: ThreadId, reason: StopReason, hit: Vec<BreakpointHandle>) {
        self.emit(BackendEvent::Stopped {
            thread_id,
            reason,
            all_threads_stopped: true,
            description: None,
            hit,
        });
    }

    pub fn write_stdout(&self, bytes: &[u8]) {
        if let Some(pipe) = self.stdout.lock().unwrap().as_mut() {
            pipe.write_all(bytes).unwrap();
        }
    }

    pub fn write_stderr(&self, bytes: &[u8]) {
        if let Some(pipe) = self.stderr.lock().unwrap().as_mut() {
            pipe.write_all(bytes).unwrap();
        }
    }

    /// Debuggee end: output pipes close, then the exit notification.
    pub fn exit(&self, code: i64) {
        self.alive.store(false, Ordering::SeqCst);
        self.stdout.lock().unwrap().take();
        self.stderr.lock().unwrap().take();
        self.emit(BackendEvent::Exited { code });
    }

    fn start(&self, events: Sender<BackendEvent>) -> Result<DebuggeeIo, BackendError> {
        let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
        let (stderr_reader, stderr_writer) = os_pipe::pipe()?;
        *self.stdout.lock().unwrap() = Some(stdout_writer);
        *self.stderr.lock().unwrap() = Some(stderr_writer);
        *self.events.lock().unwrap() = Some(events);
        self.alive.store(true, Ordering::SeqCst);
        Ok(DebuggeeIo {
            pid: Some(DEBUGGEE_PID),
            stdout: Some(stdout_reader),
            stderr: Some(stderr_reader),
        })
    }
}

impl Backend for ScriptedBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.script().capabilities
    }

    fn launch(
        &self,
        config: &LaunchConfig,
        events: Sender<BackendEvent>,
    ) -> Result<DebuggeeIo, BackendError> {
        self.record(format!(
            "launch {} no_debug={}",
            config.program.display(),
            config.no_debug
        ));
        if let Some(reason) = self.script().launch_error.clone() {
            return Err(BackendError::Launch(reason));
        }
        self.start(events)
    }

    fn attach(
        &self,
        config: &AttachConfig,
        events: Sender<BackendEvent>,
    ) -> Result<DebuggeeIo, BackendError> {
        self.record(format!("attach {}", config.pid));
        let mut io = self.start(events)?;
        io.pid = Some(config.pid);
        Ok(io)
    }

    fn terminate(&self) -> Result<(), BackendError> {
        self.record("terminate");
        if self.alive.load(Ordering::SeqCst) {
            self.exit(137);
        }
        Ok(())
    }

    fn detach(&self) -> Result<(), BackendError> {
        self.record("detach");
        self.alive.store(false, Ordering::SeqCst);
        self.stdout.lock().unwrap().take();
        self.stderr.lock().unwrap().take();
        self.events.lock().unwrap().take();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn line_table(&self, source: &str) -> Result<LineTable, BackendError> {
        self.record(format!("line_table {source}"));
        self.script()
            .line_tables
            .get(source)
            .cloned()
            .ok_or(BackendError::Unsupported("line tables of unknown sources"))
    }

    fn insert_breakpoint(&self, source: &str, line: u32) -> Result<BreakpointInstall, BackendError> {
        self.record(format!("insert {source}:{line}"));
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.installed
            .lock()
            .unwrap()
            .insert(handle, (source.to_string(), line));
        Ok(BreakpointInstall {
            handle: BreakpointHandle(handle),
            verified: self.script().verify_on_insert,
        })
    }

    fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), BackendError> {
        let (source, line) = self
            .installed
            .lock()
            .unwrap()
            .remove(&handle.0)
            .ok_or(BackendError::UnknownHandle(handle.0))?;
        self.record(format!("remove {source}:{line}"));
        Ok(())
    }

    fn resume(&self, thread: Option<ThreadId>) -> Result<(), BackendError> {
        self.record(match thread {
            Some(thread) => format!("resume {thread}"),
            None => "resume all".to_string(),
        });
        let delay = self.script().resume_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn step(&self, thread: ThreadId, kind: StepKind) -> Result<(), BackendError> {
        self.record(format!("step {kind} {thread}"));
        self.stop(thread, StopReason::Step, vec![]);
        Ok(())
    }

    fn pause(&self, thread: Option<ThreadId>) -> Result<(), BackendError> {
        let thread = thread.unwrap_or(MAIN_THREAD);
        self.record(format!("pause {thread}"));
        self.stop(thread, StopReason::Pause, vec![]);
        Ok(())
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>, BackendError> {
        let panic_on_threads = self.script().panic_on_threads;
        if panic_on_threads {
            panic!("scripted failure in threads");
        }
        Ok(self.script().threads.clone())
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>, BackendError> {
        self.record(format!("frames {thread}"));
        self.script()
            .frames
            .get(&thread)
            .cloned()
            .ok_or(BackendError::UnknownThread(thread))
    }

    fn scopes(&self, _thread: ThreadId, _frame: usize) -> Result<Vec<ScopeInfo>, BackendError> {
        Ok(self.script().scopes.clone())
    }

    fn variables(&self, handle: VarHandle) -> Result<Vec<VariableInfo>, BackendError> {
        self.script()
            .variables
            .get(&handle.0)
            .cloned()
            .ok_or(BackendError::UnknownHandle(handle.0))
    }

    fn evaluate(
        &self,
        _thread: Option<ThreadId>,
        _frame: Option<usize>,
        expression: &str,
    ) -> Result<VariableInfo, BackendError> {
        self.script()
            .evaluations
            .get(expression)
            .cloned()
            .ok_or_else(|| BackendError::Evaluate(expression.to_string()))
    }
}

/// Protocol client speaking framed JSON to an in-process session over pipes.
pub struct DapClient {
    writer: Option<PipeWriter>,
    reader: BufReader<TimeoutReader<PipeReader>>,
    next_seq: i64,
    pending: VecDeque<Value>,
    /// Every message received so far, in arrival order.
    pub log: Vec<Value>,
}

impl DapClient {
    pub fn send_request(&mut self, command: &str, arguments: Value) -> anyhow::Result<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.send_with_seq(seq, command, arguments)?;
        Ok(seq)
    }

    pub fn send_with_seq(&mut self, seq: i64, command: &str, arguments: Value) -> anyhow::Result<()> {
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.write_raw(&serde_json::to_vec(&request)?, true)
    }

    /// Send raw bytes, framed when `frame` is set.
    pub fn write_raw(&mut self, payload: &[u8], frame: bool) -> anyhow::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("client input already closed"))?;
        if frame {
            write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
        }
        writer.write_all(payload)?;
        writer.flush()?;
        Ok(())
    }

    /// End the adapter input stream.
    pub fn close(&mut self) {
        self.writer.take();
    }

    pub fn request(&mut self, command: &str, arguments: Value) -> anyhow::Result<Value> {
        let seq = self.send_request(command, arguments)?;
        self.read_response(seq)
    }

    pub fn read_response(&mut self, request_seq: i64) -> anyhow::Result<Value> {
        if let Some(pos) = self.pending.iter().position(|m| {
            m["type"] == "response" && m["request_seq"].as_i64() == Some(request_seq)
        }) {
            return Ok(self.pending.remove(pos).unwrap_or_default());
        }
        loop {
            let msg = self.read_message()?;
            if msg["type"] == "response" && msg["request_seq"].as_i64() == Some(request_seq) {
                return Ok(msg);
            }
            self.pending.push_back(msg);
        }
    }

    pub fn wait_for_event(&mut self, name: &str) -> anyhow::Result<Value> {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|m| m["type"] == "event" && m["event"] == name)
        {
            return Ok(self.pending.remove(pos).unwrap_or_default());
        }
        loop {
            let msg = self.read_message()?;
            if msg["type"] == "event" && msg["event"] == name {
                return Ok(msg);
            }
            self.pending.push_back(msg);
        }
    }

    /// Read until the adapter closes its output.
    pub fn read_to_end(&mut self) -> anyhow::Result<()> {
        loop {
            match self.read_message() {
                Ok(msg) => self.pending.push_back(msg),
                Err(e) if e.to_string().contains("connection closed") => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Events named `name` seen so far.
    pub fn events(&self, name: &str) -> Vec<Value> {
        self.log
            .iter()
            .filter(|m| m["type"] == "event" && m["event"] == name)
            .cloned()
            .collect()
    }

    /// Names of all events seen so far, in order.
    pub fn event_names(&self) -> Vec<String> {
        self.log
            .iter()
            .filter(|m| m["type"] == "event")
            .filter_map(|m| m["event"].as_str().map(ToString::to_string))
            .collect()
    }

    /// Concatenated output of one category.
    pub fn output(&self, category: &str) -> String {
        self.events("output")
            .iter()
            .filter(|e| e["body"]["category"] == category)
            .filter_map(|e| e["body"]["output"].as_str().map(ToString::to_string))
            .collect()
    }

    fn read_message(&mut self) -> anyhow::Result<Value> {
        let deadline = Instant::now() + MESSAGE_TIMEOUT;
        let mut content_length = None;
        loop {
            let mut line = String::new();
            let read_n = loop {
                match self.reader.read_line(&mut line) {
                    Ok(n) => break n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        if Instant::now() > deadline {
                            return Err(anyhow!("timed out waiting for DAP header"));
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("missing Content-Length"))?;
        let mut buf = vec![0u8; len];
        let mut offset = 0;
        while offset < len {
            match self.reader.read(&mut buf[offset..]) {
                Ok(0) => return Err(anyhow!("DAP connection closed")),
                Ok(n) => offset += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > deadline {
                        return Err(anyhow!("timed out waiting for DAP body"));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        let msg: Value = serde_json::from_slice(&buf)?;
        self.log.push(msg.clone());
        Ok(msg)
    }
}

/// A session served on a background thread.
pub struct DapSession {
    pub client: DapClient,
    pub backend: Arc<ScriptedBackend>,
    server: Option<JoinHandle<Result<(), AdapterError>>>,
}

impl DapSession {
    pub fn start(script: Script) -> anyhow::Result<Self> {
        Self::start_with(script, SessionConfig::default())
    }

    pub fn start_with(script: Script, config: SessionConfig) -> anyhow::Result<Self> {
        let backend = ScriptedBackend::new(script);
        let (server_in, client_out) = os_pipe::pipe()?;
        let (client_in, server_out) = os_pipe::pipe()?;

        let session = Session::new(backend.clone(), config);
        let server = thread::Builder::new()
            .name("session".to_string())
            .spawn(move || session.run(server_in, server_out))?;

        Ok(Self {
            client: DapClient {
                writer: Some(client_out),
                reader: BufReader::new(TimeoutReader::new(client_in, READ_TIMEOUT)),
                next_seq: 1,
                pending: VecDeque::new(),
                log: vec![],
            },
            backend,
            server: Some(server),
        })
    }

    /// initialize + launch + configuration sequence up to (not including)
    /// `configurationDone`.
    pub fn launch(&mut self, launch: Value) -> anyhow::Result<Value> {
        let init = self.client.request("initialize", json!({"adapterID": "tether"}))?;
        anyhow::ensure!(init["success"] == true, "initialize failed: {init}");
        let response = self.client.request("launch", launch)?;
        if response["success"] == true {
            self.client.wait_for_event("initialized")?;
        }
        Ok(response)
    }

    pub fn launch_program(&mut self) -> anyhow::Result<()> {
        let program = std::env::current_exe()?;
        let response = self.launch(json!({"program": program}))?;
        anyhow::ensure!(response["success"] == true, "launch failed: {response}");
        Ok(())
    }

    /// `launch` of the test binary on an already initialized session.
    pub fn launch_program_after_initialize(&mut self) -> anyhow::Result<()> {
        let program = std::env::current_exe()?;
        let response = self.client.request("launch", json!({"program": program}))?;
        anyhow::ensure!(response["success"] == true, "launch failed: {response}");
        self.client.wait_for_event("initialized")?;
        Ok(())
    }

    pub fn set_breakpoints(&mut self, lines: &[i64]) -> anyhow::Result<Value> {
        self.set_breakpoints_in(SOURCE, lines)
    }

    pub fn set_breakpoints_in(&mut self, source: &str, lines: &[i64]) -> anyhow::Result<Value> {
        let breakpoints: Vec<Value> = lines.iter().map(|l| json!({"line": l})).collect();
        self.client.request(
            "setBreakpoints",
            json!({"source": {"path": source}, "breakpoints": breakpoints}),
        )
    }

    pub fn configuration_done(&mut self) -> anyhow::Result<Value> {
        self.client.request("configurationDone", json!({}))
    }

    /// Launched, configured and stopped at a breakpoint on the main thread.
    pub fn stopped_at_breakpoint(script: Script) -> anyhow::Result<Self> {
        let mut session = Self::start(script)?;
        session.launch_program()?;
        session.set_breakpoints(&[6])?;
        session.configuration_done()?;
        let handle = session
            .backend
            .handle_at(SOURCE, 6)
            .ok_or_else(|| anyhow!("breakpoint not installed"))?;
        session.backend.stop(MAIN_THREAD, StopReason::Breakpoint, vec![handle]);
        session.client.wait_for_event("stopped")?;
        Ok(session)
    }

    /// Wait for the session thread and return its result.
    pub fn join(&mut self) -> anyhow::Result<Result<(), AdapterError>> {
        let server = self
            .server
            .take()
            .ok_or_else(|| anyhow!("session already joined"))?;
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while !server.is_finished() {
            if Instant::now() > deadline {
                return Err(anyhow!("session did not finish in time"));
            }
            thread::sleep(Duration::from_millis(10));
        }
        server.join().map_err(|_| anyhow!("session thread panicked"))
    }

    pub fn disconnect(&mut self) -> anyhow::Result<Value> {
        let response = self.client.request("disconnect", json!({}))?;
        self.client.read_to_end()?;
        Ok(response)
    }
}

impl Drop for DapSession {
    fn drop(&mut self) {
        if self.server.is_some() {
            self.client.close();
            let _ = self.join();
        }
    }
}

