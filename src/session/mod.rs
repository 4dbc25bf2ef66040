//! Debug session engine.
//!
//! A [`Session`] serves one client over one byte stream pair. Requests are read and
//! handled on the calling thread, execution-control backend calls run on the execution
//! lane, backend notifications are handled on the event pump thread and debuggee
//! output on one thread per stream. Everything the client sees goes through the
//! [`Emitter`].

mod breakpoints;
mod dispatch;
mod emitter;
pub mod error;
mod execution;
mod output;
pub mod state;

pub use error::AdapterError;
pub use state::SessionState;

use crate::backend::{
    AttachConfig, Backend, BackendError, BackendEvent, BreakpointHandle, BreakpointInstall,
    LaunchConfig, LineTable, StopReason, ThreadId,
};
use crate::dap::protocol::{
    AttachArguments, BreakpointEventBody, BreakpointEventReason, Capabilities,
    ContinuedEventBody, DisconnectArguments, Event, ExitedEventBody, InitializeArguments,
    LaunchArguments, SetBreakpointsArguments, SetBreakpointsResponseBody, StoppedEventBody,
};
use crate::dap::sourcemap::SourceMap;
use crate::dap::tracer::FileTracer;
use crate::dap::transport::{FrameReader, FrameWriter, TransportError};
use crate::dap::Numbering;
use breakpoints::{Apply, BreakpointManager, BreakpointView, Installer, INVALID_LINE};
use dispatch::Flow;
use emitter::Emitter;
use execution::{ExecutionController, Lane, Watchdog};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use output::OutputMultiplexer;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Watchdog bound of every backend call.
    pub request_timeout: Duration,
    /// How long teardown waits for debuggee output to reach end-of-stream.
    pub drain_timeout: Duration,
    /// Protocol traffic tracer.
    pub tracer: Option<FileTracer>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5000),
            drain_timeout: Duration::from_millis(2000),
            tracer: None,
        }
    }
}

/// Result of a request handler.
pub(crate) enum Handled {
    /// Answer now, then emit `then`.
    Reply {
        body: Option<Value>,
        then: Vec<Event>,
    },
    /// The handler answers later by itself.
    Deferred,
}

impl Handled {
    pub(crate) fn reply(body: Option<Value>) -> Self {
        Handled::Reply { body, then: vec![] }
    }
}

pub(crate) fn body<T: Serialize>(body: T) -> Result<Handled, AdapterError> {
    let value = serde_json::to_value(body).map_err(|e| AdapterError::Internal(e.to_string()))?;
    Ok(Handled::reply(Some(value)))
}

#[derive(Debug, Clone, Copy)]
struct Debuggee {
    pid: Option<u32>,
    /// Launched by this session, as opposed to attached.
    launched: bool,
    no_debug: bool,
    stop_on_entry: bool,
}

struct SessionInner {
    state: SessionState,
    numbering: Numbering,
    source_map: SourceMap,
    debuggee: Option<Debuggee>,
    breakpoints: BreakpointManager,
    execution: ExecutionController,
    last_seq: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum Phase {
    #[default]
    Idle,
    Running,
    Done,
}

/// "Already terminating" guard. Only the first caller of [`Teardown::begin`] tears
/// the debuggee down, everyone else waits for it.
#[derive(Default)]
struct Teardown {
    phase: Mutex<Phase>,
    done: Condvar,
}

impl Teardown {
    fn begin(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != Phase::Idle {
            return false;
        }
        *phase = Phase::Running;
        true
    }

    fn finish(&self) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = Phase::Done;
        self.done.notify_all();
    }

    fn started(&self) -> bool {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) != Phase::Idle
    }

    fn wait(&self, timeout: Duration) -> bool {
        let phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let (phase, _) = self
            .done
            .wait_timeout_while(phase, timeout, |phase| *phase != Phase::Done)
            .unwrap_or_else(PoisonError::into_inner);
        *phase == Phase::Done
    }
}

/// Backend access for the breakpoint manager, every call under the watchdog.
struct WatchedInstaller {
    backend: Arc<dyn Backend>,
    watchdog: Watchdog,
}

impl Installer for WatchedInstaller {
    fn line_table(&self, source: &str) -> Result<LineTable, AdapterError> {
        let (backend, source) = (self.backend.clone(), source.to_string());
        self.watchdog.call("line table", move || backend.line_table(&source))
    }

    fn insert(&self, source: &str, line: u32) -> Result<BreakpointInstall, AdapterError> {
        let (backend, source) = (self.backend.clone(), source.to_string());
        self.watchdog
            .call("insert breakpoint", move || backend.insert_breakpoint(&source, line))
    }

    fn remove(&self, handle: BreakpointHandle) -> Result<(), AdapterError> {
        let backend = self.backend.clone();
        self.watchdog
            .call("remove breakpoint", move || backend.remove_breakpoint(handle))
    }
}

pub(crate) struct SessionCore {
    backend: Arc<dyn Backend>,
    config: SessionConfig,
    emitter: Emitter,
    watchdog: Watchdog,
    lane: Lane,
    teardown: Teardown,
    inner: Mutex<SessionInner>,
    output: Mutex<Option<OutputMultiplexer>>,
}

/// One debugging session.
pub struct Session {
    backend: Arc<dyn Backend>,
    config: SessionConfig,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, config: SessionConfig) -> Self {
        Self { backend, config }
    }

    /// Serve one client until it disconnects or the stream ends.
    ///
    /// Returns an error only for fatal faults, after a best-effort `terminated` event.
    pub fn run<R, W>(self, input: R, output: W) -> Result<(), AdapterError>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        let mut reader = FrameReader::new(input, self.config.tracer.clone());
        let emitter = Emitter::start(FrameWriter::new(output, self.config.tracer.clone()));
        let core = Arc::new(SessionCore {
            watchdog: Watchdog::new(self.config.request_timeout),
            backend: self.backend,
            config: self.config,
            emitter,
            lane: Lane::start(),
            teardown: Teardown::default(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                numbering: Numbering::default(),
                source_map: SourceMap::default(),
                debuggee: None,
                breakpoints: BreakpointManager::default(),
                execution: ExecutionController::default(),
                last_seq: None,
            }),
            output: Mutex::new(None),
        });
        log::info!(target: "session", "session started");

        let result = loop {
            match reader.read_frame() {
                Ok(Some(payload)) => match core.dispatch(&payload) {
                    Flow::Continue => {}
                    Flow::Exit => break Ok(()),
                    Flow::Fatal(reason) => {
                        log::error!(target: "session", "fatal: {reason}");
                        core.abort();
                        break Err(AdapterError::Internal(reason));
                    }
                },
                Ok(None) => {
                    log::info!(target: "session", "client closed the stream");
                    core.shutdown(None, false);
                    break Ok(());
                }
                Err(e) => {
                    log::error!(target: "session", "fatal transport error: {e}");
                    core.abort();
                    break Err(e.into());
                }
            }

            if core.emitter.failed() {
                log::error!(target: "session", "client stream is broken");
                core.abort();
                break Err(TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).into());
            }
        };

        core.lane.close();
        core.emitter.shutdown(core.config.drain_timeout);
        log::info!(target: "session", "session finished");
        result
    }
}

fn resolve_program(program: &str, cwd: Option<&Path>) -> Result<PathBuf, AdapterError> {
    if program.trim().is_empty() {
        return Err(AdapterError::InvalidLaunch("`program` must not be empty".to_string()));
    }
    let path = Path::new(program);
    let candidate = match cwd {
        Some(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    };
    if candidate.exists() {
        return Ok(candidate);
    }
    which::which(program)
        .map_err(|_| AdapterError::StartFailed(BackendError::ProgramNotFound(program.to_string())))
}

fn start_error(e: AdapterError) -> AdapterError {
    match e {
        AdapterError::Backend(e) => AdapterError::StartFailed(e),
        other => other,
    }
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn installer(&self) -> WatchedInstaller {
        WatchedInstaller {
            backend: self.backend.clone(),
            watchdog: self.watchdog,
        }
    }

    fn emit_breakpoint(&self, view: &BreakpointView, numbering: Numbering) {
        self.emitter.event(Event::Breakpoint(BreakpointEventBody {
            reason: BreakpointEventReason::Changed,
            breakpoint: view.to_protocol(numbering),
        }));
    }

    fn initialize(&self, args: &InitializeArguments) -> Result<Handled, AdapterError> {
        if let Some(format) = args.path_format.as_deref() {
            if format != "path" {
                return Err(AdapterError::UnsupportedPathFormat(format.to_string()));
            }
        }

        let caps = self.backend.capabilities();
        {
            let mut inner = self.lock();
            inner.numbering = Numbering {
                lines_start_at1: args.lines_start_at1,
                columns_start_at1: args.columns_start_at1,
            };
            inner.state = SessionState::Initialized;
        }
        log::info!(
            target: "session",
            "initialized by {}",
            args.client_name.as_deref().or(args.client_id.as_deref()).unwrap_or("unknown client")
        );

        body(Capabilities {
            supports_configuration_done_request: true,
            supports_terminate_request: true,
            supports_conditional_breakpoints: false,
            supports_evaluate_for_hovers: caps.supports_evaluate,
            supports_stepping_granularity: false,
            supports_single_thread_execution_requests: !caps.stop_the_world,
            supports_delayed_stack_trace_loading: true,
            supports_restart_request: false,
        })
    }

    fn launch(self: &Arc<Self>, args: &LaunchArguments) -> Result<Handled, AdapterError> {
        let program = resolve_program(&args.program, args.cwd.as_deref())?;
        let config = LaunchConfig {
            program,
            args: args.args.clone(),
            cwd: args.cwd.clone(),
            env: args.env.clone(),
            no_debug: args.no_debug,
        };
        log::info!(target: "session", "launch {} (noDebug: {})", config.program.display(), config.no_debug);

        let (tx, rx) = mpsc::channel();
        let backend = self.backend.clone();
        let io = self
            .watchdog
            .call("launch", move || backend.launch(&config, tx))
            .map_err(start_error)?;

        self.debuggee_started(
            Debuggee {
                pid: io.pid,
                launched: true,
                no_debug: args.no_debug,
                stop_on_entry: args.stop_on_entry,
            },
            &args.source_map,
            OutputMultiplexer::start(io.stdout, io.stderr, self.emitter.clone()),
            rx,
        )
    }

    fn attach(self: &Arc<Self>, args: &AttachArguments) -> Result<Handled, AdapterError> {
        let pid = args
            .process_id
            .as_u32()
            .filter(|pid| *pid > 0 && i32::try_from(*pid).is_ok())
            .ok_or_else(|| AdapterError::InvalidProcessId(format!("{:?}", args.process_id)))?;
        match signal::kill(Pid::from_raw(pid as i32), None) {
            Err(Errno::ESRCH) => return Err(AdapterError::ProcessNotFound(pid)),
            // EPERM still proves the process exists
            Ok(()) | Err(_) => {}
        }
        log::info!(target: "session", "attach to {pid}");

        let (tx, rx) = mpsc::channel();
        let backend = self.backend.clone();
        let io = self
            .watchdog
            .call("attach", move || backend.attach(&AttachConfig { pid }, tx))
            .map_err(start_error)?;

        self.debuggee_started(
            Debuggee {
                pid: io.pid.or(Some(pid)),
                launched: false,
                no_debug: false,
                stop_on_entry: false,
            },
            &args.source_map,
            OutputMultiplexer::start(io.stdout, io.stderr, self.emitter.clone()),
            rx,
        )
    }

    fn debuggee_started(
        self: &Arc<Self>,
        debuggee: Debuggee,
        source_map: &HashMap<String, String>,
        output: OutputMultiplexer,
        events: Receiver<BackendEvent>,
    ) -> Result<Handled, AdapterError> {
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Some(output);
        {
            let mut inner = self.lock();
            inner.debuggee = Some(debuggee);
            inner.source_map = SourceMap::new(source_map);
            inner.state = SessionState::Configuring;
        }
        log::info!(target: "session", "debuggee started, pid {:?}", debuggee.pid);

        let core = self.clone();
        thread::Builder::new()
            .name("backend-events".to_string())
            .spawn(move || {
                for event in events {
                    core.on_backend_event(event);
                }
                core.on_backend_gone();
            })
            .map_err(|e| AdapterError::Internal(format!("spawn event pump: {e}")))?;

        Ok(Handled::Reply {
            body: None,
            then: vec![Event::Initialized],
        })
    }

    fn set_breakpoints(&self, args: &SetBreakpointsArguments) -> Result<Handled, AdapterError> {
        let path = args.source.path.clone().ok_or_else(|| AdapterError::InvalidArguments {
            command: "setBreakpoints".to_string(),
            reason: "`source.path` is required".to_string(),
        })?;

        let supported = self.backend.capabilities().supports_breakpoints;
        let (mut checkout, live, hold_message, numbering) = {
            let mut inner = self.lock();
            let numbering = inner.numbering;
            let target = inner.source_map.map_client_to_target(&path);
            let lines: Vec<u32> = args
                .requested_lines()
                .into_iter()
                .map(|line| numbering.line_from_client(line).unwrap_or(INVALID_LINE))
                .collect();
            let no_debug = inner.debuggee.is_some_and(|d| d.no_debug);
            let live = matches!(inner.state, SessionState::Running | SessionState::Stopped)
                && !no_debug
                && supported;
            let hold_message = if !supported {
                Some(BackendError::Unsupported("breakpoint installation").to_string())
            } else if inner.state == SessionState::Terminated {
                Some("debuggee is not running".to_string())
            } else if no_debug {
                Some("breakpoints are ignored in noDebug mode".to_string())
            } else {
                None
            };
            let checkout = inner.breakpoints.checkout(&target, args.source.clone(), &lines)?;
            (checkout, live, hold_message, numbering)
        };

        if checkout.has_changes() {
            log::debug!(target: "breakpoint", "update {path} (live: {live})");
        }
        let installer = self.installer();
        checkout.apply(if live {
            Apply::Live(&installer)
        } else {
            Apply::Hold(hold_message)
        });
        let views = checkout.entry.views();

        let late = self.lock().breakpoints.checkin(checkout);
        for view in &late {
            self.emit_breakpoint(view, numbering);
        }

        body(SetBreakpointsResponseBody {
            breakpoints: views.iter().map(|v| v.to_protocol(numbering)).collect(),
        })
    }

    fn configuration_done(&self) -> Result<Handled, AdapterError> {
        let (debuggee, numbering) = {
            let inner = self.lock();
            (inner.debuggee, inner.numbering)
        };
        let debuggee =
            debuggee.ok_or_else(|| AdapterError::Internal("configuring without a debuggee".to_string()))?;

        if !debuggee.no_debug && self.backend.capabilities().supports_breakpoints {
            let checkouts = self.lock().breakpoints.checkout_all();
            let installer = self.installer();
            for mut checkout in checkouts {
                let changed = checkout.entry.install_pending(&installer);
                let late = self.lock().breakpoints.checkin(checkout);
                for view in changed.iter().chain(late.iter()) {
                    self.emit_breakpoint(view, numbering);
                }
            }
        }

        if debuggee.stop_on_entry && !debuggee.no_debug {
            let backend = self.backend.clone();
            let threads = self.watchdog.call("threads", move || backend.threads())?;
            let thread: ThreadId = threads.first().map(|t| t.id).unwrap_or(1);
            {
                let mut inner = self.lock();
                inner.execution.threads.on_listed(threads.iter().map(|t| t.id));
                inner.execution.on_stopped(thread, true);
                inner.state = SessionState::Stopped;
            }
            return Ok(Handled::Reply {
                body: None,
                then: vec![Event::Stopped(StoppedEventBody {
                    reason: StopReason::Entry.to_string(),
                    description: None,
                    thread_id: Some(thread),
                    all_threads_stopped: true,
                    hit_breakpoint_ids: vec![],
                })],
            });
        }

        self.lock().state = SessionState::Running;
        let backend = self.backend.clone();
        if let Err(e) = self.watchdog.call("resume", move || backend.resume(None)) {
            let mut inner = self.lock();
            if inner.state == SessionState::Running {
                inner.state = SessionState::Configuring;
            }
            return Err(e);
        }
        Ok(Handled::reply(None))
    }

    fn terminate(&self) -> Result<Handled, AdapterError> {
        let backend = self.backend.clone();
        self.watchdog.call("terminate", move || backend.terminate())?;
        Ok(Handled::reply(None))
    }

    fn disconnect(&self, args: &DisconnectArguments) -> Result<Handled, AdapterError> {
        let launched = self.lock().debuggee.map_or(true, |d| d.launched);
        let kill = args.terminate_debuggee.unwrap_or(launched);
        log::info!(target: "session", "disconnect (terminate debuggee: {kill})");

        self.shutdown(Some(kill), false);
        if !self.lane.wait_idle(self.watchdog.timeout()) {
            log::warn!(target: "session", "execution requests still pending at disconnect");
        }
        self.lock().state = SessionState::Disconnected;
        Ok(Handled::reply(None))
    }

    /// Release the debuggee exactly once.
    ///
    /// `kill` picks between terminate and detach, `None` means the default for how
    /// the debuggee was started. `terminated` is announced when a debuggee existed or
    /// when `announce` is set.
    fn shutdown(&self, kill: Option<bool>, announce: bool) {
        if !self.teardown.begin() {
            if !self
                .teardown
                .wait(self.config.drain_timeout + self.watchdog.timeout())
            {
                log::warn!(target: "session", "teardown in progress did not finish in time");
            }
            return;
        }

        let (alive, debuggee) = {
            let inner = self.lock();
            (inner.state.debuggee_alive(), inner.debuggee)
        };
        if alive && !self.backend.is_alive() {
            log::debug!(target: "session", "debuggee already gone, nothing to release");
        } else if alive {
            let kill = kill.unwrap_or_else(|| debuggee.map_or(true, |d| d.launched));
            let backend = self.backend.clone();
            let result = if kill {
                self.watchdog.call("terminate", move || backend.terminate())
            } else {
                self.watchdog.call("detach", move || backend.detach())
            };
            if let Err(e) = result {
                log::warn!(target: "session", "release debuggee: {e}");
            }
        }

        self.release_output();
        {
            let mut inner = self.lock();
            if !inner.state.is_finished() {
                inner.state = SessionState::Terminated;
            }
            inner.breakpoints.debuggee_gone();
        }
        if debuggee.is_some() || announce {
            self.emitter.event(Event::Terminated);
        }
        self.teardown.finish();
    }

    /// Fatal fault path: release everything and tell the client, best effort.
    fn abort(&self) {
        self.shutdown(None, true);
    }

    fn release_output(&self) {
        let output = self
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut output) = output {
            output.drain(self.config.drain_timeout);
        }
    }

    fn on_backend_event(&self, event: BackendEvent) {
        log::debug!(target: "backend", "{event:?}");
        match event {
            BackendEvent::Stopped {
                thread_id,
                reason,
                all_threads_stopped,
                description,
                hit,
            } => self.on_stopped(thread_id, reason, all_threads_stopped, description, &hit),
            BackendEvent::Continued {
                thread_id,
                all_threads,
            } => {
                let mut inner = self.lock();
                if !matches!(inner.state, SessionState::Running | SessionState::Stopped) {
                    return;
                }
                inner
                    .execution
                    .on_resumed(if all_threads { None } else { Some(thread_id) });
                inner.state = inner.execution.state();
                self.emitter.event(Event::Continued(ContinuedEventBody {
                    thread_id,
                    all_threads_continued: all_threads,
                }));
            }
            BackendEvent::Exited { code } => self.on_exited(code),
            BackendEvent::BreakpointResolved { handle, line } => {
                let mut inner = self.lock();
                let numbering = inner.numbering;
                for view in inner.breakpoints.on_resolved(handle, line) {
                    self.emit_breakpoint(&view, numbering);
                }
            }
        }
    }

    fn on_stopped(
        &self,
        thread_id: ThreadId,
        reason: StopReason,
        all: bool,
        description: Option<String>,
        hit: &[BreakpointHandle],
    ) {
        let mut inner = self.lock();
        if self.teardown.started()
            || !matches!(inner.state, SessionState::Running | SessionState::Stopped)
        {
            log::debug!(target: "execution", "stop ({reason}) in state {} ignored", inner.state);
            return;
        }

        if inner.debuggee.is_some_and(|d| d.no_debug) {
            drop(inner);
            log::info!(target: "execution", "stop ({reason}) ignored in noDebug mode");
            let backend = self.backend.clone();
            if let Err(e) = self.watchdog.call("resume", move || backend.resume(None)) {
                log::warn!(target: "execution", "resume after ignored stop: {e}");
            }
            return;
        }

        inner.execution.on_stopped(thread_id, all);
        inner.state = SessionState::Stopped;
        let hit_breakpoint_ids = inner.breakpoints.hit_ids(hit);
        log::info!(target: "execution", "thread {thread_id} stopped ({reason})");
        self.emitter.event(Event::Stopped(StoppedEventBody {
            reason: reason.to_string(),
            description,
            thread_id: Some(thread_id),
            all_threads_stopped: all,
            hit_breakpoint_ids,
        }));
    }

    /// Natural or unexpected end of the debuggee: output, then `exited`, then
    /// `terminated`, once.
    fn on_exited(&self, code: i64) {
        if !self.teardown.begin() {
            return;
        }
        log::info!(target: "session", "debuggee exited with code {code}");
        {
            let mut inner = self.lock();
            if !inner.state.is_finished() {
                inner.state = SessionState::Terminated;
            }
            inner.breakpoints.debuggee_gone();
        }
        self.release_output();
        self.emitter.event(Event::Exited(ExitedEventBody { exit_code: code }));
        self.emitter.event(Event::Terminated);
        self.teardown.finish();
    }

    fn on_backend_gone(&self) {
        if !self.teardown.started() {
            log::warn!(target: "backend", "event channel closed without an exit notification");
            self.on_exited(-1);
        }
    }
}
