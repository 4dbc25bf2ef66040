//! Native process backend built on ptrace.
//!
//! All ptrace requests are made by one dedicated tracer thread: the thread that starts
//! or seizes the debuggee is its tracer, so launch, attach and every later request run
//! there. The tracer thread also polls `waitpid` and turns thread status changes into
//! [`BackendEvent`] notifications.
//!
//! The backend has no debug information, so it can't resolve source lines, install
//! breakpoints or step. Its stops come from signals: a pause request delivers
//! `SIGSTOP`, a `SIGTRAP` (for example a compiled-in break instruction) is reported as
//! a breakpoint hit, any other signal as an exception. Every stop stops all threads.

use crate::backend::register::{Register, RegisterMap};
use crate::backend::{
    AttachConfig, Backend, BackendCapabilities, BackendError, BackendEvent, BreakpointHandle,
    BreakpointInstall, DebuggeeIo, FrameInfo, LaunchConfig, LineTable, ScopeInfo, StepKind,
    StopReason, ThreadId, ThreadInfo, VarHandle, VariableInfo,
};
use nix::errno::Errno;
use nix::libc;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use os_pipe::PipeReader;
use std::collections::{BTreeMap, HashSet};
use std::iter;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use strum::IntoEnumIterator;
use sysinfo::{RefreshKind, System};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Signals passed straight to the debuggee without a stop.
static QUIET_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

/// Fail early when the kernel forbids ptrace for everyone.
pub fn probe() -> Result<(), BackendError> {
    match std::fs::read_to_string(PTRACE_SCOPE) {
        Ok(scope) if scope.trim() == "3" => Err(BackendError::Unavailable(format!(
            "ptrace is disabled ({PTRACE_SCOPE} = 3)"
        ))),
        _ => Ok(()),
    }
}

type Reply<T> = Sender<Result<T, BackendError>>;

enum Request {
    Resume(Reply<()>),
    Pause(Pid, Reply<()>),
    Kill(Reply<()>),
    Detach(Reply<()>),
    Registers(Pid, Reply<RegisterMap>),
}

/// State visible to both the backend and its tracer thread.
#[derive(Default)]
struct Shared {
    pid: AtomicI64,
    alive: AtomicBool,
    /// Thread of the latest reported stop.
    focus: AtomicI64,
}

impl Shared {
    fn pid(&self) -> Result<Pid, BackendError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BackendError::NotRunning);
        }
        Ok(Pid::from_raw(self.pid.load(Ordering::SeqCst) as i32))
    }
}

pub struct ProcessBackend {
    timeout: Duration,
    requests: Mutex<Option<Sender<Request>>>,
    shared: Arc<Shared>,
}

impl ProcessBackend {
    /// `timeout` bounds every round trip to the tracer thread.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            requests: Mutex::new(None),
            shared: Arc::new(Shared::default()),
        }
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, BackendError> {
        let requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BackendError::NotRunning)?;

        let (tx, rx) = mpsc::channel();
        requests
            .send(make(tx))
            .map_err(|_| BackendError::NotRunning)?;
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BackendError::Unavailable(
                "tracer thread does not respond".to_string(),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(BackendError::NotRunning),
        }
    }

    /// Start the tracer thread, `init` runs on it and produces the traced debuggee.
    fn start_tracer<F>(
        &self,
        events: Sender<BackendEvent>,
        no_debug: bool,
        init: F,
    ) -> Result<DebuggeeIo, BackendError>
    where
        F: FnOnce() -> Result<Started, BackendError> + Send + 'static,
    {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        if requests.is_some() {
            return Err(BackendError::Unavailable(
                "a debuggee is already attached to this backend".to_string(),
            ));
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("tracer".to_string())
            .spawn(move || match init() {
                Ok(started) => {
                    let tracer = Tracer::new(&started, no_debug, events, shared);
                    let _ = ready_tx.send(Ok(DebuggeeIo {
                        pid: Some(started.pid.as_raw() as u32),
                        stdout: started.stdout,
                        stderr: started.stderr,
                    }));
                    tracer.run(rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let io = match ready_rx.recv_timeout(self.timeout) {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Unavailable(
                    "tracer thread did not report the debuggee".to_string(),
                ))
            }
        };
        *requests = Some(tx);
        Ok(io)
    }
}

/// A traced debuggee, held in a ptrace stop.
struct Started {
    pid: Pid,
    threads: Vec<Pid>,
    launched: bool,
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
}

/// Fork and exec the program as a tracee of the calling thread.
///
/// Returns after the exec stop, before the first debuggee instruction.
fn spawn_traced(config: &LaunchConfig) -> Result<Started, BackendError> {
    let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
    let (stderr_reader, stderr_writer) = os_pipe::pipe()?;

    let mut debuggee_cmd = Command::new(&config.program);
    debuggee_cmd
        .args(&config.args)
        .stdin(Stdio::null())
        .stdout(stdout_writer)
        .stderr(stderr_writer);
    if let Some(cwd) = config.cwd.as_deref() {
        debuggee_cmd.current_dir(cwd);
    }
    for (key, value) in &config.env {
        match value {
            Some(value) => debuggee_cmd.env(key, value),
            None => debuggee_cmd.env_remove(key),
        };
    }

    unsafe {
        debuggee_cmd.pre_exec(|| {
            sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
            sys::ptrace::traceme()?;
            Ok(())
        });
    }

    let child = debuggee_cmd
        .spawn()
        .map_err(|e| BackendError::Launch(format!("{}: {e}", config.program.display())))?;
    // the parent copies of the pipe write ends live in the command
    drop(debuggee_cmd);
    let pid = Pid::from_raw(child.id() as i32);

    match waitpid(pid, None)? {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
        status => {
            return Err(BackendError::Launch(format!(
                "unexpected debuggee status after exec: {status:?}"
            )))
        }
    }
    sys::ptrace::setoptions(
        pid,
        Options::PTRACE_O_EXITKILL.union(Options::PTRACE_O_TRACECLONE),
    )?;
    log::debug!(target: "backend", "debuggee {pid} held at exec stop");

    Ok(Started {
        pid,
        threads: vec![pid],
        launched: true,
        stdout: Some(stdout_reader),
        stderr: Some(stderr_reader),
    })
}

/// Seize every thread of a running process and interrupt it.
fn seize(pid: Pid) -> Result<Started, BackendError> {
    let attach_err = |reason: String| BackendError::Attach {
        pid: pid.as_raw() as u32,
        reason,
    };

    let sys = System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
    let process = sys
        .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
        .ok_or_else(|| attach_err("no such process".to_string()))?;

    let mut interrupted = Vec::new();
    // two rounds, threads spawned during the first one are caught by the second
    for _ in 0..2 {
        let threads: Vec<Pid> = iter::once(pid)
            .chain(
                process
                    .tasks()
                    .into_iter()
                    .flatten()
                    .map(|tid| Pid::from_raw(tid.as_u32() as i32)),
            )
            .filter(|tid| !interrupted.contains(tid))
            .collect();

        for tid in &threads {
            sys::ptrace::seize(*tid, Options::PTRACE_O_TRACECLONE)
                .map_err(|e| attach_err(e.to_string()))?;
        }
        for tid in &threads {
            sys::ptrace::interrupt(*tid).map_err(|e| attach_err(e.to_string()))?;
        }
        for tid in &threads {
            let status = waitpid(*tid, Some(WaitPidFlag::__WALL))
                .map_err(|e| attach_err(e.to_string()))?;
            log::debug!(target: "backend", "seized thread {tid}: {status:?}");
        }
        interrupted.extend(threads);
    }

    Ok(Started {
        pid,
        threads: interrupted,
        launched: false,
        stdout: None,
        stderr: None,
    })
}

fn tgkill(pid: Pid, tid: Pid, signal: Signal) -> nix::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            pid.as_raw(),
            tid.as_raw(),
            signal as libc::c_int,
        )
    };
    Errno::result(ret).map(drop)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TraceeStatus {
    Running,
    /// In a ptrace stop, `pending` is re-delivered on resume.
    Stopped { pending: Option<Signal> },
}

struct Tracer {
    pid: Pid,
    launched: bool,
    no_debug: bool,
    events: Sender<BackendEvent>,
    shared: Arc<Shared>,
    threads: BTreeMap<Pid, TraceeStatus>,
    /// New threads whose first stop has not been seen yet.
    starting: HashSet<Pid>,
    /// Threads with a group-stop `SIGSTOP` still queued.
    stray_stops: HashSet<Pid>,
    finished: bool,
}

impl Tracer {
    fn new(
        started: &Started,
        no_debug: bool,
        events: Sender<BackendEvent>,
        shared: Arc<Shared>,
    ) -> Self {
        shared.pid.store(started.pid.as_raw() as i64, Ordering::SeqCst);
        shared.focus.store(started.pid.as_raw() as i64, Ordering::SeqCst);
        shared.alive.store(true, Ordering::SeqCst);
        Self {
            pid: started.pid,
            launched: started.launched,
            no_debug,
            events,
            shared,
            threads: started
                .threads
                .iter()
                .map(|tid| (*tid, TraceeStatus::Stopped { pending: None }))
                .collect(),
            starting: HashSet::new(),
            stray_stops: HashSet::new(),
            finished: false,
        }
    }

    fn run(mut self, requests: Receiver<Request>) {
        log::info!(target: "backend", "tracing {} (launched: {})", self.pid, self.launched);
        while !self.finished {
            match requests.recv_timeout(POLL_INTERVAL) {
                Ok(request) => self.handle(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.finished {
                self.poll();
            }
        }
        self.shared.alive.store(false, Ordering::SeqCst);
        log::info!(target: "backend", "tracer for {} finished", self.pid);
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Resume(reply) => {
                let _ = reply.send(self.resume_all());
            }
            Request::Pause(tid, reply) => {
                let result = if self.threads.values().all(|s| *s != TraceeStatus::Running) {
                    Ok(())
                } else {
                    tgkill(self.pid, tid, Signal::SIGSTOP).map_err(BackendError::from)
                };
                let _ = reply.send(result);
            }
            Request::Kill(reply) => {
                let result = sys::signal::kill(self.pid, Signal::SIGKILL).map_err(BackendError::from);
                let _ = reply.send(result);
            }
            Request::Detach(reply) => {
                let _ = reply.send(self.detach());
            }
            Request::Registers(tid, reply) => {
                let result = match self.threads.get(&tid) {
                    None => Err(BackendError::UnknownThread(tid.as_raw() as ThreadId)),
                    Some(TraceeStatus::Running) => Err(BackendError::NotRunning),
                    Some(TraceeStatus::Stopped { .. }) => sys::ptrace::getregs(tid)
                        .map(RegisterMap::from)
                        .map_err(BackendError::from),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn resume_all(&mut self) -> Result<(), BackendError> {
        for (tid, status) in self.threads.iter_mut() {
            let TraceeStatus::Stopped { pending } = *status else {
                continue;
            };
            match sys::ptrace::cont(*tid, pending) {
                Ok(()) => *status = TraceeStatus::Running,
                // thread is gone, waitpid reports it later
                Err(Errno::ESRCH) => log::warn!(target: "backend", "thread {tid} not found, ESRCH"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn detach(&mut self) -> Result<(), BackendError> {
        self.stop_all(None);
        for (tid, status) in &self.threads {
            let pending = match status {
                TraceeStatus::Stopped { pending } => *pending,
                TraceeStatus::Running => None,
            };
            if let Err(e) = sys::ptrace::detach(*tid, pending) {
                log::warn!(target: "backend", "detach thread {tid}: {e}");
            }
        }
        log::info!(target: "backend", "detached from {}", self.pid);
        self.threads.clear();
        self.finished = true;
        self.shared.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&mut self) {
        while !self.finished {
            let status = match waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            ) {
                Ok(WaitStatus::StillAlive) => return,
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    log::warn!(target: "backend", "no traced threads left");
                    self.finish(-1);
                    return;
                }
                Err(e) => {
                    log::warn!(target: "backend", "waitpid: {e}");
                    return;
                }
            };
            log::debug!(target: "backend", "thread status: {status:?}");
            self.apply(status);
        }
    }

    fn cont(&mut self, tid: Pid, signal: Option<Signal>) {
        match sys::ptrace::cont(tid, signal) {
            Ok(()) => {
                self.threads.insert(tid, TraceeStatus::Running);
            }
            Err(e) => log::warn!(target: "backend", "continue thread {tid}: {e}"),
        }
    }

    fn apply(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(tid, code) => self.thread_gone(tid, code as i64),
            WaitStatus::Signaled(tid, signal, _) => self.thread_gone(tid, 128 + signal as i64),
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
                match sys::ptrace::getevent(tid) {
                    Ok(new) => {
                        let new = Pid::from_raw(new as libc::pid_t);
                        log::debug!(target: "backend", "thread {new} created");
                        self.starting.insert(new);
                    }
                    Err(e) => log::warn!(target: "backend", "clone event of {tid}: {e}"),
                }
                self.cont(tid, None);
            }
            WaitStatus::PtraceEvent(tid, _, _) => {
                // first stop of a seized thread, or an event we don't trace
                self.starting.remove(&tid);
                self.cont(tid, None);
            }
            WaitStatus::Stopped(tid, Signal::SIGSTOP)
                if self.starting.remove(&tid)
                    || self.stray_stops.remove(&tid)
                    || !self.threads.contains_key(&tid) =>
            {
                self.cont(tid, None);
            }
            WaitStatus::Stopped(tid, signal) if QUIET_SIGNALS.contains(&signal) => {
                self.cont(tid, Some(signal));
            }
            WaitStatus::Stopped(tid, signal) if self.no_debug => {
                let deliver = !matches!(signal, Signal::SIGTRAP | Signal::SIGSTOP);
                self.cont(tid, deliver.then_some(signal));
            }
            WaitStatus::Stopped(tid, signal) => self.stop(tid, signal),
            other => log::debug!(target: "backend", "ignored wait status {other:?}"),
        }
    }

    fn stop(&mut self, tid: Pid, signal: Signal) {
        let (reason, pending, description) = match signal {
            Signal::SIGSTOP => (StopReason::Pause, None, None),
            Signal::SIGTRAP => (StopReason::Breakpoint, None, None),
            other => (
                StopReason::Exception,
                Some(other),
                Some(format!("thread {tid} received {other}")),
            ),
        };
        self.threads.insert(tid, TraceeStatus::Stopped { pending });
        self.stop_all(Some(tid));
        if self.finished {
            return;
        }

        log::info!(target: "backend", "thread {tid} stopped by {signal}");
        self.shared.focus.store(tid.as_raw() as i64, Ordering::SeqCst);
        let _ = self.events.send(BackendEvent::Stopped {
            thread_id: tid.as_raw() as ThreadId,
            reason,
            all_threads_stopped: true,
            description,
            hit: vec![],
        });
    }

    /// Bring every running thread into a ptrace stop.
    fn stop_all(&mut self, initiator: Option<Pid>) {
        // two rounds, threads cloned during the first one are caught by the second
        for _ in 0..2 {
            let running: Vec<Pid> = self
                .threads
                .iter()
                .filter(|(tid, status)| {
                    Some(**tid) != initiator && **status == TraceeStatus::Running
                })
                .map(|(tid, _)| *tid)
                .chain(self.starting.iter().copied())
                .collect();

            for tid in running {
                if !self.starting.contains(&tid) {
                    if let Err(e) = tgkill(self.pid, tid, Signal::SIGSTOP) {
                        log::warn!(target: "backend", "stop thread {tid}: {e}");
                        self.threads.remove(&tid);
                        continue;
                    }
                }
                self.wait_stopped(tid);
                if self.finished {
                    return;
                }
            }
        }
    }

    fn wait_stopped(&mut self, tid: Pid) {
        loop {
            let status = match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(e) => {
                    log::warn!(target: "backend", "wait for thread {tid}: {e}");
                    self.threads.remove(&tid);
                    self.starting.remove(&tid);
                    return;
                }
            };

            match status {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                    self.starting.remove(&tid);
                    self.threads.insert(tid, TraceeStatus::Stopped { pending: None });
                    return;
                }
                WaitStatus::PtraceEvent(_, _, code) if self.starting.remove(&tid) => {
                    log::debug!(target: "backend", "thread {tid} started with event {code}");
                    self.threads.insert(tid, TraceeStatus::Stopped { pending: None });
                    return;
                }
                WaitStatus::Stopped(_, signal) => {
                    // our SIGSTOP is still queued behind this signal
                    self.stray_stops.insert(tid);
                    let pending = (signal != Signal::SIGTRAP).then_some(signal);
                    self.threads.insert(tid, TraceeStatus::Stopped { pending });
                    return;
                }
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_CLONE) => {
                    if let Ok(new) = sys::ptrace::getevent(tid) {
                        self.starting.insert(Pid::from_raw(new as libc::pid_t));
                    }
                    if let Err(e) = sys::ptrace::cont(tid, None) {
                        log::warn!(target: "backend", "continue thread {tid}: {e}");
                        return;
                    }
                }
                WaitStatus::Exited(_, code) => {
                    self.thread_gone(tid, code as i64);
                    return;
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.thread_gone(tid, 128 + signal as i64);
                    return;
                }
                _ => {
                    if let Err(e) = sys::ptrace::cont(tid, None) {
                        log::warn!(target: "backend", "continue thread {tid}: {e}");
                        return;
                    }
                }
            }
        }
    }

    fn thread_gone(&mut self, tid: Pid, code: i64) {
        self.threads.remove(&tid);
        self.starting.remove(&tid);
        self.stray_stops.remove(&tid);
        if tid == self.pid {
            self.finish(code);
        }
    }

    fn finish(&mut self, code: i64) {
        if self.finished {
            return;
        }
        log::info!(target: "backend", "debuggee {} exited with code {code}", self.pid);
        self.finished = true;
        self.shared.alive.store(false, Ordering::SeqCst);
        let _ = self.events.send(BackendEvent::Exited { code });
    }
}

fn register_variable(name: String, map: &RegisterMap, register: Register) -> VariableInfo {
    VariableInfo {
        name,
        value: format!("{:#x}", map.value(register)),
        type_name: Some("u64".to_string()),
        children: None,
    }
}

impl ProcessBackend {
    fn registers(&self, thread: ThreadId) -> Result<RegisterMap, BackendError> {
        let tid = Pid::from_raw(thread as i32);
        self.request(|reply| Request::Registers(tid, reply))
    }
}

impl Backend for ProcessBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            stop_the_world: true,
            supports_stepping: false,
            supports_pause: true,
            supports_evaluate: true,
            supports_breakpoints: false,
        }
    }

    fn launch(
        &self,
        config: &LaunchConfig,
        events: Sender<BackendEvent>,
    ) -> Result<DebuggeeIo, BackendError> {
        let config = config.clone();
        let no_debug = config.no_debug;
        self.start_tracer(events, no_debug, move || spawn_traced(&config))
    }

    fn attach(
        &self,
        config: &AttachConfig,
        events: Sender<BackendEvent>,
    ) -> Result<DebuggeeIo, BackendError> {
        let pid = Pid::from_raw(config.pid as i32);
        self.start_tracer(events, false, move || seize(pid))
    }

    fn terminate(&self) -> Result<(), BackendError> {
        self.request(Request::Kill)
    }

    fn detach(&self) -> Result<(), BackendError> {
        self.request(Request::Detach)
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn line_table(&self, _source: &str) -> Result<LineTable, BackendError> {
        Err(BackendError::Unsupported("source line resolution"))
    }

    fn insert_breakpoint(
        &self,
        _source: &str,
        _line: u32,
    ) -> Result<BreakpointInstall, BackendError> {
        Err(BackendError::Unsupported("source breakpoints"))
    }

    fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), BackendError> {
        Err(BackendError::UnknownHandle(handle.0))
    }

    fn resume(&self, _thread: Option<ThreadId>) -> Result<(), BackendError> {
        self.request(Request::Resume)
    }

    fn step(&self, _thread: ThreadId, _kind: StepKind) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("stepping"))
    }

    fn pause(&self, thread: Option<ThreadId>) -> Result<(), BackendError> {
        let pid = self.shared.pid()?;
        let tid = thread.map_or(pid, |t| Pid::from_raw(t as i32));
        self.request(|reply| Request::Pause(tid, reply))
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>, BackendError> {
        let pid = self.shared.pid()?;
        let sys = System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
        let process = sys
            .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(BackendError::NotRunning)?;

        let mut tids: Vec<u32> = iter::once(pid.as_raw() as u32)
            .chain(process.tasks().into_iter().flatten().map(|t| t.as_u32()))
            .collect();
        tids.sort_unstable();
        tids.dedup();

        Ok(tids
            .into_iter()
            .map(|tid| ThreadInfo {
                id: tid as ThreadId,
                name: sys
                    .process(sysinfo::Pid::from_u32(tid))
                    .map(|task| task.name().to_string())
                    .unwrap_or_else(|| format!("thread {tid}")),
            })
            .collect())
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>, BackendError> {
        let registers = self.registers(thread)?;
        Ok(vec![FrameInfo {
            name: format!("{:#x}", registers.pc()),
            source: None,
            line: 0,
            column: 0,
        }])
    }

    fn scopes(&self, thread: ThreadId, frame: usize) -> Result<Vec<ScopeInfo>, BackendError> {
        if frame != 0 {
            return Ok(vec![]);
        }
        Ok(vec![ScopeInfo {
            name: "Registers".to_string(),
            handle: VarHandle(thread as u64),
            expensive: false,
        }])
    }

    fn variables(&self, handle: VarHandle) -> Result<Vec<VariableInfo>, BackendError> {
        let registers = self
            .registers(handle.0 as ThreadId)
            .map_err(|e| match e {
                BackendError::UnknownThread(_) => BackendError::UnknownHandle(handle.0),
                e => e,
            })?;
        Ok(Register::iter()
            .map(|register| register_variable(register.to_string(), &registers, register))
            .collect())
    }

    fn evaluate(
        &self,
        thread: Option<ThreadId>,
        _frame: Option<usize>,
        expression: &str,
    ) -> Result<VariableInfo, BackendError> {
        let name = expression.trim().trim_start_matches('$');
        let register = Register::from_str(name)
            .map_err(|_| BackendError::Evaluate(expression.to_string()))?;
        let thread = thread.unwrap_or_else(|| self.shared.focus.load(Ordering::SeqCst));
        let registers = self.registers(thread)?;
        Ok(register_variable(expression.trim().to_string(), &registers, register))
    }
}
