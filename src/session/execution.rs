//! Execution control and inspection.
//!
//! Execution-control requests are split in two: the state transition happens
//! immediately on the request path, the backend call runs on the execution lane and
//! answers when the backend does. Every backend call is bounded by the watchdog.

use crate::backend::{
    BackendError, FrameInfo, StepKind, ThreadId, VarHandle, VariableInfo,
};
use crate::dap::protocol::{
    Command, ContinueResponseBody, EvaluateResponseBody, Scope, ScopesResponseBody, Source,
    StackFrame, StackTraceResponseBody, Thread, ThreadsResponseBody, Variable,
    VariablesResponseBody,
};
use crate::session::error::AdapterError;
use crate::session::state::SessionState;
use crate::session::{body, Handled, SessionCore};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Bounds backend calls.
///
/// The call runs on a helper thread; a wedged backend leaves that thread behind and
/// the caller gets a timeout error.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Duration,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("backend-{operation}"))
            .spawn(move || {
                let _ = tx.send(f());
            })
            .map_err(|e| AdapterError::Internal(format!("spawn backend call: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result.map_err(AdapterError::from),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(target: "execution", "backend call `{operation}` timed out after {:?}", self.timeout);
                Err(AdapterError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::error!(target: "execution", "backend call `{operation}` panicked");
                Err(AdapterError::Panicked(operation))
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Serial worker for execution-control requests.
pub struct Lane {
    tx: Mutex<Option<Sender<Job>>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl Lane {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));
        let worker_pending = pending.clone();
        let spawned = thread::Builder::new()
            .name("execution-lane".to_string())
            .spawn(move || {
                for job in rx {
                    job();
                    let (count, cv) = &*worker_pending;
                    let mut count = count.lock().unwrap_or_else(PoisonError::into_inner);
                    *count = count.saturating_sub(1);
                    cv.notify_all();
                }
            });

        let tx = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                log::error!(target: "execution", "spawn execution lane: {e}, running inline");
                None
            }
        };
        Self {
            tx: Mutex::new(tx),
            pending,
        }
    }

    pub fn submit(&self, job: Job) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(tx) = tx else {
            job();
            return;
        };

        let (count, _) = &*self.pending;
        *count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if let Err(mpsc::SendError(job)) = tx.send(job) {
            *count.lock().unwrap_or_else(PoisonError::into_inner) -= 1;
            job();
        }
    }

    /// Wait until every submitted job finished. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, cv) = &*self.pending;
        let mut count = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            count = match cv.wait_timeout(count, left) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Stop accepting jobs, the worker exits after the queued ones.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Running/stopped status of debuggee threads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadTable {
    /// Whole-process stop. Threads resumed individually since then are in `resumed`.
    all_stopped: bool,
    resumed: BTreeSet<ThreadId>,
    stopped: BTreeSet<ThreadId>,
    /// Threads reported by stop notifications or a thread listing.
    known: BTreeSet<ThreadId>,
}

impl ThreadTable {
    pub fn on_stopped(&mut self, thread: ThreadId, all: bool) {
        self.known.insert(thread);
        if all {
            self.all_stopped = true;
            self.resumed.clear();
            self.stopped.clear();
        } else {
            self.stopped.insert(thread);
            self.resumed.remove(&thread);
        }
    }

    pub fn on_resumed(&mut self, thread: Option<ThreadId>) {
        match thread {
            None => {
                self.all_stopped = false;
                self.resumed.clear();
                self.stopped.clear();
            }
            Some(thread) => {
                self.stopped.remove(&thread);
                if self.all_stopped {
                    self.resumed.insert(thread);
                }
            }
        }
    }

    /// Replace the known thread set with a fresh listing.
    pub fn on_listed(&mut self, threads: impl IntoIterator<Item = ThreadId>) {
        self.known = threads.into_iter().collect();
        self.known.extend(self.stopped.iter().copied());
    }

    pub fn is_stopped(&self, thread: ThreadId) -> bool {
        self.stopped.contains(&thread)
            || (self.all_stopped && self.known.contains(&thread) && !self.resumed.contains(&thread))
    }

    pub fn any_stopped(&self) -> bool {
        self.all_stopped || !self.stopped.is_empty()
    }
}

/// Adapter-assigned frame ids and variable references of the current stop.
///
/// Everything is discarded on resume. Ids keep growing across stops, so an id from
/// an earlier stop is never confused with a current one.
#[derive(Debug, Default)]
pub struct Inspection {
    generation: u64,
    next_id: i64,
    frames: HashMap<i64, (ThreadId, usize)>,
    frame_cache: HashMap<ThreadId, Vec<(i64, FrameInfo)>>,
    references: HashMap<i64, VarHandle>,
}

impl Inspection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.frames.clear();
        self.frame_cache.clear();
        self.references.clear();
    }

    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn cached_frames(&self, thread: ThreadId) -> Option<Vec<(i64, FrameInfo)>> {
        self.frame_cache.get(&thread).cloned()
    }

    /// Cache frames fetched during `generation`. None when a resume happened meanwhile.
    pub fn store_frames(
        &mut self,
        generation: u64,
        thread: ThreadId,
        frames: Vec<FrameInfo>,
    ) -> Option<Vec<(i64, FrameInfo)>> {
        if generation != self.generation {
            return None;
        }
        let frames: Vec<(i64, FrameInfo)> = frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                let id = self.next();
                self.frames.insert(id, (thread, index));
                (id, frame)
            })
            .collect();
        self.frame_cache.insert(thread, frames.clone());
        Some(frames)
    }

    pub fn frame(&self, id: i64) -> Result<(ThreadId, usize), AdapterError> {
        self.frames
            .get(&id)
            .copied()
            .ok_or(AdapterError::UnknownFrame(id))
    }

    pub fn reference(&mut self, generation: u64, handle: VarHandle) -> Option<i64> {
        if generation != self.generation {
            return None;
        }
        let id = self.next();
        self.references.insert(id, handle);
        Some(id)
    }

    pub fn handle(&self, reference: i64) -> Result<VarHandle, AdapterError> {
        self.references
            .get(&reference)
            .copied()
            .ok_or(AdapterError::UnknownReference(reference))
    }
}

/// Thread and stack bookkeeping of the session.
#[derive(Debug, Default)]
pub struct ExecutionController {
    pub threads: ThreadTable,
    pub inspection: Inspection,
    /// Incremented on every reported stop.
    pub stop_epoch: u64,
}

impl ExecutionController {
    pub fn on_stopped(&mut self, thread: ThreadId, all: bool) {
        self.threads.on_stopped(thread, all);
        self.stop_epoch += 1;
    }

    pub fn on_resumed(&mut self, thread: Option<ThreadId>) {
        self.threads.on_resumed(thread);
        self.inspection.invalidate();
    }

    pub fn state(&self) -> SessionState {
        if self.threads.any_stopped() {
            SessionState::Stopped
        } else {
            SessionState::Running
        }
    }
}

enum Motion {
    Continue,
    Step(StepKind),
}

fn file_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

impl SessionCore {
    pub(super) fn handle_execution(
        self: &Arc<Self>,
        seq: i64,
        command: &Command,
    ) -> Result<Handled, AdapterError> {
        match command {
            Command::Continue(args) => {
                self.resume(seq, "continue", args.thread_id, args.single_thread, Motion::Continue)
            }
            Command::Next(args) => {
                self.resume(seq, "next", args.thread_id, true, Motion::Step(StepKind::Over))
            }
            Command::StepIn(args) => {
                self.resume(seq, "stepIn", args.thread_id, true, Motion::Step(StepKind::In))
            }
            Command::StepOut(args) => {
                self.resume(seq, "stepOut", args.thread_id, true, Motion::Step(StepKind::Out))
            }
            Command::Pause(args) => self.pause(seq, args.thread_id),
            Command::Threads => self.threads(),
            Command::StackTrace(args) => self.stack_trace(args.thread_id, args.start_frame, args.levels),
            Command::Scopes(args) => self.scopes(args.frame_id),
            Command::Variables(args) => self.variables(args.variables_reference, args.start, args.count),
            Command::Evaluate(args) => self.evaluate(&args.expression, args.frame_id),
            other => Err(AdapterError::Internal(format!(
                "`{}` routed to execution controller",
                other.name()
            ))),
        }
    }

    fn resume(
        self: &Arc<Self>,
        seq: i64,
        command: &'static str,
        thread: ThreadId,
        single_thread: bool,
        motion: Motion,
    ) -> Result<Handled, AdapterError> {
        let caps = self.backend.capabilities();
        if matches!(motion, Motion::Step(_)) && !caps.supports_stepping {
            return Err(BackendError::Unsupported("stepping").into());
        }
        // a stop-the-world backend always resumes everything
        let target = if caps.stop_the_world || (!single_thread && matches!(motion, Motion::Continue)) {
            None
        } else {
            Some(thread)
        };

        let (snapshot, epoch) = {
            let mut inner = self.lock();
            if !inner.execution.threads.is_stopped(thread) {
                return Err(AdapterError::ThreadNotStopped(thread));
            }
            let snapshot = inner.execution.threads.clone();
            let epoch = inner.execution.stop_epoch;
            inner.execution.on_resumed(target);
            inner.state = inner.execution.state();
            (snapshot, epoch)
        };
        log::debug!(target: "execution", "{command} thread {thread} (target {target:?})");

        let core = self.clone();
        self.lane.submit(Box::new(move || {
            let backend = core.backend.clone();
            let result = match motion {
                Motion::Continue => core.watchdog.call("resume", move || backend.resume(target)),
                Motion::Step(kind) => core.watchdog.call("step", move || backend.step(thread, kind)),
            };

            let reply = match result {
                Ok(()) => body(ContinueResponseBody {
                    all_threads_continued: target.is_none(),
                }),
                Err(e) => {
                    let mut inner = core.lock();
                    // nothing stopped meanwhile, so the old picture is still accurate
                    if inner.execution.stop_epoch == epoch && !inner.state.is_finished() {
                        inner.execution.threads = snapshot;
                        inner.state = inner.execution.state();
                    }
                    Err(e)
                }
            };
            core.finish_request(seq, command, reply);
        }));
        Ok(Handled::Deferred)
    }

    fn pause(self: &Arc<Self>, seq: i64, thread: ThreadId) -> Result<Handled, AdapterError> {
        if !self.backend.capabilities().supports_pause {
            return Err(BackendError::Unsupported("pause").into());
        }
        if self.lock().execution.threads.is_stopped(thread) {
            return Err(AdapterError::ThreadAlreadyStopped(thread));
        }

        let core = self.clone();
        self.lane.submit(Box::new(move || {
            let backend = core.backend.clone();
            let reply = core
                .watchdog
                .call("pause", move || backend.pause(Some(thread)))
                .map(|()| Handled::reply(None));
            core.finish_request(seq, "pause", reply);
        }));
        Ok(Handled::Deferred)
    }

    fn threads(&self) -> Result<Handled, AdapterError> {
        let backend = self.backend.clone();
        let threads = self.watchdog.call("threads", move || backend.threads())?;
        self.lock()
            .execution
            .threads
            .on_listed(threads.iter().map(|t| t.id));
        body(ThreadsResponseBody {
            threads: threads
                .into_iter()
                .map(|t| Thread {
                    id: t.id,
                    name: t.name,
                })
                .collect(),
        })
    }

    fn stack_trace(
        &self,
        thread: ThreadId,
        start_frame: Option<i64>,
        levels: Option<i64>,
    ) -> Result<Handled, AdapterError> {
        let (cached, generation, numbering, source_map) = {
            let inner = self.lock();
            if !inner.execution.threads.is_stopped(thread) {
                return Err(AdapterError::ThreadNotStopped(thread));
            }
            (
                inner.execution.inspection.cached_frames(thread),
                inner.execution.inspection.generation(),
                inner.numbering,
                inner.source_map.clone(),
            )
        };

        let frames = match cached {
            Some(frames) => frames,
            None => {
                let backend = self.backend.clone();
                let fetched = self.watchdog.call("frames", move || backend.frames(thread))?;
                self.lock()
                    .execution
                    .inspection
                    .store_frames(generation, thread, fetched)
                    .ok_or(AdapterError::ThreadNotStopped(thread))?
            }
        };

        let total = frames.len();
        let start = usize::try_from(start_frame.unwrap_or(0)).unwrap_or(0).min(total);
        let count = levels
            .and_then(|l| usize::try_from(l).ok())
            .filter(|l| *l > 0)
            .unwrap_or(total);

        let stack_frames = frames
            .into_iter()
            .skip(start)
            .take(count)
            .map(|(id, frame)| {
                let source = frame.source.as_deref().map(|target| {
                    let path = source_map.map_target_to_client(target);
                    Source {
                        name: file_name(&path),
                        path: Some(path),
                        source_reference: None,
                    }
                });
                StackFrame {
                    id,
                    name: frame.name,
                    presentation_hint: if source.is_none() { Some("subtle") } else { None },
                    source,
                    line: numbering.line_to_client(frame.line),
                    column: numbering.column_to_client(frame.column),
                }
            })
            .collect();

        body(StackTraceResponseBody {
            stack_frames,
            total_frames: total as i64,
        })
    }

    fn scopes(&self, frame_id: i64) -> Result<Handled, AdapterError> {
        let ((thread, index), generation) = {
            let inner = self.lock();
            (
                inner.execution.inspection.frame(frame_id)?,
                inner.execution.inspection.generation(),
            )
        };

        let backend = self.backend.clone();
        let scopes = self.watchdog.call("scopes", move || backend.scopes(thread, index))?;

        let mut inner = self.lock();
        let scopes = scopes
            .into_iter()
            .map(|scope| {
                let reference = inner
                    .execution
                    .inspection
                    .reference(generation, scope.handle)
                    .ok_or(AdapterError::UnknownFrame(frame_id))?;
                Ok(Scope {
                    name: scope.name,
                    variables_reference: reference,
                    expensive: scope.expensive,
                })
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;
        drop(inner);

        body(ScopesResponseBody { scopes })
    }

    fn variables(
        &self,
        reference: i64,
        start: Option<i64>,
        count: Option<i64>,
    ) -> Result<Handled, AdapterError> {
        let (handle, generation) = {
            let inner = self.lock();
            (
                inner.execution.inspection.handle(reference)?,
                inner.execution.inspection.generation(),
            )
        };

        let backend = self.backend.clone();
        let variables = self.watchdog.call("variables", move || backend.variables(handle))?;

        let start = start.and_then(|s| usize::try_from(s).ok()).unwrap_or(0);
        let count = count
            .and_then(|c| usize::try_from(c).ok())
            .filter(|c| *c > 0)
            .unwrap_or(usize::MAX);

        let mut inner = self.lock();
        let variables = variables
            .into_iter()
            .skip(start)
            .take(count)
            .map(|var| {
                child_reference(&mut inner.execution.inspection, generation, &var)
                    .map(|children| Variable {
                        name: var.name,
                        value: var.value,
                        type_name: var.type_name,
                        variables_reference: children,
                    })
                    .ok_or(AdapterError::UnknownReference(reference))
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;
        drop(inner);

        body(VariablesResponseBody { variables })
    }

    fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<Handled, AdapterError> {
        let (frame, generation) = {
            let inner = self.lock();
            let frame = frame_id
                .map(|id| inner.execution.inspection.frame(id))
                .transpose()?;
            (frame, inner.execution.inspection.generation())
        };

        let backend = self.backend.clone();
        let expression = expression.to_string();
        let result = self.watchdog.call("evaluate", move || {
            backend.evaluate(frame.map(|f| f.0), frame.map(|f| f.1), &expression)
        })?;

        // the value itself stays valid even if the debuggee resumed meanwhile
        let reference =
            child_reference(&mut self.lock().execution.inspection, generation, &result).unwrap_or(0);

        body(EvaluateResponseBody {
            result: result.value,
            type_name: result.type_name,
            variables_reference: reference,
        })
    }
}

/// Reference for an expandable value, 0 for a leaf. None if the stop is gone.
fn child_reference(inspection: &mut Inspection, generation: u64, var: &VariableInfo) -> Option<i64> {
    match var.children {
        Some(handle) => inspection.reference(generation, handle),
        None => (generation == inspection.generation()).then_some(0),
    }
}
