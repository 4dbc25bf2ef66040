//! Runtime debug backend interface.
//!
//! The session never touches the debuggee directly, every primitive (start, attach,
//! breakpoint installation, execution control, inspection) goes through [`Backend`].
//! Asynchronous debuggee notifications are delivered over the channel handed to
//! [`Backend::launch`] / [`Backend::attach`].

pub mod process;
mod register;

use os_pipe::PipeReader;
use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use strum_macros::Display;

pub type ThreadId = i64;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("program `{0}` not found")]
    ProgramNotFound(String),
    #[error("failed to start debuggee: {0}")]
    Launch(String),
    #[error("failed to attach to process {pid}: {reason}")]
    Attach { pid: u32, reason: String },
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("unknown variables handle {0}")]
    UnknownHandle(u64),
    #[error("debuggee is not running")]
    NotRunning,
    #[error("cannot evaluate `{0}`")]
    Evaluate(String),
    #[error("ptrace: {0}")]
    Ptrace(#[from] nix::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// What the backend can do, reported once at `initialize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendCapabilities {
    /// A stop of one thread stops every thread and a resume resumes all of them.
    pub stop_the_world: bool,
    pub supports_stepping: bool,
    pub supports_pause: bool,
    pub supports_evaluate: bool,
    pub supports_breakpoints: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// `None` removes the variable from the inherited environment.
    pub env: HashMap<String, Option<String>>,
    /// Ignore in-process break instructions and never report a stop.
    pub no_debug: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AttachConfig {
    pub pid: u32,
}

/// Handles to a started debuggee.
///
/// Output pipes are absent for attached processes. The backend must not keep the
/// write ends open, otherwise readers never observe end-of-stream.
#[derive(Debug, Default)]
pub struct DebuggeeIo {
    pub pid: Option<u32>,
    pub stdout: Option<PipeReader>,
    pub stderr: Option<PipeReader>,
}

/// Opaque breakpoint installation handle owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakpointInstall {
    pub handle: BreakpointHandle,
    /// False when the backend resolves the location later, see
    /// [`BackendEvent::BreakpointResolved`].
    pub verified: bool,
}

/// Executable lines of a source file (1-based).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineTable {
    pub executable: BTreeSet<u32>,
    /// Line ranges of functions, used to keep resolution inside the enclosing function.
    pub functions: Vec<RangeInclusive<u32>>,
}

impl LineTable {
    pub fn new(
        executable: impl IntoIterator<Item = u32>,
        functions: impl IntoIterator<Item = RangeInclusive<u32>>,
    ) -> Self {
        Self {
            executable: executable.into_iter().collect(),
            functions: functions.into_iter().collect(),
        }
    }

    /// Nearest executable line at or after `line`, not leaving the innermost
    /// function that contains `line`. A line outside every known function resolves
    /// to nothing. Without function ranges the whole file is one scope.
    pub fn resolve(&self, line: u32) -> Option<u32> {
        let limit = if self.functions.is_empty() {
            u32::MAX
        } else {
            self.functions
                .iter()
                .filter(|f| f.contains(&line))
                .min_by_key(|f| f.end() - f.start())
                .map(|f| *f.end())?
        };
        self.executable.range(line..=limit).next().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StopReason {
    Entry,
    Breakpoint,
    Step,
    Pause,
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StepKind {
    Over,
    In,
    Out,
}

/// Asynchronous debuggee notification.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Stopped {
        thread_id: ThreadId,
        reason: StopReason,
        all_threads_stopped: bool,
        description: Option<String>,
        hit: Vec<BreakpointHandle>,
    },
    Continued {
        thread_id: ThreadId,
        all_threads: bool,
    },
    Exited {
        code: i64,
    },
    BreakpointResolved {
        handle: BreakpointHandle,
        line: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub name: String,
    /// Source path as the debuggee sees it.
    pub source: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// Opaque handle of an expandable value, owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeInfo {
    pub name: String,
    pub handle: VarHandle,
    pub expensive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
    pub children: Option<VarHandle>,
}

/// Primitives of a runtime debugger.
///
/// Calls may block; the session bounds every call with a watchdog and never holds
/// its own state lock across one.
pub trait Backend: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;

    /// Start the debuggee held before its first instruction, it runs on the first
    /// [`Backend::resume`].
    fn launch(
        &self,
        config: &LaunchConfig,
        events: Sender<BackendEvent>,
    ) -> Result<DebuggeeIo, BackendError>;

    /// Attach to a running process and hold it until the first [`Backend::resume`].
    fn attach(
        &self,
        config: &AttachConfig,
        events: Sender<BackendEvent>,
    ) -> Result<DebuggeeIo, BackendError>;

    /// Kill the debuggee. An [`BackendEvent::Exited`] notification follows.
    fn terminate(&self) -> Result<(), BackendError>;

    /// Release the debuggee and let it run freely.
    fn detach(&self) -> Result<(), BackendError>;

    fn is_alive(&self) -> bool;

    fn line_table(&self, source: &str) -> Result<LineTable, BackendError>;

    fn insert_breakpoint(&self, source: &str, line: u32)
        -> Result<BreakpointInstall, BackendError>;

    fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), BackendError>;

    /// Resume one thread, or every thread when `thread` is `None`.
    fn resume(&self, thread: Option<ThreadId>) -> Result<(), BackendError>;

    fn step(&self, thread: ThreadId, kind: StepKind) -> Result<(), BackendError>;

    /// Request an asynchronous stop, a [`BackendEvent::Stopped`] follows.
    fn pause(&self, thread: Option<ThreadId>) -> Result<(), BackendError>;

    fn threads(&self) -> Result<Vec<ThreadInfo>, BackendError>;

    /// Frames of a stopped thread, innermost first.
    fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>, BackendError>;

    fn scopes(&self, thread: ThreadId, frame: usize) -> Result<Vec<ScopeInfo>, BackendError>;

    fn variables(&self, handle: VarHandle) -> Result<Vec<VariableInfo>, BackendError>;

    fn evaluate(
        &self,
        thread: Option<ThreadId>,
        frame: Option<usize>,
        expression: &str,
    ) -> Result<VariableInfo, BackendError>;
}
