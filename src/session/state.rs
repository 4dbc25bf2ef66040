use crate::dap::protocol::Command;
use itertools::Itertools;
use strum_macros::Display;

/// Adapter lifecycle.
///
/// `Uninitialized -> Initialized -> Configuring -> Running <-> Stopped -> Terminated -> Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Configuring,
    Running,
    Stopped,
    Terminated,
    Disconnected,
}

use SessionState::*;

const ANY: &[SessionState] = &[
    Uninitialized,
    Initialized,
    Configuring,
    Running,
    Stopped,
    Terminated,
];
const CONFIGURED: &[SessionState] = &[Initialized, Configuring, Running, Stopped, Terminated];
const DEBUGGEE_ALIVE: &[SessionState] = &[Configuring, Running, Stopped];

impl SessionState {
    /// True once the debuggee is gone or the client left.
    pub fn is_finished(self) -> bool {
        matches!(self, Terminated | Disconnected)
    }

    pub fn debuggee_alive(self) -> bool {
        DEBUGGEE_ALIVE.contains(&self)
    }
}

/// States in which `command` may be handled.
pub fn allowed_states(command: &Command) -> &'static [SessionState] {
    match command {
        Command::Initialize(_) => &[Uninitialized],
        Command::Launch(_) | Command::Attach(_) => &[Initialized],
        Command::SetBreakpoints(_) | Command::SetExceptionBreakpoints(_) => CONFIGURED,
        Command::ConfigurationDone => &[Configuring],
        Command::Continue(_) | Command::Next(_) | Command::StepIn(_) | Command::StepOut(_) => {
            &[Stopped]
        }
        Command::Pause(_) => &[Running, Stopped],
        Command::Threads | Command::Terminate => DEBUGGEE_ALIVE,
        Command::StackTrace(_) | Command::Scopes(_) | Command::Variables(_) | Command::Evaluate(_) => {
            &[Stopped]
        }
        Command::Disconnect(_) => ANY,
    }
}

/// Human readable list of allowed states, used in state errors.
pub fn describe(states: &[SessionState]) -> String {
    match states {
        [single] => single.to_string(),
        many => format!("one of {}", many.iter().join(", ")),
    }
}
