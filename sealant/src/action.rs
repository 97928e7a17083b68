use crate::error::CompileError;
use serde::{Deserialize, Serialize};
use std::fmt;

// From linux/seccomp.h
pub(crate) const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub(crate) const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub(crate) const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub(crate) const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub(crate) const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
pub(crate) const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ACTION_FULL: u32 = 0xffff_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

/// Largest errno the kernel passes back to user space
const MAX_ERRNO: u32 = 4095;

/// What the kernel does with a matching syscall
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Execute the syscall
    Allow,
    /// Fail the syscall with the given errno
    Errno(u32),
    /// Kill the process
    Kill,
    /// Send `SIGSYS` to the calling thread
    Trap,
    /// Execute the syscall and log it
    Log,
    /// Notify a ptrace tracer with the given message
    Trace(u32),
}

impl Action {
    /// Check the data part of the action
    pub fn validate(&self) -> Result<(), CompileError> {
        match *self {
            Action::Errno(errno) if errno > MAX_ERRNO => Err(CompileError::InvalidErrno(errno)),
            Action::Trace(msg) if msg > SECCOMP_RET_DATA => Err(CompileError::InvalidTrace(msg)),
            _ => Ok(()),
        }
    }

    /// `SECCOMP_RET_*` value returned from the filter
    pub fn to_ret(&self) -> Result<u32, CompileError> {
        self.validate()?;
        Ok(match *self {
            Action::Allow => SECCOMP_RET_ALLOW,
            Action::Errno(errno) => SECCOMP_RET_ERRNO | errno,
            Action::Kill => SECCOMP_RET_KILL_PROCESS,
            Action::Trap => SECCOMP_RET_TRAP,
            Action::Log => SECCOMP_RET_LOG,
            Action::Trace(msg) => SECCOMP_RET_TRACE | msg,
        })
    }

    /// Decode a `SECCOMP_RET_*` value. `SECCOMP_RET_KILL_THREAD` and unknown
    /// values are not representable.
    pub fn from_ret(ret: u32) -> Option<Action> {
        let data = ret & SECCOMP_RET_DATA;
        match ret & SECCOMP_RET_ACTION_FULL {
            SECCOMP_RET_ALLOW => Some(Action::Allow),
            SECCOMP_RET_ERRNO if data <= MAX_ERRNO => Some(Action::Errno(data)),
            SECCOMP_RET_KILL_PROCESS => Some(Action::Kill),
            SECCOMP_RET_TRAP => Some(Action::Trap),
            SECCOMP_RET_LOG => Some(Action::Log),
            SECCOMP_RET_TRACE => Some(Action::Trace(data)),
            SECCOMP_RET_KILL_THREAD => None,
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => f.write_str("allow"),
            Action::Errno(errno) => write!(f, "errno({errno})"),
            Action::Kill => f.write_str("kill"),
            Action::Trap => f.write_str("trap"),
            Action::Log => f.write_str("log"),
            Action::Trace(msg) => write!(f, "trace({msg})"),
        }
    }
}
