use crate::{rule::RuleHandle, Arch};
use nix::errno::Errno;
use thiserror::Error;

/// Errors returned by rule set mutation, compilation and loading
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The syscall name has no number on the requested architecture
    #[error("unknown syscall {name} on {arch}")]
    UnknownSyscall {
        /// Syscall name
        name: String,
        /// Architecture the lookup was done for
        arch: Arch,
    },
    /// Argument index out of range
    #[error("invalid argument comparison: argument index {index} is out of range")]
    InvalidArgCmp {
        /// Offending index
        index: u8,
    },
    /// The filter is loaded or failed to load
    #[error("filter is sealed")]
    FilterSealed,
    /// Stale rule handle
    #[error("rule {0} not found")]
    NotFound(RuleHandle),
    /// Lowering rules into BPF failed
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    /// The kernel rejected the program
    #[error("load error: {0}")]
    Load(#[from] LoadError),
}

/// Structural problems found while lowering a rule set
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Errno action data exceeds `MAX_ERRNO`
    #[error("invalid errno value {0}")]
    InvalidErrno(u32),
    /// Trace action data does not fit into `SECCOMP_RET_DATA`
    #[error("invalid trace value {0}")]
    InvalidTrace(u32),
    /// Program exceeds `BPF_MAXINSNS`
    #[error("program has {count} instructions (max {max})")]
    TooManyInstructions {
        /// Instructions needed
        count: usize,
        /// Kernel limit
        max: usize,
    },
    /// No syscall table for a target architecture
    #[error("no syscall table for {0}")]
    NoSyscallTable(Arch),
    /// Empty target architecture set
    #[error("no target architectures")]
    NoArchitectures,
    /// Linking needs a section for every architecture of the rule set
    #[error("missing program for {0}")]
    MissingSection(Arch),
    /// Signed operand does not fit into the argument width of a 32 bit architecture
    #[error("operand {value} of argument {index} does not fit into 32 bit on {arch}")]
    OperandWidth {
        /// Target architecture
        arch: Arch,
        /// Argument index
        index: u8,
        /// Operand
        value: i64,
    },
    /// Conditional jump distance exceeds 255 instructions
    #[error("jump at instruction {0} is out of range")]
    JumpOutOfRange(usize),
}

/// Installation failures. Each variant carries the errno reported by the kernel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// `prctl(PR_SET_NO_NEW_PRIVS)` failed
    #[error("failed to set no_new_privs: {0}")]
    NoNewPrivs(Errno),
    /// The kernel refused the program or the flags
    #[error("invalid program: {0}")]
    InvalidProgram(Errno),
    /// Missing `CAP_SYS_ADMIN` and `no_new_privs` is not set
    #[error("permission denied: {0}")]
    PermissionDenied(Errno),
    /// The filter chain exceeds the kernel's instruction limit
    #[error("filter chain limit exceeded: {0}")]
    ChainLimit(Errno),
    /// Seccomp filtering is not available
    #[error("seccomp is not supported: {0}")]
    Unsupported(Errno),
    /// Thread synchronisation failed for the given thread
    #[error("failed to synchronize thread {0}")]
    ThreadSync(i64),
    /// Program too long for `sock_fprog`
    #[error("program with {0} instructions is too long")]
    TooLong(usize),
    /// Other OS error
    #[error("OS error: {0}")]
    Os(Errno),
}

impl LoadError {
    /// Classify the errno of a failed `seccomp(SECCOMP_SET_MODE_FILTER)` call
    pub(crate) fn from_errno(errno: Errno) -> LoadError {
        match errno {
            Errno::EINVAL | Errno::EFAULT => LoadError::InvalidProgram(errno),
            Errno::EACCES | Errno::EPERM => LoadError::PermissionDenied(errno),
            Errno::ENOMEM => LoadError::ChainLimit(errno),
            Errno::ENOSYS => LoadError::Unsupported(errno),
            errno => LoadError::Os(errno),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_errno() {
        assert_eq!(
            LoadError::from_errno(Errno::EACCES),
            LoadError::PermissionDenied(Errno::EACCES)
        );
        assert_eq!(
            LoadError::from_errno(Errno::EINVAL),
            LoadError::InvalidProgram(Errno::EINVAL)
        );
        assert_eq!(
            LoadError::from_errno(Errno::ENOMEM),
            LoadError::ChainLimit(Errno::ENOMEM)
        );
        assert_eq!(
            LoadError::from_errno(Errno::EBUSY),
            LoadError::Os(Errno::EBUSY)
        );
    }

    #[test]
    fn nested_errors_convert() {
        let error: Error = CompileError::NoArchitectures.into();
        assert_eq!(error, Error::Compile(CompileError::NoArchitectures));
        assert_eq!(error.to_string(), "compile error: no target architectures");
    }
}
