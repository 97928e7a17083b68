//! Fixtures for testing filters against the running kernel.
//!
//! Installing a filter cannot be undone. Every test therefore runs in its own
//! process (see [`test!`]) and the filter itself is installed in a forked child
//! that reports back through its exit status.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use nix::{
    libc,
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, ForkResult},
};
use sealant::{Action, FilterState, SyscallTable};

pub mod logger;
mod macros;

/// Syscalls the process needs to terminate and to log after a filter is
/// installed
pub const ESSENTIAL: &[&str] = &[
    "brk",
    "clock_gettime",
    "exit",
    "exit_group",
    "futex",
    "madvise",
    "mmap",
    "mprotect",
    "munmap",
    "rt_sigprocmask",
    "sigaltstack",
    "write",
];

/// True if the kernel supports filters. Logs a warning otherwise.
pub fn supported() -> bool {
    let available = sealant::seccomp_available();
    if !available {
        warn!("Seccomp filters are not supported by this kernel. Skipping.");
    }
    available
}

/// Allow `names` on the native architecture. Names unknown to the native
/// architecture are skipped.
pub fn allow(filter: &mut FilterState, names: &[&str]) -> Result<()> {
    let table = SyscallTable::builtin();
    for name in names {
        match table.resolve_native(name) {
            Ok(id) => {
                filter.add_rule(id, Action::Allow, vec![])?;
            }
            Err(_) => info!("Skipping {name}: not available on this architecture"),
        }
    }
    Ok(())
}

/// Run `f` in a forked child and return how the child terminated. The child
/// exits with 0 if `f` succeeds and with 1 otherwise.
pub fn forked<F>(f: F) -> Result<WaitStatus>
where
    F: FnOnce() -> Result<()>,
{
    match unsafe { fork() }.context("failed to fork")? {
        ForkResult::Child => {
            let code = match f() {
                Ok(()) => 0,
                Err(e) => {
                    warn!("Child failed: {e:?}");
                    1
                }
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => waitpid(child, None).context("failed to wait"),
    }
}

/// Run `f` in a forked child and fail unless it exits with 0
pub fn in_child<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match forked(f)? {
        WaitStatus::Exited(_, 0) => Ok(()),
        status => bail!("child terminated with {status:?}"),
    }
}
