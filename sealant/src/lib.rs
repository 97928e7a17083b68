//! Seccomp-BPF policy compiler and loader.
//!
//! A policy is a default [`Action`] plus a list of rules keyed by syscall. Rules
//! are collected in a [`FilterState`], compiled into classic BPF for every
//! target [`Arch`] and installed into the kernel with a single `seccomp(2)` call.
//! Once loaded, a filter is sealed: the kernel cannot drop it again and every
//! further mutation fails with [`Error::FilterSealed`].
//!
//! ```no_run
//! use sealant::{Action, FilterState, KernelInstaller, SyscallTable};
//!
//! # fn main() -> Result<(), sealant::Error> {
//! let table = SyscallTable::builtin();
//! let mut filter = FilterState::new(Action::Errno(1));
//! for name in ["futex", "munmap", "exit_group", "write", "getpid"] {
//!     filter.add_rule(table.resolve_native(name)?, Action::Allow, vec![])?;
//! }
//! let loaded = filter.load(&KernelInstaller::default())?;
//! assert_eq!(loaded.rule_count(), 5);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(
    clippy::all,
    clippy::print_stderr,
    clippy::print_stdout,
    clippy::unwrap_used
)]

/// Seccomp return actions.
mod action;
/// Architecture tags.
mod arch;
/// BPF instructions and programs.
pub mod bpf;
/// Lowering of rule sets into BPF.
pub mod compiler;
/// Error types.
mod error;
/// Filter lifecycle.
mod filter;
/// Linking and installation of compiled programs.
pub mod loader;
/// Rules and rule sets.
mod rule;
/// Syscall name tables.
pub mod syscalls;

#[cfg(test)]
mod emu;

pub use action::Action;
pub use arch::{Arch, Endian};
pub use bpf::{Program, SockFilter};
pub use compiler::{compile, compile_arch, Compiled};
pub use error::{CompileError, Error, LoadError};
pub use filter::{Failure, FilterState, Status};
pub use loader::{link, seccomp_available, Installer, KernelInstaller, LoadOptions, LoadedFilter};
pub use rule::{ArgCmp, CmpOp, Operand, Rule, RuleHandle, RuleSet, ARG_COUNT};
pub use syscalls::{SyscallId, SyscallTable};
