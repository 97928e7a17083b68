//! Linking of compiled sections and installation into the kernel.

use crate::{
    bpf::{bpf_load, bpf_ret, Program, BPF_JEQ, BPF_MAXINSNS},
    compiler::{Assembler, Compiled, Target},
    error::{CompileError, LoadError},
    Action, Arch,
};
use log::{debug, info};
use nix::{errno::Errno, libc};
use serde::{Deserialize, Serialize};
use std::{ptr, sync::Arc};

// From linux/seccomp.h
const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_FILTER_FLAG_TSYNC: libc::c_ulong = 1;
const SECCOMP_FILTER_FLAG_LOG: libc::c_ulong = 2;

/// Link the sections of `compiled` into a single program. The program
/// dispatches on `seccomp_data.arch` and returns `bad_arch` for calls made with
/// an architecture that has no section.
pub fn link(compiled: &Compiled, bad_arch: Action) -> Result<Program, CompileError> {
    if compiled.is_empty() {
        return Err(CompileError::NoArchitectures);
    }

    let mut asm = Assembler::default();
    asm.stmt(bpf_load(memoffset::offset_of!(libc::seccomp_data, arch) as u32));

    let sections = compiled
        .iter()
        .map(|(arch, program)| {
            let section = asm.label();
            let next = asm.label();
            asm.jump(BPF_JEQ, arch.audit(), Target::Next, Target::Label(next));
            asm.ja(section);
            asm.bind(next);
            (section, program)
        })
        .collect::<Vec<_>>();
    asm.stmt(bpf_ret(bad_arch.to_ret()?));

    for (section, program) in sections {
        asm.bind(section);
        program.instructions().iter().for_each(|insn| asm.stmt(*insn));
    }

    let list = asm.finish()?;
    if list.len() > BPF_MAXINSNS {
        return Err(CompileError::TooManyInstructions {
            count: list.len(),
            max: BPF_MAXINSNS,
        });
    }
    Ok(Program::new(list))
}

/// Installs a linked program as the active filter of the calling thread group
pub trait Installer {
    /// Install `program`. Either the whole program is installed or nothing.
    fn install(&self, program: &Program) -> Result<(), LoadError>;
}

/// Options for [`KernelInstaller`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadOptions {
    /// Set `PR_SET_NO_NEW_PRIVS` before installing. Without it the caller
    /// needs `CAP_SYS_ADMIN`.
    #[serde(default = "default_true")]
    pub no_new_privs: bool,
    /// Synchronize the filter to all threads of the process
    #[serde(default = "default_true")]
    pub tsync: bool,
    /// Log all actions except allow
    #[serde(default)]
    pub log: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoadOptions {
    fn default() -> LoadOptions {
        LoadOptions {
            no_new_privs: true,
            tsync: true,
            log: false,
        }
    }
}

/// Installs filters with `seccomp(2)`
#[derive(Clone, Debug, Default)]
pub struct KernelInstaller {
    options: LoadOptions,
}

impl KernelInstaller {
    /// Installer with `options`
    pub fn new(options: LoadOptions) -> KernelInstaller {
        KernelInstaller { options }
    }

    /// Options in use
    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    fn flags(&self) -> libc::c_ulong {
        let mut flags = 0;
        if self.options.tsync {
            flags |= SECCOMP_FILTER_FLAG_TSYNC;
        }
        if self.options.log {
            flags |= SECCOMP_FILTER_FLAG_LOG;
        }
        flags
    }
}

impl Installer for KernelInstaller {
    fn install(&self, program: &Program) -> Result<(), LoadError> {
        let len = u16::try_from(program.len())
            .ok()
            .filter(|len| *len as usize <= BPF_MAXINSNS)
            .ok_or(LoadError::TooLong(program.len()))?;

        if self.options.no_new_privs {
            let result =
                unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) };
            Errno::result(result).map_err(LoadError::NoNewPrivs)?;
        }

        // Convert the list of instructions into the libc sock_filter
        let list = program
            .instructions()
            .iter()
            .map(Into::into)
            .collect::<Vec<libc::sock_filter>>();
        let sf_prog = libc::sock_fprog {
            len,
            filter: list.as_ptr() as *mut libc::sock_filter,
        };

        debug!(
            "Installing seccomp filter with {} instructions (flags {:#x})",
            len,
            self.flags()
        );
        let result = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                self.flags(),
                &sf_prog as *const libc::sock_fprog,
            )
        };
        match result {
            0 => Ok(()),
            -1 => Err(LoadError::from_errno(Errno::last())),
            // With TSYNC the kernel returns the id of the thread that failed to synchronize
            tid => Err(LoadError::ThreadSync(i64::from(tid))),
        }
    }
}

/// Probe whether the kernel supports seccomp filters. Does not modify the
/// filter of the calling process.
pub fn seccomp_available() -> bool {
    // Passing a null program fails with EFAULT if filters are supported
    let result = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_ulong,
            ptr::null::<libc::sock_fprog>(),
        )
    };
    result == -1 && Errno::last() == Errno::EFAULT
}

#[derive(Debug)]
struct Inner {
    default: Action,
    rule_count: usize,
    archs: Vec<Arch>,
    program: Program,
}

/// Proof that a filter has been installed. Read only.
#[derive(Clone, Debug)]
pub struct LoadedFilter {
    inner: Arc<Inner>,
}

impl LoadedFilter {
    pub(crate) fn new(
        default: Action,
        rule_count: usize,
        archs: Vec<Arch>,
        program: Program,
    ) -> LoadedFilter {
        info!(
            "Loaded seccomp filter with {rule_count} rules for {} architecture(s)",
            archs.len()
        );
        LoadedFilter {
            inner: Arc::new(Inner {
                default,
                rule_count,
                archs,
                program,
            }),
        }
    }

    /// Action for syscalls without a matching rule
    pub fn default_action(&self) -> Action {
        self.inner.default
    }

    /// Number of rules in the rule set at load time
    pub fn rule_count(&self) -> usize {
        self.inner.rule_count
    }

    /// Architectures covered by the filter
    pub fn archs(&self) -> &[Arch] {
        &self.inner.archs
    }

    /// The installed program
    pub fn program(&self) -> &Program {
        &self.inner.program
    }
}
