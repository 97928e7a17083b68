//! Mapping between syscall names and architecture specific syscall numbers.
//!
//! The built-in table covers every [`Arch`] and is taken from the per-ABI
//! tables of the `syscalls` crate. Additional ABIs can be described with
//! [`SyscallTable::with_arch`].

use crate::{error::Error, Arch};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

/// All `(name, nr)` pairs of one ABI of the `syscalls` crate
macro_rules! sysnos {
    ($abi:ident) => {{
        use syscalls::$abi::Sysno;
        (Sysno::first().id()..=Sysno::last().id())
            .filter_map(|id| usize::try_from(id).ok().and_then(Sysno::new))
            .filter_map(|sysno| Some((sysno.name(), u32::try_from(sysno.id()).ok()?)))
            .collect::<Vec<_>>()
    }};
}

lazy_static! {
    static ref BUILTIN: SyscallTable = {
        let arm = sysnos!(arm);
        SyscallTable::empty()
            .with_arch(Arch::X86_64, sysnos!(x86_64))
            .with_arch(Arch::X86, sysnos!(x86))
            .with_arch(Arch::Aarch64, sysnos!(aarch64))
            .with_arch(Arch::ArmEb, arm.iter().copied())
            .with_arch(Arch::Arm, arm)
            .with_arch(Arch::Riscv64, sysnos!(riscv64))
    };
}

/// Syscall number. Only meaningful together with the architecture it was
/// resolved for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyscallId {
    /// Architecture the number is valid for
    pub arch: Arch,
    /// Syscall number
    pub nr: u32,
}

impl SyscallId {
    /// Wrap a raw syscall number
    pub const fn new(arch: Arch, nr: u32) -> SyscallId {
        SyscallId { arch, nr }
    }
}

impl fmt::Display for SyscallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.arch, self.nr)
    }
}

/// Name and number lookup for one ABI
#[derive(Clone, Debug, Default)]
struct Abi {
    by_name: HashMap<&'static str, u32>,
    by_nr: HashMap<u32, &'static str>,
}

/// Syscall name tables for a set of architectures
#[derive(Clone, Debug, Default)]
pub struct SyscallTable {
    abis: HashMap<Arch, Abi>,
}

impl SyscallTable {
    /// Tables for all supported architectures
    pub fn builtin() -> &'static SyscallTable {
        &BUILTIN
    }

    /// Table without any architecture
    pub fn empty() -> SyscallTable {
        SyscallTable::default()
    }

    /// Add (or replace) the table for `arch`
    pub fn with_arch<I>(mut self, arch: Arch, entries: I) -> SyscallTable
    where
        I: IntoIterator<Item = (&'static str, u32)>,
    {
        let mut abi = Abi::default();
        for (name, nr) in entries {
            abi.by_name.insert(name, nr);
            abi.by_nr.entry(nr).or_insert(name);
        }
        self.abis.insert(arch, abi);
        self
    }

    /// True if there is a table for `arch`
    pub fn covers(&self, arch: Arch) -> bool {
        self.abis.contains_key(&arch)
    }

    /// Resolve `name` on `arch`
    pub fn resolve(&self, name: &str, arch: Arch) -> Result<SyscallId, Error> {
        self.abis
            .get(&arch)
            .and_then(|abi| abi.by_name.get(name))
            .map(|nr| SyscallId::new(arch, *nr))
            .ok_or_else(|| Error::UnknownSyscall {
                name: name.to_string(),
                arch,
            })
    }

    /// Resolve `name` on the architecture this crate is built for
    pub fn resolve_native(&self, name: &str) -> Result<SyscallId, Error> {
        self.resolve(name, Arch::native())
    }

    /// Name of the syscall `id` refers to
    pub fn name_of(&self, id: SyscallId) -> Option<&'static str> {
        self.abis
            .get(&id.arch)
            .and_then(|abi| abi.by_nr.get(&id.nr))
            .copied()
    }

    /// Same syscall on another architecture. Ids are translated by name. An id
    /// that is not in the table only translates to its own architecture.
    pub fn translate(&self, id: SyscallId, arch: Arch) -> Option<SyscallId> {
        if id.arch == arch {
            return Some(id);
        }
        let name = self.name_of(id)?;
        self.resolve(name, arch).ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn resolve_is_deterministic() {
        let table = SyscallTable::builtin();
        for arch in Arch::ALL {
            for name in ["read", "write", "getpid", "getgid", "futex", "exit_group"] {
                let first = table.resolve(name, arch).unwrap();
                let second = table.resolve(name, arch).unwrap();
                assert_eq!(first, second);
                assert_eq!(first.arch, arch);
                assert_eq!(table.name_of(first), Some(name));
            }
        }
    }

    #[test]
    fn numbers_differ_between_architectures() {
        let table = SyscallTable::builtin();
        assert_eq!(table.resolve("getpid", Arch::X86_64).unwrap().nr, 39);
        assert_eq!(table.resolve("getpid", Arch::X86).unwrap().nr, 20);
        assert_eq!(table.resolve("getpid", Arch::Aarch64).unwrap().nr, 172);
        assert_eq!(table.resolve("getpid", Arch::Arm).unwrap().nr, 20);
        assert_eq!(table.resolve("getpid", Arch::Riscv64).unwrap().nr, 172);
    }

    #[test]
    fn unknown_syscall() {
        let table = SyscallTable::builtin();
        assert_eq!(
            table.resolve("open", Arch::Aarch64),
            Err(Error::UnknownSyscall {
                name: "open".into(),
                arch: Arch::Aarch64
            })
        );
        assert!(table.resolve("open", Arch::X86_64).is_ok());
        assert!(table.resolve("no_such_syscall", Arch::native()).is_err());
    }

    #[test]
    fn translate_by_name() {
        let table = SyscallTable::builtin();
        let x86_64 = table.resolve("exit_group", Arch::X86_64).unwrap();
        let arm = table.translate(x86_64, Arch::Arm).unwrap();
        assert_eq!(arm, SyscallId::new(Arch::Arm, 248));
        // open does not exist on the generic table
        let open = table.resolve("open", Arch::X86_64).unwrap();
        assert_eq!(table.translate(open, Arch::Riscv64), None);
        // unnamed numbers stay on their own architecture
        let raw = SyscallId::new(Arch::X86, 4000);
        assert_eq!(table.translate(raw, Arch::X86), Some(raw));
        assert_eq!(table.translate(raw, Arch::X86_64), None);
    }

    #[test]
    fn custom_tables() {
        let table = SyscallTable::empty().with_arch(Arch::X86_64, [("getpid", 39)]);
        assert!(table.covers(Arch::X86_64));
        assert!(!table.covers(Arch::X86));
        assert!(table.resolve("getpid", Arch::X86).is_err());
        assert_eq!(
            table.resolve("getpid", Arch::X86_64),
            Ok(SyscallId::new(Arch::X86_64, 39))
        );
    }

    #[test]
    fn native_table_matches_libc() {
        use nix::libc;

        let table = SyscallTable::builtin();
        let mut expected = vec![
            ("bpf", libc::SYS_bpf),
            ("capget", libc::SYS_capget),
            ("clone", libc::SYS_clone),
            ("clone3", libc::SYS_clone3),
            ("close", libc::SYS_close),
            ("eventfd2", libc::SYS_eventfd2),
            ("execve", libc::SYS_execve),
            ("exit_group", libc::SYS_exit_group),
            ("futex", libc::SYS_futex),
            ("getpid", libc::SYS_getpid),
            ("getxattr", libc::SYS_getxattr),
            ("inotify_init1", libc::SYS_inotify_init1),
            ("io_uring_setup", libc::SYS_io_uring_setup),
            ("kill", libc::SYS_kill),
            ("memfd_create", libc::SYS_memfd_create),
            ("openat", libc::SYS_openat),
            ("openat2", libc::SYS_openat2),
            ("pidfd_open", libc::SYS_pidfd_open),
            ("pidfd_send_signal", libc::SYS_pidfd_send_signal),
            ("read", libc::SYS_read),
            ("restart_syscall", libc::SYS_restart_syscall),
            ("seccomp", libc::SYS_seccomp),
            ("signalfd4", libc::SYS_signalfd4),
            ("statx", libc::SYS_statx),
            ("timer_create", libc::SYS_timer_create),
            ("timerfd_create", libc::SYS_timerfd_create),
            ("wait4", libc::SYS_wait4),
            ("write", libc::SYS_write),
        ];
        #[cfg(target_arch = "x86_64")]
        expected.extend([
            ("epoll_create", libc::SYS_epoll_create),
            ("eventfd", libc::SYS_eventfd),
            ("inotify_init", libc::SYS_inotify_init),
            ("open", libc::SYS_open),
            ("shmat", libc::SYS_shmat),
            ("shmget", libc::SYS_shmget),
            ("signalfd", libc::SYS_signalfd),
        ]);

        for (name, nr) in expected {
            let id = table.resolve_native(name).unwrap();
            assert_eq!(i64::from(id.nr), i64::from(nr), "{name}");
            assert_eq!(table.name_of(id), Some(name));
        }
    }

    #[test]
    fn tables_are_complete() {
        let table = SyscallTable::builtin();
        for (arch, min) in [
            (Arch::X86_64, 360),
            (Arch::X86, 430),
            (Arch::Aarch64, 290),
            (Arch::Arm, 370),
            (Arch::ArmEb, 370),
            (Arch::Riscv64, 290),
        ] {
            let count = table.abis[&arch].by_name.len();
            assert!(count >= min, "{arch} has {count} syscalls");

            // Numbers of syscalls added since 5.1 are shared by all architectures
            for (name, nr) in [
                ("pidfd_send_signal", 424),
                ("io_uring_setup", 425),
                ("clone3", 435),
                ("futex_waitv", 449),
                ("set_mempolicy_home_node", 450),
            ] {
                assert_eq!(table.resolve(name, arch), Ok(SyscallId::new(arch, nr)));
            }
        }
        assert_eq!(
            table.resolve("restart_syscall", Arch::X86),
            Ok(SyscallId::new(Arch::X86, 0))
        );
        assert_eq!(
            table.resolve("epoll_create", Arch::Arm),
            Ok(SyscallId::new(Arch::Arm, 250))
        );
        assert_eq!(
            table.resolve("shmget", Arch::Aarch64),
            Ok(SyscallId::new(Arch::Aarch64, 194))
        );
        assert_eq!(
            table.resolve("timerfd_create", Arch::Riscv64),
            Ok(SyscallId::new(Arch::Riscv64, 85))
        );
    }

    #[test]
    fn big_endian_arm_shares_the_arm_table() {
        let table = SyscallTable::builtin();
        for name in ["getpid", "epoll_create", "timer_create", "futex_waitv"] {
            assert_eq!(
                table.resolve(name, Arch::ArmEb).unwrap().nr,
                table.resolve(name, Arch::Arm).unwrap().nr
            );
        }
    }
}
