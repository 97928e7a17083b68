use serde::{Deserialize, Serialize};
use std::fmt;

// From linux/audit.h: EM_* | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE
const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
const AUDIT_ARCH_I386: u32 = 0x4000_0003;
const AUDIT_ARCH_AARCH64: u32 = 0xc000_00b7;
const AUDIT_ARCH_ARM: u32 = 0x4000_0028;
const AUDIT_ARCH_ARMEB: u32 = 0x0000_0028;
const AUDIT_ARCH_RISCV64: u32 = 0xc000_00f3;

/// Instruction set and ABI combination a syscall number is valid for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    /// 64 bit x86
    X86_64,
    /// 32 bit x86 (i386)
    X86,
    /// 64 bit ARM, little endian
    Aarch64,
    /// 32 bit ARM EABI, little endian
    Arm,
    /// 32 bit ARM EABI, big endian
    ArmEb,
    /// 64 bit RISC-V
    Riscv64,
}

/// Byte order of the words in `seccomp_data`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl Arch {
    /// All supported architectures
    pub const ALL: [Arch; 6] = [
        Arch::X86_64,
        Arch::X86,
        Arch::Aarch64,
        Arch::Arm,
        Arch::ArmEb,
        Arch::Riscv64,
    ];

    /// Architecture this crate is built for
    pub const fn native() -> Arch {
        check_platform_requirements();

        #[cfg(target_arch = "x86_64")]
        return Arch::X86_64;
        #[cfg(target_arch = "x86")]
        return Arch::X86;
        #[cfg(target_arch = "aarch64")]
        return Arch::Aarch64;
        #[cfg(all(target_arch = "arm", target_endian = "little"))]
        return Arch::Arm;
        #[cfg(all(target_arch = "arm", target_endian = "big"))]
        return Arch::ArmEb;
        #[cfg(target_arch = "riscv64")]
        return Arch::Riscv64;
    }

    /// `AUDIT_ARCH_*` value the kernel reports in `seccomp_data.arch`
    pub const fn audit(self) -> u32 {
        match self {
            Arch::X86_64 => AUDIT_ARCH_X86_64,
            Arch::X86 => AUDIT_ARCH_I386,
            Arch::Aarch64 => AUDIT_ARCH_AARCH64,
            Arch::Arm => AUDIT_ARCH_ARM,
            Arch::ArmEb => AUDIT_ARCH_ARMEB,
            Arch::Riscv64 => AUDIT_ARCH_RISCV64,
        }
    }

    /// Look up an architecture by its `AUDIT_ARCH_*` value
    pub fn from_audit(audit: u32) -> Option<Arch> {
        Arch::ALL.into_iter().find(|arch| arch.audit() == audit)
    }

    /// Native word size in bits. Syscall arguments are zero extended to 64 bit
    /// on 32 bit architectures.
    pub const fn word_bits(self) -> u32 {
        match self {
            Arch::X86_64 | Arch::Aarch64 | Arch::Riscv64 => 64,
            Arch::X86 | Arch::Arm | Arch::ArmEb => 32,
        }
    }

    /// Byte order
    pub const fn endian(self) -> Endian {
        match self {
            Arch::ArmEb => Endian::Big,
            _ => Endian::Little,
        }
    }

    /// Short name
    pub const fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::X86 => "x86",
            Arch::Aarch64 => "aarch64",
            Arch::Arm => "arm",
            Arch::ArmEb => "armeb",
            Arch::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fail the build on platforms without seccomp filter support
const fn check_platform_requirements() {
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    compile_error!("seccomp is only supported on Linux");
    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "aarch64",
        target_arch = "arm",
        target_arch = "riscv64"
    )))]
    compile_error!("seccomp is only supported on x86, x86_64, arm, aarch64 and riscv64");
}
