//! Classic BPF instructions as executed by the kernel's seccomp VM.

use crate::Action;
use nix::libc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// From linux/bpf_common.h
/// Instruction class: load into accumulator
pub const BPF_LD: u16 = 0x00;
/// Instruction class: arithmetic on the accumulator
pub const BPF_ALU: u16 = 0x04;
/// Instruction class: jump
pub const BPF_JMP: u16 = 0x05;
/// Instruction class: return
pub const BPF_RET: u16 = 0x06;
/// Load size: 32 bit word
pub const BPF_W: u16 = 0x00;
/// Load mode: absolute offset into `seccomp_data`
pub const BPF_ABS: u16 = 0x20;
/// Operand source: immediate `k`
pub const BPF_K: u16 = 0x00;
/// ALU operation: and
pub const BPF_AND: u16 = 0x50;
/// ALU operation: xor
pub const BPF_XOR: u16 = 0xa0;
/// Jump operation: unconditional, offset in `k`
pub const BPF_JA: u16 = 0x00;
/// Jump operation: `A == k`
pub const BPF_JEQ: u16 = 0x10;
/// Jump operation: `A > k`
pub const BPF_JGT: u16 = 0x20;
/// Jump operation: `A >= k`
pub const BPF_JGE: u16 = 0x30;
/// Jump operation: `A & k != 0`
pub const BPF_JSET: u16 = 0x40;
/// Maximum number of instructions accepted by the kernel
pub const BPF_MAXINSNS: usize = 4096;

/// Single BPF instruction. Layout compatible with the kernel's `struct sock_filter`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SockFilter {
    /// Opcode
    pub code: u16,
    /// Jump offset if the condition is true
    pub jt: u8,
    /// Jump offset if the condition is false
    pub jf: u8,
    /// Immediate
    pub k: u32,
}

impl SockFilter {
    /// Instruction packed as `code:16 jt:8 jf:8 k:32`
    fn packed(&self) -> u64 {
        (u64::from(self.code) << 48)
            | (u64::from(self.jt) << 40)
            | (u64::from(self.jf) << 32)
            | u64::from(self.k)
    }

    fn unpack(value: u64) -> SockFilter {
        let [code_high, code_low, jt, jf, k @ ..] = value.to_be_bytes();
        SockFilter {
            code: u16::from_be_bytes([code_high, code_low]),
            jt,
            jf,
            k: u32::from_be_bytes(k),
        }
    }
}

impl Serialize for SockFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.packed())
    }
}

impl<'de> Deserialize<'de> for SockFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<SockFilter, D::Error> {
        u64::deserialize(deserializer).map(SockFilter::unpack)
    }
}

impl From<&SockFilter> for libc::sock_filter {
    fn from(s: &SockFilter) -> libc::sock_filter {
        libc::sock_filter {
            code: s.code,
            jt: s.jt,
            jf: s.jf,
            k: s.k,
        }
    }
}

impl SockFilter {
    /// True for instructions that end the program
    pub fn is_ret(&self) -> bool {
        self.code == BPF_RET | BPF_K
    }

    /// True for jumps
    pub fn is_jump(&self) -> bool {
        self.code & 0x07 == BPF_JMP
    }

    /// Write the disassembly of the instruction at position `pc`. Jump targets
    /// are printed as absolute positions.
    fn disassemble(&self, pc: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let next = pc + 1;
        let conditional = |f: &mut fmt::Formatter<'_>, mnemonic: &str| {
            write!(
                f,
                "{mnemonic} #{:#x}, {}, {}",
                self.k,
                next + self.jt as usize,
                next + self.jf as usize
            )
        };
        match self.code {
            c if c == BPF_LD | BPF_W | BPF_ABS => write!(f, "ld [{}]", self.k),
            c if c == BPF_ALU | BPF_AND | BPF_K => write!(f, "and #{:#x}", self.k),
            c if c == BPF_ALU | BPF_XOR | BPF_K => write!(f, "xor #{:#x}", self.k),
            c if c == BPF_JMP | BPF_JA => write!(f, "ja {}", next + self.k as usize),
            c if c == BPF_JMP | BPF_JEQ | BPF_K => conditional(f, "jeq"),
            c if c == BPF_JMP | BPF_JGT | BPF_K => conditional(f, "jgt"),
            c if c == BPF_JMP | BPF_JGE | BPF_K => conditional(f, "jge"),
            c if c == BPF_JMP | BPF_JSET | BPF_K => conditional(f, "jset"),
            c if c == BPF_RET | BPF_K => match Action::from_ret(self.k) {
                Some(action) => write!(f, "ret {action}"),
                None => write!(f, "ret #{:#x}", self.k),
            },
            _ => write!(
                f,
                ".insn {:#06x}, {}, {}, {:#x}",
                self.code, self.jt, self.jf, self.k
            ),
        }
    }
}

// https://elixir.bootlin.com/linux/latest/source/include/uapi/linux/filter.h#L48
pub(crate) fn bpf_stmt(code: u16, k: u32) -> SockFilter {
    bpf_jump(code, k, 0, 0)
}

// https://elixir.bootlin.com/linux/latest/source/include/uapi/linux/filter.h#L51
pub(crate) fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

/// Load a 32 bit word of `seccomp_data` into the accumulator
pub(crate) fn bpf_load(offset: u32) -> SockFilter {
    bpf_stmt(BPF_LD | BPF_W | BPF_ABS, offset)
}

/// Return `k` (a `SECCOMP_RET_*` value)
pub(crate) fn bpf_ret(k: u32) -> SockFilter {
    bpf_stmt(BPF_RET | BPF_K, k)
}

/// Immutable sequence of instructions
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Program {
    list: Vec<SockFilter>,
}

impl Program {
    /// Wrap a list of instructions
    pub fn new(list: Vec<SockFilter>) -> Program {
        Program { list }
    }

    /// Instructions
    pub fn instructions(&self) -> &[SockFilter] {
        &self.list
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True if the program has no instructions
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Raw program in the in-memory layout of `struct sock_filter` with
    /// native byte order. This is what `seccomp(2)` consumes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.list.len() * std::mem::size_of::<SockFilter>());
        for insn in &self.list {
            bytes.extend_from_slice(&insn.code.to_ne_bytes());
            bytes.push(insn.jt);
            bytes.push(insn.jf);
            bytes.extend_from_slice(&insn.k.to_ne_bytes());
        }
        bytes
    }

    /// Check that every jump lands inside the program. Jumps are relative to
    /// the next instruction and can only go forward.
    pub fn jumps_in_bounds(&self) -> bool {
        let len = self.list.len();
        self.list.iter().enumerate().all(|(pc, insn)| {
            let next = pc + 1;
            if !insn.is_jump() {
                true
            } else if insn.code == BPF_JMP | BPF_JA {
                next + (insn.k as usize) < len
            } else {
                next + (insn.jt as usize) < len && next + (insn.jf as usize) < len
            }
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, insn) in self.list.iter().enumerate() {
            write!(f, "{pc:04}: ")?;
            insn.disassemble(pc, f)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
