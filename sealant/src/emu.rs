//! Evaluator for the instruction subset the compiler and the linker emit.

#![allow(clippy::unwrap_used)]

use crate::{
    bpf::{
        Program, BPF_ABS, BPF_ALU, BPF_AND, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP,
        BPF_JSET, BPF_K, BPF_LD, BPF_RET, BPF_W, BPF_XOR,
    },
    Arch, Endian,
};

/// Contents of `struct seccomp_data` for one syscall invocation
#[derive(Clone, Debug)]
pub(crate) struct SeccompData {
    endian: Endian,
    nr: u32,
    audit: u32,
    instruction_pointer: u64,
    args: [u64; 6],
}

impl SeccompData {
    pub(crate) fn new(arch: Arch, nr: u32) -> SeccompData {
        SeccompData {
            endian: arch.endian(),
            nr,
            audit: arch.audit(),
            instruction_pointer: 0,
            args: [0; 6],
        }
    }

    pub(crate) fn args(mut self, args: [u64; 6]) -> SeccompData {
        self.args = args;
        self
    }

    /// Pretend the call was made with an arbitrary `AUDIT_ARCH` value
    pub(crate) fn audit(mut self, audit: u32) -> SeccompData {
        self.audit = audit;
        self
    }

    fn bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        match self.endian {
            Endian::Little => {
                bytes.extend(self.nr.to_le_bytes());
                bytes.extend(self.audit.to_le_bytes());
                bytes.extend(self.instruction_pointer.to_le_bytes());
                self.args.iter().for_each(|arg| bytes.extend(arg.to_le_bytes()));
            }
            Endian::Big => {
                bytes.extend(self.nr.to_be_bytes());
                bytes.extend(self.audit.to_be_bytes());
                bytes.extend(self.instruction_pointer.to_be_bytes());
                self.args.iter().for_each(|arg| bytes.extend(arg.to_be_bytes()));
            }
        }
        bytes
    }

    fn word(&self, bytes: &[u8], offset: u32) -> u32 {
        let offset = offset as usize;
        let word: [u8; 4] = bytes[offset..offset + 4].try_into().unwrap();
        match self.endian {
            Endian::Little => u32::from_le_bytes(word),
            Endian::Big => u32::from_be_bytes(word),
        }
    }

    /// Run `program` and return the `SECCOMP_RET_*` value
    pub(crate) fn run(&self, program: &Program) -> u32 {
        let bytes = self.bytes();
        let insns = program.instructions();
        let mut acc = 0u32;
        let mut pc = 0usize;

        loop {
            let insn = insns
                .get(pc)
                .unwrap_or_else(|| panic!("pc {pc} is outside of the program\n{program}"));
            pc += 1;

            let code = insn.code;
            let taken = match code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    acc = self.word(&bytes, insn.k);
                    continue;
                }
                c if c == BPF_ALU | BPF_AND | BPF_K => {
                    acc &= insn.k;
                    continue;
                }
                c if c == BPF_ALU | BPF_XOR | BPF_K => {
                    acc ^= insn.k;
                    continue;
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                c if c == BPF_JMP | BPF_JA => {
                    pc += insn.k as usize;
                    continue;
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => acc == insn.k,
                c if c == BPF_JMP | BPF_JGT | BPF_K => acc > insn.k,
                c if c == BPF_JMP | BPF_JGE | BPF_K => acc >= insn.k,
                c if c == BPF_JMP | BPF_JSET | BPF_K => acc & insn.k != 0,
                c => panic!("unsupported instruction {c:#x} at {}", pc - 1),
            };
            pc += usize::from(if taken { insn.jt } else { insn.jf });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bpf::{bpf_jump, bpf_load, bpf_ret};

    #[test]
    fn big_endian_words() {
        let data = SeccompData::new(Arch::ArmEb, 20).args([0x1122_3344_5566_7788, 0, 0, 0, 0, 0]);
        let bytes = data.bytes();
        assert_eq!(data.word(&bytes, 0), 20);
        assert_eq!(data.word(&bytes, 16), 0x1122_3344);
        assert_eq!(data.word(&bytes, 20), 0x5566_7788);

        let data = SeccompData::new(Arch::Arm, 20).args([0x1122_3344_5566_7788, 0, 0, 0, 0, 0]);
        let bytes = data.bytes();
        assert_eq!(data.word(&bytes, 16), 0x5566_7788);
        assert_eq!(data.word(&bytes, 20), 0x1122_3344);
    }

    #[test]
    fn jumps() {
        let program = Program::new(vec![
            bpf_load(4),
            bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, Arch::X86.audit(), 1, 0),
            bpf_ret(1),
            bpf_ret(2),
        ]);
        assert_eq!(SeccompData::new(Arch::X86, 0).run(&program), 2);
        assert_eq!(SeccompData::new(Arch::X86, 0).audit(0).run(&program), 1);
    }
}
