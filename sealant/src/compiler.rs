//! Lowering of a [`RuleSet`] into one BPF program per architecture.
//!
//! Each architecture gets a self contained section:
//!
//! ```text
//!     ld  [nr]
//!     jge #X32_SYSCALL_BIT        (x86_64 only, also without rules)
//!     jeq #-1
//!     ret bad_arch
//!     jeq #nr_a, 0, 1             for every syscall with rules
//!     ret action | ja block_a
//!     ...
//!     ret default
//! block_a:
//!     argument comparisons        for every rule up to the first unconditional one
//!     ret action
//!     ...
//!     ret default
//! ```
//!
//! Syscalls without rules do not generate any instruction. All jumps point
//! forward. Sections only contain relative jumps and are linked behind an
//! architecture dispatch header by [`crate::loader::link`].

use crate::{
    action::Action,
    bpf::{
        bpf_jump, bpf_load, bpf_ret, bpf_stmt, Program, SockFilter, BPF_ALU, BPF_AND, BPF_JA,
        BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_K, BPF_MAXINSNS, BPF_XOR,
    },
    error::CompileError,
    rule::{ArgCmp, CmpOp, Operand, Rule, RuleSet},
    Arch, Endian, SyscallTable,
};
use log::{debug, trace};
use nix::libc::seccomp_data;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    mem::size_of,
};

/// Compiled sections by architecture
pub type Compiled = BTreeMap<Arch, Program>;

/// x32 syscalls are reported as x86_64 with this bit set in the number
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// Syscall number -1 as set by tracers to skip a call
const SKIPPED_SYSCALL: u32 = u32::MAX;

/// Flipping the sign bit maps signed order onto unsigned order
const SIGN_BIT: u32 = 0x8000_0000;

/// Size of elements of the `args` array of `seccomp_data`
const SECCOMP_DATA_ARGS_SIZE: usize = size_of::<u64>();

/// Compile `rules` for every target architecture of the rule set
pub fn compile(rules: &RuleSet, table: &SyscallTable) -> Result<Compiled, CompileError> {
    if rules.archs().next().is_none() {
        return Err(CompileError::NoArchitectures);
    }
    rules
        .archs()
        .map(|arch| compile_arch(rules, table, arch).map(|program| (arch, program)))
        .collect()
}

/// Syscall with its rules on one architecture
struct Group<'a> {
    nr: u32,
    priority: u8,
    rules: Vec<&'a Rule>,
}

impl Group<'_> {
    /// Single unconditional rule that can be returned right from the dispatch
    fn inline(&self) -> Option<Action> {
        match self.rules.as_slice() {
            [rule] if rule.is_unconditional() => Some(rule.action),
            _ => None,
        }
    }
}

/// Compile `rules` for `arch`
pub fn compile_arch(
    rules: &RuleSet,
    table: &SyscallTable,
    arch: Arch,
) -> Result<Program, CompileError> {
    if !table.covers(arch) {
        return Err(CompileError::NoSyscallTable(arch));
    }

    let default = rules.default_action();
    let default_ret = default.to_ret()?;
    let bad_arch_ret = rules.bad_arch_action().to_ret()?;
    for rule in rules.rules() {
        rule.action.validate()?;
    }

    let groups = group(rules, table, arch);
    let x32_guard = arch == Arch::X86_64;
    if groups.is_empty() && !x32_guard {
        debug!("No rules for {arch}: returning {default} for every syscall");
        return Ok(Program::new(vec![bpf_ret(default_ret)]));
    }

    let mut asm = Assembler::default();
    asm.stmt(bpf_load(offset_nr()));

    // x32 calls share the audit arch of x86_64. A tracer skipping a call sets
    // the number to -1, which is not an x32 call.
    if x32_guard {
        let native = asm.label();
        asm.jump(BPF_JGE, X32_SYSCALL_BIT, Target::Next, Target::Label(native));
        asm.jump(BPF_JEQ, SKIPPED_SYSCALL, Target::Label(native), Target::Next);
        asm.stmt(bpf_ret(bad_arch_ret));
        asm.bind(native);
    }

    // Dispatch
    let mut blocks = Vec::new();
    for group in &groups {
        let skip = asm.label();
        asm.jump(BPF_JEQ, group.nr, Target::Next, Target::Label(skip));
        match group.inline() {
            Some(action) => asm.stmt(bpf_ret(action.to_ret()?)),
            None => {
                let block = asm.label();
                asm.ja(block);
                blocks.push((block, group));
            }
        }
        asm.bind(skip);
    }
    asm.stmt(bpf_ret(default_ret));

    // Argument blocks
    for (block, group) in blocks {
        trace!(
            "Adding argument block at {} (arch={arch}, nr={})",
            asm.len(),
            group.nr
        );
        asm.bind(block);
        for rule in &group.rules {
            let next_rule = asm.label();
            for cmp in &rule.cmps {
                lower(&mut asm, arch, cmp, next_rule)?;
            }
            asm.stmt(bpf_ret(rule.action.to_ret()?));
            asm.bind(next_rule);
        }
        if group.rules.last().is_some_and(|rule| !rule.is_unconditional()) {
            asm.stmt(bpf_ret(default_ret));
        }
        trace!("Finished argument block (arch={arch}, nr={})", group.nr);
    }

    let list = asm.finish()?;
    if list.len() > BPF_MAXINSNS {
        return Err(CompileError::TooManyInstructions {
            count: list.len(),
            max: BPF_MAXINSNS,
        });
    }

    debug!(
        "Compiled {} syscalls into {} instructions for {arch}",
        groups.len(),
        list.len()
    );
    Ok(Program::new(list))
}

/// Group the rules by syscall number on `arch`. Rules shadowed by an earlier
/// unconditional rule and groups that always end in the default action are
/// dropped. The result is ordered by priority and then by first insertion.
fn group<'a>(rules: &'a RuleSet, table: &SyscallTable, arch: Arch) -> Vec<Group<'a>> {
    let mut groups: Vec<Group> = Vec::new();
    let mut index = HashMap::<u32, usize>::new();

    for rule in rules.rules() {
        let id = match table.translate(rule.id, arch) {
            Some(id) => id,
            None => {
                debug!("Skipping rule {} ({}): no such syscall on {arch}", rule.handle, rule.id);
                continue;
            }
        };
        let priority = rules.priority(rule.id);
        let position = *index.entry(id.nr).or_insert_with(|| {
            groups.push(Group {
                nr: id.nr,
                priority,
                rules: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[position];
        group.priority = group.priority.max(priority);
        if group.rules.last().is_some_and(|last| last.is_unconditional()) {
            trace!("Rule {} is shadowed on {arch}", rule.handle);
            continue;
        }
        group.rules.push(rule);
    }

    let default = rules.default_action();
    groups.retain(|group| group.rules.iter().any(|rule| rule.action != default));
    // Stable, so equal priorities keep their insertion order
    groups.sort_by_key(|group| Reverse(group.priority));
    groups
}

/// Offset of the syscall number in `seccomp_data`
fn offset_nr() -> u32 {
    memoffset::offset_of!(seccomp_data, nr) as u32
}

/// Offsets of the high and the low word of argument `index`
fn arg_offsets(arch: Arch, index: u8) -> (u32, u32) {
    let base =
        memoffset::offset_of!(seccomp_data, args) + index as usize * SECCOMP_DATA_ARGS_SIZE;
    let (high, low) = match arch.endian() {
        Endian::Little => (base + SECCOMP_DATA_ARGS_SIZE / 2, base),
        Endian::Big => (base, base + SECCOMP_DATA_ARGS_SIZE / 2),
    };
    (high as u32, low as u32)
}

/// 32 bit half of an argument comparison
#[derive(Clone, Copy, Debug)]
struct Word {
    offset: u32,
    value: u32,
    flip: bool,
}

/// Split the operand into the values compared against the high and the low
/// word of the argument.
fn words(arch: Arch, cmp: &ArgCmp) -> Result<(Word, Word), CompileError> {
    let (high_offset, low_offset) = arg_offsets(arch, cmp.index);
    let ordered = matches!(cmp.op, CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge);

    let (high, low, flip_high, flip_low) = match (cmp.operand, arch.word_bits()) {
        (Operand::Unsigned(value), _) => ((value >> 32) as u32, value as u32, false, false),
        (Operand::Signed(value), 64) => {
            let bits = value as u64;
            let flip = ordered;
            let high = (bits >> 32) as u32;
            (
                if flip { high ^ SIGN_BIT } else { high },
                bits as u32,
                flip,
                false,
            )
        }
        (Operand::Signed(value), _) => {
            // Arguments are zero extended: the high word is always 0
            let value = i32::try_from(value).map_err(|_| CompileError::OperandWidth {
                arch,
                index: cmp.index,
                value,
            })?;
            let low = value as u32;
            (0, if ordered { low ^ SIGN_BIT } else { low }, false, ordered)
        }
    };

    Ok((
        Word {
            offset: high_offset,
            value: high,
            flip: flip_high,
        },
        Word {
            offset: low_offset,
            value: low,
            flip: flip_low,
        },
    ))
}

/// Load a word into the accumulator
fn load(asm: &mut Assembler, word: Word) {
    asm.stmt(bpf_load(word.offset));
    if word.flip {
        asm.stmt(bpf_stmt(BPF_ALU | BPF_XOR | BPF_K, SIGN_BIT));
    }
}

/// Emit `cmp`. Falls through if the comparison holds and jumps to `fail` otherwise.
fn lower(
    asm: &mut Assembler,
    arch: Arch,
    cmp: &ArgCmp,
    fail_label: Label,
) -> Result<(), CompileError> {
    use Target::{Label as L, Next};

    let (high, low) = words(arch, cmp)?;
    let fail = L(fail_label);

    match cmp.op {
        CmpOp::Eq => {
            load(asm, high);
            asm.jump(BPF_JEQ, high.value, Next, fail);
            load(asm, low);
            asm.jump(BPF_JEQ, low.value, Next, fail);
        }
        CmpOp::Ne => {
            let pass = asm.label();
            load(asm, high);
            asm.jump(BPF_JEQ, high.value, Next, L(pass));
            load(asm, low);
            asm.jump(BPF_JEQ, low.value, fail, Next);
            asm.bind(pass);
        }
        CmpOp::Gt | CmpOp::Ge => {
            let pass = asm.label();
            load(asm, high);
            asm.jump(BPF_JGT, high.value, L(pass), Next);
            asm.jump(BPF_JEQ, high.value, Next, fail);
            load(asm, low);
            let op = if cmp.op == CmpOp::Gt { BPF_JGT } else { BPF_JGE };
            asm.jump(op, low.value, Next, fail);
            asm.bind(pass);
        }
        CmpOp::Lt | CmpOp::Le => {
            let pass = asm.label();
            load(asm, high);
            asm.jump(BPF_JGT, high.value, fail, Next);
            asm.jump(BPF_JEQ, high.value, Next, L(pass));
            load(asm, low);
            let op = if cmp.op == CmpOp::Lt { BPF_JGE } else { BPF_JGT };
            asm.jump(op, low.value, fail, Next);
            asm.bind(pass);
        }
        CmpOp::MaskedEq(mask) => {
            let masks = [(mask >> 32) as u32, mask as u32];
            for (word, mask) in [high, low].into_iter().zip(masks) {
                match mask {
                    // arg & 0 is 0
                    0 if word.value == 0 => (),
                    0 => asm.ja(fail_label),
                    _ => {
                        load(asm, word);
                        if mask != u32::MAX {
                            asm.stmt(bpf_stmt(BPF_ALU | BPF_AND | BPF_K, mask));
                        }
                        asm.jump(BPF_JEQ, word.value, Next, fail);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Forward reference to an instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Label(usize);

/// Jump target of a conditional jump
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    /// Continue with the next instruction
    Next,
    /// Continue at a label
    Label(Label),
}

#[derive(Clone, Copy, Debug)]
enum Insn {
    Stmt(SockFilter),
    Jump {
        op: u16,
        k: u32,
        jt: Target,
        jf: Target,
    },
    Ja(Label),
}

/// Collects instructions with symbolic forward jumps and resolves them into
/// relative offsets.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    insns: Vec<Insn>,
    labels: Vec<Option<usize>>,
}

impl Assembler {
    /// Create a new unbound label
    pub(crate) fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction
    pub(crate) fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.insns.len());
    }

    /// Append a statement
    pub(crate) fn stmt(&mut self, insn: SockFilter) {
        self.insns.push(Insn::Stmt(insn));
    }

    /// Append a conditional jump comparing the accumulator with `k`
    pub(crate) fn jump(&mut self, op: u16, k: u32, jt: Target, jf: Target) {
        self.insns.push(Insn::Jump { op, k, jt, jf });
    }

    /// Append an unconditional jump
    pub(crate) fn ja(&mut self, label: Label) {
        self.insns.push(Insn::Ja(label));
    }

    /// Number of instructions emitted so far
    pub(crate) fn len(&self) -> usize {
        self.insns.len()
    }

    /// Resolve all jumps
    pub(crate) fn finish(self) -> Result<Vec<SockFilter>, CompileError> {
        let len = self.insns.len();
        let distance = |pc: usize, label: Label| -> Result<usize, CompileError> {
            match self.labels.get(label.0).copied().flatten() {
                Some(target) if target > pc && target < len => Ok(target - pc - 1),
                _ => Err(CompileError::JumpOutOfRange(pc)),
            }
        };
        let offset = |pc: usize, target: Target| -> Result<u8, CompileError> {
            match target {
                Target::Next => Ok(0),
                Target::Label(label) => {
                    u8::try_from(distance(pc, label)?).map_err(|_| CompileError::JumpOutOfRange(pc))
                }
            }
        };

        self.insns
            .iter()
            .enumerate()
            .map(|(pc, insn)| match *insn {
                Insn::Stmt(insn) => Ok(insn),
                Insn::Jump { op, k, jt, jf } => Ok(bpf_jump(
                    BPF_JMP | op | BPF_K,
                    k,
                    offset(pc, jt)?,
                    offset(pc, jf)?,
                )),
                Insn::Ja(label) => {
                    let distance = u32::try_from(distance(pc, label)?)
                        .map_err(|_| CompileError::JumpOutOfRange(pc))?;
                    Ok(bpf_stmt(BPF_JMP | BPF_JA, distance))
                }
            })
            .collect()
    }
}
