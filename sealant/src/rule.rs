use crate::{error::Error, Action, Arch, SyscallId};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

/// Number of syscall arguments in `seccomp_data`
pub const ARG_COUNT: u8 = 6;

/// Comparand of an argument comparison. The signedness decides how ordering
/// comparisons are lowered and is never guessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Unsigned 64 bit value
    Unsigned(u64),
    /// Signed 64 bit value
    Signed(i64),
}

impl Operand {
    /// Raw 64 bit pattern
    pub fn bits(&self) -> u64 {
        match *self {
            Operand::Unsigned(value) => value,
            Operand::Signed(value) => value as u64,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Unsigned(value) => write!(f, "{value:#x}"),
            Operand::Signed(value) => write!(f, "{value}"),
        }
    }
}

/// Comparison operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// `arg == operand`
    Eq,
    /// `arg != operand`
    Ne,
    /// `arg < operand`
    Lt,
    /// `arg <= operand`
    Le,
    /// `arg > operand`
    Gt,
    /// `arg >= operand`
    Ge,
    /// `arg & mask == operand`
    MaskedEq(u64),
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmpOp::Eq => f.write_str("=="),
            CmpOp::Ne => f.write_str("!="),
            CmpOp::Lt => f.write_str("<"),
            CmpOp::Le => f.write_str("<="),
            CmpOp::Gt => f.write_str(">"),
            CmpOp::Ge => f.write_str(">="),
            CmpOp::MaskedEq(mask) => write!(f, "& {mask:#x} =="),
        }
    }
}

/// Predicate over one syscall argument
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArgCmp {
    /// Argument index (0..6)
    pub index: u8,
    /// Operator
    pub op: CmpOp,
    /// Comparand
    pub operand: Operand,
}

impl ArgCmp {
    /// Construct a new comparison. The index is checked when the comparison
    /// is added to a rule set.
    pub fn new(index: u8, op: CmpOp, operand: Operand) -> ArgCmp {
        ArgCmp { index, op, operand }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.index >= ARG_COUNT {
            Err(Error::InvalidArgCmp { index: self.index })
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for ArgCmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arg{} {} {}", self.index, self.op, self.operand)
    }
}

/// Identifies a rule within the rule set that created it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleHandle(pub(crate) u64);

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Action for a syscall, optionally guarded by argument comparisons
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Handle returned from [`RuleSet::add_rule`]
    pub handle: RuleHandle,
    /// Syscall
    pub id: SyscallId,
    /// Action taken if all comparisons match
    pub action: Action,
    /// Comparisons. All of them must match.
    pub cmps: Vec<ArgCmp>,
}

impl Rule {
    /// Rules without comparisons match every invocation of the syscall
    pub fn is_unconditional(&self) -> bool {
        self.cmps.is_empty()
    }
}

/// Default action, rules in insertion order and the target architectures.
///
/// Rules on the same syscall are evaluated in insertion order and the first
/// matching rule wins. An unconditional rule shadows every rule for the same
/// syscall that was added after it.
#[derive(Clone, Debug)]
pub struct RuleSet {
    default: Action,
    bad_arch: Action,
    rules: Vec<Rule>,
    priorities: HashMap<SyscallId, u8>,
    archs: BTreeSet<Arch>,
    next_handle: u64,
}

impl RuleSet {
    /// Empty rule set targeting the native architecture
    pub fn new(default: Action) -> RuleSet {
        RuleSet {
            default,
            bad_arch: Action::Kill,
            rules: Vec::new(),
            priorities: HashMap::new(),
            archs: BTreeSet::from([Arch::native()]),
            next_handle: 0,
        }
    }

    /// Action for syscalls without a matching rule
    pub fn default_action(&self) -> Action {
        self.default
    }

    /// Replace the default action
    pub fn set_default_action(&mut self, action: Action) {
        self.default = action;
    }

    /// Action for syscalls made with an architecture outside the target set
    pub fn bad_arch_action(&self) -> Action {
        self.bad_arch
    }

    /// Replace the bad architecture action. Defaults to [`Action::Kill`].
    pub fn set_bad_arch_action(&mut self, action: Action) {
        self.bad_arch = action;
    }

    /// Append a rule
    pub fn add_rule(
        &mut self,
        id: SyscallId,
        action: Action,
        cmps: Vec<ArgCmp>,
    ) -> Result<RuleHandle, Error> {
        cmps.iter().try_for_each(ArgCmp::validate)?;

        let handle = RuleHandle(self.next_handle);
        self.next_handle += 1;
        debug!("Adding rule {handle}: {id} -> {action}");
        self.rules.push(Rule {
            handle,
            id,
            action,
            cmps,
        });
        Ok(handle)
    }

    /// Remove a rule and return it
    pub fn remove_rule(&mut self, handle: RuleHandle) -> Result<Rule, Error> {
        let position = self
            .rules
            .iter()
            .position(|rule| rule.handle == handle)
            .ok_or(Error::NotFound(handle))?;
        debug!("Removing rule {handle}");
        Ok(self.rules.remove(position))
    }

    /// Drop all rules and priorities and set a new default action. Handles
    /// issued before stay invalid.
    pub fn reset(&mut self, default: Action) {
        self.rules.clear();
        self.priorities.clear();
        self.default = default;
    }

    /// Syscalls with a higher priority are dispatched first. The default is 0.
    pub fn set_priority(&mut self, id: SyscallId, priority: u8) {
        self.priorities.insert(id, priority);
    }

    /// Priority of `id`
    pub fn priority(&self, id: SyscallId) -> u8 {
        self.priorities.get(&id).copied().unwrap_or_default()
    }

    /// Add a target architecture. Returns false if it is already present.
    pub fn add_arch(&mut self, arch: Arch) -> bool {
        self.archs.insert(arch)
    }

    /// Remove a target architecture. Returns false if it was not present.
    pub fn remove_arch(&mut self, arch: Arch) -> bool {
        self.archs.remove(&arch)
    }

    /// True if `arch` is a target architecture
    pub fn has_arch(&self, arch: Arch) -> bool {
        self.archs.contains(&arch)
    }

    /// Target architectures in a stable order
    pub fn archs(&self) -> impl Iterator<Item = Arch> + '_ {
        self.archs.iter().copied()
    }

    /// Number of rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Rules in insertion order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn getpid() -> SyscallId {
        SyscallId::new(Arch::X86_64, 39)
    }

    #[test]
    fn add_remove_roundtrip() {
        let mut rules = RuleSet::new(Action::Errno(1));
        rules.add_rule(getpid(), Action::Allow, vec![]).unwrap();
        let before = rules.rules().to_vec();

        let cmp = ArgCmp::new(0, CmpOp::Eq, Operand::Unsigned(5));
        let handle = rules.add_rule(getpid(), Action::Kill, vec![cmp]).unwrap();
        assert_eq!(rules.rule_count(), 2);

        let removed = rules.remove_rule(handle).unwrap();
        assert_eq!(removed.cmps, vec![cmp]);
        assert_eq!(rules.rules(), before.as_slice());
        assert_eq!(rules.remove_rule(handle), Err(Error::NotFound(handle)));
    }

    #[test]
    fn argument_index_out_of_range() {
        let mut rules = RuleSet::new(Action::Kill);
        let cmps = vec![
            ArgCmp::new(5, CmpOp::Eq, Operand::Unsigned(0)),
            ArgCmp::new(6, CmpOp::Eq, Operand::Unsigned(0)),
        ];
        assert_eq!(
            rules.add_rule(getpid(), Action::Allow, cmps),
            Err(Error::InvalidArgCmp { index: 6 })
        );
        assert_eq!(rules.rule_count(), 0);
    }

    #[test]
    fn duplicate_unconditional_rules_are_accepted() {
        let mut rules = RuleSet::new(Action::Kill);
        let first = rules.add_rule(getpid(), Action::Allow, vec![]).unwrap();
        let second = rules.add_rule(getpid(), Action::Allow, vec![]).unwrap();
        assert_ne!(first, second);
        assert_eq!(rules.rule_count(), 2);
    }

    #[test]
    fn reset_invalidates_handles() {
        let mut rules = RuleSet::new(Action::Kill);
        let handle = rules.add_rule(getpid(), Action::Allow, vec![]).unwrap();
        rules.set_priority(getpid(), 10);
        rules.reset(Action::Errno(1));
        assert_eq!(rules.rule_count(), 0);
        assert_eq!(rules.default_action(), Action::Errno(1));
        assert_eq!(rules.priority(getpid()), 0);
        assert_eq!(rules.remove_rule(handle), Err(Error::NotFound(handle)));
        let next = rules.add_rule(getpid(), Action::Allow, vec![]).unwrap();
        assert_ne!(next, handle);
    }

    #[test]
    fn architectures() {
        let mut rules = RuleSet::new(Action::Kill);
        assert!(rules.has_arch(Arch::native()));
        assert!(!rules.add_arch(Arch::native()));
        for arch in Arch::ALL {
            rules.add_arch(arch);
        }
        assert_eq!(rules.archs().count(), Arch::ALL.len());
        assert!(rules.remove_arch(Arch::X86));
        assert!(!rules.has_arch(Arch::X86));
        assert_eq!(rules.bad_arch_action(), Action::Kill);
    }

    #[test]
    fn arg_cmp_serde() {
        let cmp = ArgCmp::new(1, CmpOp::MaskedEq(0xff), Operand::Signed(-1));
        let json = serde_json::to_string(&cmp).unwrap();
        assert_eq!(
            json,
            r#"{"index":1,"op":{"masked_eq":255},"operand":{"signed":-1}}"#
        );
        assert_eq!(serde_json::from_str::<ArgCmp>(&json).unwrap(), cmp);
        assert_eq!(cmp.to_string(), "arg1 & 0xff == -1");
    }
}
