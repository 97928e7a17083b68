use crate::{
    bpf::Program,
    compiler::{compile, Compiled},
    error::{CompileError, Error, LoadError},
    loader::{link, Installer, LoadedFilter},
    rule::{ArgCmp, Rule, RuleHandle, RuleSet},
    Action, Arch, SyscallId, SyscallTable,
};
use log::{debug, warn};
use std::fmt;

/// Reason a filter failed to load
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Compiling or linking failed
    Compile(CompileError),
    /// The installer rejected the program
    Load(LoadError),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Compile(error) => write!(f, "compile error: {error}"),
            Failure::Load(error) => write!(f, "load error: {error}"),
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Error {
        match failure {
            Failure::Compile(error) => Error::Compile(error),
            Failure::Load(error) => Error::Load(error),
        }
    }
}

/// Lifecycle state without payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Rules can be changed
    Building,
    /// Installed
    Loaded,
    /// Loading failed
    Failed,
}

/// Filter lifecycle. Only a filter that is [`FilterState::Building`] can be
/// changed or loaded. [`FilterState::Loaded`] and [`FilterState::Failed`] are
/// terminal and every mutation fails with [`Error::FilterSealed`].
#[derive(Clone, Debug)]
pub enum FilterState {
    /// Rules are collected
    Building(RuleSet),
    /// The filter is installed
    Loaded(LoadedFilter),
    /// Compiling or installing the filter failed
    Failed(Failure),
}

impl From<RuleSet> for FilterState {
    fn from(rules: RuleSet) -> FilterState {
        FilterState::Building(rules)
    }
}

impl FilterState {
    /// New filter with `default` as the default action and the native
    /// architecture as target
    pub fn new(default: Action) -> FilterState {
        FilterState::Building(RuleSet::new(default))
    }

    /// Current state
    pub fn status(&self) -> Status {
        match self {
            FilterState::Building(_) => Status::Building,
            FilterState::Loaded(_) => Status::Loaded,
            FilterState::Failed(_) => Status::Failed,
        }
    }

    /// Rule set while building
    pub fn rules(&self) -> Option<&RuleSet> {
        match self {
            FilterState::Building(rules) => Some(rules),
            _ => None,
        }
    }

    /// Handle of the installed filter
    pub fn loaded(&self) -> Option<&LoadedFilter> {
        match self {
            FilterState::Loaded(loaded) => Some(loaded),
            _ => None,
        }
    }

    /// Reason for a failed load
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            FilterState::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    fn building(&mut self) -> Result<&mut RuleSet, Error> {
        match self {
            FilterState::Building(rules) => Ok(rules),
            _ => Err(Error::FilterSealed),
        }
    }

    /// Replace the default action
    pub fn set_default_action(&mut self, action: Action) -> Result<(), Error> {
        self.building()?.set_default_action(action);
        Ok(())
    }

    /// Replace the action for calls from architectures outside the target set
    pub fn set_bad_arch_action(&mut self, action: Action) -> Result<(), Error> {
        self.building()?.set_bad_arch_action(action);
        Ok(())
    }

    /// Append a rule. See [`RuleSet::add_rule`].
    pub fn add_rule(
        &mut self,
        id: SyscallId,
        action: Action,
        cmps: Vec<ArgCmp>,
    ) -> Result<RuleHandle, Error> {
        self.building()?.add_rule(id, action, cmps)
    }

    /// Remove a rule. Fails with [`Error::FilterSealed`] once the filter is
    /// sealed and with [`Error::NotFound`] for stale handles.
    pub fn remove_rule(&mut self, handle: RuleHandle) -> Result<Rule, Error> {
        self.building()?.remove_rule(handle)
    }

    /// Drop all rules and set a new default action
    pub fn reset(&mut self, default: Action) -> Result<(), Error> {
        self.building()?.reset(default);
        Ok(())
    }

    /// Set the dispatch priority of a syscall
    pub fn set_priority(&mut self, id: SyscallId, priority: u8) -> Result<(), Error> {
        self.building()?.set_priority(id, priority);
        Ok(())
    }

    /// Add a target architecture
    pub fn add_arch(&mut self, arch: Arch) -> Result<bool, Error> {
        Ok(self.building()?.add_arch(arch))
    }

    /// Remove a target architecture
    pub fn remove_arch(&mut self, arch: Arch) -> Result<bool, Error> {
        Ok(self.building()?.remove_arch(arch))
    }

    /// Compile the rule set without loading it
    pub fn compile(&self, table: &SyscallTable) -> Result<Compiled, Error> {
        match self {
            FilterState::Building(rules) => compile(rules, table).map_err(Into::into),
            _ => Err(Error::FilterSealed),
        }
    }

    /// Compile the rule set with the built-in syscall table and install it
    pub fn load(&mut self, installer: &dyn Installer) -> Result<LoadedFilter, Error> {
        self.load_with(SyscallTable::builtin(), installer)
    }

    /// Compile the rule set with `table` and install it
    pub fn load_with(
        &mut self,
        table: &SyscallTable,
        installer: &dyn Installer,
    ) -> Result<LoadedFilter, Error> {
        let rules = self.building()?;
        match compile(rules, table) {
            Ok(compiled) => self.load_compiled(compiled, installer),
            Err(error) => Err(self.fail(Failure::Compile(error))),
        }
    }

    /// Install previously compiled sections. `compiled` needs a section for
    /// every target architecture.
    pub fn load_compiled(
        &mut self,
        compiled: Compiled,
        installer: &dyn Installer,
    ) -> Result<LoadedFilter, Error> {
        let FilterState::Building(rules) = &*self else {
            return Err(Error::FilterSealed);
        };
        let default = rules.default_action();
        let rule_count = rules.rule_count();
        let archs = rules.archs().collect::<Vec<_>>();
        let program = match link_sections(rules, &compiled) {
            Ok(program) => program,
            Err(error) => return Err(self.fail(Failure::Compile(error))),
        };

        if let Err(error) = installer.install(&program) {
            return Err(self.fail(Failure::Load(error)));
        }

        let loaded = LoadedFilter::new(default, rule_count, archs, program);
        *self = FilterState::Loaded(loaded.clone());
        Ok(loaded)
    }

    /// Seal the filter as failed
    fn fail(&mut self, failure: Failure) -> Error {
        warn!("Failed to load seccomp filter: {failure}");
        *self = FilterState::Failed(failure.clone());
        failure.into()
    }
}

/// Link the sections of the target architectures of `rules`
fn link_sections(rules: &RuleSet, compiled: &Compiled) -> Result<Program, CompileError> {
    let mut sections = Compiled::new();
    for arch in rules.archs() {
        let program = compiled
            .get(&arch)
            .ok_or(CompileError::MissingSection(arch))?;
        sections.insert(arch, program.clone());
    }
    for arch in compiled.keys().filter(|arch| !rules.has_arch(**arch)) {
        debug!("Ignoring program for {arch}: not a target architecture");
    }
    link(&sections, rules.bad_arch_action())
}
