//! The [`Command`] trait and the command registry.
//!
//! A command is looked up by name when a script is compiled.  It validates
//! its instruction's shape at compile time, may declare a local variable,
//! and is dispatched through the compiled jump table at run time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::ScriptResult;
use crate::script::block::Instruction;
use crate::script::compiler::CompiledArgument;
use crate::script::queue::{ExecContext, WaitHandle};

// ── Metadata ──────────────────────────────────────────────────────────────────

/// Whether a command owns a `{ }` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRule {
    Forbidden,
    Optional,
    Required,
}

#[derive(Debug, Clone)]
pub struct CommandMeta {
    pub name: &'static str,
    /// Argument summary shown by `help`, e.g. `<name> <value>`.
    pub usage: &'static str,
    pub description: &'static str,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub block: BlockRule,
    /// May be prefixed with `&` to suspend the queue until it finishes.
    pub waitable: bool,
    /// Its callback entry is where `try`-style error unwinding stops.
    pub error_boundary: bool,
}

impl CommandMeta {
    pub const fn new(name: &'static str, usage: &'static str, description: &'static str) -> Self {
        Self {
            name,
            usage,
            description,
            min_args: 0,
            max_args: Some(0),
            block: BlockRule::Forbidden,
            waitable: false,
            error_boundary: false,
        }
    }

    pub const fn args(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_args = min;
        self.max_args = max;
        self
    }

    pub const fn block(mut self, rule: BlockRule) -> Self {
        self.block = rule;
        self
    }

    pub const fn waitable(mut self) -> Self {
        self.waitable = true;
        self
    }

    pub const fn error_boundary(mut self) -> Self {
        self.error_boundary = true;
        self
    }
}

/// A local variable introduced by an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub type_name: &'static str,
}

/// What the interpreter does after a command returns.
#[derive(Debug, Clone)]
pub enum Flow {
    Continue,
    Suspend(Wait),
    CompleteFrame,
    StopQueue,
}

#[derive(Debug, Clone)]
pub enum Wait {
    Seconds(f64),
    Until(WaitHandle),
}

// ── Command trait ─────────────────────────────────────────────────────────────

pub trait Command: Send + Sync {
    fn meta(&self) -> &CommandMeta;

    /// Command-specific compile-time checks beyond arity and block shape.
    fn validate(&self, _instr: &Instruction) -> Result<(), String> {
        Ok(())
    }

    /// The variable this instruction declares, if any.
    fn declares(
        &self,
        _instr: &Instruction,
        _args: &[CompiledArgument],
        _named: &BTreeMap<String, CompiledArgument>,
    ) -> Result<Option<Declaration>, String> {
        Ok(None)
    }

    /// Place a callback entry right after this command's block.
    fn needs_callback(&self) -> bool {
        false
    }

    /// Names of commands this one must directly follow (`else` after `if`).
    fn links_previous(&self) -> Option<&'static [&'static str]> {
        None
    }

    /// Run the instruction at `cx.index`.  Callback entries are dispatched
    /// to their owner's command with `cx.instruction().callback_of` set.
    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow>;
}

impl fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self.meta().name)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a command under its lower-case name.
    pub fn register(&mut self, cmd: Arc<dyn Command>) {
        self.commands.insert(cmd.meta().name.to_ascii_lowercase(), cmd);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(name)
    }

    /// Sorted command names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
