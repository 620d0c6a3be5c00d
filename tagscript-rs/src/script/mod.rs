//! Script model: parsing, tag resolution, compilation, and execution.
//!
//! - [`block`] turns source text into a flat instruction list with nested
//!   block ranges
//! - [`argument`] parses arguments and `<{ }>` tag chains
//! - [`types`] and [`tags`] define the expression object model
//! - [`compiler`] resolves tags and variable slots into an [`ExecutableUnit`]
//! - [`queue`] is the stack machine that runs compiled scripts
//!
//! # Quick start
//!
//! ```rust
//! use tagscript::script::{compile_source, Registries};
//!
//! let reg = Registries::builtin();
//! let script = compile_source("demo", "define x 5; echo <{var[x]}>", &reg, &[]).unwrap();
//! assert_eq!(script.len(), 2);
//! assert_eq!(script.slot_count(), 1);
//! ```

pub mod argument;
pub mod block;
pub mod command;
pub mod compiler;
pub mod queue;
pub mod tags;
pub mod types;
pub mod value;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::commands;
use crate::error::CompileError;
use crate::script::block::Instruction;
use crate::script::command::CommandRegistry;
use crate::script::compiler::{Compiler, ExecutableUnit};
use crate::script::tags::TagBaseRegistry;
use crate::script::types::TypeRegistry;

pub use compiler::CompiledArgument;
pub use value::Value;

// ── Registries ────────────────────────────────────────────────────────────────

/// Commands, tag bases and tag types known to an engine.  Populated before
/// the engine starts and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct Registries {
    pub commands: CommandRegistry,
    pub bases: TagBaseRegistry,
    pub types: TypeRegistry,
}

impl Registries {
    /// Built-in commands, bases and types.
    pub fn builtin() -> Self {
        let mut commands = CommandRegistry::new();
        commands::register_builtins(&mut commands);
        Self { commands, bases: TagBaseRegistry::builtin(), types: TypeRegistry::builtin() }
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

/// How much a running script reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Every message, including step-by-step `Good` traces.
    Full,
    /// Regular output and errors.
    #[default]
    Minimal,
    /// Regular output only; errors are silent.
    None,
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Verbosity::Full),
            "minimal" => Ok(Verbosity::Minimal),
            "none" => Ok(Verbosity::None),
            other => Err(format!("Unknown verbosity '{other}': expected full, minimal or none.")),
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verbosity::Full => "full",
            Verbosity::Minimal => "minimal",
            Verbosity::None => "none",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Regular script output (`echo`).
    Info,
    /// Progress traces, shown at [`Verbosity::Full`] only.
    Good,
    /// Errors and warnings.
    Bad,
}

impl MessageType {
    pub fn shown_at(self, verbosity: Verbosity) -> bool {
        match self {
            MessageType::Info => true,
            MessageType::Good => verbosity == Verbosity::Full,
            MessageType::Bad => verbosity != Verbosity::None,
        }
    }
}

/// Host callback receiving script output.
pub type OutputFn = Arc<dyn Fn(&str, MessageType) + Send + Sync>;

// ── Script ────────────────────────────────────────────────────────────────────

/// An immutable compiled script.
#[derive(Debug)]
pub struct Script {
    /// Lower-case name.
    pub name: String,
    pub verbosity: Verbosity,
    pub unit: ExecutableUnit,
    /// `///key=value` header lines.
    pub headers: Vec<(String, String)>,
    /// Name of the script whose source this one was cut from, for function
    /// and event handler bodies.  Line numbers refer to that source.
    pub origin: Option<String>,
}

impl Script {
    pub fn new(name: &str, verbosity: Verbosity, unit: ExecutableUnit) -> Self {
        Self { name: name.to_lowercase(), verbosity, unit, headers: Vec::new(), origin: None }
    }

    pub fn len(&self) -> usize {
        self.unit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unit.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.unit.slot_count()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.unit.entries.iter().map(|e| &e.instruction)
    }

    /// Header value by lower-case key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Name of the source file this script's line numbers refer to.
    pub fn source_name(&self) -> &str {
        self.origin.as_deref().unwrap_or(&self.name)
    }

    /// Source text equivalent to this script.
    pub fn render(&self) -> String {
        let instrs: Vec<Instruction> = self.instructions().cloned().collect();
        block::render_range(&instrs, 0..instrs.len())
    }
}

/// Parse and compile `src` into a script.
pub fn compile_source(
    name: &str,
    src: &str,
    registries: &Registries,
    predefined: &[(String, &'static str)],
) -> Result<Script, CompileError> {
    let headers = block::parse_headers(src);
    let verbosity = headers
        .iter()
        .find(|(k, _)| k == "debug")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or_default();
    let instructions = block::parse(src, &registries.commands)?;
    let unit = Compiler::new(registries).compile(instructions, predefined)?;
    let mut script = Script::new(name, verbosity, unit);
    script.headers = headers;
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_parses_case_insensitively() {
        assert_eq!("FULL".parse::<Verbosity>().unwrap(), Verbosity::Full);
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[test]
    fn message_visibility() {
        assert!(MessageType::Info.shown_at(Verbosity::None));
        assert!(!MessageType::Good.shown_at(Verbosity::Minimal));
        assert!(MessageType::Bad.shown_at(Verbosity::Minimal));
        assert!(!MessageType::Bad.shown_at(Verbosity::None));
    }

    #[test]
    fn debug_header_sets_verbosity() {
        let reg = Registries::builtin();
        let script = compile_source("Demo", "///debug=full\necho hi", &reg, &[]).unwrap();
        assert_eq!(script.name, "demo");
        assert_eq!(script.verbosity, Verbosity::Full);
        assert_eq!(script.header("debug"), Some("full"));
    }

    #[test]
    fn render_recompiles_to_same_shape() {
        let reg = Registries::builtin();
        let src = "define x 5; if <{var[x].is_greater_than[3]}> { echo big } else { echo small }; echo <{var[x]}>";
        let script = compile_source("a", src, &reg, &[]).unwrap();
        let again = compile_source("a", &script.render(), &reg, &[]).unwrap();
        assert_eq!(script.len(), again.len());
        assert_eq!(script.slot_count(), again.slot_count());
    }
}
