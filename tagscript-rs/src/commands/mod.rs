//! Built-in commands.
//!
//! - [`common`]: output, variables, determinations and errors
//! - [`flow`]: conditionals, loops, `once`, `goto`/`mark` and `try`/`catch`
//! - [`queue`]: waiting, functions, nested calls, new queues and events
//!
//! Block commands that loop or catch errors get a callback entry right
//! after their block; the interpreter dispatches that entry back to the
//! owning command, which then decides whether to jump back to the block
//! start or fall through.

pub mod common;
pub mod flow;
pub mod queue;

use std::sync::Arc;

use crate::error::{ScriptError, ScriptResult};
use crate::script::command::CommandRegistry;
use crate::script::block::Instruction;
use crate::script::queue::ExecContext;

/// Register every built-in command.
pub fn register_builtins(registry: &mut CommandRegistry) {
    registry.register(Arc::new(common::Echo));
    registry.register(Arc::new(common::Help));
    registry.register(Arc::new(common::Noop));
    registry.register(Arc::new(common::DebugCommand));
    registry.register(Arc::new(common::Define));
    registry.register(Arc::new(common::Set));
    registry.register(Arc::new(common::Determine));
    registry.register(Arc::new(common::ErrorCommand));
    registry.register(Arc::new(common::Stop));
    registry.register(Arc::new(common::CompileErrorCommand));

    registry.register(Arc::new(flow::If));
    registry.register(Arc::new(flow::Else));
    registry.register(Arc::new(flow::Repeat));
    registry.register(Arc::new(flow::Foreach));
    registry.register(Arc::new(flow::Once));
    registry.register(Arc::new(flow::Goto));
    registry.register(Arc::new(flow::Mark));
    registry.register(Arc::new(flow::Try));
    registry.register(Arc::new(flow::Catch));

    registry.register(Arc::new(queue::WaitCommand));
    registry.register(Arc::new(queue::Function));
    registry.register(Arc::new(queue::Call));
    registry.register(Arc::new(queue::Run));
    registry.register(Arc::new(queue::EventCommand));
}

// ── Argument helpers ──────────────────────────────────────────────────────────

/// Argument `i` as a boolean, or a runtime error naming the command.
pub(crate) fn bool_arg(cx: &ExecContext<'_>, i: usize) -> ScriptResult<bool> {
    let value = cx.arg(i)?;
    value.as_boolean().ok_or_else(|| {
        ScriptError::runtime(format!(
            "Command '{}' expects a boolean, got '{value}'.",
            cx.instruction().name
        ))
    })
}

pub(crate) fn integer_arg(cx: &ExecContext<'_>, i: usize) -> ScriptResult<i64> {
    let value = cx.arg(i)?;
    value.as_integer().ok_or_else(|| {
        ScriptError::runtime(format!(
            "Command '{}' expects an integer, got '{value}'.",
            cx.instruction().name
        ))
    })
}

pub(crate) fn number_arg(cx: &ExecContext<'_>, i: usize) -> ScriptResult<f64> {
    let value = cx.arg(i)?;
    value.as_number().ok_or_else(|| {
        ScriptError::runtime(format!(
            "Command '{}' expects a number, got '{value}'.",
            cx.instruction().name
        ))
    })
}

/// Lower-case name of a literal argument, for commands that name things
/// at compile time.
pub(crate) fn literal_name(instr: &Instruction, i: usize) -> Result<String, String> {
    instr
        .args
        .get(i)
        .and_then(|a| a.literal())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Command '{}' needs a plain name as argument {}.", instr.name, i + 1))
}

/// `--as=<name>` of a loop, as given in source.
pub(crate) fn loop_variable(instr: &Instruction) -> Result<Option<String>, String> {
    match instr.named.get("as") {
        None => Ok(None),
        Some(arg) => arg
            .literal()
            .map(|s| Some(s.trim().to_lowercase()))
            .ok_or_else(|| format!("Command '{}' needs a plain variable name for --as.", instr.name)),
    }
}

// ── Test support ──────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use crate::engine::Engine;
    use crate::script::queue::ExecutionResult;
    use crate::script::MessageType;

    pub type Lines = Arc<Mutex<Vec<(String, MessageType)>>>;

    pub struct Captured {
        pub lines: Vec<(String, MessageType)>,
    }

    impl Captured {
        /// Regular (`Info`) output only.
        pub fn texts(&self) -> Vec<&str> {
            self.lines
                .iter()
                .filter(|(_, k)| *k == MessageType::Info)
                .map(|(m, _)| m.as_str())
                .collect()
        }
    }

    pub fn engine() -> (Engine, Lines) {
        let lines: Lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let engine = Engine::new(Arc::new(move |m: &str, k| sink.lock().unwrap().push((m.to_owned(), k))));
        (engine, lines)
    }

    pub fn run_result(src: &str) -> (Captured, ExecutionResult) {
        let (mut engine, lines) = engine();
        let script = engine.script_from_source("test", src);
        let result = engine.execute_script(&script, HashMap::new());
        let lines = lines.lock().unwrap().clone();
        (Captured { lines }, result)
    }

    pub fn run(src: &str) -> Captured {
        run_result(src).0
    }
}
