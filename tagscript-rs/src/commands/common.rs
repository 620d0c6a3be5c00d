//! Output, variables, determinations and errors.

use std::collections::BTreeMap;

use crate::commands::literal_name;
use crate::engine::COMPILE_ERROR_COMMAND;
use crate::error::{ScriptError, ScriptResult};
use crate::script::block::Instruction;
use crate::script::command::{Command, CommandMeta, Declaration, Flow};
use crate::script::compiler::CompiledArgument;
use crate::script::queue::ExecContext;
use crate::script::{Value, Verbosity};

// ── echo / help / noop ────────────────────────────────────────────────────────

pub struct Echo;

static ECHO: CommandMeta = CommandMeta::new("echo", "<text>", "Shows text.").args(1, None);

impl Command for Echo {
    fn meta(&self) -> &CommandMeta {
        &ECHO
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let mut words = Vec::with_capacity(cx.arg_count());
        for i in 0..cx.arg_count() {
            words.push(cx.arg_text(i)?);
        }
        cx.info(&words.join(" "));
        Ok(Flow::Continue)
    }
}

pub struct Help;

static HELP: CommandMeta =
    CommandMeta::new("help", "[<command>]", "Shows how to use a command, or lists commands.").args(0, Some(1));

impl Command for Help {
    fn meta(&self) -> &CommandMeta {
        &HELP
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        if cx.arg_count() == 0 {
            let names = cx.engine.registries().commands.names().join(", ");
            cx.info(&format!("Commands: {names}"));
            return Ok(Flow::Continue);
        }
        let name = cx.arg_text(0)?.to_lowercase();
        let meta = match cx.engine.registries().commands.get(&name) {
            Some(cmd) => cmd.meta().clone(),
            None => return Err(ScriptError::runtime(format!("Unknown command '{name}'."))),
        };
        cx.info(&format!("Usage: {} {}", meta.name, meta.usage));
        cx.info(meta.description);
        Ok(Flow::Continue)
    }
}

pub struct Noop;

static NOOP: CommandMeta = CommandMeta::new("noop", "[<anything>...]", "Does nothing.").args(0, None);

impl Command for Noop {
    fn meta(&self) -> &CommandMeta {
        &NOOP
    }

    fn execute(&self, _cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        Ok(Flow::Continue)
    }
}

// ── debug ─────────────────────────────────────────────────────────────────────

pub struct DebugCommand;

static DEBUG: CommandMeta =
    CommandMeta::new("debug", "full|minimal|none", "Sets how much the current script reports.").args(1, Some(1));

impl Command for DebugCommand {
    fn meta(&self) -> &CommandMeta {
        &DEBUG
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        match instr.args[0].literal() {
            Some(mode) => mode.parse::<Verbosity>().map(|_| ()),
            None => Ok(()),
        }
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let mode: Verbosity = cx.arg_text(0)?.parse().map_err(ScriptError::Runtime)?;
        cx.frame_mut().verbosity = mode;
        cx.good(&format!("Debug mode set to {mode}."));
        Ok(Flow::Continue)
    }
}

// ── define / set ──────────────────────────────────────────────────────────────

pub struct Define;

static DEFINE: CommandMeta = CommandMeta::new(
    "define",
    "<name> <value>",
    "Declares a local variable, typed after its value.",
)
.args(2, Some(2));

impl Command for Define {
    fn meta(&self) -> &CommandMeta {
        &DEFINE
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        let name = literal_name(instr, 0)?;
        if name.contains(['.', '[', ']']) {
            return Err(format!("Invalid variable name '{name}'."));
        }
        Ok(())
    }

    fn declares(
        &self,
        instr: &Instruction,
        args: &[CompiledArgument],
        _named: &BTreeMap<String, CompiledArgument>,
    ) -> Result<Option<Declaration>, String> {
        let name = literal_name(instr, 0)?;
        let type_name = args.get(1).map_or("text", |a| a.type_name);
        Ok(Some(Declaration { name, type_name }))
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let slot = cx
            .entry()
            .declares
            .ok_or_else(|| ScriptError::Internal("define without a slot".to_owned()))?;
        let type_name = cx.frame().script.unit.slot_types[slot];
        let value = cx.engine.registries().types.convert(&cx.arg(1)?, type_name);
        if cx.frame().verbosity == Verbosity::Full {
            let name = cx.frame().script.unit.slot_names[slot].clone();
            cx.good(&format!("Defined {type_name} variable '{name}' as '{value}'."));
        }
        cx.set_slot(slot, value);
        Ok(Flow::Continue)
    }
}

/// Arithmetic assignment modes of `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetMode {
    Assign,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl SetMode {
    fn parse(op: &str) -> Result<Self, String> {
        match op {
            "=" => Ok(SetMode::Assign),
            "+=" => Ok(SetMode::Add),
            "-=" => Ok(SetMode::Subtract),
            "*=" => Ok(SetMode::Multiply),
            "/=" => Ok(SetMode::Divide),
            _ => Err(format!("That setter mode ({op}) does not exist!")),
        }
    }
}

pub struct Set;

static SET: CommandMeta = CommandMeta::new(
    "set",
    "<name> =|+=|-=|*=|/= <value>",
    "Changes a declared local variable.",
)
.args(3, Some(3));

impl Command for Set {
    fn meta(&self) -> &CommandMeta {
        &SET
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        literal_name(instr, 0)?;
        let op = instr.args[1].literal().unwrap_or_default();
        SetMode::parse(op.trim()).map(|_| ())
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let name = cx.arg_text(0)?.to_lowercase();
        let Some(&slot) = cx.entry().var_lookup.get(&name) else {
            return Err(ScriptError::runtime(format!(
                "Unknown variable name '{name}' - cannot set its value."
            )));
        };
        let mode = SetMode::parse(cx.arg_text(1)?.trim()).map_err(ScriptError::Runtime)?;
        let type_name = cx.frame().script.unit.slot_types[slot];
        let current = cx.frame().slots[slot].clone();
        let input = cx.arg(2)?;
        let types = &cx.engine.registries().types;

        let value = if mode == SetMode::Assign {
            types.convert(&input, type_name)
        } else if types.is_a(type_name, "integer") {
            integer_op(mode, &current, &input)?
        } else if types.is_a(type_name, "number") {
            number_op(mode, &current, &input)?
        } else if type_name == "list" && mode == SetMode::Add {
            let mut items = current.as_list();
            items.push(input);
            Value::List(items)
        } else {
            return Err(ScriptError::runtime(format!(
                "Cannot use that setter mode ({mode:?}) on a variable of type '{type_name}'!"
            )));
        };
        if cx.frame().verbosity == Verbosity::Full {
            cx.good(&format!("Set variable '{name}' to '{value}'."));
        }
        cx.set_slot(slot, value);
        Ok(Flow::Continue)
    }
}

fn integer_op(mode: SetMode, current: &Value, input: &Value) -> ScriptResult<Value> {
    let (Some(a), Some(b)) = (current.as_integer(), input.as_integer()) else {
        return Err(ScriptError::runtime(format!("Cannot {mode:?} '{current}' and '{input}' as integers.")));
    };
    let result = match mode {
        SetMode::Add => a.checked_add(b),
        SetMode::Subtract => a.checked_sub(b),
        SetMode::Multiply => a.checked_mul(b),
        SetMode::Divide if b == 0 => return Err(ScriptError::runtime("Cannot divide by zero.")),
        SetMode::Divide => a.checked_div(b),
        SetMode::Assign => Some(b),
    };
    result.map(Value::Integer).ok_or_else(|| ScriptError::runtime("Integer overflow."))
}

fn number_op(mode: SetMode, current: &Value, input: &Value) -> ScriptResult<Value> {
    let (Some(a), Some(b)) = (current.as_number(), input.as_number()) else {
        return Err(ScriptError::runtime(format!("Cannot {mode:?} '{current}' and '{input}' as numbers.")));
    };
    Ok(Value::Number(match mode {
        SetMode::Add => a + b,
        SetMode::Subtract => a - b,
        SetMode::Multiply => a * b,
        SetMode::Divide if b == 0.0 => return Err(ScriptError::runtime("Cannot divide by zero.")),
        SetMode::Divide => a / b,
        SetMode::Assign => b,
    }))
}

// ── determine ─────────────────────────────────────────────────────────────────

pub struct Determine;

static DETERMINE: CommandMeta = CommandMeta::new(
    "determine",
    "<value>",
    "Adds an outcome to the current script's determinations.",
)
.args(1, Some(1));

impl Command for Determine {
    fn meta(&self) -> &CommandMeta {
        &DETERMINE
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let value = cx.arg(0)?;
        cx.good(&format!("Determined '{value}'."));
        cx.frame_mut().determinations.push(value);
        Ok(Flow::Continue)
    }
}

// ── error / stop ──────────────────────────────────────────────────────────────

pub struct ErrorCommand;

static ERROR: CommandMeta =
    CommandMeta::new("error", "<message>", "Raises an error, caught by an enclosing try block.").args(1, None);

impl Command for ErrorCommand {
    fn meta(&self) -> &CommandMeta {
        &ERROR
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let mut words = Vec::with_capacity(cx.arg_count());
        for i in 0..cx.arg_count() {
            words.push(cx.arg_text(i)?);
        }
        Err(ScriptError::Runtime(words.join(" ")))
    }
}

pub struct Stop;

static STOP: CommandMeta = CommandMeta::new("stop", "", "Stops the current queue.");

impl Command for Stop {
    fn meta(&self) -> &CommandMeta {
        &STOP
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        cx.good("Stopping queue.");
        Ok(Flow::StopQueue)
    }
}

/// Stands in for a script that failed to compile, and raises the compile
/// report when run.
pub struct CompileErrorCommand;

static COMPILE_ERROR: CommandMeta =
    CommandMeta::new(COMPILE_ERROR_COMMAND, "<report>", "Reports a script compile failure.").args(1, Some(1));

impl Command for CompileErrorCommand {
    fn meta(&self) -> &CommandMeta {
        &COMPILE_ERROR
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        Err(ScriptError::Runtime(cx.arg_text(0)?))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
