//! Waiting, functions, nested calls, new queues and script-registered
//! event handlers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::commands::{literal_name, number_arg};
use crate::error::{ScriptError, ScriptResult};
use crate::event::EventHandler;
use crate::script::block::Instruction;
use crate::script::command::{BlockRule, Command, CommandMeta, Flow, Wait};
use crate::script::queue::{ExecContext, Frame};
use crate::script::{Script, Value};

/// Frames a single queue may nest before `call` refuses to go deeper.
pub const MAX_CALL_DEPTH: usize = 256;

/// Compile the executing instruction's block as a script named `name`.
fn compile_body(cx: &ExecContext<'_>, name: &str) -> ScriptResult<Arc<Script>> {
    let block = cx
        .instruction()
        .block
        .clone()
        .ok_or_else(|| ScriptError::Internal(format!("'{}' without a block", cx.instruction().name)))?;
    cx.engine
        .compile_block(name, &cx.frame().script, block)
        .map_err(|e| ScriptError::Runtime(e.report(name)))
}

fn find_script(cx: &mut ExecContext<'_>, name: &str) -> ScriptResult<Arc<Script>> {
    cx.engine
        .find_script(name)
        .ok_or_else(|| ScriptError::runtime(format!("Unknown function or script '{name}'.")))
}

/// `--key=value` arguments, evaluated, as initial variables.
fn named_vars(cx: &ExecContext<'_>) -> ScriptResult<HashMap<String, Value>> {
    let mut vars = HashMap::new();
    for (key, arg) in &cx.entry().named {
        vars.insert(key.clone(), cx.eval(arg)?);
    }
    Ok(vars)
}

// ── wait ──────────────────────────────────────────────────────────────────────

pub struct WaitCommand;

static WAIT: CommandMeta =
    CommandMeta::new("wait", "<seconds>", "Pauses the queue. Ignored when the script runs synchronously.")
        .args(1, Some(1));

impl Command for WaitCommand {
    fn meta(&self) -> &CommandMeta {
        &WAIT
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let seconds = number_arg(cx, 0)?;
        if !cx.delayable {
            cx.good("Not waiting: the queue cannot be delayed.");
            return Ok(Flow::Continue);
        }
        cx.good(&format!("Waiting {seconds} seconds."));
        Ok(Flow::Suspend(Wait::Seconds(seconds)))
    }
}

// ── function / call / run ─────────────────────────────────────────────────────

pub struct Function;

static FUNCTION: CommandMeta = CommandMeta::new(
    "function",
    "<name>",
    "Registers its block as a function for call and run. Arguments arrive in dvar[...].",
)
.args(1, Some(1))
.block(BlockRule::Required);

impl Command for Function {
    fn meta(&self) -> &CommandMeta {
        &FUNCTION
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        literal_name(instr, 0).map(|_| ())
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let name = cx.arg_text(0)?.to_lowercase();
        let script = compile_body(cx, &name)?;
        cx.engine.register_function(&name, script);
        cx.good(&format!("Function '{name}' defined."));
        cx.skip_block()?;
        Ok(Flow::Continue)
    }
}

pub struct Call;

static CALL: CommandMeta = CommandMeta::new(
    "call",
    "<function> [--<name>=<value>...]",
    "Runs a function or script file inside the current queue, then continues.",
)
.args(1, Some(1));

impl Command for Call {
    fn meta(&self) -> &CommandMeta {
        &CALL
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        if cx.frames.len() >= MAX_CALL_DEPTH {
            return Err(ScriptError::runtime(format!("Call stack is too deep (more than {MAX_CALL_DEPTH} frames).")));
        }
        let name = cx.arg_text(0)?;
        let script = find_script(cx, &name)?;
        let vars = named_vars(cx)?;
        cx.good(&format!("Calling '{}'.", script.name));
        cx.frames.push(Frame::new(script, vars));
        Ok(Flow::Continue)
    }
}

pub struct Run;

static RUN: CommandMeta = CommandMeta::new(
    "run",
    "<function> [--<name>=<value>...]",
    "Starts a function or script file on a new queue. With '&', waits for it to finish.",
)
.args(1, Some(1))
.waitable();

impl Command for Run {
    fn meta(&self) -> &CommandMeta {
        &RUN
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let name = cx.arg_text(0)?;
        let script = find_script(cx, &name)?;
        let vars = named_vars(cx)?;
        let output = cx.output.cloned();
        cx.good(&format!("Starting '{}' on a new queue.", script.name));
        let handle = cx.engine.start_script(&script, vars, output);
        if cx.instruction().wait_for && !handle.is_complete() {
            return Ok(Flow::Suspend(Wait::Until(handle)));
        }
        Ok(Flow::Continue)
    }
}

// ── event ─────────────────────────────────────────────────────────────────────

pub struct EventCommand;

static EVENT: CommandMeta = CommandMeta::new(
    "event",
    "add <event> <handler> [<priority>] { ... } | remove <event> <handler>",
    "Adds or removes a script event handler.",
)
.args(3, Some(4))
.block(BlockRule::Optional);

impl Command for EventCommand {
    fn meta(&self) -> &CommandMeta {
        &EVENT
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        let action = literal_name(instr, 0)?;
        literal_name(instr, 1)?;
        literal_name(instr, 2)?;
        match (action.as_str(), instr.block.is_some(), instr.args.len()) {
            ("add", true, _) => Ok(()),
            ("add", false, _) => Err("'event add' requires a { block }!".to_owned()),
            ("remove", false, 3) => Ok(()),
            ("remove", _, _) => Err("Usage: event remove <event> <handler>".to_owned()),
            (other, _, _) => Err(format!("Unknown event action '{other}': expected add or remove.")),
        }
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let action = cx.arg_text(0)?.to_lowercase();
        let event = cx.arg_text(1)?.to_lowercase();
        let handler = cx.arg_text(2)?.to_lowercase();

        if action == "remove" {
            if cx.engine.remove_event_handler(&event, &handler) {
                cx.good(&format!("Removed handler '{handler}' from event '{event}'."));
            } else {
                cx.bad(&format!("Event '{event}' has no handler '{handler}'."));
            }
            return Ok(Flow::Continue);
        }

        let priority = match cx.arg_count() {
            4 => {
                let value = cx.arg(3)?;
                let n = value
                    .as_integer()
                    .ok_or_else(|| ScriptError::runtime(format!("Invalid event priority '{value}'.")))?;
                i32::try_from(n).map_err(|_| ScriptError::runtime(format!("Invalid event priority '{n}'.")))?
            }
            _ => 0,
        };
        let script = compile_body(cx, &handler)?;
        let mut entry = EventHandler::new(&handler, script, priority);
        entry.from_script = true;
        cx.engine.register_event_handler(&event, entry);
        cx.good(&format!("Added handler '{handler}' to event '{event}' at priority {priority}."));
        cx.skip_block()?;
        Ok(Flow::Continue)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
