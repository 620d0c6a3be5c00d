//! Conditionals, loops, run-once guards, `goto`/`mark` and `try`/`catch`.

use std::collections::BTreeMap;

use tracing::debug;

use crate::commands::{bool_arg, integer_arg, literal_name, loop_variable};
use crate::error::{ScriptError, ScriptResult};
use crate::script::block::Instruction;
use crate::script::command::{BlockRule, Command, CommandMeta, Declaration, Flow};
use crate::script::compiler::CompiledArgument;
use crate::script::queue::{ExecContext, LoopState};
use crate::script::Value;

// ── if / else ─────────────────────────────────────────────────────────────────

pub struct If;

static IF: CommandMeta = CommandMeta::new("if", "<condition>", "Runs its block when the condition is true.")
    .args(1, Some(1))
    .block(BlockRule::Required);

impl Command for If {
    fn meta(&self) -> &CommandMeta {
        &IF
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let taken = bool_arg(cx, 0)?;
        let index = cx.index;
        cx.frame_mut().branches.insert(index, taken);
        if !taken {
            cx.skip_block()?;
        }
        Ok(Flow::Continue)
    }
}

pub struct Else;

static ELSE: CommandMeta = CommandMeta::new(
    "else",
    "[if <condition>]",
    "Runs its block when no earlier branch of the if chain ran.",
)
.args(0, Some(2))
.block(BlockRule::Required);

impl Command for Else {
    fn meta(&self) -> &CommandMeta {
        &ELSE
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        let is_if = instr.args.first().and_then(|a| a.literal()).is_some_and(|w| w.eq_ignore_ascii_case("if"));
        match instr.args.len() {
            0 => Ok(()),
            2 if is_if => Ok(()),
            _ => Err("Usage: else [if <condition>]".to_owned()),
        }
    }

    fn links_previous(&self) -> Option<&'static [&'static str]> {
        Some(&["if", "else"])
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let index = cx.index;
        let link = cx
            .instruction()
            .link
            .ok_or_else(|| ScriptError::Internal("else without a preceding branch".to_owned()))?;
        let earlier = cx.frame().branches.get(&link).copied().unwrap_or(false);
        let taken = if earlier {
            false
        } else if cx.arg_count() == 2 {
            bool_arg(cx, 1)?
        } else {
            true
        };
        // The chain is settled once any branch ran.
        cx.frame_mut().branches.insert(index, earlier || taken);
        if !taken {
            cx.skip_block()?;
        }
        Ok(Flow::Continue)
    }
}

// ── repeat / foreach ──────────────────────────────────────────────────────────

/// Index of the loop owner for a callback entry.
fn loop_owner(cx: &ExecContext<'_>) -> Option<usize> {
    cx.instruction().callback_of
}

/// Start of the owner's block, to jump back to.
fn block_start(cx: &ExecContext<'_>, owner: usize) -> ScriptResult<usize> {
    cx.frame().script.unit.entries[owner]
        .instruction
        .block
        .as_ref()
        .map(|b| b.start)
        .ok_or_else(|| ScriptError::Internal("loop without a block".to_owned()))
}

fn set_loop_variable(cx: &mut ExecContext<'_>, owner: usize, value: Value) {
    if let Some(slot) = cx.frame().script.unit.entries[owner].declares {
        cx.set_slot(slot, value);
    }
}

pub struct Repeat;

static REPEAT: CommandMeta = CommandMeta::new(
    "repeat",
    "<count> [--as=<variable>]",
    "Runs its block a number of times. The variable counts from 1.",
)
.args(1, Some(1))
.block(BlockRule::Required);

impl Command for Repeat {
    fn meta(&self) -> &CommandMeta {
        &REPEAT
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        loop_variable(instr).map(|_| ())
    }

    fn declares(
        &self,
        instr: &Instruction,
        _args: &[CompiledArgument],
        _named: &BTreeMap<String, CompiledArgument>,
    ) -> Result<Option<Declaration>, String> {
        Ok(loop_variable(instr)?.map(|name| Declaration { name, type_name: "integer" }))
    }

    fn needs_callback(&self) -> bool {
        true
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        if let Some(owner) = loop_owner(cx) {
            let next = match cx.frame_mut().loops.get_mut(&owner) {
                Some(LoopState::Count { current, total }) if *current < *total => {
                    *current += 1;
                    Some(*current)
                }
                _ => None,
            };
            match next {
                Some(n) => {
                    set_loop_variable(cx, owner, Value::Integer(n));
                    let start = block_start(cx, owner)?;
                    cx.jump(start)?;
                }
                None => {
                    cx.frame_mut().loops.remove(&owner);
                }
            }
            return Ok(Flow::Continue);
        }

        let total = integer_arg(cx, 0)?;
        let index = cx.index;
        if total <= 0 {
            cx.good("Repeat count is zero, skipping.");
            return cx.skip_block().map(|_| Flow::Continue);
        }
        cx.frame_mut().loops.insert(index, LoopState::Count { current: 1, total });
        set_loop_variable(cx, index, Value::Integer(1));
        Ok(Flow::Continue)
    }
}

pub struct Foreach;

static FOREACH: CommandMeta = CommandMeta::new(
    "foreach",
    "<list> [--as=<variable>]",
    "Runs its block once per list item.",
)
.args(1, Some(1))
.block(BlockRule::Required);

impl Command for Foreach {
    fn meta(&self) -> &CommandMeta {
        &FOREACH
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        loop_variable(instr).map(|_| ())
    }

    fn declares(
        &self,
        instr: &Instruction,
        _args: &[CompiledArgument],
        _named: &BTreeMap<String, CompiledArgument>,
    ) -> Result<Option<Declaration>, String> {
        Ok(loop_variable(instr)?.map(|name| Declaration { name, type_name: "dynamic" }))
    }

    fn needs_callback(&self) -> bool {
        true
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        if let Some(owner) = loop_owner(cx) {
            let next = match cx.frame_mut().loops.get_mut(&owner) {
                Some(LoopState::Items { index, items }) if *index + 1 < items.len() => {
                    *index += 1;
                    Some(items[*index].clone())
                }
                _ => None,
            };
            match next {
                Some(item) => {
                    set_loop_variable(cx, owner, item);
                    let start = block_start(cx, owner)?;
                    cx.jump(start)?;
                }
                None => {
                    cx.frame_mut().loops.remove(&owner);
                }
            }
            return Ok(Flow::Continue);
        }

        let items = cx.arg(0)?.as_list();
        let index = cx.index;
        let Some(first) = items.first().cloned() else {
            return cx.skip_block().map(|_| Flow::Continue);
        };
        cx.frame_mut().loops.insert(index, LoopState::Items { index: 0, items });
        set_loop_variable(cx, index, first);
        Ok(Flow::Continue)
    }
}

// ── once ──────────────────────────────────────────────────────────────────────

/// What `once` does when its id was already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepeatPolicy {
    Error,
    Warning,
    Quiet,
}

impl RepeatPolicy {
    fn parse(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(RepeatPolicy::Error),
            "warning" => Ok(RepeatPolicy::Warning),
            "quiet" => Ok(RepeatPolicy::Quiet),
            other => Err(format!("Unknown once mode '{other}': expected error, warning or quiet.")),
        }
    }
}

pub struct Once;

static ONCE: CommandMeta = CommandMeta::new(
    "once",
    "<id> [error|warning|quiet]",
    "Runs its block only the first time the id is seen.",
)
.args(1, Some(2))
.block(BlockRule::Required);

impl Command for Once {
    fn meta(&self) -> &CommandMeta {
        &ONCE
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        match instr.args.get(1).and_then(|a| a.literal()) {
            Some(mode) => RepeatPolicy::parse(&mode).map(|_| ()),
            None => Ok(()),
        }
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let id = cx.arg_text(0)?.to_lowercase();
        let policy = match cx.arg_count() {
            2 => RepeatPolicy::parse(&cx.arg_text(1)?).map_err(ScriptError::Runtime)?,
            _ => RepeatPolicy::Error,
        };
        if cx.engine.mark_once(&id) {
            cx.good(&format!("Once block '{id}' entered."));
            return Ok(Flow::Continue);
        }
        debug!(%id, ?policy, "once block repeated");
        let message = format!("Once block repeated: {id}");
        match policy {
            RepeatPolicy::Error => return Err(ScriptError::Runtime(message)),
            RepeatPolicy::Warning => cx.bad(&message),
            RepeatPolicy::Quiet => {}
        }
        cx.skip_block()?;
        Ok(Flow::Continue)
    }
}

// ── goto / mark ───────────────────────────────────────────────────────────────

pub struct Goto;

static GOTO: CommandMeta = CommandMeta::new(
    "goto",
    "<label>",
    "Jumps forward to a mark. Everything up to the mark is discarded for good.",
)
.args(1, Some(1));

impl Command for Goto {
    fn meta(&self) -> &CommandMeta {
        &GOTO
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let label = cx.arg_text(0)?.trim().to_lowercase();
        let script = cx.script();
        let from = cx.frame().pc;
        let target = script.unit.entries[from..].iter().position(|e| {
            e.instruction.name == "mark"
                && e.args.first().and_then(CompiledArgument::literal).is_some_and(|l| l.trim().eq_ignore_ascii_case(&label))
        });
        let Some(offset) = target else {
            return Err(ScriptError::runtime("Cannot goto marked location: unknown marker!"));
        };
        let after = from + offset + 1;
        let frame = cx.frame_mut();
        frame.floor = after;
        frame.pc = after;
        cx.good(&format!("Went to mark '{label}'."));
        Ok(Flow::Continue)
    }
}

pub struct Mark;

static MARK: CommandMeta = CommandMeta::new("mark", "<label>", "A place for goto to jump to.").args(1, Some(1));

impl Command for Mark {
    fn meta(&self) -> &CommandMeta {
        &MARK
    }

    fn validate(&self, instr: &Instruction) -> Result<(), String> {
        literal_name(instr, 0).map(|_| ())
    }

    fn execute(&self, _cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        Ok(Flow::Continue)
    }
}

// ── try / catch ───────────────────────────────────────────────────────────────

pub struct Try;

static TRY: CommandMeta = CommandMeta::new(
    "try",
    "",
    "Runs its block; an error inside stops the block instead of the queue.",
)
.block(BlockRule::Required)
.error_boundary();

impl Command for Try {
    fn meta(&self) -> &CommandMeta {
        &TRY
    }

    fn needs_callback(&self) -> bool {
        true
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        if let Some(owner) = cx.instruction().callback_of {
            if cx.frame().branches.get(&owner).copied().unwrap_or(false) {
                cx.good("Error caught by try block.");
            }
            return Ok(Flow::Continue);
        }
        let index = cx.index;
        cx.frame_mut().branches.insert(index, false);
        Ok(Flow::Continue)
    }
}

pub struct Catch;

static CATCH: CommandMeta = CommandMeta::new(
    "catch",
    "",
    "Runs its block when the try block before it caught an error. The trace is in dvar[stack_trace].",
)
.block(BlockRule::Required);

impl Command for Catch {
    fn meta(&self) -> &CommandMeta {
        &CATCH
    }

    fn links_previous(&self) -> Option<&'static [&'static str]> {
        Some(&["try"])
    }

    fn execute(&self, cx: &mut ExecContext<'_>) -> ScriptResult<Flow> {
        let caught = cx
            .instruction()
            .link
            .and_then(|owner| cx.frame().branches.get(&owner).copied())
            .unwrap_or(false);
        if !caught {
            cx.skip_block()?;
        }
        Ok(Flow::Continue)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::commands::tests::{engine, run, run_result};
    use crate::script::MessageType;
    use std::collections::HashMap;

    #[test]
    fn if_else_chain() {
        let src = "define x 5; \
                   if <{var[x].is_greater_than[10]}> { echo big } \
                   else if <{var[x].is_greater_than[3]}> { echo medium } \
                   else { echo small }; echo done";
        assert_eq!(run(src).texts(), vec!["medium", "done"]);
        let src = "if false { echo a } else { echo b }";
        assert_eq!(run(src).texts(), vec!["b"]);
        let src = "if true { echo a } else { echo b }";
        assert_eq!(run(src).texts(), vec!["a"]);
    }

    #[test]
    fn else_must_follow_if() {
        let out = run("echo a; else { echo b }");
        assert!(out.lines[0].0.contains("'else' must directly follow one of: if, else."));
    }

    #[test]
    fn non_boolean_condition_fails() {
        let out = run("if maybe { echo a }");
        assert!(out.lines[0].0.contains("expects a boolean"));
    }

    #[test]
    fn repeat_counts_from_one() {
        let out = run("repeat 3 --as=i { echo <{var[i]}> }; echo end");
        assert_eq!(out.texts(), vec!["1", "2", "3", "end"]);
    }

    #[test]
    fn repeat_zero_skips_block() {
        let out = run("repeat 0 { echo never }; echo end");
        assert_eq!(out.texts(), vec!["end"]);
    }

    #[test]
    fn nested_loops() {
        let out = run("repeat 2 --as=a { repeat 2 --as=b { echo <{var[a]}>-<{var[b]}> } }");
        assert_eq!(out.texts(), vec!["1-1", "1-2", "2-1", "2-2"]);
    }

    #[test]
    fn foreach_items() {
        let out = run("foreach <{list[x|y|z]}> --as=item { echo <{var[item].to_upper}> }");
        assert_eq!(out.texts(), vec!["X", "Y", "Z"]);
        let out = run("foreach <{list[]}> { echo never }; echo end");
        assert_eq!(out.texts(), vec!["end"]);
    }

    #[test]
    fn once_policies() {
        let (mut engine, lines) = engine();
        let quiet = engine.script_from_source("q", "once a quiet { echo first }; once a quiet { echo second }");
        engine.execute_script(&quiet, HashMap::new());
        let warn = engine.script_from_source("w", "once b warning { echo one }; once b warning { echo two }; echo after");
        engine.execute_script(&warn, HashMap::new());
        let got = lines.lock().unwrap().clone();
        let texts: Vec<&str> = got.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(texts, vec!["first", "one", "Once block repeated: b", "after"]);
        assert_eq!(got[2].1, MessageType::Bad);
    }

    #[test]
    fn once_ids_are_case_insensitive() {
        let out = run("once Demo { echo hi }; once DEMO { echo again }");
        assert_eq!(out.texts(), vec!["hi"]);
        assert!(out.lines[1].0.contains("Once block repeated: demo"));
    }

    #[test]
    fn goto_discards_earlier_instructions() {
        let out = run("goto end; echo skipped; mark end; echo shown");
        assert_eq!(out.texts(), vec!["shown"]);
    }

    #[test]
    fn goto_cannot_jump_back_into_a_loop() {
        let (out, result) = run_result("repeat 2 { goto out; mark out }");
        assert!(result.errored);
        assert!(out.lines[0].0.contains("Cannot jump back into instructions discarded by goto."));
    }

    #[test]
    fn try_catches_and_catch_sees_trace() {
        let src = "try { echo in; error boom; echo never } catch { echo <{dvar[stack_trace]}> }; echo after";
        let (out, result) = run_result(src);
        assert!(!result.errored);
        let texts = out.texts();
        assert_eq!(texts[0], "in");
        assert!(texts[1].starts_with("ERROR: \"boom\""));
        assert!(texts[1].contains("in script 'test' at line 1: (error boom)"));
        assert_eq!(texts[2], "after");
    }

    #[test]
    fn catch_skipped_without_error() {
        let out = run("try { echo fine } catch { echo caught }; echo after");
        assert_eq!(out.texts(), vec!["fine", "after"]);
    }

    #[test]
    fn nested_try_catches_innermost() {
        let src = "try { try { error inner } catch { echo inner caught }; error outer } catch { echo outer caught }";
        assert_eq!(run(src).texts(), vec!["inner caught", "outer caught"]);
    }

    #[test]
    fn error_after_try_block_is_not_caught() {
        let (_, result) = run_result("try { echo ok }; error later");
        assert!(result.errored);
    }
}
