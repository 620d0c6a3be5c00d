//! Execution queues: the stack machine that runs compiled scripts.
//!
//! A [`CommandQueue`] holds a LIFO stack of [`Frame`]s.  Each step runs the
//! instruction at the top frame's program counter; the counter advances
//! before the command is dispatched, so commands jump by assigning it.
//!
//! A queue moves between these states:
//!
//! | State | Left by |
//! |-------|---------|
//! | running | suspension, error, or running out of frames |
//! | suspended | a tick bringing the wait to zero, or its wait handle completing |
//! | unwinding | reaching a `try` boundary (→ running) or not (→ stopped) |
//! | stopped | — |
//!
//! Synchronous (non-delayable) queues never suspend.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::engine::Engine;
use crate::error::{ScriptError, ScriptResult};
use crate::script::block::Instruction;
use crate::script::command::{Flow, Wait};
use crate::script::compiler::{CompiledArgument, Dispatch, Entry};
use crate::script::tags::TagContext;
use crate::script::value::Value;
use crate::script::{MessageType, OutputFn, Script, Verbosity};

// ── WaitHandle ────────────────────────────────────────────────────────────────

/// A one-shot completion flag shared between a queue and whoever waits on
/// it.  Safe to complete from another thread.
#[derive(Debug, Clone, Default)]
pub struct WaitHandle(Arc<AtomicBool>);

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// Progress of a `repeat` or `foreach` loop, keyed by its owner's index.
#[derive(Debug, Clone)]
pub enum LoopState {
    Count { current: i64, total: i64 },
    Items { index: usize, items: Vec<Value> },
}

/// One script invocation on a queue's stack.
#[derive(Debug)]
pub struct Frame {
    pub script: Arc<Script>,
    pub pc: usize,
    /// Instructions below this index were discarded by `goto`.
    pub floor: usize,
    pub slots: Vec<Value>,
    /// Variables injected at run time, read with `dvar[...]`.
    pub vars: HashMap<String, Value>,
    pub verbosity: Verbosity,
    pub determinations: Vec<Value>,
    pub loops: HashMap<usize, LoopState>,
    /// Outcome of `if`/`else` chains and caught `try` blocks, by owner index.
    pub branches: HashMap<usize, bool>,
}

impl Frame {
    /// A fresh frame.  Initial variables go to their slot when the script
    /// predeclared them, and to the dynamic variables otherwise.
    pub fn new(script: Arc<Script>, vars: HashMap<String, Value>) -> Self {
        let mut slots = script.unit.slot_template();
        let mut dynamic = HashMap::new();
        let first = script.unit.entries.first();
        let lookup = first.map(|e| e.var_lookup.clone());
        let own = first.and_then(|e| e.declares);
        for (name, value) in vars {
            let name = name.to_lowercase();
            match lookup.as_ref().and_then(|l| l.get(&name)).filter(|&&s| Some(s) != own) {
                Some(&slot) => {
                    let type_name = script.unit.slot_types[slot];
                    slots[slot] = value;
                    debug!(%name, slot, type_name, "initial variable bound to slot");
                }
                None => {
                    dynamic.insert(name, value);
                }
            }
        }
        Self {
            verbosity: script.verbosity,
            script,
            pc: 0,
            floor: 0,
            slots,
            vars: dynamic,
            determinations: Vec::new(),
            loops: HashMap::new(),
            branches: HashMap::new(),
        }
    }

    pub fn jump(&mut self, target: usize) -> ScriptResult<()> {
        if target < self.floor {
            return Err(ScriptError::runtime(
                "Cannot jump back into instructions discarded by goto.",
            ));
        }
        self.pc = target;
        Ok(())
    }

    /// Top-level variables visible at the end of the script.
    pub fn bindings(&self) -> HashMap<String, Value> {
        self.script
            .unit
            .final_lookup
            .iter()
            .map(|(name, &slot)| (name.clone(), self.slots.get(slot).cloned().unwrap_or_default()))
            .collect()
    }

    /// Index and entry of the instruction being executed.
    fn current(&self) -> Option<&Entry> {
        self.script.unit.entries.get(self.pc.checked_sub(1)?)
    }
}

// ── ExecContext ───────────────────────────────────────────────────────────────

/// What a command sees while it runs.
pub struct ExecContext<'a> {
    pub engine: &'a mut Engine,
    pub frames: &'a mut Vec<Frame>,
    /// Position of the executing frame in `frames`.
    pub depth: usize,
    /// Index of the executing instruction.
    pub index: usize,
    /// The queue may suspend.
    pub delayable: bool,
    pub output: Option<&'a OutputFn>,
}

impl ExecContext<'_> {
    pub fn frame(&self) -> &Frame {
        &self.frames[self.depth]
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frames[self.depth]
    }

    pub fn script(&self) -> Arc<Script> {
        self.frame().script.clone()
    }

    pub fn entry(&self) -> &Entry {
        &self.frame().script.unit.entries[self.index]
    }

    pub fn instruction(&self) -> &Instruction {
        &self.entry().instruction
    }

    pub fn eval(&self, arg: &CompiledArgument) -> ScriptResult<Value> {
        let frame = self.frame();
        let cx = TagContext {
            slots: &frame.slots,
            vars: &frame.vars,
            evaluators: &frame.script.unit.evaluators,
            types: &self.engine.registries().types,
        };
        arg.evaluate(&cx)
    }

    /// Positional argument `i`, or `null` when absent.
    pub fn arg(&self, i: usize) -> ScriptResult<Value> {
        match self.entry().args.get(i) {
            Some(arg) => self.eval(arg),
            None => Ok(Value::Null),
        }
    }

    pub fn arg_text(&self, i: usize) -> ScriptResult<String> {
        Ok(self.arg(i)?.to_string())
    }

    pub fn arg_count(&self) -> usize {
        self.entry().args.len()
    }

    pub fn named(&self, key: &str) -> ScriptResult<Option<Value>> {
        match self.entry().named.get(key) {
            Some(arg) => self.eval(arg).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_slot(&mut self, slot: usize, value: Value) {
        if let Some(s) = self.frame_mut().slots.get_mut(slot) {
            *s = value;
        }
    }

    pub fn jump(&mut self, target: usize) -> ScriptResult<()> {
        self.frame_mut().jump(target)
    }

    /// Jump past this instruction's block, and past its callback if it has
    /// one.
    pub fn skip_block(&mut self) -> ScriptResult<()> {
        let Some(block) = self.instruction().block.clone() else { return Ok(()) };
        let has_callback = self
            .frame()
            .script
            .unit
            .entries
            .get(block.end)
            .is_some_and(|e| e.instruction.callback_of == Some(self.index));
        self.jump(block.end + usize::from(has_callback))
    }

    /// Send a message through the queue's output, honoring the frame's
    /// verbosity.
    pub fn output(&self, message: &str, kind: MessageType) {
        emit(self.engine, self.output, self.frame().verbosity, message, kind);
    }

    pub fn info(&self, message: &str) {
        self.output(message, MessageType::Info);
    }

    pub fn good(&self, message: &str) {
        self.output(message, MessageType::Good);
    }

    pub fn bad(&self, message: &str) {
        self.output(message, MessageType::Bad);
    }
}

/// Route a message: the queue's own output if it has one, else the
/// engine's.  Bad messages always reach the engine output too.
pub(crate) fn emit(
    engine: &Engine,
    queue_output: Option<&OutputFn>,
    verbosity: Verbosity,
    message: &str,
    kind: MessageType,
) {
    if !kind.shown_at(verbosity) {
        return;
    }
    if kind == MessageType::Bad {
        warn!(target: "tagscript::output", "{message}");
    }
    match queue_output {
        Some(out) => {
            out(message, kind);
            if kind == MessageType::Bad {
                engine.output(message, kind);
            }
        }
        None => engine.output(message, kind),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command panicked".to_owned()
    }
}

// ── CommandQueue ──────────────────────────────────────────────────────────────

/// Result of a queue that ran to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// Determinations of the outermost frame.
    pub determinations: Vec<Value>,
    /// Top-level variables of the outermost frame at its end.
    pub bindings: HashMap<String, Value>,
    /// The queue stopped on an uncaught error.
    pub errored: bool,
}

pub struct CommandQueue {
    pub id: u64,
    frames: Vec<Frame>,
    wait: f64,
    waiting_on: Option<WaitHandle>,
    running: bool,
    delayable: bool,
    output: Option<OutputFn>,
    completion: WaitHandle,
    result: ExecutionResult,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("frames", &self.frames.len())
            .field("wait", &self.wait)
            .field("running", &self.running)
            .finish()
    }
}

impl CommandQueue {
    pub fn new(id: u64, frame: Frame, delayable: bool) -> Self {
        Self {
            id,
            frames: vec![frame],
            wait: 0.0,
            waiting_on: None,
            running: true,
            delayable,
            output: None,
            completion: WaitHandle::new(),
            result: ExecutionResult::default(),
        }
    }

    pub fn with_output(mut self, output: Option<OutputFn>) -> Self {
        self.output = output;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_delayable(&self) -> bool {
        self.delayable
    }

    /// Released when the queue stops.
    pub fn completion(&self) -> WaitHandle {
        self.completion.clone()
    }

    /// Seconds left on the current timed wait.
    pub fn remaining_wait(&self) -> f64 {
        self.wait
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn into_result(self) -> ExecutionResult {
        self.result
    }

    pub fn result(&self) -> &ExecutionResult {
        &self.result
    }

    /// Advance the timed wait by `delta` seconds, then run if nothing holds
    /// the queue back.
    pub fn tick(&mut self, delta: f64, engine: &mut Engine) {
        if !self.running {
            return;
        }
        if self.wait > 0.0 {
            self.wait -= delta;
            if self.wait > 0.0 {
                return;
            }
            self.wait = 0.0;
        }
        self.run(engine);
    }

    /// Run until the queue suspends or stops.
    pub fn run(&mut self, engine: &mut Engine) {
        while self.running {
            if let Some(handle) = &self.waiting_on {
                if !handle.is_complete() {
                    return;
                }
                self.waiting_on = None;
            }
            if self.wait > 0.0 {
                return;
            }
            let Some(depth) = self.frames.len().checked_sub(1) else {
                self.stop();
                break;
            };

            let frame = &mut self.frames[depth];
            if frame.pc >= frame.script.len() {
                self.complete_frame();
                continue;
            }
            let index = frame.pc;
            frame.pc += 1;
            let script = frame.script.clone();

            let command = match &script.unit.dispatch[index] {
                Dispatch::Command(cmd) => cmd.clone(),
                Dispatch::Unknown(name) => {
                    self.handle_error(ScriptError::runtime(format!("Unknown command '{name}'.")), engine);
                    continue;
                }
            };

            let result = {
                let mut cx = ExecContext {
                    engine: &mut *engine,
                    frames: &mut self.frames,
                    depth,
                    index,
                    delayable: self.delayable,
                    output: self.output.as_ref(),
                };
                catch_unwind(AssertUnwindSafe(|| command.execute(&mut cx)))
                    .unwrap_or_else(|payload| Err(ScriptError::Internal(panic_message(payload.as_ref()))))
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Suspend(wait)) if self.delayable => match wait {
                    Wait::Seconds(secs) if secs > 0.0 => self.wait = secs,
                    Wait::Seconds(_) => {}
                    Wait::Until(handle) => self.waiting_on = Some(handle),
                },
                Ok(Flow::Suspend(_)) => {}
                Ok(Flow::CompleteFrame) => {
                    self.frames.truncate(depth + 1);
                    self.complete_frame();
                }
                Ok(Flow::StopQueue) => self.stop(),
                Err(err) => self.handle_error(err, engine),
            }
        }
    }

    /// Pop the top frame and hand its results to the parent, or keep them as
    /// the queue's result when it was the last frame.
    fn complete_frame(&mut self) {
        let Some(frame) = self.frames.pop() else { return };
        let bindings = frame.bindings();
        match self.frames.last_mut() {
            Some(parent) => {
                parent
                    .vars
                    .insert("determinations".to_owned(), Value::List(frame.determinations));
                parent.vars.extend(bindings);
            }
            None => {
                self.result.determinations = frame.determinations;
                self.result.bindings = bindings;
            }
        }
    }

    /// Stop the queue and release anyone waiting on it.
    pub fn stop(&mut self) {
        if let Some(frame) = self.frames.first() {
            // Keep what the outermost frame has so far.
            self.result.determinations = frame.determinations.clone();
            self.result.bindings = frame.bindings();
        }
        self.frames.clear();
        self.running = false;
        self.completion.complete();
        debug!(queue = self.id, "queue stopped");
    }

    fn handle_error(&mut self, err: ScriptError, engine: &mut Engine) {
        let unwound = catch_unwind(AssertUnwindSafe(|| self.unwind(&err, engine)));
        if let Err(payload) = unwound {
            let message = panic_message(payload.as_ref());
            error!(queue = self.id, %err, %message, "failure while handling a script error");
            emit(
                engine,
                self.output.as_ref(),
                Verbosity::Minimal,
                &format!("Error while handling error '{err}': {message}"),
                MessageType::Bad,
            );
            self.result.errored = true;
            self.stop();
        }
    }

    /// Find the nearest enclosing `try` and resume there, or stop the queue
    /// and report the trace.
    fn unwind(&mut self, err: &ScriptError, engine: &mut Engine) {
        let mut trace = format!("ERROR: \"{err}\"");
        for frame in self.frames.iter().rev() {
            if let Some(entry) = frame.current() {
                let script = match &frame.script.origin {
                    Some(origin) => format!("'{}' (in '{origin}')", frame.script.name),
                    None => format!("'{}'", frame.script.name),
                };
                trace.push_str(&format!(
                    "\n    in script {script} at line {}: ({})",
                    entry.instruction.line, entry.instruction.source
                ));
            }
        }

        for depth in (0..self.frames.len()).rev() {
            let Some(target) = find_boundary(&self.frames[depth]) else { continue };
            self.frames.truncate(depth + 1);
            let frame = &mut self.frames[depth];
            frame.pc = target;
            if let Some(owner) = frame.script.unit.entries[target].instruction.callback_of {
                frame.branches.insert(owner, true);
            }
            frame.vars.insert("stack_trace".to_owned(), Value::Text(trace));
            debug!(queue = self.id, script = %frame.script.name, %err, "error caught by try block");
            return;
        }

        let verbosity = self.frames.last().map(|f| f.verbosity).unwrap_or_default();
        debug!(queue = self.id, %err, "uncaught script error");
        emit(engine, self.output.as_ref(), verbosity, &trace, MessageType::Bad);
        self.result.errored = true;
        self.stop();
    }
}

/// Index of the nearest pending error-boundary callback whose block
/// encloses the frame's current instruction.
fn find_boundary(frame: &Frame) -> Option<usize> {
    let unit = &frame.script.unit;
    (frame.pc..unit.len()).find(|&i| {
        let is_boundary = matches!(&unit.dispatch[i], Dispatch::Command(c) if c.meta().error_boundary);
        is_boundary
            && unit.entries[i]
                .instruction
                .callback_of
                .is_some_and(|owner| owner < frame.pc)
    })
}
