//! The engine: script cache, functions, event handlers and active queues.
//!
//! The host owns one [`Engine`] and drives it with [`Engine::tick`].  All
//! mutable engine state (the once-set, functions, event handlers, queues)
//! is touched only from the thread that ticks; the registries are fixed at
//! construction.
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use tagscript::engine::Engine;
//!
//! let lines = Arc::new(Mutex::new(Vec::new()));
//! let sink = lines.clone();
//! let mut engine = Engine::new(Arc::new(move |msg: &str, _| sink.lock().unwrap().push(msg.to_owned())));
//! let script = engine.script_from_source("hello", "echo <{text[hi].to_upper}>");
//! engine.execute_script(&script, Default::default());
//! assert_eq!(*lines.lock().unwrap(), vec!["HI".to_owned()]);
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::CompileError;
use crate::event::{Event, EventHandler};
use crate::script::argument::Argument;
use crate::script::block::{self, Instruction};
use crate::script::compiler::Compiler;
use crate::script::queue::{CommandQueue, ExecutionResult, Frame, WaitHandle};
use crate::script::{compile_source, MessageType, OutputFn, Registries, Script, Value, Verbosity};

/// Name of the command a script that failed to compile is replaced with.
pub const COMPILE_ERROR_COMMAND: &str = "internal_compile_error";

/// Loads a named script file's text.  `Ok(None)` means the file does not
/// exist.
pub type FileLoader = Arc<dyn Fn(&str) -> Result<Option<String>, String> + Send + Sync>;

pub struct Engine {
    registries: Arc<Registries>,
    output: OutputFn,
    loader: Option<FileLoader>,
    /// Script file extension, without the dot.
    extension: String,
    /// Verbosity of scripts without a `///debug` header.
    verbosity: Verbosity,
    scripts: HashMap<String, Arc<Script>>,
    functions: HashMap<String, Arc<Script>>,
    once: HashSet<String>,
    events: HashMap<String, Vec<EventHandler>>,
    queues: Vec<CommandQueue>,
    /// `///autorun=N` scripts, sorted by priority.
    autorun: Vec<(i32, Arc<Script>)>,
    next_queue_id: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scripts", &self.scripts.len())
            .field("functions", &self.functions.len())
            .field("events", &self.events.len())
            .field("queues", &self.queues.len())
            .finish()
    }
}

impl Engine {
    /// An engine with the built-in commands, tag bases and types.
    pub fn new(output: OutputFn) -> Self {
        Self::with_registries(Registries::builtin(), output)
    }

    pub fn with_registries(registries: Registries, output: OutputFn) -> Self {
        Self {
            registries: Arc::new(registries),
            output,
            loader: None,
            extension: "cfg".to_owned(),
            verbosity: Verbosity::default(),
            scripts: HashMap::new(),
            functions: HashMap::new(),
            once: HashSet::new(),
            events: HashMap::new(),
            queues: Vec::new(),
            autorun: Vec::new(),
            next_queue_id: 1,
        }
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn set_loader(&mut self, loader: FileLoader) {
        self.loader = Some(loader);
    }

    pub fn set_extension(&mut self, extension: &str) {
        self.extension = extension.trim_start_matches('.').to_owned();
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Default verbosity for scripts compiled from now on.
    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }

    /// A loader reading `<dir>/<name>`.
    pub fn fs_loader(dir: PathBuf) -> FileLoader {
        Arc::new(move |name: &str| {
            let path = dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(src) => Ok(Some(src)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(format!("{}: {e}", path.display())),
            }
        })
    }

    /// Send a message to the engine output.
    pub fn output(&self, message: &str, kind: MessageType) {
        (self.output)(message, kind);
    }

    // ── Compiling ─────────────────────────────────────────────────────────────

    pub fn try_compile(&self, name: &str, src: &str) -> Result<Arc<Script>, CompileError> {
        self.compile_with_vars(name, src, &[])
    }

    /// Compile with `predefined` variables visible from the first
    /// instruction on.
    pub fn compile_with_vars(
        &self,
        name: &str,
        src: &str,
        predefined: &[(String, &'static str)],
    ) -> Result<Arc<Script>, CompileError> {
        let mut script = compile_source(name, src, &self.registries, predefined)?;
        if script.header("debug").is_none() {
            script.verbosity = self.verbosity;
        }
        debug!(script = %script.name, instructions = script.len(), slots = script.slot_count(), "compiled script");
        Ok(Arc::new(script))
    }

    /// Compile the block `range` of `owner` as a script of its own, named
    /// `name`.  Instructions keep their source lines.
    pub fn compile_block(&self, name: &str, owner: &Script, range: Range<usize>) -> Result<Arc<Script>, CompileError> {
        let instrs: Vec<Instruction> = owner.instructions().cloned().collect();
        let unit = Compiler::new(&self.registries).compile(block::extract_block(&instrs, range), &[])?;
        let mut script = Script::new(name, owner.verbosity, unit);
        script.origin = Some(owner.source_name().to_owned());
        debug!(script = %script.name, origin = %owner.source_name(), instructions = script.len(), "compiled block");
        Ok(Arc::new(script))
    }

    /// Compile `src`.  On failure the error is reported through the engine
    /// output and the result is a script that raises it when run.
    pub fn script_from_source(&self, name: &str, src: &str) -> Arc<Script> {
        match self.try_compile(name, src) {
            Ok(script) => script,
            Err(err) => {
                let report = err.report(&name.to_lowercase());
                error!(script = %name, line = err.line(), "{err}");
                self.output(&report, MessageType::Bad);
                Arc::new(self.compile_error_script(name, &report))
            }
        }
    }

    fn compile_error_script(&self, name: &str, report: &str) -> Script {
        let mut instr = Instruction::new(COMPILE_ERROR_COMMAND, 1);
        instr.args.push(Argument::text(report));
        instr.source = format!("{COMPILE_ERROR_COMMAND} \"{report}\"");
        let unit = Compiler::new(&self.registries).compile(vec![instr], &[]).unwrap_or_default();
        Script::new(name, self.verbosity, unit)
    }

    /// The script file `<name>.<ext>` through the file loader, cached by
    /// name.  `None` when there is no loader or no such file.
    pub fn get_script_file(&mut self, name: &str) -> Option<Arc<Script>> {
        let key = name.to_lowercase();
        if let Some(script) = self.scripts.get(&key) {
            return Some(script.clone());
        }
        let loader = self.loader.clone()?;
        let file = format!("{name}.{}", self.extension);
        match loader(&file) {
            Ok(Some(src)) => {
                let script = self.script_from_source(name, &src);
                self.scripts.insert(key, script.clone());
                Some(script)
            }
            Ok(None) => None,
            Err(e) => {
                self.output(&format!("Generating script for file '{name}': {e}"), MessageType::Bad);
                None
            }
        }
    }

    // ── Functions and once-guards ─────────────────────────────────────────────

    pub fn register_function(&mut self, name: &str, script: Arc<Script>) {
        debug!(function = %name, "registered function");
        self.functions.insert(name.to_lowercase(), script);
    }

    pub fn function(&self, name: &str) -> Option<Arc<Script>> {
        self.functions.get(&name.to_lowercase()).cloned()
    }

    /// A function by name, else the script file of that name.
    pub fn find_script(&mut self, name: &str) -> Option<Arc<Script>> {
        self.function(name).or_else(|| self.get_script_file(name))
    }

    /// Record a once-block id.  `true` the first time it is seen.
    pub fn mark_once(&mut self, id: &str) -> bool {
        self.once.insert(id.to_lowercase())
    }

    // ── Running ───────────────────────────────────────────────────────────────

    fn next_id(&mut self) -> u64 {
        let id = self.next_queue_id;
        self.next_queue_id += 1;
        id
    }

    /// Run `script` to completion on a synchronous queue.  Waits are
    /// ignored.
    pub fn execute_script(&mut self, script: &Arc<Script>, vars: HashMap<String, Value>) -> ExecutionResult {
        let id = self.next_id();
        let mut queue = CommandQueue::new(id, Frame::new(script.clone(), vars), false);
        debug!(queue = id, script = %script.name, "executing script");
        queue.run(self);
        queue.into_result()
    }

    /// Start `script` on a new queue.  It runs until it first suspends; if it
    /// is still running it joins the active queues.  The handle is released
    /// when the queue stops.
    pub fn start_script(
        &mut self,
        script: &Arc<Script>,
        vars: HashMap<String, Value>,
        output: Option<OutputFn>,
    ) -> WaitHandle {
        let id = self.next_id();
        let mut queue = CommandQueue::new(id, Frame::new(script.clone(), vars), true).with_output(output);
        let handle = queue.completion();
        debug!(queue = id, script = %script.name, "starting script");
        queue.run(self);
        if queue.is_running() {
            self.queues.push(queue);
        }
        handle
    }

    /// Advance every active queue by `delta` seconds, in order.  Queues
    /// started during the tick join at the end.
    pub fn tick(&mut self, delta: f64) {
        let mut active = std::mem::take(&mut self.queues);
        for queue in active.iter_mut() {
            queue.tick(delta, self);
        }
        active.retain(CommandQueue::is_running);
        active.append(&mut self.queues);
        self.queues = active;
    }

    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn queues(&self) -> &[CommandQueue] {
        &self.queues
    }

    /// Stop every active queue.
    pub fn stop_all(&mut self) {
        for queue in self.queues.iter_mut() {
            queue.stop();
        }
        self.queues.clear();
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Forget once-guards, functions, script-registered event handlers, the
    /// script cache and autorun scripts.  Registries are kept.
    pub fn reload(&mut self) {
        self.once.clear();
        self.functions.clear();
        self.scripts.clear();
        self.autorun.clear();
        for handlers in self.events.values_mut() {
            handlers.retain(|h| !h.from_script);
        }
        self.events.retain(|_, handlers| !handlers.is_empty());
        info!("engine reloaded");
    }

    /// Queue `script` for [`run_precalculated`](Self::run_precalculated) if
    /// it has an `///autorun=<priority>` header.  Returns whether it did.
    pub fn precalc_script(&mut self, script: Arc<Script>) -> bool {
        let Some(priority) = script.header("autorun").and_then(|p| p.parse::<i32>().ok()) else {
            return false;
        };
        let at = self.autorun.partition_point(|(p, _)| *p <= priority);
        debug!(script = %script.name, priority, "autorun scheduled");
        self.autorun.insert(at, (priority, script));
        true
    }

    /// Start every autorun script, lowest priority first.
    pub fn run_precalculated(&mut self) {
        let scripts: Vec<Arc<Script>> = self.autorun.iter().map(|(_, s)| s.clone()).collect();
        for script in scripts {
            self.start_script(&script, HashMap::new(), None);
        }
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Add a handler, keeping the list ordered by priority.  A handler with
    /// the same name is replaced.
    pub fn register_event_handler(&mut self, event: &str, handler: EventHandler) {
        let list = self.events.entry(event.to_lowercase()).or_default();
        list.retain(|h| h.name != handler.name);
        let at = list.partition_point(|h| h.priority <= handler.priority);
        debug!(event = %event, handler = %handler, "event handler registered");
        list.insert(at, handler);
    }

    /// Remove a handler by name.  Returns whether one was removed.
    pub fn remove_event_handler(&mut self, event: &str, name: &str) -> bool {
        let name = name.to_lowercase();
        let Some(list) = self.events.get_mut(&event.to_lowercase()) else { return false };
        let before = list.len();
        list.retain(|h| h.name != name);
        before != list.len()
    }

    pub fn event_handlers(&self, event: &str) -> &[EventHandler] {
        self.events.get(&event.to_lowercase()).map(Vec::as_slice).unwrap_or_default()
    }

    /// Run every handler of `event` synchronously and apply their
    /// determinations.  Returns whether the event ends up cancelled.
    pub fn dispatch(&mut self, event: &mut Event) -> bool {
        // Handlers may be added, removed or replaced while others run.  Each
        // name runs at most once per dispatch, in list order.
        let mut done: HashSet<String> = HashSet::new();
        loop {
            let next = self
                .events
                .get(&event.name)
                .and_then(|l| l.iter().find(|h| !done.contains(&h.name)))
                .cloned();
            let Some(handler) = next else { break };
            done.insert(handler.name.clone());

            let vars = event.variables().into_iter().collect();
            let result = self.execute_script(&handler.script, vars);
            for value in &result.determinations {
                if let Err(message) = event.apply_determination(value) {
                    self.output(&message, MessageType::Bad);
                }
            }
        }
        debug!(event = %event.name, cancelled = event.cancelled, "event dispatched");
        event.cancelled
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture() -> (Engine, Arc<Mutex<Vec<(String, MessageType)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let engine = Engine::new(Arc::new(move |m: &str, k| sink.lock().unwrap().push((m.to_owned(), k))));
        (engine, lines)
    }

    #[test]
    fn compile_failure_yields_placeholder() {
        let (mut engine, lines) = capture();
        let script = engine.script_from_source("Broken", "echo <{bogus[1]}>");
        assert_eq!(script.len(), 1);
        assert_eq!(lines.lock().unwrap().len(), 1);
        assert!(lines.lock().unwrap()[0].0.starts_with("FAILED TO COMPILE SCRIPT 'broken': (line 1)"));
        let result = engine.execute_script(&script, HashMap::new());
        assert!(result.errored);
    }

    #[test]
    fn missing_file_is_none() {
        let (mut engine, _) = capture();
        assert!(engine.get_script_file("nothing").is_none());
        engine.set_loader(Arc::new(|_| Ok(None)));
        assert!(engine.get_script_file("nothing").is_none());
    }

    #[test]
    fn loader_errors_are_reported() {
        let (mut engine, lines) = capture();
        engine.set_loader(Arc::new(|_| Err("disk on fire".to_owned())));
        assert!(engine.get_script_file("x").is_none());
        assert!(lines.lock().unwrap()[0].0.contains("disk on fire"));
    }

    #[test]
    fn files_are_cached_by_name() {
        let (mut engine, _) = capture();
        let loads = Arc::new(Mutex::new(0));
        let counter = loads.clone();
        engine.set_loader(Arc::new(move |name| {
            *counter.lock().unwrap() += 1;
            assert_eq!(name, "greet.cfg");
            Ok(Some("echo hi".to_owned()))
        }));
        let a = engine.get_script_file("greet").unwrap();
        let b = engine.get_script_file("GREET").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*loads.lock().unwrap(), 1);
    }

    #[test]
    fn start_script_parks_waiting_queue() {
        let (mut engine, lines) = capture();
        let script = engine.script_from_source("w", "echo a; wait 1; echo b");
        let handle = engine.start_script(&script, HashMap::new(), None);
        assert_eq!(engine.active_queues(), 1);
        assert!(!handle.is_complete());
        engine.tick(0.5);
        assert_eq!(lines.lock().unwrap().len(), 1);
        engine.tick(0.6);
        assert_eq!(engine.active_queues(), 0);
        assert!(handle.is_complete());
        assert_eq!(lines.lock().unwrap()[1].0, "b");
    }

    #[test]
    fn execute_script_ignores_waits() {
        let (mut engine, lines) = capture();
        let script = engine.script_from_source("w", "echo a; wait 10; echo b");
        engine.execute_script(&script, HashMap::new());
        assert_eq!(lines.lock().unwrap().len(), 2);
        assert_eq!(engine.active_queues(), 0);
    }

    #[test]
    fn autorun_runs_by_priority() {
        let (mut engine, lines) = capture();
        let late = engine.script_from_source("late", "///autorun=5\necho late");
        let early = engine.script_from_source("early", "///autorun=-1\necho early");
        let never = engine.script_from_source("never", "echo never");
        assert!(engine.precalc_script(late));
        assert!(engine.precalc_script(early));
        assert!(!engine.precalc_script(never));
        engine.run_precalculated();
        let got: Vec<String> = lines.lock().unwrap().iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(got, vec!["early", "late"]);
    }

    #[test]
    fn reload_forgets_once_and_script_handlers() {
        let (mut engine, _) = capture();
        assert!(engine.mark_once("Demo"));
        assert!(!engine.mark_once("demo"));
        let script = engine.script_from_source("h", "noop");
        let mut scripted = EventHandler::new("a", script.clone(), 0);
        scripted.from_script = true;
        engine.register_event_handler("tick", scripted);
        engine.register_event_handler("tick", EventHandler::new("b", script, 0));
        engine.reload();
        assert!(engine.mark_once("demo"));
        assert_eq!(engine.event_handlers("tick").len(), 1);
        assert_eq!(engine.event_handlers("tick")[0].name, "b");
    }

    #[test]
    fn handlers_are_ordered_by_priority() {
        let (mut engine, _) = capture();
        let s = engine.script_from_source("h", "noop");
        engine.register_event_handler("e", EventHandler::new("second", s.clone(), 10));
        engine.register_event_handler("e", EventHandler::new("first", s.clone(), -10));
        engine.register_event_handler("e", EventHandler::new("middle", s, 0));
        let names: Vec<&str> = engine.event_handlers("E").iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["first", "middle", "second"]);
        assert!(engine.remove_event_handler("e", "MIDDLE"));
        assert!(!engine.remove_event_handler("e", "middle"));
    }

    #[test]
    fn handler_replacing_itself_runs_once_per_dispatch() {
        let (mut engine, lines) = capture();
        let setup = engine.script_from_source(
            "setup",
            "event add tick again 1 { echo old; event add tick again 1 { echo new } }; \
             event add tick after 2 { echo after }",
        );
        engine.execute_script(&setup, HashMap::new());

        let mut event = Event::new("tick");
        engine.dispatch(&mut event);
        engine.dispatch(&mut event);
        let texts: Vec<String> = lines.lock().unwrap().iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(texts, vec!["old", "after", "new", "after"]);
    }
}
