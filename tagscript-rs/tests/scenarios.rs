//! End-to-end scenarios: compile, run, unwind and dispatch through the
//! public engine API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tagscript::script::queue::ExecutionResult;
use tagscript::{Engine, Event, EventHandler, MessageType, Value};

// ── Helpers ───────────────────────────────────────────────────────────────────

type Lines = Arc<Mutex<Vec<(String, MessageType)>>>;

fn engine() -> (Engine, Lines) {
    let lines: Lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let engine = Engine::new(Arc::new(move |m: &str, k| sink.lock().unwrap().push((m.to_owned(), k))));
    (engine, lines)
}

fn messages(lines: &Lines) -> Vec<String> {
    lines.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
}

fn bad(lines: &Lines) -> Vec<String> {
    lines
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, k)| *k == MessageType::Bad)
        .map(|(m, _)| m.clone())
        .collect()
}

fn run(engine: &mut Engine, name: &str, src: &str) -> ExecutionResult {
    let script = engine.script_from_source(name, src);
    engine.execute_script(&script, HashMap::new())
}

// ── Scenario A: define and read a local ───────────────────────────────────────

#[test]
fn define_then_echo() {
    let (mut engine, lines) = engine();
    let script = engine.script_from_source("a", "define x 5 ; echo <{var[x]}>");
    assert_eq!(script.len(), 2);
    assert_eq!(script.slot_count(), 1);
    let result = engine.execute_script(&script, HashMap::new());
    assert!(!result.errored);
    assert_eq!(messages(&lines), vec!["5"]);
    assert_eq!(result.bindings["x"], Value::Integer(5));
}

// ── Scenario B: run-once guard ────────────────────────────────────────────────

#[test]
fn once_block_repeated() {
    let (mut engine, lines) = engine();
    let result = run(&mut engine, "b", "once demo { echo hi }; once demo { echo again }");
    assert!(result.errored);
    let got = messages(&lines);
    assert_eq!(got[0], "hi");
    assert_eq!(got.len(), 2);
    assert!(got[1].starts_with("ERROR: \"Once block repeated: demo\""));
}

#[test]
fn once_guard_spans_scripts_until_reload() {
    let (mut engine, lines) = engine();
    run(&mut engine, "one", "once setup { echo first }");
    run(&mut engine, "two", "once setup quiet { echo second }");
    engine.reload();
    run(&mut engine, "three", "once setup { echo third }");
    assert_eq!(messages(&lines), vec!["first", "third"]);
}

// ── Scenario C: destructive goto ──────────────────────────────────────────────

#[test]
fn goto_skips_forward() {
    let (mut engine, lines) = engine();
    let result = run(&mut engine, "c", "goto mark_skip ; echo \"skipped\" ; mark mark_skip ; echo \"shown\"");
    assert!(!result.errored);
    assert_eq!(messages(&lines), vec!["shown"]);
}

#[test]
fn goto_cannot_return_to_a_passed_mark() {
    let (mut engine, lines) = engine();
    let result = run(
        &mut engine,
        "c",
        "goto mark_skip ; echo \"skipped\" ; mark mark_skip ; echo \"shown\" ; goto mark_skip",
    );
    assert!(result.errored);
    let got = messages(&lines);
    assert_eq!(got[0], "shown");
    assert!(got[1].contains("Cannot goto marked location: unknown marker!"));
}

// ── Scenario D: uncaught error in nested frames ───────────────────────────────

#[test]
fn uncaught_error_lists_every_frame() {
    let (mut engine, lines) = engine();
    let src = "function inner {\n  if true {\n    error deep failure\n  }\n}\n\
               function outer {\n  call inner\n}\n\
               call outer;\necho unreachable";
    let result = run(&mut engine, "d", src);
    assert!(result.errored);

    let errors = bad(&lines);
    assert_eq!(errors.len(), 1, "{errors:?}");
    let trace: Vec<&str> = errors[0].lines().collect();
    assert_eq!(trace[0], "ERROR: \"deep failure\"");
    assert_eq!(trace[1], "    in script 'inner' (in 'd') at line 3: (error deep failure)");
    assert_eq!(trace[2], "    in script 'outer' (in 'd') at line 7: (call inner)");
    assert_eq!(trace[3], "    in script 'd' at line 9: (call outer)");
    assert_eq!(trace.len(), 4);
    assert!(!messages(&lines).iter().any(|m| m == "unreachable"));
}

#[test]
fn try_in_outer_frame_catches_nested_error() {
    let (mut engine, lines) = engine();
    let src = "function fails { error nested }; \
               try { call fails; echo not here } catch { echo caught }; echo after";
    let result = run(&mut engine, "d2", src);
    assert!(!result.errored);
    assert_eq!(messages(&lines), vec!["caught", "after"]);
}

#[test]
fn errors_stay_in_their_queue() {
    let (mut engine, lines) = engine();
    let failing = engine.script_from_source("failing", "wait 1; error boom");
    let healthy = engine.script_from_source("healthy", "wait 1; echo fine; wait 1; echo still fine");
    engine.start_script(&failing, HashMap::new(), None);
    engine.start_script(&healthy, HashMap::new(), None);
    engine.tick(1.0);
    engine.tick(1.0);
    assert_eq!(engine.active_queues(), 0);
    let got = messages(&lines);
    assert!(got[0].starts_with("ERROR: \"boom\""));
    assert_eq!(&got[1..], ["fine", "still fine"]);
}

// ── Scenario E: event determinations ──────────────────────────────────────────

#[test]
fn event_cancel_and_unknown_determination() {
    let (mut engine, lines) = engine();
    let cancel = engine.script_from_source("cancel", "determine cancelled");
    let weird = engine.script_from_source("weird", "determine sideways");
    engine.register_event_handler("door", EventHandler::new("cancel", cancel, 0));
    engine.register_event_handler("door", EventHandler::new("weird", weird, 1));

    let mut event = Event::new("door");
    assert!(engine.dispatch(&mut event));
    assert!(event.cancelled);
    assert_eq!(bad(&lines), vec!["Unknown determination 'sideways'."]);
}

#[test]
fn handlers_removed_during_dispatch_are_not_skipped() {
    let (mut engine, lines) = engine();
    let setup = "event add ping a 1 { echo a; event remove ping a }; \
                 event add ping b 2 { echo b }; \
                 event add ping c 3 { echo c }";
    run(&mut engine, "setup", setup);
    let mut event = Event::new("ping");
    engine.dispatch(&mut event);
    engine.dispatch(&mut event);
    assert_eq!(messages(&lines), vec!["a", "b", "c", "b", "c"]);
}

#[test]
fn handlers_added_during_dispatch_run_once() {
    let (mut engine, lines) = engine();
    let setup = "event add ping first 1 { echo first; event add ping late 5 { echo late } }";
    run(&mut engine, "setup", setup);
    let mut event = Event::new("ping");
    engine.dispatch(&mut event);
    assert_eq!(messages(&lines), vec!["first", "late"]);
}

#[test]
fn event_context_is_visible_to_handlers() {
    let (mut engine, lines) = engine();
    let script = engine.script_from_source("greeter", "echo <{dvar[name].to_upper}> <{dvar[cancelled]}>");
    engine.register_event_handler("join", EventHandler::new("greeter", script, 0));
    let mut event = Event::new("join").with("name", "ada");
    assert!(!engine.dispatch(&mut event));
    assert_eq!(messages(&lines), vec!["ADA false"]);
}

// ── Idempotence ───────────────────────────────────────────────────────────────

#[test]
fn same_script_twice_gives_same_result() {
    let (mut engine, _) = engine();
    let script = engine.script_from_source(
        "idem",
        "define total 0; repeat 4 --as=i { set total += <{var[i]}> }; determine <{var[total]}>",
    );
    let first = engine.execute_script(&script, HashMap::new());
    let second = engine.execute_script(&script, HashMap::new());
    assert_eq!(first, second);
    assert_eq!(first.determinations, vec![Value::Integer(10)]);
}

#[test]
fn initial_variables_reach_the_first_frame() {
    let (mut engine, lines) = engine();
    let script = engine.script_from_source("vars", "echo <{dvar[greeting]}>");
    let mut vars = HashMap::new();
    vars.insert("Greeting".to_owned(), Value::from("hello"));
    engine.execute_script(&script, vars);
    assert_eq!(messages(&lines), vec!["hello"]);
}

#[test]
fn compiled_variables_can_be_predeclared() {
    let (mut engine, lines) = engine();
    let script = engine
        .compile_with_vars("typed", "echo <{var[count].add[1]}>", &[("count".to_owned(), "integer")])
        .unwrap();
    let mut vars = HashMap::new();
    vars.insert("count".to_owned(), Value::Integer(41));
    engine.execute_script(&script, vars);
    assert_eq!(messages(&lines), vec!["42"]);
}

// ── Files ─────────────────────────────────────────────────────────────────────

#[test]
fn scripts_load_from_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("greet.cfg"), "///autorun=1\necho hello from file").unwrap();
    std::fs::write(dir.path().join("broken.cfg"), "echo <{nope}>").unwrap();

    let (mut engine, lines) = engine();
    engine.set_loader(Engine::fs_loader(dir.path().to_path_buf()));
    assert!(engine.get_script_file("missing").is_none());

    let greet = engine.get_script_file("greet").unwrap();
    assert_eq!(greet.header("autorun"), Some("1"));
    assert!(engine.precalc_script(greet));
    engine.run_precalculated();
    assert_eq!(messages(&lines), vec!["hello from file"]);

    let broken = engine.get_script_file("broken").unwrap();
    assert_eq!(broken.len(), 1);
    assert!(bad(&lines)[0].starts_with("FAILED TO COMPILE SCRIPT 'broken': (line 1)"));

    let result = run(&mut engine, "caller", "call greet");
    assert!(!result.errored);
}
