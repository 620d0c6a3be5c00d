//! Static resolver and compiler.
//!
//! Lowers a validated instruction list into an [`ExecutableUnit`]:
//!
//! - every tag chain is resolved against the type registry once, and turned
//!   into one reusable [`Evaluator`] closure (identical chains share one);
//! - every declared local variable gets a fixed slot, and `var[name]` reads
//!   become direct slot reads;
//! - every instruction gets its command resolved into a jump-table entry.
//!
//! Resolution runs in instruction order.  For each instruction the
//! arguments are resolved first (so `define x <{var[x]}>` reads the previous
//! `x`), then a block owner opens a new scope, then the instruction's own
//! declaration (if any) is added to the innermost scope.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::error::{CompileError, ScriptError};
use crate::script::argument::{Argument, Segment, TagExpr};
use crate::script::block::Instruction;
use crate::script::command::{Command, Declaration};
use crate::script::tags::{Evaluator, TagBase, TagContext};
use crate::script::types::{ParamRule, ReturnType, SubTagCall, SubTagFn};
use crate::script::value::Value;
use crate::script::Registries;

// ── Compiled forms ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledPart {
    Text(String),
    /// Index into [`ExecutableUnit::evaluators`].
    Tag(usize),
}

/// An argument with its tags replaced by evaluator indices.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArgument {
    pub parts: Vec<CompiledPart>,
    /// Static type of the argument's value.
    pub type_name: &'static str,
}

impl CompiledArgument {
    /// Evaluate to a value.  A lone tag keeps its typed value; anything else
    /// is joined into text.
    pub fn evaluate(&self, cx: &TagContext<'_>) -> Result<Value, ScriptError> {
        match self.parts.as_slice() {
            [CompiledPart::Tag(i)] => run_evaluator(*i, cx),
            [CompiledPart::Text(t)] => Ok(Value::Text(t.clone())),
            parts => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        CompiledPart::Text(t) => out.push_str(t),
                        CompiledPart::Tag(i) => out.push_str(&run_evaluator(*i, cx)?.to_string()),
                    }
                }
                Ok(Value::Text(out))
            }
        }
    }

    pub fn literal(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [CompiledPart::Text(t)] => Some(t),
            _ => None,
        }
    }
}

fn run_evaluator(index: usize, cx: &TagContext<'_>) -> Result<Value, ScriptError> {
    let eval = cx
        .evaluators
        .get(index)
        .ok_or_else(|| ScriptError::Internal(format!("missing tag evaluator {index}")))?;
    eval(cx)
}

/// How an instruction's command is reached at run time.
#[derive(Clone)]
pub enum Dispatch {
    Command(Arc<dyn Command>),
    /// Not a registered command; raises an error when it runs.
    Unknown(String),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Command(c) => write!(f, "Command({})", c.meta().name),
            Dispatch::Unknown(name) => write!(f, "Unknown({name})"),
        }
    }
}

/// One compiled instruction.
#[derive(Debug, Clone)]
pub struct Entry {
    pub instruction: Instruction,
    pub args: Vec<CompiledArgument>,
    pub named: BTreeMap<String, CompiledArgument>,
    /// Slot declared by this instruction.
    pub declares: Option<usize>,
    /// Variables visible after this instruction, by lower-case name.
    pub var_lookup: Arc<HashMap<String, usize>>,
}

/// A script lowered for direct execution.
#[derive(Clone, Default)]
pub struct ExecutableUnit {
    pub entries: Vec<Entry>,
    /// Parallel to `entries`.
    pub dispatch: Vec<Dispatch>,
    pub evaluators: Vec<Evaluator>,
    pub slot_types: Vec<&'static str>,
    pub slot_names: Vec<String>,
    /// Top-level variables visible at the end of the script.
    pub final_lookup: HashMap<String, usize>,
}

impl ExecutableUnit {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_types.len()
    }

    /// A fresh slot array for a new frame.
    pub fn slot_template(&self) -> Vec<Value> {
        vec![Value::Null; self.slot_types.len()]
    }
}

impl std::fmt::Debug for ExecutableUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableUnit")
            .field("entries", &self.entries.len())
            .field("evaluators", &self.evaluators.len())
            .field("slots", &self.slot_names)
            .finish()
    }
}

// ── Compiler ──────────────────────────────────────────────────────────────────

struct Scope {
    /// First index no longer inside this scope.
    end: usize,
    names: HashMap<String, usize>,
}

enum Start {
    Slot(usize),
    Base {
        base: Arc<dyn TagBase>,
        param: Option<CompiledArgument>,
        modifier: Option<fn(&Value) -> Value>,
    },
}

struct Step {
    /// Converts the running value to the type that owns the sub-tag.
    convert: Option<fn(&Value) -> Value>,
    handler: SubTagFn,
    param: Option<CompiledArgument>,
    modifier: Option<fn(&Value) -> Value>,
}

pub struct Compiler<'a> {
    registries: &'a Registries,
    line: usize,
    scopes: Vec<Scope>,
    slot_types: Vec<&'static str>,
    slot_names: Vec<String>,
    evaluators: Vec<Evaluator>,
    evaluator_types: Vec<&'static str>,
    evaluator_keys: HashMap<String, usize>,
}

impl<'a> Compiler<'a> {
    pub fn new(registries: &'a Registries) -> Self {
        Self {
            registries,
            line: 0,
            scopes: vec![Scope { end: usize::MAX, names: HashMap::new() }],
            slot_types: Vec::new(),
            slot_names: Vec::new(),
            evaluators: Vec::new(),
            evaluator_types: Vec::new(),
            evaluator_keys: HashMap::new(),
        }
    }

    /// Compile `instructions`.  `predefined` variables take the first slots
    /// and are visible from the first instruction on.
    pub fn compile(
        mut self,
        instructions: Vec<Instruction>,
        predefined: &[(String, &'static str)],
    ) -> Result<ExecutableUnit, CompileError> {
        for (name, type_name) in predefined {
            self.declare(Declaration { name: name.clone(), type_name });
        }

        let mut entries = Vec::with_capacity(instructions.len());
        let mut dispatch = Vec::with_capacity(instructions.len());
        let mut lookup = Arc::new(self.visible());

        for (index, instr) in instructions.into_iter().enumerate() {
            self.line = instr.line;
            let mut changed = false;
            while self.scopes.len() > 1 && self.scopes.last().is_some_and(|s| s.end <= index) {
                self.scopes.pop();
                changed = true;
            }

            let args = instr
                .args
                .iter()
                .map(|a| self.compile_argument(a).map(|(c, _)| c))
                .collect::<Result<Vec<_>, _>>()?;
            let mut named = BTreeMap::new();
            for (key, arg) in &instr.named {
                named.insert(key.clone(), self.compile_argument(arg)?.0);
            }

            let command = self.registries.commands.get(&instr.name).cloned();
            if let (Some(block), false) = (&instr.block, instr.is_callback()) {
                self.scopes.push(Scope { end: block.end, names: HashMap::new() });
            }

            let mut declares = None;
            if let (Some(cmd), false) = (&command, instr.is_callback()) {
                let decl = cmd
                    .declares(&instr, &args, &named)
                    .map_err(|message| CompileError::Validation { line: instr.line, message })?;
                if let Some(decl) = decl {
                    declares = Some(self.declare(decl));
                    changed = true;
                }
            }
            if changed {
                lookup = Arc::new(self.visible());
            }

            dispatch.push(match command {
                Some(cmd) => Dispatch::Command(cmd),
                None => Dispatch::Unknown(instr.name.clone()),
            });
            entries.push(Entry { instruction: instr, args, named, declares, var_lookup: lookup.clone() });
        }

        let final_lookup = self.scopes.first().map(|s| s.names.clone()).unwrap_or_default();
        trace!(
            entries = entries.len(),
            slots = self.slot_types.len(),
            evaluators = self.evaluators.len(),
            "lowered script"
        );
        Ok(ExecutableUnit {
            entries,
            dispatch,
            evaluators: self.evaluators,
            slot_types: self.slot_types,
            slot_names: self.slot_names,
            final_lookup,
        })
    }

    fn declare(&mut self, decl: Declaration) -> usize {
        let slot = self.slot_types.len();
        self.slot_types.push(decl.type_name);
        let name = decl.name.to_lowercase();
        self.slot_names.push(name.clone());
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.insert(name, slot);
        }
        slot
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.scopes.iter().rev().find_map(|s| s.names.get(name).copied())
    }

    fn visible(&self) -> HashMap<String, usize> {
        let mut out = HashMap::new();
        for scope in &self.scopes {
            out.extend(scope.names.iter().map(|(k, v)| (k.clone(), *v)));
        }
        out
    }

    // ── Arguments and tags ───────────────────────────────────────────────────

    /// Compile an argument; also returns its identity key for deduplication.
    fn compile_argument(&mut self, arg: &Argument) -> Result<(CompiledArgument, String), CompileError> {
        let mut parts = Vec::with_capacity(arg.segments.len());
        let mut key = String::new();
        for seg in &arg.segments {
            match seg {
                Segment::Text(t) => {
                    key.push_str(&format!("{t:?}"));
                    parts.push(CompiledPart::Text(t.clone()));
                }
                Segment::Tag(tag) => {
                    let index = self.compile_tag(tag)?;
                    key.push_str(&format!("#{index}"));
                    parts.push(CompiledPart::Tag(index));
                }
            }
        }
        let type_name = match parts.as_slice() {
            [CompiledPart::Tag(i)] => self.evaluator_types[*i],
            [CompiledPart::Text(t)] => Value::from_literal(t).type_name(),
            _ => "text",
        };
        Ok((CompiledArgument { parts, type_name }, key))
    }

    fn compile_param(
        &mut self,
        rule: ParamRule,
        param: Option<&Argument>,
        key: &str,
        raw: &str,
    ) -> Result<Option<(CompiledArgument, String)>, CompileError> {
        let line = self.line;
        let fail = |message: String| CompileError::Parameter { line, message, raw: raw.to_owned() };
        match (rule, param) {
            (ParamRule::None, Some(_)) => Err(fail(format!("'{key}' does not take a [parameter]."))),
            (ParamRule::Required(_), None) => Err(fail(format!("'{key}' requires a [parameter]."))),
            (_, Some(p)) => Ok(Some(self.compile_argument(p)?)),
            (_, None) => Ok(None),
        }
    }

    fn resolve_return(
        &self,
        returns: ReturnType,
        param: Option<&CompiledArgument>,
        raw: &str,
    ) -> Result<&'static str, CompileError> {
        match returns {
            ReturnType::Fixed(t) => Ok(t),
            ReturnType::Special(f) => f(param.and_then(CompiledArgument::literal), &self.registries.types)
                .map_err(|message| CompileError::Parameter { line: self.line, message, raw: raw.to_owned() }),
        }
    }

    fn creator_of(&self, type_name: &str) -> Option<fn(&Value) -> Value> {
        self.registries.types.get(type_name).map(|t| t.creator)
    }

    /// Resolve a tag chain and return its evaluator index.
    fn compile_tag(&mut self, tag: &TagExpr) -> Result<usize, CompileError> {
        let raw = tag.body();
        let Some(first) = tag.parts.first() else {
            return Err(CompileError::UnknownBase { line: self.line, key: String::new(), raw });
        };
        let base_key = first.key.to_lowercase();
        let base = self
            .registries
            .bases
            .get(&base_key)
            .cloned()
            .ok_or_else(|| CompileError::UnknownBase { line: self.line, key: base_key.clone(), raw: raw.clone() })?;

        let mut key = base_key.clone();
        let (start, mut current) = if base.reads_slot() {
            let name = first
                .param
                .as_ref()
                .and_then(Argument::literal)
                .map(|n| n.trim().to_lowercase())
                .ok_or_else(|| CompileError::Parameter {
                    line: self.line,
                    message: format!("'{base_key}' requires a literal variable name."),
                    raw: raw.clone(),
                })?;
            let slot = self
                .lookup(&name)
                .ok_or_else(|| CompileError::UnknownVariable { line: self.line, name: name.clone(), raw: raw.clone() })?;
            key.push_str(&format!("@{slot}"));
            (Start::Slot(slot), self.slot_types[slot])
        } else {
            let param = self.compile_param(base.param(), first.param.as_ref(), &base_key, &raw)?;
            let ty = self.resolve_return(base.returns(), param.as_ref().map(|p| &p.0), &raw)?;
            let modifier = base.param().modifier_type().and_then(|m| self.creator_of(m));
            let param = param.map(|(c, k)| {
                key.push_str(&format!("[{k}]"));
                c
            });
            (Start::Base { base, param, modifier }, ty)
        };

        let mut steps = Vec::with_capacity(tag.parts.len().saturating_sub(1));
        for (index, part) in tag.parts.iter().enumerate().skip(1) {
            let sub_key = part.key.to_lowercase();
            let Some((owner, sub)) = self.registries.types.resolve_subtag(current, &sub_key) else {
                let hint = if sub_key.is_empty() {
                    "stray '.' dot symbol?"
                } else {
                    "sub-tag doesn't seem to exist"
                };
                return Err(CompileError::SubTag {
                    line: self.line,
                    index,
                    key: sub_key,
                    type_name: current.to_owned(),
                    hint,
                    raw,
                });
            };
            let (owner_name, sub) = (owner.name, sub.clone());
            let convert = (owner_name != current).then(|| self.creator_of(owner_name)).flatten();
            let param = self.compile_param(sub.param, part.param.as_ref(), &sub_key, &raw)?;
            let returns = self.resolve_return(sub.returns, param.as_ref().map(|p| &p.0), &raw)?;
            key.push('.');
            key.push_str(&sub_key);
            let param = param.map(|(c, k)| {
                key.push_str(&format!("[{k}]"));
                c
            });
            steps.push(Step {
                convert,
                handler: sub.handler,
                param,
                modifier: sub.param.modifier_type().and_then(|m| self.creator_of(m)),
            });
            current = returns;
        }

        let fallback = match &tag.fallback {
            Some(fb) => {
                let (compiled, k) = self.compile_argument(fb)?;
                key.push_str(&format!("||{k}"));
                if compiled.type_name != current {
                    current = "dynamic";
                }
                Some(compiled)
            }
            None => None,
        };

        if let Some(&index) = self.evaluator_keys.get(&key) {
            return Ok(index);
        }
        let index = self.evaluators.len();
        self.evaluators.push(build_evaluator(start, steps, fallback, raw));
        self.evaluator_types.push(current);
        self.evaluator_keys.insert(key, index);
        Ok(index)
    }
}

fn eval_param(
    param: &Option<CompiledArgument>,
    modifier: Option<fn(&Value) -> Value>,
    cx: &TagContext<'_>,
) -> Result<Option<Value>, ScriptError> {
    let Some(p) = param else { return Ok(None) };
    let value = p.evaluate(cx)?;
    Ok(Some(match modifier {
        Some(convert) => convert(&value),
        None => value,
    }))
}

fn build_evaluator(start: Start, steps: Vec<Step>, fallback: Option<CompiledArgument>, raw: String) -> Evaluator {
    Arc::new(move |cx: &TagContext<'_>| {
        let fail = |e: String| ScriptError::Runtime(format!("{e} (in tag '<{{{raw}}}>')"));
        let mut value = match &start {
            Start::Slot(slot) => cx.slots.get(*slot).cloned().unwrap_or(Value::Null),
            Start::Base { base, param, modifier } => {
                let param = eval_param(param, *modifier, cx)?;
                base.evaluate(param.as_ref(), cx).map_err(fail)?
            }
        };
        for step in &steps {
            if value.is_null() {
                break;
            }
            if let Some(convert) = step.convert {
                value = convert(&value);
                if value.is_null() {
                    break;
                }
            }
            let param = eval_param(&step.param, step.modifier, cx)?;
            if param.as_ref().is_some_and(Value::is_null) {
                value = Value::Null;
                break;
            }
            let call = SubTagCall { value: &value, param: param.as_ref(), types: cx.types };
            value = (step.handler)(&call).map_err(fail)?;
        }
        match (&fallback, value.is_null()) {
            (Some(fb), true) => fb.evaluate(cx),
            _ => Ok(value),
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::block;

    fn compile(src: &str) -> Result<ExecutableUnit, CompileError> {
        let reg = Registries::builtin();
        let instrs = block::parse(src, &reg.commands)?;
        Compiler::new(&reg).compile(instrs, &[])
    }

    fn eval_first_arg(unit: &ExecutableUnit, entry: usize, slots: &[Value]) -> Value {
        let reg = Registries::builtin();
        let vars = HashMap::new();
        let cx = TagContext { slots, vars: &vars, evaluators: &unit.evaluators, types: &reg.types };
        unit.entries[entry].args[0].evaluate(&cx).unwrap()
    }

    #[test]
    fn define_then_read_uses_slot() {
        let unit = compile("define x 5; echo <{var[x]}>").unwrap();
        assert_eq!(unit.len(), 2);
        assert_eq!(unit.slot_count(), 1);
        assert_eq!(unit.slot_types[0], "integer");
        assert_eq!(unit.entries[0].declares, Some(0));
        assert_eq!(eval_first_arg(&unit, 1, &[Value::Integer(5)]), Value::Integer(5));
    }

    #[test]
    fn undeclared_var_fails() {
        let err = compile("echo <{var[nope]}>").unwrap_err();
        assert!(matches!(err, CompileError::UnknownVariable { ref name, .. } if name == "nope"));
    }

    #[test]
    fn unknown_base_fails() {
        let err = compile("echo <{bogus[1]}>").unwrap_err();
        assert!(matches!(err, CompileError::UnknownBase { .. }));
        assert_eq!(err.subtag_index(), Some(0));
    }

    #[test]
    fn bad_subtag_reports_index() {
        let err = compile("echo <{text[a].to_upper.nonsense.length}>").unwrap_err();
        assert_eq!(err.subtag_index(), Some(2));
        let err = compile("echo <{text[a]..length}>").unwrap_err();
        assert!(err.to_string().contains("stray '.'"));
    }

    #[test]
    fn chain_resolves_through_parent_types() {
        let unit = compile("echo <{integer[41].add[1].to_upper.length}>").unwrap();
        assert_eq!(eval_first_arg(&unit, 0, &[]), Value::Integer(2));
    }

    #[test]
    fn as_changes_static_type() {
        let unit = compile("echo <{text[3].as[integer].add[4]}>").unwrap();
        assert_eq!(eval_first_arg(&unit, 0, &[]), Value::Integer(7));
        assert!(compile("echo <{text[3].add[4]}>").is_err());
    }

    #[test]
    fn fallback_on_null() {
        let unit = compile("echo <{text[abc].to_integer||none}>").unwrap();
        assert_eq!(eval_first_arg(&unit, 0, &[]), Value::Text("none".into()));
        let unit = compile("echo <{null.to_upper||<{text[x].to_upper}>}>").unwrap();
        assert_eq!(eval_first_arg(&unit, 0, &[]), Value::Text("X".into()));
    }

    #[test]
    fn identical_chains_share_an_evaluator() {
        let unit = compile("echo <{text[a].to_upper}>; echo <{text[a].to_upper}>; echo <{text[b].to_upper}>").unwrap();
        assert_eq!(unit.evaluators.len(), 2);
    }

    #[test]
    fn block_scoped_loop_variable() {
        assert!(compile("repeat 2 --as=i { echo <{var[i]}> }").is_ok());
        assert!(compile("repeat 2 --as=i { echo a }; echo <{var[i]}>").is_err());
    }

    #[test]
    fn redeclaration_gets_new_slot() {
        let unit = compile("define x 1; define x <{var[x].add[1]}>; echo <{var[x]}>").unwrap();
        assert_eq!(unit.slot_count(), 2);
        assert_eq!(unit.entries[2].var_lookup["x"], 1);
        assert_eq!(unit.final_lookup["x"], 1);
    }

    #[test]
    fn predefined_variables_are_visible() {
        let reg = Registries::builtin();
        let instrs = block::parse("echo <{var[who].to_upper}>", &reg.commands).unwrap();
        let unit = Compiler::new(&reg).compile(instrs, &[("who".to_owned(), "text")]).unwrap();
        assert_eq!(eval_first_arg(&unit, 0, &["bob".into()]), Value::Text("BOB".into()));
    }

    #[test]
    fn missing_required_param_fails() {
        let err = compile("echo <{text[a].append}>").unwrap_err();
        assert!(matches!(err, CompileError::Parameter { .. }));
        assert!(compile("echo <{null[x]}>").is_err());
    }

    #[test]
    fn runtime_subtag_error_mentions_tag() {
        let unit = compile("echo <{number[1].divide[0]}>").unwrap();
        let reg = Registries::builtin();
        let vars = HashMap::new();
        let cx = TagContext { slots: &[], vars: &vars, evaluators: &unit.evaluators, types: &reg.types };
        let err = unit.entries[0].args[0].evaluate(&cx).unwrap_err();
        assert!(err.to_string().contains("divide by zero"));
    }
}
