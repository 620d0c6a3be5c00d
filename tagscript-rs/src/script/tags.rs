//! Tag bases: the starting handler named by the first key of every tag.
//!
//! `<{text[hello].to_upper}>` starts at the `text` base, which produces a
//! `text` value from its parameter; the compiler then resolves `to_upper`
//! against the `text` type.  `var[...]` is special: the compiler replaces it
//! with a direct slot read, so its [`TagBase::evaluate`] is only the slow
//! path for engines that evaluate tags without compiling them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ScriptError;
use crate::script::types::{ParamRule, ReturnType, TypeRegistry};
use crate::script::value::Value;

// ── Evaluation context ────────────────────────────────────────────────────────

/// Everything a compiled tag chain can read while it runs.
pub struct TagContext<'a> {
    /// The running frame's local variable slots.
    pub slots: &'a [Value],
    /// The running frame's dynamic variables (`dvar[...]`).
    pub vars: &'a HashMap<String, Value>,
    /// All compiled chains of the script, for nested tags in parameters.
    pub evaluators: &'a [Evaluator],
    pub types: &'a TypeRegistry,
}

/// One pre-lowered tag chain.
pub type Evaluator = Arc<dyn Fn(&TagContext<'_>) -> Result<Value, ScriptError> + Send + Sync>;

// ── TagBase ───────────────────────────────────────────────────────────────────

pub trait TagBase: Send + Sync {
    fn name(&self) -> &'static str;

    fn param(&self) -> ParamRule {
        ParamRule::Required("text")
    }

    fn returns(&self) -> ReturnType;

    /// `true` for the base that reads compiled local variable slots.
    fn reads_slot(&self) -> bool {
        false
    }

    fn evaluate(&self, param: Option<&Value>, cx: &TagContext<'_>) -> Result<Value, String>;
}

/// A base that converts its parameter into a fixed type: `text[...]`,
/// `integer[...]`, `list[...]` and friends.
pub struct ConvertBase {
    pub name: &'static str,
    pub type_name: &'static str,
}

impl TagBase for ConvertBase {
    fn name(&self) -> &'static str {
        self.name
    }

    fn returns(&self) -> ReturnType {
        ReturnType::Fixed(self.type_name)
    }

    fn evaluate(&self, param: Option<&Value>, cx: &TagContext<'_>) -> Result<Value, String> {
        let value = param.cloned().unwrap_or_else(|| Value::Text(String::new()));
        Ok(cx.types.convert(&value, self.type_name))
    }
}

/// `null`: always the absence value, useful to force a fallback.
pub struct NullBase;

impl TagBase for NullBase {
    fn name(&self) -> &'static str {
        "null"
    }

    fn param(&self) -> ParamRule {
        ParamRule::None
    }

    fn returns(&self) -> ReturnType {
        ReturnType::Fixed("null")
    }

    fn evaluate(&self, _param: Option<&Value>, _cx: &TagContext<'_>) -> Result<Value, String> {
        Ok(Value::Null)
    }
}

/// `var[name]`: a compiled local variable.
pub struct VarBase;

impl TagBase for VarBase {
    fn name(&self) -> &'static str {
        "var"
    }

    fn returns(&self) -> ReturnType {
        ReturnType::Fixed("dynamic")
    }

    fn reads_slot(&self) -> bool {
        true
    }

    fn evaluate(&self, param: Option<&Value>, cx: &TagContext<'_>) -> Result<Value, String> {
        let name = param.map(|p| p.to_string().to_lowercase()).unwrap_or_default();
        cx.vars
            .get(&name)
            .cloned()
            .ok_or_else(|| format!("Unknown variable '{name}'."))
    }
}

/// `dvar[name]`: a variable injected at runtime (`determinations`,
/// `stack_trace`, event context).  Missing names read as `null`.
pub struct DynamicVarBase;

impl TagBase for DynamicVarBase {
    fn name(&self) -> &'static str {
        "dvar"
    }

    fn returns(&self) -> ReturnType {
        ReturnType::Fixed("dynamic")
    }

    fn evaluate(&self, param: Option<&Value>, cx: &TagContext<'_>) -> Result<Value, String> {
        let name = param.map(|p| p.to_string().to_lowercase()).unwrap_or_default();
        Ok(cx.vars.get(&name).cloned().unwrap_or(Value::Null))
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Tag bases by lower-case name.
#[derive(Clone, Default)]
pub struct TagBaseRegistry {
    bases: HashMap<String, Arc<dyn TagBase>>,
}

impl TagBaseRegistry {
    pub fn builtin() -> Self {
        let mut reg = Self::default();
        for (name, type_name) in [
            ("text", "text"),
            ("number", "number"),
            ("integer", "integer"),
            ("boolean", "boolean"),
            ("list", "list"),
        ] {
            reg.register(Arc::new(ConvertBase { name, type_name }));
        }
        reg.register(Arc::new(NullBase));
        reg.register(Arc::new(VarBase));
        reg.register(Arc::new(DynamicVarBase));
        reg
    }

    pub fn register(&mut self, base: Arc<dyn TagBase>) {
        self.bases.insert(base.name().to_ascii_lowercase(), base);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TagBase>> {
        self.bases.get(name)
    }
}
