//! Expression object model: tag types and their sub-tag tables.
//!
//! Every tag type has a name, an optional parent type, a creator that
//! converts an arbitrary [`Value`] into that type (or [`Value::Null`] when it
//! can't), and a table of named sub-tags.  A sub-tag lookup that misses on a
//! type continues on its parent, so `integer` values can use `text` sub-tags.
//!
//! | Type | Parent |
//! |------|--------|
//! | `text` | — |
//! | `number` | `text` |
//! | `integer` | `number` |
//! | `boolean` | `text` |
//! | `list` | `text` |
//! | `dynamic` | `text` |
//! | `null` | `text` |

use std::collections::HashMap;

use crate::pattern::{MatchMode, Pattern};
use crate::script::value::Value;

// ── Sub-tag definitions ───────────────────────────────────────────────────────

/// Arguments handed to a sub-tag handler.
pub struct SubTagCall<'a> {
    /// The running value, already converted to the type owning the sub-tag.
    pub value: &'a Value,
    /// The `[parameter]`, already converted to the sub-tag's modifier type.
    pub param: Option<&'a Value>,
    pub types: &'a TypeRegistry,
}

impl SubTagCall<'_> {
    fn text(&self) -> String {
        self.value.to_string()
    }

    fn param_text(&self) -> String {
        self.param.map(Value::to_string).unwrap_or_default()
    }
}

pub type SubTagFn = fn(&SubTagCall<'_>) -> Result<Value, String>;

/// Decides a result type at compile time from the literal parameter text.
pub type SpecialTypeFn = fn(Option<&str>, &TypeRegistry) -> Result<&'static str, String>;

/// How the result type of a sub-tag (or tag base) is determined.
#[derive(Clone, Copy)]
pub enum ReturnType {
    Fixed(&'static str),
    Special(SpecialTypeFn),
}

/// Whether a `[parameter]` is accepted, and which type it is converted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRule {
    None,
    Optional(&'static str),
    Required(&'static str),
}

impl ParamRule {
    pub fn modifier_type(self) -> Option<&'static str> {
        match self {
            ParamRule::None => None,
            ParamRule::Optional(t) | ParamRule::Required(t) => Some(t),
        }
    }
}

#[derive(Clone)]
pub struct SubTag {
    pub name: &'static str,
    pub returns: ReturnType,
    pub param: ParamRule,
    pub handler: SubTagFn,
}

// ── Tag types ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TagType {
    pub name: &'static str,
    pub parent: Option<&'static str>,
    pub creator: fn(&Value) -> Value,
    pub subtags: HashMap<&'static str, SubTag>,
}

impl TagType {
    pub fn new(name: &'static str, parent: Option<&'static str>, creator: fn(&Value) -> Value) -> Self {
        Self { name, parent, creator, subtags: HashMap::new() }
    }

    /// Add a sub-tag (builder style).
    pub fn with(mut self, name: &'static str, returns: ReturnType, param: ParamRule, handler: SubTagFn) -> Self {
        self.subtags.insert(name, SubTag { name, returns, param, handler });
        self
    }
}

/// Registry of every tag type known to an engine.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<&'static str, TagType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in types.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(text_type());
        reg.register(number_type());
        reg.register(integer_type());
        reg.register(boolean_type());
        reg.register(list_type());
        reg.register(TagType::new("dynamic", Some("text"), Value::clone));
        reg.register(TagType::new("null", Some("text"), |_| Value::Null));
        reg
    }

    /// Register or replace a type.
    pub fn register(&mut self, ty: TagType) {
        self.types.insert(ty.name, ty);
    }

    pub fn get(&self, name: &str) -> Option<&TagType> {
        self.types.get(name)
    }

    /// Canonical `'static` name for a type, matched case-insensitively.
    pub fn canonical_name(&self, name: &str) -> Option<&'static str> {
        let lower = name.to_ascii_lowercase();
        self.types.get(lower.as_str()).map(|t| t.name)
    }

    /// Find `key` on `type_name` or the nearest ancestor that defines it.
    /// Returns the owning type alongside the sub-tag.
    pub fn resolve_subtag(&self, type_name: &str, key: &str) -> Option<(&TagType, &SubTag)> {
        let mut current = self.types.get(type_name);
        // Bounded walk so a misconfigured parent cycle can't hang the compiler.
        for _ in 0..=self.types.len() {
            let ty = current?;
            if let Some(sub) = ty.subtags.get(key) {
                return Some((ty, sub));
            }
            current = ty.parent.and_then(|p| self.types.get(p));
        }
        None
    }

    /// Convert a value to the named type with that type's creator.
    /// Unknown types pass the value through unchanged.
    pub fn convert(&self, value: &Value, type_name: &str) -> Value {
        match self.types.get(type_name) {
            Some(ty) => (ty.creator)(value),
            None => value.clone(),
        }
    }

    /// Whether `child` is `ancestor` or descends from it.
    pub fn is_a(&self, child: &str, ancestor: &str) -> bool {
        let mut current = Some(child);
        for _ in 0..=self.types.len() {
            let Some(name) = current else { return false };
            if name == ancestor {
                return true;
            }
            current = self.types.get(name).and_then(|t| t.parent);
        }
        false
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }
}

// ── Creators ──────────────────────────────────────────────────────────────────

fn create_text(v: &Value) -> Value {
    match v {
        Value::Null => Value::Null,
        Value::Text(_) => v.clone(),
        other => Value::Text(other.to_string()),
    }
}

fn create_number(v: &Value) -> Value {
    v.as_number().map(Value::Number).unwrap_or(Value::Null)
}

fn create_integer(v: &Value) -> Value {
    v.as_integer().map(Value::Integer).unwrap_or(Value::Null)
}

fn create_boolean(v: &Value) -> Value {
    v.as_boolean().map(Value::Boolean).unwrap_or(Value::Null)
}

fn create_list(v: &Value) -> Value {
    match v {
        Value::Null => Value::Null,
        other => Value::List(other.as_list()),
    }
}

/// Result type of `as[type]`: the named type itself.
fn special_as(param: Option<&str>, types: &TypeRegistry) -> Result<&'static str, String> {
    let name = param.ok_or("The 'as' sub-tag needs a literal type name, like as[integer].")?;
    types
        .canonical_name(name.trim())
        .ok_or_else(|| format!("Unknown type '{name}' for the 'as' sub-tag."))
}

use ParamRule::{None as NoParam, Required};
use ReturnType::{Fixed, Special};

// ── text ──────────────────────────────────────────────────────────────────────

fn text_type() -> TagType {
    TagType::new("text", None, create_text)
        .with("to_upper", Fixed("text"), NoParam, |c| Ok(c.text().to_uppercase().into()))
        .with("to_lower", Fixed("text"), NoParam, |c| Ok(c.text().to_lowercase().into()))
        .with("length", Fixed("integer"), NoParam, |c| {
            Ok(Value::Integer(c.text().chars().count() as i64))
        })
        .with("to_number", Fixed("number"), NoParam, |c| Ok(create_number(c.value)))
        .with("to_integer", Fixed("integer"), NoParam, |c| Ok(create_integer(c.value)))
        .with("to_boolean", Fixed("boolean"), NoParam, |c| Ok(create_boolean(c.value)))
        .with("is_number", Fixed("boolean"), NoParam, |c| Ok(c.value.as_number().is_some().into()))
        .with("is_integer", Fixed("boolean"), NoParam, |c| Ok(c.value.as_integer().is_some().into()))
        .with("is_boolean", Fixed("boolean"), NoParam, |c| Ok(c.value.as_boolean().is_some().into()))
        .with("to_list_of_characters", Fixed("list"), NoParam, |c| {
            Ok(Value::List(c.text().chars().map(|ch| Value::Text(ch.to_string())).collect()))
        })
        .with("substring", Fixed("text"), Required("text"), substring)
        .with("append", Fixed("text"), Required("text"), |c| {
            Ok(format!("{}{}", c.text(), c.param_text()).into())
        })
        .with("prepend", Fixed("text"), Required("text"), |c| {
            Ok(format!("{}{}", c.param_text(), c.text()).into())
        })
        .with("equals", Fixed("boolean"), Required("text"), |c| Ok((c.text() == c.param_text()).into()))
        .with("does_not_equal", Fixed("boolean"), Required("text"), |c| {
            Ok((c.text() != c.param_text()).into())
        })
        .with("equals_ignore_case", Fixed("boolean"), Required("text"), |c| {
            Ok(c.text().to_lowercase().eq(&c.param_text().to_lowercase()).into())
        })
        .with("does_not_equal_ignore_case", Fixed("boolean"), Required("text"), |c| {
            Ok((!c.text().to_lowercase().eq(&c.param_text().to_lowercase())).into())
        })
        .with("contains", Fixed("boolean"), Required("text"), |c| {
            Ok(c.text().contains(c.param_text().as_str()).into())
        })
        .with("contains_ignore_case", Fixed("boolean"), Required("text"), |c| {
            pattern_match(&c.param_text(), MatchMode::Substr, &c.text())
        })
        .with("contains_any", Fixed("boolean"), Required("text"), |c| {
            pattern_match(&c.param_text(), MatchMode::AnyOf, &c.text())
        })
        .with("matches", Fixed("boolean"), Required("text"), |c| {
            pattern_match(&c.param_text(), MatchMode::Regexp, &c.text())
        })
        .with("matches_glob", Fixed("boolean"), Required("text"), |c| {
            pattern_match(&c.param_text(), MatchMode::Glob, &c.text())
        })
        .with("split", Fixed("list"), Required("text"), |c| {
            let sep = c.param_text();
            if sep.is_empty() {
                return Err("Cannot split on an empty separator.".to_owned());
            }
            Ok(Value::List(c.text().split(sep.as_str()).map(Value::from).collect()))
        })
        .with("type", Fixed("text"), NoParam, |c| Ok(c.value.type_name().into()))
        .with("as", Special(special_as), Required("text"), |c| {
            let target = c.param_text();
            let name = c.types.canonical_name(target.trim()).unwrap_or("dynamic");
            Ok(c.types.convert(c.value, name))
        })
}

fn pattern_match(src: &str, mode: MatchMode, text: &str) -> Result<Value, String> {
    let pat = Pattern::new(src, mode).map_err(|e| e.to_string())?;
    Ok(pat.matches(text).into())
}

/// `substring[a,b]`: characters a through b, 1-based and inclusive, clamped
/// to the text.
fn substring(c: &SubTagCall<'_>) -> Result<Value, String> {
    let spec = c.param_text();
    let (a, b) = spec
        .split_once(',')
        .ok_or_else(|| format!("Invalid substring range '{spec}', expected [start,end]."))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<i64>()
            .map_err(|_| format!("Invalid substring index '{}'.", s.trim()))
    };
    let (start, end) = (parse(a)?, parse(b)?);
    let chars: Vec<char> = c.text().chars().collect();
    let start = start.max(1) as usize;
    let end = (end.max(0) as usize).min(chars.len());
    if start > end {
        return Ok(Value::Text(String::new()));
    }
    Ok(Value::Text(chars[start - 1..end].iter().collect()))
}

// ── number / integer ──────────────────────────────────────────────────────────

fn num_pair(c: &SubTagCall<'_>) -> (f64, f64) {
    let a = c.value.as_number().unwrap_or(0.0);
    let b = c.param.and_then(Value::as_number).unwrap_or(0.0);
    (a, b)
}

fn number_type() -> TagType {
    TagType::new("number", Some("text"), create_number)
        .with("add", Fixed("number"), Required("number"), |c| {
            let (a, b) = num_pair(c);
            Ok(Value::Number(a + b))
        })
        .with("subtract", Fixed("number"), Required("number"), |c| {
            let (a, b) = num_pair(c);
            Ok(Value::Number(a - b))
        })
        .with("multiply", Fixed("number"), Required("number"), |c| {
            let (a, b) = num_pair(c);
            Ok(Value::Number(a * b))
        })
        .with("divide", Fixed("number"), Required("number"), |c| {
            let (a, b) = num_pair(c);
            if b == 0.0 {
                return Err("Cannot divide by zero.".to_owned());
            }
            Ok(Value::Number(a / b))
        })
        .with("is_greater_than", Fixed("boolean"), Required("number"), |c| {
            let (a, b) = num_pair(c);
            Ok((a > b).into())
        })
        .with("is_less_than", Fixed("boolean"), Required("number"), |c| {
            let (a, b) = num_pair(c);
            Ok((a < b).into())
        })
        .with("round", Fixed("integer"), NoParam, |c| {
            Ok(Value::Integer(c.value.as_number().unwrap_or(0.0).round() as i64))
        })
        .with("absolute_value", Fixed("number"), NoParam, |c| {
            Ok(Value::Number(c.value.as_number().unwrap_or(0.0).abs()))
        })
}

fn int_pair(c: &SubTagCall<'_>) -> (i64, i64) {
    let a = c.value.as_integer().unwrap_or(0);
    let b = c.param.and_then(Value::as_integer).unwrap_or(0);
    (a, b)
}

fn integer_type() -> TagType {
    TagType::new("integer", Some("number"), create_integer)
        .with("add", Fixed("integer"), Required("integer"), |c| {
            let (a, b) = int_pair(c);
            a.checked_add(b).map(Value::Integer).ok_or_else(overflow)
        })
        .with("subtract", Fixed("integer"), Required("integer"), |c| {
            let (a, b) = int_pair(c);
            a.checked_sub(b).map(Value::Integer).ok_or_else(overflow)
        })
        .with("multiply", Fixed("integer"), Required("integer"), |c| {
            let (a, b) = int_pair(c);
            a.checked_mul(b).map(Value::Integer).ok_or_else(overflow)
        })
        .with("modulo", Fixed("integer"), Required("integer"), |c| {
            let (a, b) = int_pair(c);
            if b == 0 {
                return Err("Cannot take modulo by zero.".to_owned());
            }
            Ok(Value::Integer(a.rem_euclid(b)))
        })
        .with("is_even", Fixed("boolean"), NoParam, |c| {
            Ok((c.value.as_integer().unwrap_or(0) % 2 == 0).into())
        })
}

fn overflow() -> String {
    "Integer overflow.".to_owned()
}

// ── boolean ───────────────────────────────────────────────────────────────────

fn boolean_type() -> TagType {
    TagType::new("boolean", Some("text"), create_boolean)
        .with("not", Fixed("boolean"), NoParam, |c| Ok((!c.value.as_boolean().unwrap_or(false)).into()))
        .with("and", Fixed("boolean"), Required("boolean"), |c| {
            let a = c.value.as_boolean().unwrap_or(false);
            Ok((a && c.param.and_then(Value::as_boolean).unwrap_or(false)).into())
        })
        .with("or", Fixed("boolean"), Required("boolean"), |c| {
            let a = c.value.as_boolean().unwrap_or(false);
            Ok((a || c.param.and_then(Value::as_boolean).unwrap_or(false)).into())
        })
}

// ── list ──────────────────────────────────────────────────────────────────────

fn list_type() -> TagType {
    TagType::new("list", Some("text"), create_list)
        .with("size", Fixed("integer"), NoParam, |c| Ok(Value::Integer(c.value.as_list().len() as i64)))
        .with("first", Fixed("dynamic"), NoParam, |c| {
            Ok(c.value.as_list().into_iter().next().unwrap_or(Value::Null))
        })
        .with("last", Fixed("dynamic"), NoParam, |c| Ok(c.value.as_list().pop().unwrap_or(Value::Null)))
        .with("get", Fixed("dynamic"), Required("integer"), |c| {
            let index = c.param.and_then(Value::as_integer).unwrap_or(0);
            let position = index
                .checked_sub(1)
                .ok_or_else(|| format!("List index {index} is out of range."))?;
            let items = c.value.as_list();
            Ok(usize::try_from(position).ok().and_then(|i| items.get(i).cloned()).unwrap_or(Value::Null))
        })
        .with("reversed", Fixed("list"), NoParam, |c| {
            let mut items = c.value.as_list();
            items.reverse();
            Ok(Value::List(items))
        })
        .with("joined", Fixed("text"), Required("text"), |c| {
            let sep = c.param_text();
            let parts: Vec<String> = c.value.as_list().iter().map(Value::to_string).collect();
            Ok(Value::Text(parts.join(&sep)))
        })
        .with("contains", Fixed("boolean"), Required("text"), |c| {
            let needle = c.param_text();
            Ok(c.value.as_list().iter().any(|v| v.to_string() == needle).into())
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
