//! Runtime value type for tag expressions and script variables.
//!
//! Every value can be rendered as text; typed variants exist so that
//! compiled tag chains can hand integers, numbers and lists to the next
//! sub-tag without re-parsing.  [`Value::Null`] is the absence signal that
//! triggers a tag's `||` fallback.

use std::fmt;

/// A tagscript runtime value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Text(s) => f.write_str(s),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Number(x) => write!(f, "{x}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Infer the most specific value for a literal piece of script text:
    /// `5` → integer, `2.5` → number, `true` → boolean, anything else text.
    pub fn from_literal(text: &str) -> Value {
        if let Ok(n) = text.parse::<i64>() {
            Value::Integer(n)
        } else if let Some(x) = parse_number(text) {
            Value::Number(x)
        } else if let Some(b) = parse_boolean(text) {
            Value::Boolean(b)
        } else {
            Value::Text(text.to_owned())
        }
    }

    /// Name of the expression type that naturally holds this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
            Value::List(_) => "list",
        }
    }

    // ── Coercions ─────────────────────────────────────────────────────────────

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Number(x) if x.fract() == 0.0 && x.is_finite() => Some(*x as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Number(x) => Some(*x),
            Value::Text(s) => parse_number(s.trim()),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Text(s) => parse_boolean(s.trim()),
            _ => None,
        }
    }

    /// Items of a list value.  Text is split on `|`; the empty string and
    /// `null` are the empty list.
    pub fn as_list(&self) -> Vec<Value> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) => items.clone(),
            other => {
                let text = other.to_string();
                if text.is_empty() {
                    Vec::new()
                } else {
                    text.split('|').map(Value::from_literal).collect()
                }
            }
        }
    }
}

fn parse_number(s: &str) -> Option<f64> {
    // Reject "inf"/"nan" spellings that str::parse accepts.
    if s.is_empty() || !s.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<f64>().ok().filter(|x| x.is_finite())
}

fn parse_boolean(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_inference() {
        assert_eq!(Value::from_literal("5"), Value::Integer(5));
        assert_eq!(Value::from_literal("-2.5"), Value::Number(-2.5));
        assert_eq!(Value::from_literal("TRUE"), Value::Boolean(true));
        assert_eq!(Value::from_literal("inf"), Value::Text("inf".into()));
        assert_eq!(Value::from_literal("hello"), Value::Text("hello".into()));
    }

    #[test]
    fn list_display_uses_pipes() {
        let v = Value::List(vec![Value::Integer(1), "two".into(), Value::Boolean(false)]);
        assert_eq!(v.to_string(), "1|two|false");
    }

    #[test]
    fn number_display_drops_trailing_zero() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(0.25).to_string(), "0.25");
    }

    #[test]
    fn text_splits_into_list() {
        let v = Value::from("a|2|c");
        assert_eq!(v.as_list(), vec!["a".into(), Value::Integer(2), "c".into()]);
        assert!(Value::from("").as_list().is_empty());
    }

    #[test]
    fn integer_coercion() {
        assert_eq!(Value::Number(4.0).as_integer(), Some(4));
        assert_eq!(Value::Number(4.5).as_integer(), None);
        assert_eq!(Value::from(" 12 ").as_integer(), Some(12));
        assert_eq!(Value::Boolean(true).as_integer(), None);
    }
}
