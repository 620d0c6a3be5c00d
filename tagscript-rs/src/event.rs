//! Named events and their handler scripts.
//!
//! An [`Event`] is fired with [`Engine::dispatch`](crate::engine::Engine::dispatch).
//! Each handler runs synchronously with the event's context fields (and
//! `cancelled`) as initial variables, and may `determine cancelled` or
//! `determine uncancelled`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::script::{Script, Value};

// ── Event ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// Lower-case event name.
    pub name: String,
    pub cancelled: bool,
    /// Context fields exposed to handlers, in insertion order.
    pub context: Vec<(String, Value)>,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_lowercase(), ..Self::default() }
    }

    /// Add or replace a context field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let key = key.to_lowercase();
        let value = value.into();
        match self.context.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.context.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let key = key.to_lowercase();
        self.context.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Initial variables for a handler run.
    pub fn variables(&self) -> Vec<(String, Value)> {
        let mut vars = self.context.clone();
        vars.push(("cancelled".to_owned(), Value::Boolean(self.cancelled)));
        vars
    }

    /// Apply one handler determination.
    pub fn apply_determination(&mut self, value: &Value) -> Result<(), String> {
        match value.to_string().parse::<Determination>()? {
            Determination::Cancelled => self.cancelled = true,
            Determination::Uncancelled => self.cancelled = false,
        }
        Ok(())
    }
}

/// Outcomes a handler may determine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Determination {
    Cancelled,
    Uncancelled,
}

impl FromStr for Determination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cancelled" => Ok(Determination::Cancelled),
            "uncancelled" => Ok(Determination::Uncancelled),
            _ => Err(format!("Unknown determination '{s}'.")),
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// A script registered to run when an event fires.
#[derive(Debug, Clone)]
pub struct EventHandler {
    /// Lower-case handler name, unique per event.
    pub name: String,
    pub script: Arc<Script>,
    /// Lower runs first.
    pub priority: i32,
    /// Registered by `event add` (dropped on reload).
    pub from_script: bool,
}

impl EventHandler {
    pub fn new(name: &str, script: Arc<Script>, priority: i32) -> Self {
        Self { name: name.to_lowercase(), script, priority, from_script: false }
    }
}

impl fmt::Display for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (priority {})", self.name, self.priority)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_fields_replace_by_key() {
        let ev = Event::new("Chat").with("message", "hi").with("MESSAGE", "bye");
        assert_eq!(ev.name, "chat");
        assert_eq!(ev.context.len(), 1);
        assert_eq!(ev.get("message"), Some(&Value::Text("bye".into())));
    }

    #[test]
    fn variables_include_cancelled() {
        let mut ev = Event::new("x").with("n", 3i64);
        ev.cancelled = true;
        let vars = ev.variables();
        assert_eq!(vars.last(), Some(&("cancelled".to_owned(), Value::Boolean(true))));
    }

    #[test]
    fn determinations_are_case_insensitive() {
        let mut ev = Event::new("x");
        ev.apply_determination(&"CANCELLED".into()).unwrap();
        assert!(ev.cancelled);
        ev.apply_determination(&"Uncancelled".into()).unwrap();
        assert!(!ev.cancelled);
    }

    #[test]
    fn unknown_determination_is_reported() {
        let mut ev = Event::new("x");
        let err = ev.apply_determination(&"bogus".into()).unwrap_err();
        assert_eq!(err, "Unknown determination 'bogus'.");
        assert!(!ev.cancelled);
    }
}
