//! Error types for compiling and running scripts.

use thiserror::Error;

/// A failure that prevents a script from compiling.
///
/// Compile errors are fatal to the whole script; the engine wraps the
/// rendered message into a placeholder script that reports it when run.
/// Every variant renders as `(line N): message`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Malformed source text: unbalanced brackets, unterminated tags.
    #[error("(line {line}): {message}")]
    Syntax { line: usize, message: String },

    /// A command rejected its arguments or block shape.
    #[error("(line {line}): {message}")]
    Validation { line: usize, message: String },

    /// The first key of a tag names no registered tag base.
    #[error("(line {line}): Invalid tag base '{key}' in tag '{raw}'!")]
    UnknownBase { line: usize, key: String, raw: String },

    /// A later key of a tag does not resolve against the running type.
    #[error("(line {line}): Invalid sub-tag '{key}' at sub-tag index {index} for type '{type_name}' ({hint})! In tag '{raw}'.")]
    SubTag {
        line: usize,
        index: usize,
        key: String,
        type_name: String,
        hint: &'static str,
        raw: String,
    },

    /// `var[name]` names a variable that is not declared at that position.
    #[error("(line {line}): Unknown variable '{name}' in tag '{raw}'!")]
    UnknownVariable { line: usize, name: String, raw: String },

    /// A tag is missing a required `[parameter]` or has one it cannot use.
    #[error("(line {line}): {message} In tag '{raw}'.")]
    Parameter { line: usize, message: String, raw: String },
}

impl CompileError {
    /// 1-based source line the error was raised at.
    pub fn line(&self) -> usize {
        match self {
            CompileError::Syntax { line, .. }
            | CompileError::Validation { line, .. }
            | CompileError::UnknownBase { line, .. }
            | CompileError::SubTag { line, .. }
            | CompileError::UnknownVariable { line, .. }
            | CompileError::Parameter { line, .. } => *line,
        }
    }

    /// Index of the offending key within its tag chain, where one applies.
    /// An unknown base is index 0.
    pub fn subtag_index(&self) -> Option<usize> {
        match self {
            CompileError::SubTag { index, .. } => Some(*index),
            CompileError::UnknownBase { .. } | CompileError::UnknownVariable { .. } => Some(0),
            _ => None,
        }
    }

    /// Full report as shown to the user for a failed script.
    pub fn report(&self, script: &str) -> String {
        format!("FAILED TO COMPILE SCRIPT '{script}': {self}")
    }
}

/// A failure raised while a script runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// Recoverable at an enclosing `try` block.
    #[error("{0}")]
    Runtime(String),

    /// An engine fault or a panic caught inside a command.
    #[error("Internal exception: {0}")]
    Internal(String),
}

impl ScriptError {
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime(message.into())
    }
}

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_report_format() {
        let err = CompileError::Validation { line: 3, message: "Missing block!".into() };
        assert_eq!(err.report("demo"), "FAILED TO COMPILE SCRIPT 'demo': (line 3): Missing block!");
    }

    #[test]
    fn subtag_error_mentions_index_and_hint() {
        let err = CompileError::SubTag {
            line: 1,
            index: 2,
            key: String::new(),
            type_name: "text".into(),
            hint: "stray '.' dot symbol?",
            raw: "text[a]..to_upper".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sub-tag index 2"));
        assert!(msg.contains("stray '.'"));
        assert_eq!(err.subtag_index(), Some(2));
    }

    #[test]
    fn internal_error_prefix() {
        let err = ScriptError::Internal("boom".into());
        assert_eq!(err.to_string(), "Internal exception: boom");
    }
}
