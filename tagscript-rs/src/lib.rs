//! An embeddable command-scripting engine.
//!
//! Scripts are parsed into flat instruction lists with nested blocks,
//! their `<{tag}>` expressions are resolved against a type hierarchy at
//! compile time, and the compiled form runs on a cooperative stack machine
//! driven by [`Engine::tick`](engine::Engine::tick).

pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod pattern;
pub mod script;

pub use engine::{Engine, FileLoader};
pub use error::{CompileError, ScriptError};
pub use event::{Event, EventHandler};
pub use script::{MessageType, OutputFn, Script, Value, Verbosity};
