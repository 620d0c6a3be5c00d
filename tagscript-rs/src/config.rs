//! Host configuration file parser.
//!
//! A config file is a list of `key = value` lines:
//!
//! | Key | Value |
//! |-----|-------|
//! | `script_dir` | directory script files are loaded from |
//! | `script_extension` | script file extension, default `cfg` |
//! | `verbosity` | `full`, `minimal` or `none` |
//! | `tick_interval` | milliseconds between engine ticks |
//! | `autorun` | `true` to start `///autorun` scripts on startup |
//! | Lines starting with `#` or `;` | comment, ignored |
//!
//! Bad lines are collected as [`ConfigError`]s; the remaining lines still
//! apply.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;

use crate::script::Verbosity;

// ── Public API ────────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Settings for the command-line host.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub script_dir: PathBuf,
    pub script_extension: String,
    pub verbosity: Verbosity,
    pub tick_interval: Duration,
    pub autorun: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let script_dir = project_dirs()
            .map(|d| d.data_dir().join("scripts"))
            .unwrap_or_else(|| PathBuf::from("scripts"));
        Self {
            script_dir,
            script_extension: "cfg".to_owned(),
            verbosity: Verbosity::Minimal,
            tick_interval: Duration::from_millis(50),
            autorun: true,
        }
    }
}

impl EngineConfig {
    /// Parse config text over the defaults.  Returns the config and a list
    /// of any bad lines.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = EngineConfig::default();
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                errors.push(ConfigError { line: lineno, message: format!("expected 'key = value', got '{line}'") });
                continue;
            };
            if let Err(message) = config.apply(key.trim(), unquote(value.trim())) {
                errors.push(ConfigError { line: lineno, message });
            }
        }

        (config, errors)
    }

    /// Read and parse a config file from disk.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }

    /// Set one key.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key.to_ascii_lowercase().as_str() {
            "script_dir" => self.script_dir = PathBuf::from(value),
            "script_extension" => {
                let ext = value.trim_start_matches('.');
                if ext.is_empty() {
                    return Err("script_extension must not be empty".to_owned());
                }
                self.script_extension = ext.to_owned();
            }
            "verbosity" => self.verbosity = value.parse()?,
            "tick_interval" => {
                let ms: u64 = value.parse().map_err(|_| format!("invalid tick_interval '{value}'"))?;
                if ms == 0 {
                    return Err("tick_interval must be at least 1 ms".to_owned());
                }
                self.tick_interval = Duration::from_millis(ms);
            }
            "autorun" => {
                self.autorun = match value.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => true,
                    "false" | "no" | "off" | "0" => false,
                    _ => return Err(format!("invalid autorun value '{value}'")),
                }
            }
            other => return Err(format!("unknown key '{other}'")),
        }
        Ok(())
    }
}

/// Default config file location (`<config dir>/tagscript.conf`).
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("tagscript.conf"))
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "tagscript")
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"').and_then(|r| r.strip_suffix('"')).unwrap_or(s)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
