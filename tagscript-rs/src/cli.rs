//! Command-line argument parsing.
//!
//! Usage:
//!   tagscript [-s<dir>] [-f[<file>]] [-c<cmd>] [-v<verbosity>] [-t<ms>] [<script>...]

use std::path::PathBuf;

use crate::script::Verbosity;

pub const USAGE: &str = "Usage: tagscript [-s<dir>] [-f[<file>]] [-c<cmd>] [-v<verbosity>] [-t<ms>] [<script>...]";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Script directory override (`-s<dir>`).
    pub script_dir: Option<PathBuf>,
    /// Config-file specification.
    pub config: ConfigFile,
    /// Script source to run after autorun scripts start (`-c<cmd>`, repeatable).
    pub commands: Vec<String>,
    /// Verbosity override (`-v<verbosity>`).
    pub verbosity: Option<Verbosity>,
    /// Tick interval override in milliseconds (`-t<ms>`).
    pub tick_ms: Option<u64>,
    /// Script files to run, by name.
    pub scripts: Vec<String>,
}

/// How to choose the config file.
#[derive(Debug, Default, PartialEq)]
pub enum ConfigFile {
    /// The default location under the user config directory.
    #[default]
    Default,
    /// `-f` with no file argument: use built-in defaults only.
    Skip,
    /// `-f<file>`: load this specific file.
    Explicit(PathBuf),
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Value of a flag written either embedded (`-s<dir>`) or separate
/// (`-s <dir>`).  Advances `i` past a separate value.
fn flag_value(argv: &[String], i: &mut usize, rest: &str, flag: char, what: &str) -> Result<String, String> {
    if !rest.is_empty() {
        Ok(rest.to_owned())
    } else if *i + 1 < argv.len() {
        *i += 1;
        Ok(argv[*i].clone())
    } else {
        Err(format!("-{flag} requires {what}"))
    }
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        // `--` ends flag processing.
        if arg == "--" {
            args.scripts.extend(argv[i + 1..].iter().cloned());
            break;
        }

        // Non-flag argument.
        if !arg.starts_with('-') || arg == "-" {
            args.scripts.push(arg.to_owned());
            i += 1;
            continue;
        }

        let mut chars = arg[1..].chars();
        let Some(flag) = chars.next() else {
            return Err(format!("invalid option: {arg}"));
        };
        let rest = chars.as_str();
        match flag {
            's' => args.script_dir = Some(PathBuf::from(flag_value(argv, &mut i, rest, 's', "a directory argument")?)),
            'c' => args.commands.push(flag_value(argv, &mut i, rest, 'c', "a command argument")?),
            'v' => {
                let v = flag_value(argv, &mut i, rest, 'v', "a verbosity argument")?;
                args.verbosity = Some(v.parse()?);
            }
            't' => {
                let v = flag_value(argv, &mut i, rest, 't', "a millisecond argument")?;
                let ms: u64 = v.parse().map_err(|_| format!("invalid tick interval: {v}"))?;
                if ms == 0 {
                    return Err("tick interval must be at least 1 ms".to_owned());
                }
                args.tick_ms = Some(ms);
            }
            // -f[<file>]
            'f' => {
                if !rest.is_empty() {
                    args.config = ConfigFile::Explicit(PathBuf::from(rest));
                } else if i + 1 < argv.len() && !argv[i + 1].starts_with('-') && argv[i + 1].contains('.') {
                    // Separate `-f <file>`; a bare name without an extension
                    // is a script to run.
                    i += 1;
                    args.config = ConfigFile::Explicit(PathBuf::from(&argv[i]));
                } else {
                    args.config = ConfigFile::Skip;
                }
            }
            c => return Err(format!("unknown option: -{c}")),
        }
        i += 1;
    }

    Ok(args)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn empty_args() {
        let a = parse_argv(&argv(&[])).unwrap();
        assert!(a.scripts.is_empty());
        assert_eq!(a.config, ConfigFile::Default);
        assert!(a.verbosity.is_none());
    }

    #[test]
    fn scripts_positional() {
        let a = parse_argv(&argv(&["setup", "main"])).unwrap();
        assert_eq!(a.scripts, vec!["setup", "main"]);
    }

    #[test]
    fn script_dir_embedded_and_separate() {
        let a = parse_argv(&argv(&["-s/some/dir"])).unwrap();
        assert_eq!(a.script_dir, Some(PathBuf::from("/some/dir")));
        let a = parse_argv(&argv(&["-s", "/some/dir"])).unwrap();
        assert_eq!(a.script_dir, Some(PathBuf::from("/some/dir")));
    }

    #[test]
    fn config_variants() {
        let a = parse_argv(&argv(&["-f"])).unwrap();
        assert_eq!(a.config, ConfigFile::Skip);
        let a = parse_argv(&argv(&["-fmy.conf"])).unwrap();
        assert_eq!(a.config, ConfigFile::Explicit(PathBuf::from("my.conf")));
        let a = parse_argv(&argv(&["-f", "my.conf", "main"])).unwrap();
        assert_eq!(a.config, ConfigFile::Explicit(PathBuf::from("my.conf")));
        assert_eq!(a.scripts, vec!["main"]);
        let a = parse_argv(&argv(&["-f", "main"])).unwrap();
        assert_eq!(a.config, ConfigFile::Skip);
        assert_eq!(a.scripts, vec!["main"]);
    }

    #[test]
    fn commands_repeat() {
        let a = parse_argv(&argv(&["-cecho one", "-c", "echo two"])).unwrap();
        assert_eq!(a.commands, vec!["echo one", "echo two"]);
    }

    #[test]
    fn verbosity_and_tick() {
        let a = parse_argv(&argv(&["-vfull", "-t", "20"])).unwrap();
        assert_eq!(a.verbosity, Some(Verbosity::Full));
        assert_eq!(a.tick_ms, Some(20));
        assert!(parse_argv(&argv(&["-vloud"])).is_err());
        assert!(parse_argv(&argv(&["-t0"])).is_err());
        assert!(parse_argv(&argv(&["-tfast"])).is_err());
    }

    #[test]
    fn missing_value() {
        assert_eq!(parse_argv(&argv(&["-c"])).unwrap_err(), "-c requires a command argument");
    }

    #[test]
    fn double_dash_ends_flags() {
        let a = parse_argv(&argv(&["--", "-weird"])).unwrap();
        assert_eq!(a.scripts, vec!["-weird"]);
    }

    #[test]
    fn unknown_flag() {
        assert!(parse_argv(&argv(&["-z"])).is_err());
    }
}
