//! Text matching used by the `matches`, `matches_glob`, `contains_ignore_case`
//! and `contains_any` sub-tags.
//!
//! ## Match modes
//!
//! | Mode | Description |
//! |------|-------------|
//! | [`MatchMode::Regexp`] | [`regex`] crate, smart-case |
//! | [`MatchMode::Glob`]   | `*`, `?`, `[…]` wildcards, case-insensitive |
//! | [`MatchMode::Substr`] | Case-insensitive substring search |
//! | [`MatchMode::AnyOf`]  | Case-insensitive search for any `|`-separated needle |

use std::sync::Arc;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::Regex;
use thiserror::Error;

// ── Public types ─────────────────────────────────────────────────────────────

/// Which matching algorithm a [`Pattern`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Regexp,
    Glob,
    Substr,
    AnyOf,
}

/// Error returned when a pattern cannot be compiled.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("regex error: {0}")]
    InvalidRegex(#[from] regex::Error),
    #[error("glob error: {0}")]
    InvalidGlob(String),
}

#[derive(Clone)]
enum Compiled {
    Regex(Arc<Regex>),
    Glob,
    Substr(String),
    AnyOf(Arc<AhoCorasick>),
}

/// A compiled pattern ready for matching.
#[derive(Clone)]
pub struct Pattern {
    src: String,
    mode: MatchMode,
    compiled: Compiled,
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pattern")
            .field("src", &self.src)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Pattern {
    /// Compile `src` using `mode`.
    pub fn new(src: &str, mode: MatchMode) -> Result<Self, PatternError> {
        let compiled = match mode {
            MatchMode::Regexp => Compiled::Regex(Arc::new(compile_regex(src)?)),
            MatchMode::Glob => {
                check_glob(src).map_err(PatternError::InvalidGlob)?;
                Compiled::Glob
            }
            MatchMode::Substr => Compiled::Substr(src.to_ascii_lowercase()),
            MatchMode::AnyOf => {
                let needles: Vec<&str> = src.split('|').filter(|n| !n.is_empty()).collect();
                let ac = AhoCorasickBuilder::new()
                    .ascii_case_insensitive(true)
                    .build(needles);
                Compiled::AnyOf(Arc::new(ac))
            }
        };
        Ok(Self { src: src.to_owned(), mode, compiled })
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Returns `true` if this pattern matches `text`.
    ///
    /// An empty source string always matches.
    pub fn matches(&self, text: &str) -> bool {
        if self.src.is_empty() {
            return true;
        }
        match &self.compiled {
            Compiled::Regex(re) => re.is_match(text),
            Compiled::Glob => glob_match(&self.src, text),
            Compiled::Substr(lo) => substr_find_ascii_ci(text, lo).is_some(),
            Compiled::AnyOf(ac) => ac.is_match(text),
        }
    }
}

// ── Regex ─────────────────────────────────────────────────────────────────────

/// Case-insensitive unless the pattern holds an unescaped uppercase letter
/// outside a bracket class.
fn compile_regex(pattern: &str) -> Result<Regex, PatternError> {
    let case_insensitive = !has_unescaped_upper(pattern);
    Ok(regex::RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()?)
}

fn has_unescaped_upper(pattern: &str) -> bool {
    let mut escaped = false;
    let mut in_bracket = false;
    for ch in pattern.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            ']' if in_bracket => in_bracket = false,
            '[' if !in_bracket => in_bracket = true,
            c if !in_bracket && c.is_uppercase() => return true,
            _ => {}
        }
    }
    false
}

// ── Glob ──────────────────────────────────────────────────────────────────────
//
//   *      any run of characters
//   ?      any single character
//   [...]  character class, [^...] negated, a-z ranges
//   \x     literal x

/// Glob match over chars, case-insensitive.  Backtracks only to the most
/// recent `*`, so the cost stays linear in practice.
pub fn glob_match(pat: &str, text: &str) -> bool {
    let p: Vec<char> = pat.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if eq_ci(p[pi + 1], t[ti]) {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if eq_ci(c, t[ti]) {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }
        // Mismatch: retry from the last star, consuming one more char.
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Match `ch` against the class opening at `p[open]`.  Returns whether it
/// matched and the index just past the closing `]`.
fn match_class(p: &[char], open: usize, ch: char) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negated = p.get(i) == Some(&'^');
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        let c = p[i];
        if c == ']' && !first {
            return Some((matched != negated, i + 1));
        }
        first = false;
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = (c.to_ascii_lowercase(), p[i + 2].to_ascii_lowercase());
            let lc = ch.to_ascii_lowercase();
            if lo <= lc && lc <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if eq_ci(c, ch) {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

fn eq_ci(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// Validate glob syntax: every `[` needs a closing `]`, and a pattern may not
/// end in a lone `\`.
pub fn check_glob(pat: &str) -> Result<(), String> {
    let p: Vec<char> = pat.chars().collect();
    let mut i = 0;
    while i < p.len() {
        match p[i] {
            '\\' => {
                if i + 1 >= p.len() {
                    return Err("pattern ends with a lone '\\'".to_owned());
                }
                i += 2;
            }
            '[' => {
                let Some((_, next)) = match_class(&p, i, '\0') else {
                    return Err("unmatched '['".to_owned());
                };
                i = next;
            }
            _ => i += 1,
        }
    }
    Ok(())
}

fn substr_find_ascii_ci(text: &str, lo_pattern: &str) -> Option<(usize, usize)> {
    let tb = text.as_bytes();
    let pb = lo_pattern.as_bytes();
    if pb.len() > tb.len() {
        return None;
    }
    'outer: for i in 0..=tb.len() - pb.len() {
        for (j, &p) in pb.iter().enumerate() {
            if tb[i + j].to_ascii_lowercase() != p {
                continue 'outer;
            }
        }
        return Some((i, i + pb.len()));
    }
    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(src: &str, mode: MatchMode) -> Pattern {
        Pattern::new(src, mode).unwrap()
    }

    #[test]
    fn regex_smart_case() {
        assert!(pat("hello", MatchMode::Regexp).matches("HELLO there"));
        assert!(!pat("Hello", MatchMode::Regexp).matches("hello"));
        assert!(pat("[A-Z]+x", MatchMode::Regexp).matches("abcX"));
    }

    #[test]
    fn invalid_regex_is_error() {
        assert!(Pattern::new("(", MatchMode::Regexp).is_err());
    }

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("*", ""));
        assert!(glob_match("h?llo", "HELLO"));
        assert!(glob_match("*.cfg", "scripts/demo.cfg"));
        assert!(!glob_match("*.cfg", "demo.cfgx"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
    }

    #[test]
    fn glob_classes() {
        assert!(glob_match("[a-c]at", "bat"));
        assert!(!glob_match("[^a-c]at", "cat"));
        assert!(glob_match("\\*", "*"));
        assert!(check_glob("[abc").is_err());
        assert!(check_glob("a\\").is_err());
    }

    #[test]
    fn substr_and_any_of() {
        assert!(pat("LAZY", MatchMode::Substr).matches("the lazy dog"));
        assert!(!pat("cat", MatchMode::Substr).matches("dog"));
        let any = pat("fox|cat", MatchMode::AnyOf);
        assert!(any.matches("The quick brown FOX"));
        assert!(!any.matches("dog"));
    }

    #[test]
    fn empty_pattern_matches_everything() {
        for mode in [MatchMode::Regexp, MatchMode::Glob, MatchMode::Substr, MatchMode::AnyOf] {
            assert!(pat("", mode).matches("anything"));
        }
    }
}
