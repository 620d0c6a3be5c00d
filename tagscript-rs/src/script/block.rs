//! Script tokenizer and block parser.
//!
//! Source text is a sequence of commands separated by `;`, with `{ }`
//! blocks attached to the command right before them:
//!
//! ```text
//! // comment
//! define count 3;
//! repeat <{var[count]}> --as=i {
//!     echo "pass <{var[i]}>";
//! }
//! ```
//!
//! Parsing happens in three steps:
//!
//! 1. [`split_source`] strips `//` and `/* */` comments, splits on `;`, and
//!    turns unquoted `{` / `}` into block tokens.  `<{` and `}>` are tag
//!    delimiters, not braces.
//! 2. Block tokens are folded into a tree; each `{ }` region belongs to the
//!    instruction right before it.  A stray `}` is ignored and a missing one
//!    is implied at end of input.
//! 3. The tree is flattened in pre-order: every owner is immediately followed
//!    by its block, and owners that ask for it get a callback entry right
//!    after their block.  Each instruction is then validated.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::CompileError;
use crate::script::argument::Argument;
use crate::script::command::{BlockRule, CommandRegistry};

// ── Instruction ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Lower-case command name.
    pub name: String,
    pub args: Vec<Argument>,
    /// `--key=value` arguments by lower-case key.
    pub named: BTreeMap<String, Argument>,
    /// 1-based source line.
    pub line: usize,
    /// The command's source text, used in error traces.
    pub source: String,
    /// Indices of the nested block this instruction owns.
    pub block: Option<Range<usize>>,
    /// Written with a leading `&`: wait for the command to finish.
    pub wait_for: bool,
    /// Set on synthesized callback entries: the owner's index.
    pub callback_of: Option<usize>,
    /// The preceding sibling this instruction continues (`else` → `if`).
    pub link: Option<usize>,
}

impl Instruction {
    pub fn new(name: &str, line: usize) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            args: Vec::new(),
            named: BTreeMap::new(),
            line,
            source: name.to_owned(),
            block: None,
            wait_for: false,
            callback_of: None,
            link: None,
        }
    }

    pub fn is_callback(&self) -> bool {
        self.callback_of.is_some()
    }

    /// Source form of the command head, without any block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.wait_for {
            out.push('&');
        }
        out.push_str(&self.name);
        for arg in &self.args {
            out.push(' ');
            out.push_str(&quote_if_needed(&arg.to_string(), arg.quoted));
        }
        for (key, arg) in &self.named {
            out.push(' ');
            out.push_str(&quote_if_needed(&format!("--{key}={arg}"), arg.quoted));
        }
        out
    }
}

fn quote_if_needed(text: &str, quoted: bool) -> String {
    if !quoted && !text.is_empty() && !needs_quotes(text) {
        text.to_owned()
    } else if text.contains('"') {
        format!("'{text}'")
    } else {
        format!("\"{text}\"")
    }
}

/// Whether `text` would split or change meaning if written bare.  Tag
/// delimiters are fine, and whitespace inside a tag doesn't split words.
fn needs_quotes(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    let mut tags = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c == '<' && next == Some('{') {
            tags += 1;
            i += 2;
            continue;
        }
        if c == '}' && next == Some('>') && tags > 0 {
            tags -= 1;
            i += 2;
            continue;
        }
        if matches!(c, ';' | '{' | '}' | '"' | '\'') || (tags == 0 && c.is_whitespace()) {
            return true;
        }
        i += 1;
    }
    false
}

// ── Step 1: raw tokens ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RawToken {
    Command { text: String, line: usize },
    Open,
    Close,
}

/// Split script text into command pieces and block tokens.
pub fn split_source(src: &str) -> Vec<RawToken> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;
    let mut line = 1;
    let mut quote: Option<char> = None;
    let mut i = 0;

    let flush = |current: &mut String, start_line: usize, tokens: &mut Vec<RawToken>| {
        let text = current.trim();
        if !text.is_empty() {
            tokens.push(RawToken::Command { text: text.to_owned(), line: start_line });
        }
        current.clear();
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if quote.is_none() && c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if quote.is_none() && c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            i += 2;
            continue;
        }

        if quote.is_none() && !c.is_whitespace() && current.trim().is_empty() {
            start_line = line;
        }
        match c {
            '"' | '\'' => {
                match quote {
                    None => quote = Some(c),
                    Some(q) if q == c => quote = None,
                    Some(_) => {}
                }
                current.push(c);
            }
            ';' if quote.is_none() => flush(&mut current, start_line, &mut tokens),
            '{' if quote.is_none() && i > 0 && chars[i - 1] == '<' => current.push(c),
            '}' if quote.is_none() && next == Some('>') => current.push(c),
            '{' if quote.is_none() => {
                flush(&mut current, start_line, &mut tokens);
                tokens.push(RawToken::Open);
            }
            '}' if quote.is_none() => {
                flush(&mut current, start_line, &mut tokens);
                tokens.push(RawToken::Close);
            }
            '\n' => {
                line += 1;
                current.push(' ');
            }
            c => current.push(c),
        }
        i += 1;
    }
    flush(&mut current, start_line, &mut tokens);
    tokens
}

/// Split one command piece into words, stripping quotes outside tags.
/// Returns `(word, quoted)` pairs.
fn split_words(text: &str) -> Vec<(String, bool)> {
    let chars: Vec<char> = text.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut quote: Option<char> = None;
    let mut tags = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c == '<' && next == Some('{') {
            tags += 1;
            current.push_str("<{");
            i += 2;
            continue;
        }
        if c == '}' && next == Some('>') && tags > 0 {
            tags -= 1;
            current.push_str("}>");
            i += 2;
            continue;
        }
        match c {
            '"' | '\'' if tags == 0 => match quote {
                None => {
                    quote = Some(c);
                    quoted = true;
                }
                Some(q) if q == c => quote = None,
                Some(_) => current.push(c),
            },
            c if c.is_whitespace() && quote.is_none() && tags == 0 => {
                if !current.is_empty() || quoted {
                    words.push((std::mem::take(&mut current), quoted));
                }
                quoted = false;
            }
            c => current.push(c),
        }
        i += 1;
    }
    if !current.is_empty() || quoted {
        words.push((current, quoted));
    }
    words
}

/// Build an instruction from one command piece.
pub fn parse_instruction(text: &str, line: usize) -> Result<Instruction, CompileError> {
    let syntax = |message: String| CompileError::Syntax { line, message };
    let mut words = split_words(text).into_iter();
    let Some((head, _)) = words.next() else {
        return Err(syntax("Empty command.".to_owned()));
    };
    let (wait_for, name) = match head.strip_prefix('&') {
        Some(rest) => (true, rest),
        None => (false, head.as_str()),
    };
    if name.is_empty() {
        return Err(syntax("Missing command name.".to_owned()));
    }

    let mut instr = Instruction::new(name, line);
    instr.wait_for = wait_for;
    instr.source = text.to_owned();
    for (word, quoted) in words {
        let named = if quoted { None } else { word.strip_prefix("--").and_then(|w| w.split_once('=')) };
        if let Some((key, value)) = named {
            let arg = Argument::parse(value).map_err(syntax)?;
            instr.named.insert(key.to_ascii_lowercase(), arg);
        } else {
            let mut arg = Argument::parse(&word).map_err(syntax)?;
            arg.quoted = quoted;
            instr.args.push(arg);
        }
    }
    Ok(instr)
}

// ── Step 2: block tree ────────────────────────────────────────────────────────

struct Node {
    instr: Instruction,
    block: Option<Vec<Node>>,
}

fn build_level(
    tokens: &[RawToken],
    pos: &mut usize,
    nested: bool,
) -> Result<Vec<Node>, CompileError> {
    let mut nodes: Vec<Node> = Vec::new();
    while *pos < tokens.len() {
        let token = &tokens[*pos];
        *pos += 1;
        match token {
            RawToken::Command { text, line } => {
                nodes.push(Node { instr: parse_instruction(text, *line)?, block: None });
            }
            RawToken::Open => {
                let children = build_level(tokens, pos, true)?;
                match nodes.last_mut() {
                    Some(owner) if owner.block.is_none() => owner.block = Some(children),
                    _ => nodes.extend(children),
                }
            }
            RawToken::Close if nested => return Ok(nodes),
            RawToken::Close => {}
        }
    }
    Ok(nodes)
}

// ── Step 3: flatten and validate ──────────────────────────────────────────────

fn flatten(
    nodes: Vec<Node>,
    out: &mut Vec<Instruction>,
    registry: &CommandRegistry,
) -> Result<(), CompileError> {
    let mut prev_sibling: Option<usize> = None;
    for node in nodes {
        let index = out.len();
        let mut instr = node.instr;
        let cmd = registry.get(&instr.name).cloned();

        if let Some(allowed) = cmd.as_ref().and_then(|c| c.links_previous()) {
            match prev_sibling {
                Some(p) if allowed.iter().any(|a| *a == out[p].name) => instr.link = Some(p),
                _ => {
                    return Err(CompileError::Validation {
                        line: instr.line,
                        message: format!("'{}' must directly follow one of: {}.", instr.name, allowed.join(", ")),
                    })
                }
            }
        }

        let line = instr.line;
        let name = instr.name.clone();
        out.push(instr);
        if let Some(children) = node.block {
            let start = out.len();
            flatten(children, out, registry)?;
            out[index].block = Some(start..out.len());
            if cmd.as_ref().is_some_and(|c| c.needs_callback()) {
                let mut callback = Instruction::new(&name, line);
                callback.source = format!("{name} (end of block)");
                callback.callback_of = Some(index);
                out.push(callback);
            }
        }
        prev_sibling = Some(index);
    }
    Ok(())
}

fn validate(instr: &Instruction, registry: &CommandRegistry) -> Result<(), CompileError> {
    let Some(cmd) = registry.get(&instr.name) else {
        // Unknown commands fail when they run.
        return Ok(());
    };
    let meta = cmd.meta();
    let fail = |message: String| CompileError::Validation { line: instr.line, message };
    let count = instr.args.len();
    if count < meta.min_args {
        return Err(fail(format!("Not enough arguments. Usage: {} {}", meta.name, meta.usage)));
    }
    if meta.max_args.is_some_and(|max| count > max) {
        return Err(fail(format!("Too many arguments. Usage: {} {}", meta.name, meta.usage)));
    }
    match (meta.block, instr.block.is_some()) {
        (BlockRule::Required, false) => {
            return Err(fail(format!("Command '{}' requires a {{ block }}!", meta.name)))
        }
        (BlockRule::Forbidden, true) => {
            return Err(fail(format!("Command '{}' does not take a block!", meta.name)))
        }
        _ => {}
    }
    if instr.wait_for && !meta.waitable {
        return Err(fail(format!("Command '{}' cannot be waited on with '&'.", meta.name)));
    }
    cmd.validate(instr).map_err(fail)
}

/// Parse script text into a validated, flat instruction list.
pub fn parse(src: &str, registry: &CommandRegistry) -> Result<Vec<Instruction>, CompileError> {
    let tokens = split_source(src);
    let mut pos = 0;
    let tree = build_level(&tokens, &mut pos, false)?;
    let mut out = Vec::new();
    flatten(tree, &mut out, registry)?;
    for instr in out.iter().filter(|i| !i.is_callback()) {
        validate(instr, registry)?;
    }
    Ok(out)
}

/// Copy the instructions in `range` out as a list of their own.  Block
/// ranges, callback owners and links are shifted to the new positions;
/// source lines are kept.
pub fn extract_block(instructions: &[Instruction], range: Range<usize>) -> Vec<Instruction> {
    let base = range.start;
    instructions[range]
        .iter()
        .map(|instr| {
            let mut instr = instr.clone();
            instr.block = instr.block.map(|b| b.start - base..b.end - base);
            instr.callback_of = instr.callback_of.map(|i| i - base);
            instr.link = instr.link.map(|i| i - base);
            instr
        })
        .collect()
}

/// Render the instructions in `range` back to source text.  Callback
/// entries are skipped; they are rebuilt when the text is parsed again.
pub fn render_range(instructions: &[Instruction], range: Range<usize>) -> String {
    let mut out = String::new();
    render_into(instructions, range, 0, &mut out);
    out
}

fn render_into(instructions: &[Instruction], range: Range<usize>, depth: usize, out: &mut String) {
    let mut i = range.start;
    while i < range.end {
        let instr = &instructions[i];
        if instr.is_callback() {
            i += 1;
            continue;
        }
        let indent = "    ".repeat(depth);
        out.push_str(&indent);
        out.push_str(&instr.render());
        match &instr.block {
            Some(block) => {
                out.push_str(" {\n");
                render_into(instructions, block.clone(), depth + 1, out);
                out.push_str(&indent);
                out.push_str("}\n");
                i = block.end;
            }
            None => {
                out.push_str(";\n");
                i += 1;
            }
        }
    }
}

// ── Headers ───────────────────────────────────────────────────────────────────

/// Leading `///key=value` header lines, with lower-case keys.
pub fn parse_headers(src: &str) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for line in src.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(rest) = line.strip_prefix("///") else {
            if line.starts_with("//") {
                continue;
            }
            break;
        };
        if let Some((key, value)) = rest.split_once('=') {
            headers.push((key.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
    }
    headers
}

// ── Tests ─────────────────────────────────────────────────────────────────────
