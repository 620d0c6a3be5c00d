//! Argument and tag-expression parser.
//!
//! An argument is a run of literal text and `<{ ... }>` tags:
//!
//! ```text
//! Hello <{dvar[player].to_upper||stranger}>!
//! ```
//!
//! Inside a tag, `.` separates sub-tag keys, `[...]` attaches a parameter to
//! a key (parameters are arguments themselves, so tags nest), and `||`
//! introduces the fallback used when the chain yields `null`.  Brackets and
//! tag delimiters must balance; a mismatch is an error, never a literal.

use std::fmt;

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Tag(TagExpr),
}

/// One command argument.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Argument {
    pub segments: Vec<Segment>,
    /// The argument was written inside quotes.
    pub quoted: bool,
}

/// A dot-chained tag, the part between `<{` and `}>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TagExpr {
    pub parts: Vec<TagPart>,
    pub fallback: Option<Box<Argument>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagPart {
    pub key: String,
    pub param: Option<Argument>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

impl Argument {
    /// A plain literal argument.
    pub fn text(s: impl Into<String>) -> Self {
        Self { segments: vec![Segment::Text(s.into())], quoted: false }
    }

    /// Split raw argument text into literal and tag segments.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let chars: Vec<char> = raw.chars().collect();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] == '<' && chars.get(i + 1) == Some(&'{') {
                let close = find_tag_close(&chars, i + 2)
                    .ok_or_else(|| format!("Unterminated tag '<{{' in '{raw}'."))?;
                if !literal.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut literal)));
                }
                let inner: String = chars[i + 2..close].iter().collect();
                segments.push(Segment::Tag(TagExpr::parse(&inner)?));
                i = close + 2;
            } else {
                literal.push(chars[i]);
                i += 1;
            }
        }
        if !literal.is_empty() || segments.is_empty() {
            segments.push(Segment::Text(literal));
        }
        Ok(Self { segments, quoted: false })
    }

    /// The argument's text if it holds no tags.
    pub fn literal(&self) -> Option<String> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Tag(_) => return None,
            }
        }
        Some(out)
    }

    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    /// Every tag in this argument, outermost only.
    pub fn tags(&self) -> impl Iterator<Item = &TagExpr> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Tag(t) => Some(t),
            Segment::Text(_) => None,
        })
    }
}

/// Find the `}` of the `}>` closing a tag whose body starts at `start`.
fn find_tag_close(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut j = start;
    while j < chars.len() {
        if chars[j] == '<' && chars.get(j + 1) == Some(&'{') {
            depth += 1;
            j += 2;
        } else if chars[j] == '}' && chars.get(j + 1) == Some(&'>') {
            depth -= 1;
            if depth == 0 {
                return Some(j);
            }
            j += 2;
        } else {
            j += 1;
        }
    }
    None
}

impl TagExpr {
    /// Parse the body of a tag (without the `<{` `}>` delimiters).
    pub fn parse(inner: &str) -> Result<Self, String> {
        let chars: Vec<char> = inner.chars().collect();
        let mut raw_parts = Vec::new();
        let mut current = String::new();
        let mut brackets = 0i32;
        let mut tags = 0i32;
        let mut fallback = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            let top = brackets == 0 && tags == 0;
            match c {
                '<' if next == Some('{') => {
                    tags += 1;
                    current.push_str("<{");
                    i += 2;
                    continue;
                }
                '}' if next == Some('>') => {
                    tags -= 1;
                    current.push_str("}>");
                    i += 2;
                    continue;
                }
                '[' if tags == 0 => brackets += 1,
                ']' if tags == 0 => {
                    brackets -= 1;
                    if brackets < 0 {
                        return Err(format!("Unbalanced ']' in tag '{inner}'."));
                    }
                }
                '.' if top => {
                    raw_parts.push(std::mem::take(&mut current));
                    i += 1;
                    continue;
                }
                '|' if top && next == Some('|') => {
                    let rest: String = chars[i + 2..].iter().collect();
                    fallback = Some(Box::new(Argument::parse(&rest)?));
                    break;
                }
                _ => {}
            }
            current.push(c);
            i += 1;
        }
        if brackets != 0 {
            return Err(format!("Unbalanced '[' in tag '{inner}'."));
        }
        raw_parts.push(current);

        let parts = raw_parts
            .iter()
            .map(|p| TagPart::parse(p, inner))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { parts, fallback })
    }

    /// Tag body in source form, without delimiters.
    pub fn body(&self) -> String {
        let mut out = String::new();
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            out.push_str(&part.key);
            if let Some(param) = &part.param {
                out.push('[');
                out.push_str(&param.to_string());
                out.push(']');
            }
        }
        if let Some(fb) = &self.fallback {
            out.push_str("||");
            out.push_str(&fb.to_string());
        }
        out
    }
}

impl TagPart {
    fn parse(raw: &str, whole: &str) -> Result<Self, String> {
        let Some(open) = raw.find('[') else {
            return Ok(Self { key: raw.trim().to_owned(), param: None });
        };
        if !raw.ends_with(']') {
            return Err(format!("Unexpected text after ']' in tag '{whole}'."));
        }
        let key = raw[..open].trim().to_owned();
        let param = Argument::parse(&raw[open + 1..raw.len() - 1])?;
        Ok(Self { key, param: Some(param) })
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => f.write_str(t)?,
                Segment::Tag(tag) => write!(f, "{tag}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for TagExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{{{}}}>", self.body())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_of(raw: &str) -> TagExpr {
        let arg = Argument::parse(raw).unwrap();
        let tag = arg.tags().next().cloned().expect("one tag");
        tag
    }

    #[test]
    fn plain_text_is_literal() {
        let arg = Argument::parse("hello world").unwrap();
        assert_eq!(arg.literal().as_deref(), Some("hello world"));
    }

    #[test]
    fn empty_argument_has_one_empty_segment() {
        let arg = Argument::parse("").unwrap();
        assert_eq!(arg.literal().as_deref(), Some(""));
    }

    #[test]
    fn mixed_segments() {
        let arg = Argument::parse("a<{text[b]}>c").unwrap();
        assert_eq!(arg.segments.len(), 3);
        assert!(!arg.is_literal());
        assert_eq!(arg.to_string(), "a<{text[b]}>c");
    }

    #[test]
    fn dots_inside_params_do_not_split() {
        let tag = tag_of("<{number[3.5].add[1.25]}>");
        assert_eq!(tag.parts.len(), 2);
        assert_eq!(tag.parts[0].key, "number");
        assert_eq!(tag.parts[0].param.as_ref().unwrap().literal().as_deref(), Some("3.5"));
    }

    #[test]
    fn nested_tag_in_param() {
        let tag = tag_of("<{text[<{var[x].to_upper}>].length}>");
        assert_eq!(tag.parts.len(), 2);
        let param = tag.parts[0].param.as_ref().unwrap();
        assert_eq!(param.tags().next().unwrap().parts.len(), 2);
    }

    #[test]
    fn fallback_is_parsed() {
        let tag = tag_of("<{dvar[name]||<{text[nobody]}>}>");
        assert_eq!(tag.parts.len(), 1);
        let fb = tag.fallback.as_ref().unwrap();
        assert_eq!(fb.tags().count(), 1);
        assert_eq!(tag.body(), "dvar[name]||<{text[nobody]}>");
    }

    #[test]
    fn stray_dot_gives_empty_key() {
        let tag = tag_of("<{text[a]..to_upper}>");
        assert_eq!(tag.parts.len(), 3);
        assert_eq!(tag.parts[1].key, "");
    }

    #[test]
    fn unbalanced_brackets_are_errors() {
        assert!(Argument::parse("<{text[a}>").is_err());
        assert!(Argument::parse("<{text]a[}>").is_err());
        assert!(Argument::parse("<{text[a]").is_err());
        assert!(Argument::parse("<{text[a]x}>").is_err());
    }

    #[test]
    fn render_round_trips() {
        for src in ["x", "<{var[a]}>", "pre <{list[a|b].get[<{var[i]}>]||none}> post"] {
            let arg = Argument::parse(src).unwrap();
            assert_eq!(arg.to_string(), src);
            assert_eq!(Argument::parse(&arg.to_string()).unwrap(), arg);
        }
    }
}
