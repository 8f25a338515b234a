//! GDB/MI Line Classifier
//!
//! Splits one line of debugger output into its record kind and payload.

use regex::Regex;
use std::sync::LazyLock;

use crate::gdb::types::GdbCommand;

static PROMPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\(gdb\)\s*$").unwrap());

/// Leading record marker of an output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `*` async exec record
    AsyncExec,
    /// `^` command result
    Result,
    /// `~` console stream
    Console,
    /// `&` log stream
    Log,
    /// `=` notification
    Notify,
    /// `@` target stream
    Target,
}

impl RecordKind {
    fn from_marker(c: char) -> Option<Self> {
        match c {
            '*' => Some(RecordKind::AsyncExec),
            '^' => Some(RecordKind::Result),
            '~' => Some(RecordKind::Console),
            '&' => Some(RecordKind::Log),
            '=' => Some(RecordKind::Notify),
            '@' => Some(RecordKind::Target),
            _ => None,
        }
    }

    pub fn is_stream(self) -> bool {
        matches!(self, RecordKind::Console | RecordKind::Log | RecordKind::Target)
    }
}

/// A classified record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub payload: String,
    /// Stream records: the quoted text ended with a newline escape
    pub ends_line: bool,
}

/// One classified output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `(gdb)`: all output of the in-flight command has been flushed
    Prompt,
    Record(Record),
    /// Text without a record marker
    Raw(String),
}

/// Escape handling for stream payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeMode {
    /// Only `\"` and `\\` are resolved; GDB's own string escapes survive
    Minimal,
    /// Newline, tab, quote, backslash and octal escapes are all resolved
    Full,
}

impl EscapeMode {
    pub fn for_command(command: Option<&GdbCommand>) -> Self {
        match command {
            Some(cmd) if cmd.reads_values() => EscapeMode::Minimal,
            _ => EscapeMode::Full,
        }
    }
}

pub fn is_prompt(line: &str) -> bool {
    PROMPT.is_match(line)
}

/// Classify a newline-stripped output line.
///
/// Malformed escapes never fail: a dangling backslash or unknown escape is
/// dropped and the rest of the line passes through.
pub fn classify(line: &str, mode: EscapeMode) -> Line {
    let line = line.trim_end_matches(['\r', '\n']);
    if is_prompt(line) {
        return Line::Prompt;
    }

    // Result and async records may carry a numeric token prefix.
    let body = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut chars = body.chars();
    let kind = match chars.next().and_then(RecordKind::from_marker) {
        Some(kind) => kind,
        None => return Line::Raw(line.to_string()),
    };
    let rest = chars.as_str();

    if !kind.is_stream() {
        return Line::Record(Record {
            kind,
            payload: rest.to_string(),
            ends_line: false,
        });
    }

    let quoted = rest
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .filter(|_| rest.len() >= 2);
    let (payload, ends_line) = match quoted {
        Some(inner) => {
            let (inner, ends_line) = strip_newline_escape(inner);
            (unescape(inner, mode), ends_line)
        }
        None => (rest.to_string(), true),
    };

    Line::Record(Record {
        kind,
        payload,
        ends_line,
    })
}

/// Drop a trailing `\n` escape; it is only an escape if the backslash run
/// before the `n` has odd length.
fn strip_newline_escape(s: &str) -> (&str, bool) {
    let Some(head) = s.strip_suffix("\\n") else {
        return (s, false);
    };
    let run = head.chars().rev().take_while(|&c| c == '\\').count();
    if run % 2 == 0 {
        (head, true)
    } else {
        (s, false)
    }
}

pub fn unescape(s: &str, mode: EscapeMode) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            break;
        };
        match (mode, next) {
            (_, '"') => result.push('"'),
            (_, '\\') => result.push('\\'),
            (EscapeMode::Minimal, other) => {
                result.push('\\');
                result.push(other);
            }
            (EscapeMode::Full, 'n') => result.push('\n'),
            (EscapeMode::Full, 't') => result.push('\t'),
            (EscapeMode::Full, 'r') => result.push('\r'),
            (EscapeMode::Full, '\'') => result.push('\''),
            (EscapeMode::Full, d @ '0'..='7') => {
                let mut code = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(v) => {
                            code = code * 8 + v;
                            chars.next();
                        }
                        None => break,
                    }
                }
                if let Some(ch) = char::from_u32(code) {
                    result.push(ch);
                }
            }
            (EscapeMode::Full, _) => {}
        }
    }

    result
}
