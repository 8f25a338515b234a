//! Expression Decoder
//!
//! Recursive-descent parser over GDB's printed value grammar:
//!
//! ```text
//! value     := aggregate | text | number | pointer | angle | bare
//! aggregate := '{' [ element { ',' element } [ '...' ] ] '}'
//! element   := [ key '=' ] value [ '<repeats' N 'times>' ]
//! text      := ( string | char [ repeats ] ) { ',' ( char | string ) }
//! pointer   := [ '(' type ')' | '{' type '}' ] hex [ angle ] [ text ]
//! ```
//!
//! Braces are ambiguous in GDB output: `{a = 1}` is a struct and `{1, 2}` is
//! an array. An aggregate is an object when every element carries a key and
//! an array when none does.

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;

use crate::gdb::types::{DataType, Expression, RepeatPolicy};

/// Upper bound on elements produced by unfolding `<repeats N times>` in one value.
pub const MAX_REPEAT_UNFOLD: usize = 65_536;

const OPTIMIZED_OUT: &str = "<optimized out>";

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?(?:0[xX][0-9a-fA-F]+|\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").unwrap()
});
static REPEATS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<repeats (\d+) times>").unwrap());
static IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*").unwrap());

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Int(String),
    Float(String),
    /// Address printed on its own or in front of a symbol
    Pointer(String),
    /// Decoded bytes of a string or char run
    Bytes(Vec<u8>),
    /// Enumerators, `<...>` placeholders and anything else left verbatim
    Text(String),
    List(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    fn into_json(self) -> Value {
        match self {
            Node::Int(text) => text
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| text.parse::<u64>().map(Value::from))
                .unwrap_or(Value::String(text)),
            Node::Float(text) => text
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(text)),
            Node::Bytes(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            Node::Pointer(text) | Node::Text(text) => Value::String(text),
            Node::List(items) => Value::Array(items.into_iter().map(Node::into_json).collect()),
            Node::Map(entries) => {
                let mut map = Map::new();
                for (key, node) in entries {
                    map.insert(key, node.into_json());
                }
                Value::Object(map)
            }
        }
    }
}

/// Decode one `name = value` line.
///
/// Values that do not fit the grammar come back as `original` with the raw
/// right-hand side; only a line without `=` is an error.
pub fn decode_expression(line: &str, policy: RepeatPolicy) -> Result<Expression> {
    let (name, rhs) = line
        .split_once('=')
        .ok_or_else(|| anyhow!("Not an expression line: {}", line))?;
    let name = name.trim();
    let rhs = rhs.trim();

    if rhs.starts_with(OPTIMIZED_OUT) {
        return Ok(Expression::new(
            format!("{} {}", name, OPTIMIZED_OUT),
            DataType::Original,
            "null",
        ));
    }

    match decode_value(rhs, policy) {
        Ok((data_type, val)) => Ok(Expression::new(name, data_type, val)),
        Err(_) => Ok(Expression::new(
            format!("{} <original>", name),
            DataType::Original,
            rhs,
        )),
    }
}

/// Decode a complete right-hand side into its data type and `val` text.
pub fn decode_value(text: &str, policy: RepeatPolicy) -> Result<(DataType, String)> {
    let mut parser = ValueParser::new(text, policy);
    let node = parser.parse_value()?;
    parser.skip_ws();
    parser.eat("...");
    parser.skip_ws();
    if !parser.at_end() {
        bail!("Unexpected trailing text: {}", parser.rest());
    }

    match node {
        Node::Int(text) | Node::Pointer(text) => Ok((DataType::Integer, text)),
        Node::Float(text) => Ok((DataType::Float, text)),
        Node::Bytes(bytes) => Ok((DataType::CharArray, serde_json::to_string(&bytes)?)),
        node @ Node::List(_) => Ok((DataType::Array, node.into_json().to_string())),
        node @ Node::Map(_) => Ok((DataType::Object, node.into_json().to_string())),
        Node::Text(text) => bail!("Unrecognized value: {}", text),
    }
}

struct ValueParser<'a> {
    src: &'a str,
    pos: usize,
    policy: RepeatPolicy,
    unfolded: usize,
}

impl<'a> ValueParser<'a> {
    fn new(src: &'a str, policy: RepeatPolicy) -> Self {
        Self {
            src,
            pos: 0,
            policy,
            unfolded: 0,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Result<Node> {
        self.skip_ws();
        match self.peek() {
            Some('{') => {
                if let Some(end) = self.function_type_end() {
                    self.pos = end;
                    return self.parse_value();
                }
                self.parse_aggregate()
            }
            Some('(') => {
                let end = self.closing(self.pos, '(', ')')?;
                let is_cast = self.src[end..]
                    .trim_start()
                    .starts_with(|c: char| c == '-' || c.is_ascii_digit() || "\"'{(".contains(c));
                if !is_cast {
                    // Flag enums print as `(A | B)`
                    let text = self.src[self.pos..end].to_string();
                    self.pos = end;
                    return Ok(Node::Text(text));
                }
                self.pos = end;
                self.parse_value()
            }
            Some('"' | '\'') => self.parse_text(),
            Some('<') => Ok(Node::Text(self.take_angle()?)),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            Some(_) => self.take_bare(),
            None => bail!("Unexpected end of value"),
        }
    }

    /// `{type} 0x...` prefixes function pointers; returns the position after
    /// the braces when they are followed by an address.
    fn function_type_end(&self) -> Option<usize> {
        let end = self.closing(self.pos, '{', '}').ok()?;
        self.src[end..].trim_start().starts_with("0x").then_some(end)
    }

    /// Position just past the bracket that closes the one at `start`.
    fn closing(&self, start: usize, open: char, close: char) -> Result<usize> {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escape = false;
        for (i, c) in self.src[start..].char_indices() {
            if escape {
                escape = false;
                continue;
            }
            match c {
                '\\' => escape = true,
                '"' => in_string = !in_string,
                c if c == open && !in_string => depth += 1,
                c if c == close && !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(start + i + c.len_utf8());
                    }
                }
                _ => {}
            }
        }
        bail!("Unbalanced '{}'", open)
    }

    fn parse_aggregate(&mut self) -> Result<Node> {
        if !self.eat("{") {
            bail!("Aggregate must start with '{{'");
        }
        let mut items: Vec<(Option<String>, Node)> = Vec::new();

        loop {
            self.skip_ws();
            if self.eat("}") {
                break;
            }
            if self.eat("...") {
                self.skip_ws();
                if self.eat("}") {
                    break;
                }
                bail!("Elision must close the aggregate");
            }

            let key = self.try_key();
            self.skip_ws();
            let elem_start = self.pos;
            let node = self.parse_value()?;
            let elem_text = self.src[elem_start..self.pos].trim().to_string();

            match self.repeat_count()? {
                Some(n) => match self.policy {
                    RepeatPolicy::Unfold => {
                        self.charge(n)?;
                        items.extend(std::iter::repeat((key, node)).take(n));
                    }
                    RepeatPolicy::Annotate => items.push((
                        key,
                        Node::Text(format!("{} <repeats {} times>", elem_text, n)),
                    )),
                },
                None => items.push((key, node)),
            }

            self.skip_ws();
            self.eat("...");
            self.skip_ws();
            if self.eat(",") {
                continue;
            }
            if self.eat("}") {
                break;
            }
            bail!("Expected ',' or '}}' at: {}", self.rest());
        }

        if items.iter().all(|(key, _)| key.is_some()) && !items.is_empty() {
            Ok(Node::Map(
                items
                    .into_iter()
                    .filter_map(|(key, node)| key.map(|k| (k, node)))
                    .collect(),
            ))
        } else if items.iter().all(|(key, _)| key.is_none()) {
            Ok(Node::List(items.into_iter().map(|(_, node)| node).collect()))
        } else {
            bail!("Aggregate mixes keyed and positional elements")
        }
    }

    /// Consume `key =` if present. Keys are identifiers, `<base>` names or
    /// `[index]` designators.
    fn try_key(&mut self) -> Option<String> {
        let save = self.pos;
        self.skip_ws();
        let key = match self.peek() {
            Some('<') => self.take_angle().ok(),
            Some('[') => {
                let end = self.closing(self.pos, '[', ']').ok()?;
                let key = self.src[self.pos..end].to_string();
                self.pos = end;
                Some(key)
            }
            _ => IDENT.find(self.rest()).map(|m| {
                self.pos += m.end();
                m.as_str().to_string()
            }),
        };

        if let Some(key) = key {
            self.skip_ws();
            if self.rest().starts_with('=') && !self.rest().starts_with("==") {
                self.pos += 1;
                return Some(key);
            }
        }
        self.pos = save;
        None
    }

    fn repeat_count(&mut self) -> Result<Option<usize>> {
        let save = self.pos;
        self.skip_ws();
        match REPEATS.captures(self.rest()) {
            Some(caps) => {
                let n = caps[1].parse::<usize>()?;
                self.pos += caps[0].len();
                Ok(Some(n))
            }
            None => {
                self.pos = save;
                Ok(None)
            }
        }
    }

    fn charge(&mut self, n: usize) -> Result<()> {
        self.unfolded = self.unfolded.saturating_add(n);
        if self.unfolded > MAX_REPEAT_UNFOLD {
            bail!("Repeat expansion exceeds {} elements", MAX_REPEAT_UNFOLD);
        }
        Ok(())
    }

    fn parse_number(&mut self) -> Result<Node> {
        let Some(m) = NUMBER.find(self.rest()) else {
            return self.take_bare();
        };
        let literal = m.as_str().to_string();
        self.pos += m.end();

        let is_hex = literal.trim_start_matches('-').starts_with("0x")
            || literal.trim_start_matches('-').starts_with("0X");
        let save = self.pos;
        self.skip_ws();

        // `65 'A'`: the number is the value, the char is display only
        if !is_hex && self.peek() == Some('\'') {
            self.parse_char()?;
            return Ok(Node::Int(literal));
        }

        if is_hex {
            if self.peek() == Some('<') {
                self.take_angle()?;
                let after_symbol = self.pos;
                self.skip_ws();
                if matches!(self.peek(), Some('"' | '\'')) {
                    return self.parse_text();
                }
                self.pos = after_symbol;
                return Ok(Node::Pointer(literal));
            }
            if matches!(self.peek(), Some('"' | '\'')) {
                return self.parse_text();
            }
            self.pos = save;
            return Ok(Node::Pointer(literal));
        }

        self.pos = save;
        if literal.contains(['.', 'e', 'E']) {
            Ok(Node::Float(literal))
        } else {
            Ok(Node::Int(literal))
        }
    }

    /// A run of string and repeated-char segments forming one char array,
    /// e.g. `"ab", '\000' <repeats 14 times>`.
    fn parse_text(&mut self) -> Result<Node> {
        let mut bytes = Vec::new();

        loop {
            let was_char = match self.peek() {
                Some('"') => {
                    self.parse_quoted(&mut bytes)?;
                    false
                }
                Some('\'') => {
                    let byte = self.parse_char()?;
                    let count = match self.repeat_count()? {
                        Some(n) => {
                            self.charge(n)?;
                            n
                        }
                        None => 1,
                    };
                    bytes.extend(std::iter::repeat(byte).take(count));
                    true
                }
                _ => bail!("Expected string at: {}", self.rest()),
            };
            self.eat("...");

            let save = self.pos;
            self.skip_ws();
            if self.eat(",") {
                self.skip_ws();
                match self.peek() {
                    Some('\'') => continue,
                    Some('"') if was_char => continue,
                    _ => {}
                }
            }
            self.pos = save;
            break;
        }

        Ok(Node::Bytes(bytes))
    }

    fn parse_quoted(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if !self.eat("\"") {
            bail!("String must start with '\"'");
        }
        loop {
            match self.peek() {
                Some('"') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some('\\') => {
                    self.pos += 1;
                    self.parse_escape(out)?;
                }
                Some(c) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    self.pos += c.len_utf8();
                }
                None => bail!("Unterminated string"),
            }
        }
    }

    fn parse_char(&mut self) -> Result<u8> {
        if !self.eat("'") {
            bail!("Char must start with '\\''");
        }
        let mut bytes = Vec::with_capacity(1);
        match self.peek() {
            Some('\\') => {
                self.pos += 1;
                self.parse_escape(&mut bytes)?;
            }
            Some(c) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                self.pos += c.len_utf8();
            }
            None => bail!("Unterminated char"),
        }
        if !self.eat("'") {
            bail!("Unterminated char");
        }
        bytes.first().copied().ok_or_else(|| anyhow!("Empty char"))
    }

    /// Decode the escape following a backslash into `out`.
    fn parse_escape(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let c = self.peek().ok_or_else(|| anyhow!("Dangling escape"))?;
        self.pos += c.len_utf8();
        let byte = match c {
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            'n' => b'\n',
            'r' => b'\r',
            't' => b'\t',
            'v' => 0x0b,
            'e' => 0x1b,
            '0'..='7' => {
                let mut code = c.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            code = code * 8 + d;
                            self.pos += 1;
                        }
                        None => break,
                    }
                }
                (code & 0xff) as u8
            }
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                return Ok(());
            }
        };
        out.push(byte);
        Ok(())
    }

    fn take_angle(&mut self) -> Result<String> {
        let end = self.closing(self.pos, '<', '>')?;
        let text = self.src[self.pos..end].to_string();
        self.pos = end;
        Ok(text)
    }

    /// Everything up to the next element boundary, verbatim.
    fn take_bare(&mut self) -> Result<Node> {
        let rest = self.rest();
        let end = rest.find([',', '}']).unwrap_or(rest.len());
        let text = rest[..end].trim_end();
        if text.is_empty() {
            bail!("Empty value at: {}", rest);
        }
        self.pos += end;
        Ok(Node::Text(text.to_string()))
    }
}
