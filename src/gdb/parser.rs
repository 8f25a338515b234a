//! GDB Machine Interface (MI) Parser
//!
//! Parses the payload of `^` result and `*` async records into structured
//! values. Keys have `-` replaced by `_` so they deserialize straight into
//! the bridge types.

use crate::gdb::types::{ExecuteResult, RunningStatus};
use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{Map, Value};

/// GDB/MI Parser
pub struct MiParser {
    // Record class with optional comma-separated results
    record_pattern: Regex,
}

impl MiParser {
    pub fn new() -> Self {
        Self {
            record_pattern: Regex::new(r"^([a-z][a-z-]*)(?:,(.*))?$").unwrap(),
        }
    }

    /// Split a record payload into its class and parsed results
    pub fn parse_record(&self, payload: &str) -> Result<(String, Map<String, Value>)> {
        let payload = payload.trim();
        let caps = self
            .record_pattern
            .captures(payload)
            .ok_or_else(|| anyhow!("Malformed MI record: {}", payload))?;
        let class = caps[1].to_string();
        let results = match caps.get(2) {
            Some(m) => self.parse_results(m.as_str())?,
            None => Map::new(),
        };
        Ok((class, results))
    }

    /// Parse an async record payload such as `stopped,reason="breakpoint-hit",...`
    pub fn parse_running_status(&self, payload: &str) -> Result<RunningStatus> {
        let (kind, results) = self.parse_record(payload)?;
        let info = serde_json::from_value(Value::Object(results))?;
        Ok(RunningStatus { kind, info })
    }

    /// Parse a result record payload. Everything except `error` counts as done.
    pub fn parse_exec_status(&self, payload: &str) -> ExecuteResult {
        let payload = payload.trim();
        let (class, rest) = payload.split_once(',').unwrap_or((payload, ""));
        if class != "error" {
            return ExecuteResult::done();
        }

        let msg = self
            .parse_results(rest)
            .ok()
            .and_then(|results| results.get("msg").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| {
                rest.strip_prefix("msg=")
                    .unwrap_or(rest)
                    .trim_matches('"')
                    .to_string()
            });
        ExecuteResult::failed(msg)
    }

    /// Parse results (variable=value pairs)
    pub fn parse_results(&self, input: &str) -> Result<Map<String, Value>> {
        let mut results = Map::new();
        let mut current = input.trim();

        while !current.is_empty() {
            let (key, value, remaining) = self.parse_result(current)?;
            results.insert(key, value);
            current = remaining.trim_start();
            current = match current.strip_prefix(',') {
                Some(rest) => rest.trim_start(),
                None if current.is_empty() => current,
                None => return Err(anyhow!("Expected ',' before: {}", current)),
            };
        }

        Ok(results)
    }

    /// Parse a single result (variable=value)
    fn parse_result<'a>(&self, input: &'a str) -> Result<(String, Value, &'a str)> {
        let eq_pos = input.find('=').ok_or_else(|| anyhow!("No '=' found"))?;
        let variable = input[..eq_pos].trim();
        if variable.is_empty()
            || !variable
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(anyhow!("Invalid variable name: {}", variable));
        }

        let (value, remaining) = self.parse_value(&input[eq_pos + 1..])?;
        Ok((variable.replace('-', "_"), value, remaining))
    }

    /// Parse a value (string, list, or tuple)
    fn parse_value<'a>(&self, input: &'a str) -> Result<(Value, &'a str)> {
        let input = input.trim_start();
        match input.chars().next() {
            Some('"') => {
                let (s, remaining) = self.parse_string(input)?;
                Ok((Value::String(s), remaining))
            }
            Some('{') => self.parse_tuple(input),
            Some('[') => self.parse_list(input),
            Some(c) => Err(anyhow!("Unexpected character '{}' in value", c)),
            None => Err(anyhow!("Missing value")),
        }
    }

    /// Parse a quoted C string. Octal escapes are raw bytes, so multi-byte
    /// characters come back as UTF-8.
    fn parse_string<'a>(&self, input: &'a str) -> Result<(String, &'a str)> {
        let body = input
            .strip_prefix('"')
            .ok_or_else(|| anyhow!("String must start with '\"'"))?;
        let bytes = body.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'"' => {
                    let s = String::from_utf8_lossy(&out).into_owned();
                    return Ok((s, &body[i + 1..]));
                }
                b'\\' => {
                    i += 1;
                    let Some(&c) = bytes.get(i) else {
                        break;
                    };
                    match c {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'0'..=b'7' => {
                            let mut code = u32::from(c - b'0');
                            let mut digits = 1;
                            while digits < 3 {
                                match bytes.get(i + 1) {
                                    Some(&d @ b'0'..=b'7') => {
                                        code = code * 8 + u32::from(d - b'0');
                                        i += 1;
                                        digits += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((code & 0xff) as u8);
                        }
                        other => out.push(other),
                    }
                    i += 1;
                }
                b => {
                    out.push(b);
                    i += 1;
                }
            }
        }

        Err(anyhow!("Unterminated string"))
    }

    /// Parse a list [...]. Elements may be bare values or `key=value` results;
    /// keys of result elements are dropped.
    fn parse_list<'a>(&self, input: &'a str) -> Result<(Value, &'a str)> {
        let mut current = input
            .strip_prefix('[')
            .ok_or_else(|| anyhow!("List must start with '['"))?
            .trim_start();
        let mut list = Vec::new();

        if let Some(remaining) = current.strip_prefix(']') {
            return Ok((Value::Array(list), remaining));
        }

        loop {
            let (value, remaining) = match current.chars().next() {
                Some('"' | '{' | '[') => self.parse_value(current)?,
                _ => {
                    let (_, value, remaining) = self.parse_result(current)?;
                    (value, remaining)
                }
            };
            list.push(value);

            let remaining = remaining.trim_start();
            if let Some(rest) = remaining.strip_prefix(',') {
                current = rest.trim_start();
            } else if let Some(rest) = remaining.strip_prefix(']') {
                return Ok((Value::Array(list), rest));
            } else {
                return Err(anyhow!("Unterminated list"));
            }
        }
    }

    /// Parse a tuple {...}
    fn parse_tuple<'a>(&self, input: &'a str) -> Result<(Value, &'a str)> {
        let mut current = input
            .strip_prefix('{')
            .ok_or_else(|| anyhow!("Tuple must start with '{{'"))?
            .trim_start();
        let mut tuple = Map::new();

        if let Some(remaining) = current.strip_prefix('}') {
            return Ok((Value::Object(tuple), remaining));
        }

        loop {
            let (key, value, remaining) = self.parse_result(current)?;
            tuple.insert(key, value);

            let remaining = remaining.trim_start();
            if let Some(rest) = remaining.strip_prefix(',') {
                current = rest.trim_start();
            } else if let Some(rest) = remaining.strip_prefix('}') {
                return Ok((Value::Object(tuple), rest));
            } else {
                return Err(anyhow!("Unterminated tuple"));
            }
        }
    }
}

impl Default for MiParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec_status_done() {
        let parser = MiParser::new();
        assert_eq!(parser.parse_exec_status("done"), ExecuteResult::done());
        assert_eq!(parser.parse_exec_status("running"), ExecuteResult::done());
        assert_eq!(parser.parse_exec_status("connected"), ExecuteResult::done());
    }

    #[test]
    fn test_parse_exec_status_error() {
        let parser = MiParser::new();
        let status =
            parser.parse_exec_status(r#"error,msg="No symbol \"foo\" in current context.""#);
        assert!(!status.is_done);
        assert_eq!(
            status.msg.as_deref(),
            Some("No symbol \"foo\" in current context.")
        );
    }

    #[test]
    fn test_parse_exec_status_octal_message() {
        let parser = MiParser::new();
        let status = parser.parse_exec_status(r#"error,msg="caf\303\251 \101""#);
        assert_eq!(status.msg.as_deref(), Some("café A"));
    }

    #[test]
    fn test_parse_stopped() {
        let parser = MiParser::new();
        let status = parser
            .parse_running_status(
                r#"stopped,reason="breakpoint-hit",disp="keep",bkptno="1",frame={addr="0x08000150",func="main",args=[{name="argc",value="1"}],file="main.c",fullname="/src/main.c",line="12",arch="armv7e-m"},thread-id="1",stopped-threads="all""#,
            )
            .unwrap();
        assert!(status.is_stopped());
        assert_eq!(status.info.reason.as_deref(), Some("breakpoint-hit"));
        assert_eq!(status.info.bkptno.as_deref(), Some("1"));
        assert_eq!(status.info.thread_id.as_deref(), Some("1"));
        assert_eq!(status.info.stopped_threads.as_deref(), Some("all"));
        let frame = status.info.frame.unwrap();
        assert_eq!(frame.func, "main");
        assert_eq!(frame.line.as_deref(), Some("12"));
        assert_eq!(frame.args[0].name, "argc");
        assert_eq!(frame.args[0].value, "1");
    }

    #[test]
    fn test_parse_signal_received() {
        let parser = MiParser::new();
        let status = parser
            .parse_running_status(
                r#"stopped,reason="signal-received",signal-name="SIGINT",signal-meaning="Interrupt",frame={addr="0x08000200",func="loop",args=[]},thread-id="1",stopped-threads=["1"]"#,
            )
            .unwrap();
        assert_eq!(status.info.signal_name.as_deref(), Some("SIGINT"));
        assert_eq!(status.info.stopped_threads.as_deref(), Some("1"));
        assert!(status.info.frame.unwrap().file.is_none());
    }

    #[test]
    fn test_parse_running() {
        let parser = MiParser::new();
        let status = parser.parse_running_status(r#"running,thread-id="all""#).unwrap();
        assert!(!status.is_stopped());
        assert_eq!(status.kind, "running");
    }

    #[test]
    fn test_parse_result_list() {
        let parser = MiParser::new();
        let results = parser
            .parse_results(r#"stack=[frame={level="0",func="a"},frame={level="1",func="b"}]"#)
            .unwrap();
        let stack = results["stack"].as_array().unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[1]["func"], "b");
    }

    #[test]
    fn test_parse_malformed() {
        let parser = MiParser::new();
        assert!(parser.parse_results(r#"msg="unterminated"#).is_err());
        assert!(parser.parse_results(r#"frame={addr="0x1""#).is_err());
        assert!(parser.parse_record("").is_err());
    }
}
