//! Console line matchers
//!
//! Regex matchers for the CLI text GDB prints for the non-MI commands the
//! bridge issues, plus the pre-pass that rebuilds `name = value` lines from
//! stream fragments.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::LazyLock;

use crate::gdb::line::{Record, RecordKind};
use crate::gdb::types::{
    BaseBreakPoint, DataType, Expression, FunctionArg, GdbFrame, VariablesDefine,
};

static BREAKPOINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Breakpoint (\d+) at (0x[0-9a-fA-F]+): file (.+), line (\d+)\.$").unwrap()
});

static STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^#(\d+)\s+(?:(0x[0-9a-fA-F]+)\s+in\s+)?([\w:~$.]+)\s*\((.*)\)\s+at\s+(.+):(\d+)\s*$",
    )
    .unwrap()
});

static REGISTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\s+(0x[0-9a-fA-F]+)").unwrap());

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\d+:\s*)?(?:[A-Za-z_]\w*\s+)+\**\s*([A-Za-z_]\w*)\s*(\[\d*\])?[^;]*;\s*$",
    )
    .unwrap()
});

static MEMORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(0x[0-9a-fA-F]+)(?:\s*<[^>]*>)?\s*:\s*(0x[0-9a-fA-F]+|-?\d+)").unwrap()
});

static NO_SYMBOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)no debugging symbols found").unwrap());

const DEFAULT_FRAME_ADDR: &str = "0x00000000";

/// Join stream fragments into text lines.
///
/// GDB may split one printed line over several stream records; a fragment
/// ends its line when it carried a trailing newline or when the stream kind
/// changes. A leading `&` record is GDB's echo of the command and is left out.
pub fn logical_lines(records: &[Record]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_kind: Option<RecordKind> = None;

    let mut streams = records.iter().filter(|r| r.kind.is_stream()).peekable();
    let _ = streams.next_if(|r| r.kind == RecordKind::Log);

    for record in streams {
        if current_kind.is_some_and(|kind| kind != record.kind) && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        current_kind = Some(record.kind);
        current.push_str(&record.payload);
        if record.ends_line {
            lines.push(std::mem::take(&mut current));
            current_kind = None;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    for line in &mut lines {
        // Full unescape can leave embedded newlines
        if line.contains('\n') {
            *line = line.replace(['\n', '\r'], " ");
        }
    }
    lines.retain(|l| !l.trim().is_empty());
    lines
}

/// Merge lines that continue an unbalanced aggregate and keep the ones that
/// look like `name = value`.
pub fn value_lines(lines: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let mut pending: Option<(String, i64)> = None;

    for line in lines {
        let (text, depth) = match pending.take() {
            Some((mut text, depth)) => {
                text.push(' ');
                text.push_str(line.trim());
                (text, depth + brace_delta(line))
            }
            None => (line.trim().to_string(), brace_delta(line)),
        };
        if depth > 0 {
            pending = Some((text, depth));
        } else {
            merged.push(text);
        }
    }
    if let Some((text, _)) = pending {
        merged.push(text);
    }

    merged.retain(|l| l.contains('='));
    merged
}

/// Net `{` minus `}` outside string and char literals
fn brace_delta(line: &str) -> i64 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut escape = false;
    for c in line.chars() {
        if escape {
            escape = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escape = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '{') => delta += 1,
            (None, '}') => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// `Breakpoint N at 0xADDR: file PATH, line N.`
pub fn breakpoint(lines: &[String]) -> Option<BaseBreakPoint> {
    lines.iter().find_map(|line| {
        let caps = BREAKPOINT.captures(line.trim())?;
        Some(BaseBreakPoint {
            source: caps[3].to_string(),
            verified: true,
            id: caps[1].parse().ok(),
            line_num: caps[4].parse().ok(),
            ..Default::default()
        })
    })
}

/// `#N  [0xADDR in] FUNC (ARGS) at FILE:LINE`; frames without source are skipped
pub fn stack(lines: &[String]) -> Vec<GdbFrame> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = STACK_FRAME.captures(line.trim())?;
            Some(GdbFrame {
                addr: caps
                    .get(2)
                    .map_or(DEFAULT_FRAME_ADDR, |m| m.as_str())
                    .to_string(),
                func: caps[3].to_string(),
                args: frame_args(&caps[4]),
                file: Some(caps[5].to_string()),
                fullname: None,
                line: Some(caps[6].to_string()),
                arch: None,
                id: caps[1].parse().ok(),
            })
        })
        .collect()
}

fn frame_args(text: &str) -> Vec<FunctionArg> {
    text.split(", ")
        .filter_map(|arg| {
            let (name, value) = arg.split_once('=')?;
            Some(FunctionArg {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// `name  0xHEX  natural`
pub fn registers(lines: &[String]) -> Vec<Expression> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = REGISTER.captures(line.trim())?;
            Some(Expression::new(&caps[1], DataType::Integer, &caps[2]))
        })
        .collect()
}

/// C declarations ending in `;`, as listed by `info variables`
pub fn variables(lines: &[String]) -> Vec<VariablesDefine> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = DECLARATION.captures(line)?;
            Some(VariablesDefine {
                name: caps[1].to_string(),
                is_array: caps.get(2).is_some(),
            })
        })
        .collect()
}

/// `0xADDR <sym>: 0xVALUE` from `x /1xw`
pub fn memory(lines: &[String]) -> Result<Expression> {
    lines
        .iter()
        .find_map(|line| MEMORY.captures(line))
        .map(|caps| Expression::new("result", DataType::Integer, &caps[2]))
        .ok_or_else(|| anyhow!("No memory dump line in: {}", lines.join(" ; ")))
}

pub fn has_no_symbols(lines: &[String]) -> bool {
    lines.iter().any(|line| NO_SYMBOLS.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: RecordKind, payload: &str, ends_line: bool) -> Record {
        Record {
            kind,
            payload: payload.to_string(),
            ends_line,
        }
    }

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_logical_lines_join_fragments() {
        let records = vec![
            record(RecordKind::Log, "print buf", true),
            record(RecordKind::Console, "$1 = ", false),
            record(RecordKind::Console, "{1, 2}", false),
            record(RecordKind::Console, "", true),
            record(RecordKind::Result, "done", false),
        ];
        assert_eq!(logical_lines(&records), lines(&["$1 = {1, 2}"]));
    }

    #[test]
    fn test_logical_lines_drop_echo_only() {
        let records = vec![
            record(RecordKind::Notify, "breakpoint-modified", false),
            record(RecordKind::Log, "print a == b", true),
            record(RecordKind::Console, "$1 = 0", true),
            record(RecordKind::Log, "warning: stale frame", true),
        ];
        let text = logical_lines(&records);
        assert_eq!(text, lines(&["$1 = 0", "warning: stale frame"]));
        assert_eq!(value_lines(&text), lines(&["$1 = 0"]));
    }

    #[test]
    fn test_logical_lines_kind_change_splits() {
        let records = vec![
            record(RecordKind::Console, "partial", false),
            record(RecordKind::Log, "warning: x", true),
        ];
        assert_eq!(logical_lines(&records), lines(&["partial", "warning: x"]));
    }

    #[test]
    fn test_value_lines_merge_continuations() {
        let input = lines(&["print cfg", "$1 = {a = 1,", "  b = {2, 3}}", "No symbol table."]);
        assert_eq!(value_lines(&input), lines(&["$1 = {a = 1, b = {2, 3}}"]));
    }

    #[test]
    fn test_value_lines_ignore_braces_in_strings() {
        let input = lines(&[r#"s = "{{""#, "c = 123 '{'"]);
        assert_eq!(value_lines(&input), input);
    }

    #[test]
    fn test_breakpoint() {
        let bp = breakpoint(&lines(&[
            "break \"main.c\":42",
            "Breakpoint 3 at 0x08000120: file main.c, line 42.",
        ]))
        .unwrap();
        assert_eq!(bp.id, Some(3));
        assert_eq!(bp.source, "main.c");
        assert_eq!(bp.line_num, Some(42));
        assert!(bp.verified);
        assert!(breakpoint(&lines(&["No source file named foo.c."])).is_none());
    }

    #[test]
    fn test_stack() {
        let frames = stack(&lines(&[
            "#0  delay (ms=10) at src/delay.c:8",
            "#1  0x08000242 in main () at src/main.c:27",
            "#2  0x08000100 in ?? ()",
        ]));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].addr, DEFAULT_FRAME_ADDR);
        assert_eq!(frames[0].func, "delay");
        assert_eq!(frames[0].args[0].name, "ms");
        assert_eq!(frames[0].args[0].value, "10");
        assert_eq!(frames[0].id, Some(0));
        assert_eq!(frames[1].addr, "0x08000242");
        assert_eq!(frames[1].file.as_deref(), Some("src/main.c"));
        assert_eq!(frames[1].line.as_deref(), Some("27"));
    }

    #[test]
    fn test_registers() {
        let regs = registers(&lines(&[
            "r0             0x20000400          536871936",
            "pc             0x8000150           0x8000150 <main+4>",
            "xpsr           0x61000000          1627389952",
        ]));
        assert_eq!(regs.len(), 3);
        assert_eq!(regs[1].name, "pc");
        assert_eq!(regs[1].val, "0x8000150");
        assert!(regs.iter().all(|r| r.data_type == DataType::Integer));
    }

    #[test]
    fn test_variables() {
        let vars = variables(&lines(&[
            "All defined variables:",
            "File src/main.c:",
            "12:\tint counter;",
            "5:\tstatic uint8_t rx_buf[64];",
            "7:\tconst char *banner;",
            "Non-debugging symbols:",
            "0x20000000  __data_start",
        ]));
        assert_eq!(
            vars,
            vec![
                VariablesDefine { name: "counter".into(), is_array: false },
                VariablesDefine { name: "rx_buf".into(), is_array: true },
                VariablesDefine { name: "banner".into(), is_array: false },
            ]
        );
    }

    #[test]
    fn test_memory() {
        let e = memory(&lines(&["x /1xw 0x20000000", "0x20000000 <counter>:\t0x0000002a"])).unwrap();
        assert_eq!(e, Expression::new("result", DataType::Integer, "0x0000002a"));
        assert!(memory(&lines(&["Cannot access memory at address 0x0"])).is_err());
    }

    #[test]
    fn test_no_symbols() {
        assert!(has_no_symbols(&lines(&["(No debugging symbols found in app.elf)"])));
        assert!(!has_no_symbols(&lines(&["Reading symbols from app.elf..."])));
    }
}
