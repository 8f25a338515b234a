//! Response Assembler
//!
//! Turns the records buffered between two prompts into one
//! `GdbServerResponse` for the command that produced them.

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use crate::gdb::line::{Record, RecordKind};
use crate::gdb::matcher;
use crate::gdb::parser::MiParser;
use crate::gdb::types::{
    ExecuteResult, GdbCommand, GdbServerResponse, RepeatPolicy, ResponseResult, ResultShape,
};
use crate::gdb::value;

pub struct ResponseAssembler {
    parser: MiParser,
    policy: RepeatPolicy,
}

impl ResponseAssembler {
    pub fn new(policy: RepeatPolicy) -> Self {
        Self {
            parser: MiParser::new(),
            policy,
        }
    }

    pub fn parser(&self) -> &MiParser {
        &self.parser
    }

    /// Assemble the response for `command`. Never fails: GDB errors and
    /// decode errors both end up as `status.isDone == false`.
    pub fn assemble(&self, command: &GdbCommand, records: &[Record]) -> GdbServerResponse {
        let mut response = GdbServerResponse::new(command.name());

        if let Some(result) = records.iter().rev().find(|r| r.kind == RecordKind::Result) {
            response.status = self.parser.parse_exec_status(&result.payload);
            if !response.status.is_done {
                debug!(command = %command, msg = ?response.status.msg, "Command failed");
                return response;
            }
        }

        if let Err(e) = self.decode(command, records, &mut response) {
            warn!(command = %command, error = %e, "Failed to decode response");
            response.status = ExecuteResult::failed(e.to_string());
            response.result = None;
            response.running_status = None;
        }

        response
    }

    fn decode(
        &self,
        command: &GdbCommand,
        records: &[Record],
        response: &mut GdbServerResponse,
    ) -> Result<()> {
        let lines = matcher::logical_lines(records);

        match command.shape() {
            ResultShape::Status => {
                debug!(command = %command, lines = lines.len(), "No result expected");
            }
            ResultShape::Symbols => {
                if matcher::has_no_symbols(&lines) {
                    response.status = ExecuteResult::failed("No debugging symbols found");
                }
            }
            ResultShape::Variables => {
                response.result = Some(ResponseResult::Variables(matcher::variables(&lines)));
            }
            ResultShape::Registers => {
                response.result = Some(ResponseResult::Expressions(matcher::registers(&lines)));
            }
            ResultShape::Values => {
                let expressions = matcher::value_lines(&lines)
                    .iter()
                    .map(|line| value::decode_expression(line, self.policy))
                    .collect::<Result<Vec<_>>>()?;
                response.result = Some(ResponseResult::Expressions(expressions));
            }
            ResultShape::Stack => {
                response.result = Some(ResponseResult::Frames(matcher::stack(&lines)));
            }
            ResultShape::Breakpoint => {
                let mut bp = matcher::breakpoint(&lines).ok_or_else(|| {
                    if lines.is_empty() {
                        anyhow!("Breakpoint not set")
                    } else {
                        anyhow!("{}", lines.join(" ; "))
                    }
                })?;
                if let GdbCommand::Break { condition, .. } = command {
                    bp.is_condition = Some(condition.is_some());
                    bp.condition = condition.clone();
                }
                response.result = Some(ResponseResult::Breakpoint(bp));
            }
            ResultShape::Memory => {
                let expression = matcher::memory(&lines)?;
                response.result = Some(ResponseResult::Expressions(vec![expression]));
            }
            ResultShape::Stop => {
                let asyncs = || records.iter().rev().filter(|r| r.kind == RecordKind::AsyncExec);
                let record = asyncs()
                    .find(|r| r.payload.starts_with("stopped"))
                    .or_else(|| asyncs().next())
                    .ok_or_else(|| anyhow!("No stop record"))?;
                response.running_status = Some(self.parser.parse_running_status(&record.payload)?);
            }
        }

        Ok(())
    }
}
