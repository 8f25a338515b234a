//! Debugger Bridge Type Definitions

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Display name of the stop-wait marker.
pub const STOP_MARKER: &str = "###";

/// Value classification of a decoded expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Float,
    Array,
    CharArray,
    Object,
    Original,
}

/// A decoded `name = value` line.
///
/// `val` is JSON text for `Array`, `Object` and `CharArray`, a numeral for
/// `Integer` and `Float`, and the raw right-hand side for `Original`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expression {
    pub name: String,
    pub data_type: DataType,
    pub val: String,
}

impl Expression {
    pub fn new(name: impl Into<String>, data_type: DataType, val: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type,
            val: val.into(),
        }
    }
}

/// Declaration listed by `info variables`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesDefine {
    pub name: String,
    pub is_array: bool,
}

/// Function argument of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionArg {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Frame information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GdbFrame {
    pub addr: String,
    pub func: String,
    #[serde(default)]
    pub args: Vec<FunctionArg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullname: Option<String>,
    /// Source line, numeric text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Only set for explicit stack listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

/// Breakpoint as exchanged with the IDE
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseBreakPoint {
    pub source: String,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_condition: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Payload of an async `*` record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bkptno: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<GdbFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_or_list"
    )]
    pub stopped_threads: Option<String>,
}

/// Async stop/notify event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStatus {
    #[serde(rename = "type")]
    pub kind: String,
    pub info: RunningInfo,
}

#[cfg(test)]
impl RunningStatus {
    pub fn is_stopped(&self) -> bool {
        self.kind == "stopped"
    }
}

/// GDB reports `stopped-threads` either as `"all"` or as a list of ids.
fn string_or_list<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Threads {
        One(String),
        Many(Vec<String>),
    }

    Ok(Option::<Threads>::deserialize(deserializer)?.map(|t| match t {
        Threads::One(s) => s,
        Threads::Many(list) => list.join(","),
    }))
}

/// Command-level outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub is_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl ExecuteResult {
    pub fn done() -> Self {
        Self {
            is_done: true,
            msg: None,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            is_done: false,
            msg: Some(msg.into()),
        }
    }
}

/// Typed result carried by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseResult {
    Expressions(Vec<Expression>),
    Variables(Vec<VariablesDefine>),
    Frames(Vec<GdbFrame>),
    Breakpoint(BaseBreakPoint),
}

/// One assembled answer to one logical command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GdbServerResponse {
    pub command: String,
    pub status: ExecuteResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_status: Option<RunningStatus>,
}

impl GdbServerResponse {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            status: ExecuteResult::done(),
            result: None,
            running_status: None,
        }
    }

    pub fn failed(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            status: ExecuteResult::failed(msg),
            ..Self::new(command)
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done
    }
}

/// Result shape a command expects from its console output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Nothing beyond the exec status
    Status,
    /// `file`: success only with debugging symbols
    Symbols,
    Variables,
    Registers,
    Values,
    Stack,
    Breakpoint,
    Memory,
    /// Stop-wait marker: the `*stopped` record
    Stop,
}

/// Commands the bridge issues to the debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GdbCommand {
    File { path: String },
    TargetRemote { target: String },
    MonitorReset,
    MonitorHalt,
    Load,
    Undisplay,
    Break { location: String, condition: Option<String> },
    DeleteBreakpoints { id: u32 },
    Continue,
    Step,
    Next,
    InfoLocals,
    InfoVariables,
    InfoStack,
    InfoRegisters,
    Print { expression: String },
    SetVar { assignment: String },
    Examine { address: String },
    WaitForStop,
}

impl GdbCommand {
    /// Break at `"source":line`, optionally conditional
    pub fn break_at(source: &str, line: u32, condition: Option<&str>) -> Self {
        GdbCommand::Break {
            location: format!("\"{}\":{}", source, line),
            condition: condition.map(str::to_string),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GdbCommand::File { .. } => "file",
            GdbCommand::TargetRemote { .. } => "target remote",
            GdbCommand::MonitorReset => "monitor reset",
            GdbCommand::MonitorHalt => "monitor halt",
            GdbCommand::Load => "load",
            GdbCommand::Undisplay => "undisplay",
            GdbCommand::Break { .. } => "break",
            GdbCommand::DeleteBreakpoints { .. } => "delete breakpoints",
            GdbCommand::Continue => "continue",
            GdbCommand::Step => "step",
            GdbCommand::Next => "next",
            GdbCommand::InfoLocals => "info locals",
            GdbCommand::InfoVariables => "info variables",
            GdbCommand::InfoStack => "info stack",
            GdbCommand::InfoRegisters => "info registers",
            GdbCommand::Print { .. } => "print",
            GdbCommand::SetVar { .. } => "set var",
            GdbCommand::Examine { .. } => "x",
            GdbCommand::WaitForStop => STOP_MARKER,
        }
    }

    pub fn params(&self) -> String {
        match self {
            GdbCommand::File { path } => format!("\"{}\"", path.replace('\\', "\\\\")),
            GdbCommand::TargetRemote { target } => target.clone(),
            GdbCommand::Undisplay => "y".to_string(),
            GdbCommand::Break {
                location,
                condition: Some(cond),
            } => format!("{} if {}", location, cond),
            GdbCommand::Break { location, .. } => location.clone(),
            GdbCommand::DeleteBreakpoints { id } => id.to_string(),
            GdbCommand::Print { expression } => expression.clone(),
            GdbCommand::SetVar { assignment } => assignment.clone(),
            GdbCommand::Examine { address } => format!("/1xw {}", address),
            _ => String::new(),
        }
    }

    /// Text written to the debugger's stdin, newline included
    pub fn wire_text(&self) -> String {
        let params = self.params();
        if params.is_empty() {
            format!("{}\n", self.name())
        } else {
            format!("{} {}\n", self.name(), params)
        }
    }

    /// The stop-wait marker only occupies the queue, it is never written.
    pub fn is_written(&self) -> bool {
        !matches!(self, GdbCommand::WaitForStop)
    }

    /// Commands a stop marker is queued behind
    pub fn is_run_control(&self) -> bool {
        matches!(
            self,
            GdbCommand::Continue | GdbCommand::Step | GdbCommand::Next | GdbCommand::MonitorHalt
        )
    }

    pub fn shape(&self) -> ResultShape {
        match self {
            GdbCommand::File { .. } => ResultShape::Symbols,
            GdbCommand::InfoVariables => ResultShape::Variables,
            GdbCommand::InfoRegisters => ResultShape::Registers,
            GdbCommand::InfoLocals | GdbCommand::Print { .. } => ResultShape::Values,
            GdbCommand::InfoStack => ResultShape::Stack,
            GdbCommand::Break { .. } => ResultShape::Breakpoint,
            GdbCommand::Examine { .. } => ResultShape::Memory,
            GdbCommand::WaitForStop => ResultShape::Stop,
            GdbCommand::TargetRemote { .. }
            | GdbCommand::MonitorReset
            | GdbCommand::MonitorHalt
            | GdbCommand::Load
            | GdbCommand::Undisplay
            | GdbCommand::DeleteBreakpoints { .. }
            | GdbCommand::Continue
            | GdbCommand::Step
            | GdbCommand::Next
            | GdbCommand::SetVar { .. } => ResultShape::Status,
        }
    }

    /// Value-reading commands keep GDB's own string escapes intact.
    pub fn reads_values(&self) -> bool {
        self.shape() == ResultShape::Values
    }
}

impl fmt::Display for GdbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_text().trim_end())
    }
}

/// How `<repeats N times>` runs are decoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepeatPolicy {
    /// Expand into N literal copies
    #[default]
    Unfold,
    /// Keep `"<elem> <repeats N times>"` as a string element
    Annotate,
}

/// GDB configuration
#[derive(Debug, Clone)]
pub struct GdbConfig {
    pub gdb_path: String,
    pub gdb_args: Vec<String>,
    /// Output lines that end the session wherever they appear
    pub fatal_patterns: Vec<String>,
    pub repeat_policy: RepeatPolicy,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb_path: "arm-none-eabi-gdb".to_string(),
            gdb_args: vec!["--interpreter".to_string(), "mi".to_string()],
            fatal_patterns: vec![
                "Remote communication error".to_string(),
                "Remote connection closed".to_string(),
            ],
            repeat_policy: RepeatPolicy::default(),
        }
    }
}

/// Remote target configuration
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteTargetConfig {
    Tcp {
        host: String,
        port: u16,
    },
    /// Serial device path
    Serial { port: String },
}

impl RemoteTargetConfig {
    pub fn to_target_string(&self) -> String {
        match self {
            RemoteTargetConfig::Tcp { host, port } => format!("{}:{}", host, port),
            RemoteTargetConfig::Serial { port } => port.clone(),
        }
    }
}

impl Default for RemoteTargetConfig {
    fn default() -> Self {
        RemoteTargetConfig::Tcp {
            host: "localhost".to_string(),
            port: 2331,
        }
    }
}

impl std::str::FromStr for RemoteTargetConfig {
    type Err = String;

    /// `host:port` selects TCP, anything else is a serial device path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((host, port)) = s.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Ok(RemoteTargetConfig::Tcp {
                    host: host.to_string(),
                    port,
                });
            }
        }
        if s.is_empty() {
            return Err("empty remote target".to_string());
        }
        Ok(RemoteTargetConfig::Serial {
            port: s.to_string(),
        })
    }
}
