//! Debugger side: GDB/MI output parsing, command pipeline and session

pub mod assembler;
pub mod events;
pub mod line;
pub mod matcher;
pub mod parser;
pub mod pipeline;
pub mod session;
pub mod types;
pub mod value;

pub use events::{ChannelSink, EventSink, SessionEvent, TracingSink};
pub use session::DebugSession;
pub use types::*;
