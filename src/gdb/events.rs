//! Session events
//!
//! Sessions report what happens to an injected [`EventSink`] instead of a
//! process-wide dispatcher.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gdb::types::{GdbServerResponse, RunningStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CommandQueued { session: Uuid, command: String },
    CommandWritten { session: Uuid, command: String },
    /// A pipeline command (or a whole group) completed
    Response {
        session: Uuid,
        response: GdbServerResponse,
    },
    /// Unsolicited `*` record; does not consume a pipeline slot
    Stopped { session: Uuid, status: RunningStatus },
    /// The session is over; every pending command has been rejected
    Aborted { session: Uuid, reason: String },
    /// Output with no consumer, such as `=` notifications or stray text
    Diagnostic { session: Uuid, message: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SessionEvent) {
        match event {
            SessionEvent::CommandQueued { session, command } => {
                debug!(%session, %command, "Command queued");
            }
            SessionEvent::CommandWritten { session, command } => {
                debug!(%session, %command, "Command written");
            }
            SessionEvent::Response { session, response } => {
                debug!(
                    %session,
                    command = %response.command,
                    is_done = response.status.is_done,
                    "Command completed"
                );
            }
            SessionEvent::Stopped { session, status } => {
                info!(%session, kind = %status.kind, reason = ?status.info.reason, "Target event");
            }
            SessionEvent::Aborted { session, reason } => {
                warn!(%session, %reason, "Session aborted");
            }
            SessionEvent::Diagnostic { session, message } => {
                debug!(%session, %message, "GDB output");
            }
        }
    }
}

/// Forwards events into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody listens any more.
        let _ = self.tx.send(event);
    }
}

/// Emits to every inner sink in order
pub struct FanoutSink(pub Vec<Box<dyn EventSink>>);

impl EventSink for FanoutSink {
    fn emit(&self, event: SessionEvent) {
        if let Some((last, rest)) = self.0.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
