//! Command Pipeline
//!
//! FIFO of commands for a debugger with no request ids: at most one command
//! is in flight, and the head of the queue is the command every output line
//! belongs to.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::gdb::events::{EventSink, SessionEvent};
use crate::gdb::session::SessionError;
use crate::gdb::types::{GdbCommand, GdbServerResponse};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("command queue is empty")]
    EmptyQueue,
    #[error("command pipeline is closed")]
    Closed,
    #[error("debugger process terminated: {0}")]
    ProcessTerminated(#[source] io::Error),
}

/// Sink for command text, normally the debugger's stdin
#[async_trait]
pub trait CommandWriter: Send {
    async fn write_command(&mut self, text: &str) -> io::Result<()>;
}

#[async_trait]
impl<T> CommandWriter for T
where
    T: AsyncWrite + Unpin + Send,
{
    async fn write_command(&mut self, text: &str) -> io::Result<()> {
        self.write_all(text.as_bytes()).await?;
        self.flush().await
    }
}

pub type Reply = oneshot::Sender<Result<GdbServerResponse, SessionError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTag {
    Start,
    Running,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOption {
    pub group_name: String,
    pub tag: GroupTag,
}

/// Group position of the head entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Start,
    Running,
    End,
    Normal,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
}

#[derive(Debug)]
pub struct PendingCommand {
    pub command: GdbCommand,
    pub option: Option<CommandOption>,
    /// Taken when the response is dispatched; group members other than the
    /// first carry none.
    pub reply: Option<Reply>,
}

impl PendingCommand {
    pub fn new(command: GdbCommand, reply: Option<Reply>) -> Self {
        Self {
            command,
            option: None,
            reply,
        }
    }

    fn grouped(command: GdbCommand, group_name: &str, tag: GroupTag, reply: Option<Reply>) -> Self {
        Self {
            command,
            option: Some(CommandOption {
                group_name: group_name.to_string(),
                tag,
            }),
            reply,
        }
    }
}

pub struct CommandPipeline<W> {
    writer: W,
    queue: VecDeque<PendingCommand>,
    closed: bool,
    session: Uuid,
    sink: Arc<dyn EventSink>,
}

impl<W: CommandWriter> CommandPipeline<W> {
    pub fn new(writer: W, session: Uuid, sink: Arc<dyn EventSink>) -> Self {
        Self {
            writer,
            queue: VecDeque::new(),
            closed: false,
            session,
            sink,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> PipelineState {
        if self.queue.is_empty() {
            PipelineState::Idle
        } else {
            PipelineState::Running
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append a command; it is written at once if nothing is in flight.
    pub async fn enqueue(&mut self, entry: PendingCommand) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::Closed);
        }
        self.sink.emit(SessionEvent::CommandQueued {
            session: self.session,
            command: entry.command.to_string(),
        });

        let was_idle = self.queue.is_empty();
        self.queue.push_back(entry);
        if was_idle {
            self.write_head().await?;
        }
        Ok(())
    }

    /// Open a group; `reply` receives the aggregate response at the group end.
    pub async fn start_group(
        &mut self,
        group_name: &str,
        command: GdbCommand,
        reply: Option<Reply>,
    ) -> Result<(), PipelineError> {
        self.enqueue(PendingCommand::grouped(command, group_name, GroupTag::Start, reply))
            .await
    }

    pub async fn group_add(
        &mut self,
        group_name: &str,
        command: GdbCommand,
    ) -> Result<(), PipelineError> {
        self.enqueue(PendingCommand::grouped(command, group_name, GroupTag::Running, None))
            .await
    }

    pub async fn end_group(
        &mut self,
        group_name: &str,
        command: GdbCommand,
    ) -> Result<(), PipelineError> {
        self.enqueue(PendingCommand::grouped(command, group_name, GroupTag::End, None))
            .await
    }

    /// The in-flight command
    pub fn current_command(&self) -> Result<&GdbCommand, PipelineError> {
        self.queue
            .front()
            .map(|entry| &entry.command)
            .ok_or(PipelineError::EmptyQueue)
    }

    pub fn head_mut(&mut self) -> Option<&mut PendingCommand> {
        self.queue.front_mut()
    }

    pub fn group_status(&self) -> GroupStatus {
        match self.queue.front().and_then(|entry| entry.option.as_ref()) {
            Some(option) => match option.tag {
                GroupTag::Start => GroupStatus::Start,
                GroupTag::Running => GroupStatus::Running,
                GroupTag::End => GroupStatus::End,
            },
            None => GroupStatus::Normal,
        }
    }

    /// Drop the completed head and write the next command, if any.
    pub async fn notify_complete(&mut self) -> Result<(), PipelineError> {
        if self.queue.pop_front().is_none() {
            return Err(PipelineError::EmptyQueue);
        }
        if self.closed {
            return Err(PipelineError::Closed);
        }
        self.write_head().await
    }

    /// Close the pipeline and hand back everything still queued.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        self.closed = true;
        self.queue.drain(..).collect()
    }

    #[cfg(test)]
    pub fn writer(&self) -> &W {
        &self.writer
    }

    async fn write_head(&mut self) -> Result<(), PipelineError> {
        let Some(head) = self.queue.front() else {
            return Ok(());
        };
        // The stop marker holds the head until the next prompt.
        if !head.command.is_written() {
            return Ok(());
        }

        let text = head.command.wire_text();
        let command = head.command.to_string();
        self.writer
            .write_command(&text)
            .await
            .map_err(PipelineError::ProcessTerminated)?;
        self.sink.emit(SessionEvent::CommandWritten {
            session: self.session,
            command,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::events::TracingSink;
    use tokio_test::io::Builder;

    fn pipeline<W: CommandWriter>(writer: W) -> CommandPipeline<W> {
        CommandPipeline::new(writer, Uuid::new_v4(), Arc::new(TracingSink))
    }

    #[tokio::test]
    async fn test_fifo_writes() {
        let mock = Builder::new()
            .write(b"info locals\n")
            .write(b"info stack\n")
            .write(b"print x\n")
            .build();
        let mut pipeline = pipeline(mock);

        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.enqueue(PendingCommand::new(GdbCommand::InfoLocals, None)).await.unwrap();
        pipeline.enqueue(PendingCommand::new(GdbCommand::InfoStack, None)).await.unwrap();
        pipeline
            .enqueue(PendingCommand::new(GdbCommand::Print { expression: "x".into() }, None))
            .await
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert_eq!(pipeline.current_command().unwrap(), &GdbCommand::InfoLocals);

        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.current_command().unwrap(), &GdbCommand::InfoStack);
        pipeline.notify_complete().await.unwrap();
        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(matches!(pipeline.current_command(), Err(PipelineError::EmptyQueue)));
    }

    #[tokio::test]
    async fn test_fifo_writes_tracked_in_memory() {
        let mut pipeline = pipeline(Vec::<u8>::new());
        pipeline.enqueue(PendingCommand::new(GdbCommand::Load, None)).await.unwrap();
        pipeline.enqueue(PendingCommand::new(GdbCommand::Continue, None)).await.unwrap();
        assert_eq!(pipeline.writer().as_slice(), b"load\n");

        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.writer().as_slice(), b"load\ncontinue\n");
    }

    #[tokio::test]
    async fn test_stop_marker_is_not_written() {
        let mut pipeline = pipeline(Vec::<u8>::new());
        pipeline.enqueue(PendingCommand::new(GdbCommand::Step, None)).await.unwrap();
        pipeline.enqueue(PendingCommand::new(GdbCommand::WaitForStop, None)).await.unwrap();
        pipeline.enqueue(PendingCommand::new(GdbCommand::InfoStack, None)).await.unwrap();

        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.current_command().unwrap(), &GdbCommand::WaitForStop);
        assert_eq!(pipeline.writer().as_slice(), b"step\n");

        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.writer().as_slice(), b"step\ninfo stack\n");
    }

    #[tokio::test]
    async fn test_group_status() {
        let mut pipeline = pipeline(Vec::<u8>::new());
        pipeline
            .start_group("launch", GdbCommand::TargetRemote { target: "localhost:2331".into() }, None)
            .await
            .unwrap();
        pipeline.group_add("launch", GdbCommand::MonitorReset).await.unwrap();
        pipeline.group_add("launch", GdbCommand::Load).await.unwrap();
        pipeline.end_group("launch", GdbCommand::Undisplay).await.unwrap();
        pipeline.enqueue(PendingCommand::new(GdbCommand::InfoLocals, None)).await.unwrap();

        assert_eq!(pipeline.group_status(), GroupStatus::Start);
        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.group_status(), GroupStatus::Running);
        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.group_status(), GroupStatus::Running);
        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.group_status(), GroupStatus::End);
        pipeline.notify_complete().await.unwrap();
        assert_eq!(pipeline.group_status(), GroupStatus::Normal);
        assert_eq!(
            pipeline.writer().as_slice(),
            b"target remote localhost:2331\nmonitor reset\nload\nundisplay y\ninfo locals\n"
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_process_terminated() {
        let mock = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
            .build();
        let mut pipeline = pipeline(mock);
        let result = pipeline.enqueue(PendingCommand::new(GdbCommand::Continue, None)).await;
        assert!(matches!(result, Err(PipelineError::ProcessTerminated(_))));
    }

    #[tokio::test]
    async fn test_drain_closes() {
        let mut pipeline = pipeline(Vec::<u8>::new());
        let (tx, mut rx) = oneshot::channel();
        pipeline.enqueue(PendingCommand::new(GdbCommand::Continue, Some(tx))).await.unwrap();
        let drained = pipeline.drain();
        assert_eq!(drained.len(), 1);
        assert!(pipeline.is_closed());
        assert!(matches!(
            pipeline.enqueue(PendingCommand::new(GdbCommand::Load, None)).await,
            Err(PipelineError::Closed)
        ));
        drop(drained);
        assert!(rx.try_recv().is_err());
    }
}
