//! Debug Session Coordinator
//!
//! [`Coordinator`] turns the debugger's output lines into responses for the
//! pipeline head. [`DebugSession`] owns the debugger process and runs the
//! coordinator as a single actor task, so all queue and buffer mutation
//! happens on one path.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::gdb::assembler::ResponseAssembler;
use crate::gdb::events::{EventSink, SessionEvent};
use crate::gdb::line::{classify, EscapeMode, Line, Record, RecordKind};
use crate::gdb::pipeline::{
    CommandPipeline, CommandWriter, GroupStatus, PendingCommand, PipelineError, Reply,
};
use crate::gdb::types::{ExecuteResult, GdbCommand, GdbConfig, GdbServerResponse};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to start debugger: {0}")]
    Spawn(String),
    #[error("failed to write to debugger: {0}")]
    Write(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("debugger process exited")]
    ProcessExited,
    #[error("debug session closed")]
    Closed,
    #[error("timed out waiting for the debugger")]
    Timeout,
}

impl From<PipelineError> for SessionError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::ProcessTerminated(err) => SessionError::Write(err.to_string()),
            PipelineError::Closed | PipelineError::EmptyQueue => SessionError::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process spawned, first prompt not seen yet
    Starting,
    Ready,
    AwaitingResponse,
    Closed,
}

/// One aggregate response for a command group, delivered at the group end
#[derive(Debug)]
pub struct GroupAccumulator {
    name: String,
    status: ExecuteResult,
    reply: Option<Reply>,
}

impl GroupAccumulator {
    pub fn start(name: impl Into<String>, reply: Option<Reply>) -> Self {
        Self {
            name: name.into(),
            status: ExecuteResult::done(),
            reply,
        }
    }

    /// First failure sticks; the first non-empty message wins.
    pub fn absorb(&mut self, response: &GdbServerResponse) {
        self.status.is_done &= response.status.is_done;
        if self.status.msg.is_none() {
            self.status.msg = response
                .status
                .msg
                .clone()
                .filter(|msg| !msg.is_empty());
        }
    }

    pub fn finish(self) -> (GdbServerResponse, Option<Reply>) {
        let mut response = GdbServerResponse::new(self.name);
        response.status = self.status;
        (response, self.reply)
    }
}

pub struct Coordinator<W> {
    id: Uuid,
    state: SessionState,
    pipeline: CommandPipeline<W>,
    buffer: Vec<Record>,
    group: Option<GroupAccumulator>,
    assembler: ResponseAssembler,
    fatal_patterns: Vec<String>,
    sink: Arc<dyn EventSink>,
    connected: Option<oneshot::Sender<()>>,
}

impl<W: CommandWriter> Coordinator<W> {
    pub fn new(
        id: Uuid,
        writer: W,
        config: &GdbConfig,
        sink: Arc<dyn EventSink>,
        connected: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Starting,
            pipeline: CommandPipeline::new(writer, id, sink.clone()),
            buffer: Vec::new(),
            group: None,
            assembler: ResponseAssembler::new(config.repeat_policy),
            fatal_patterns: config.fatal_patterns.clone(),
            sink,
            connected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn pipeline(&self) -> &CommandPipeline<W> {
        &self.pipeline
    }

    pub async fn submit(&mut self, command: GdbCommand, reply: Reply) {
        if self.state == SessionState::Closed {
            let _ = reply.send(Err(SessionError::Closed));
            return;
        }
        let result = self
            .pipeline
            .enqueue(PendingCommand::new(command, Some(reply)))
            .await;
        self.after_enqueue(result);
    }

    /// Queue `commands` as one group; `reply` gets a single aggregate response.
    pub async fn submit_group(&mut self, name: &str, commands: Vec<GdbCommand>, reply: Reply) {
        if self.state == SessionState::Closed {
            let _ = reply.send(Err(SessionError::Closed));
            return;
        }

        let mut commands = commands.into_iter();
        let Some(first) = commands.next() else {
            let _ = reply.send(Ok(GdbServerResponse::new(name)));
            return;
        };
        let Some(last) = commands.next_back() else {
            return self.submit(first, reply).await;
        };

        let mut result = self.pipeline.start_group(name, first, Some(reply)).await;
        for command in commands {
            if result.is_err() {
                break;
            }
            result = self.pipeline.group_add(name, command).await;
        }
        if result.is_ok() {
            result = self.pipeline.end_group(name, last).await;
        }
        self.after_enqueue(result);
    }

    fn after_enqueue(&mut self, result: Result<(), PipelineError>) {
        match result {
            Ok(()) => {
                if self.state == SessionState::Ready {
                    self.state = SessionState::AwaitingResponse;
                }
            }
            Err(e) => self.abort(e.into()),
        }
    }

    /// Process one line of debugger stdout.
    pub async fn handle_line(&mut self, raw: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(pattern) = self.fatal_match(raw) {
            self.abort(SessionError::ConnectionLost(pattern));
            return;
        }

        let mode = EscapeMode::for_command(self.pipeline.current_command().ok());
        match classify(raw, mode) {
            Line::Prompt => self.on_prompt().await,
            Line::Record(record) => self.on_record(record),
            Line::Raw(text) => {
                self.sink.emit(SessionEvent::Diagnostic {
                    session: self.id,
                    message: text,
                });
            }
        }
    }

    /// Process one line of debugger stderr.
    pub fn handle_stderr(&mut self, raw: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(pattern) = self.fatal_match(raw) {
            self.abort(SessionError::ConnectionLost(pattern));
            return;
        }
        warn!(session = %self.id, line = %raw, "GDB stderr");
        self.sink.emit(SessionEvent::Diagnostic {
            session: self.id,
            message: raw.to_string(),
        });
    }

    fn fatal_match(&self, raw: &str) -> Option<String> {
        self.fatal_patterns
            .iter()
            .find(|pattern| raw.contains(pattern.as_str()))
            .cloned()
    }

    fn on_record(&mut self, record: Record) {
        match record.kind {
            RecordKind::AsyncExec => {
                match self.assembler.parser().parse_running_status(&record.payload) {
                    Ok(status) => self.sink.emit(SessionEvent::Stopped {
                        session: self.id,
                        status,
                    }),
                    Err(e) => debug!(session = %self.id, error = %e, "Unparsed async record"),
                }
            }
            RecordKind::Notify => self.sink.emit(SessionEvent::Diagnostic {
                session: self.id,
                message: format!("={}", record.payload),
            }),
            _ => {}
        }

        // Output with no command in flight belongs to nobody.
        if !self.pipeline.is_empty() && self.state != SessionState::Starting {
            self.buffer.push(record);
        }
    }

    async fn on_prompt(&mut self) {
        if self.state == SessionState::Starting {
            info!(session = %self.id, "Debugger ready");
            self.buffer.clear();
            if let Some(connected) = self.connected.take() {
                let _ = connected.send(());
            }
            self.state = if self.pipeline.is_empty() {
                SessionState::Ready
            } else {
                SessionState::AwaitingResponse
            };
            return;
        }

        let command = match self.pipeline.current_command() {
            Ok(command) => command.clone(),
            Err(_) => {
                self.buffer.clear();
                return;
            }
        };

        // Run control answers with a prompt of its own before the target
        // stops; the stop marker waits for the prompt after `*stopped`.
        if command == GdbCommand::WaitForStop && !self.has_stop_record() {
            trace!(session = %self.id, "Still waiting for the target to stop");
            return;
        }

        let records = std::mem::take(&mut self.buffer);
        let response = self.assembler.assemble(&command, &records);
        let marker = self.settle_marker(&command, &response, &records);
        let group_status = self.pipeline.group_status();
        let (reply, group_name) = match self.pipeline.head_mut() {
            Some(head) => (
                head.reply.take(),
                head.option.as_ref().map(|o| o.group_name.clone()),
            ),
            None => (None, None),
        };
        self.dispatch(group_status, group_name, response, reply);

        if let Err(e) = self.pipeline.notify_complete().await {
            self.abort(e.into());
            return;
        }
        if let Some(marker) = marker {
            if let Err(e) = self.complete_marker(marker).await {
                self.abort(e.into());
                return;
            }
        }
        self.state = if self.pipeline.is_empty() {
            SessionState::Ready
        } else {
            SessionState::AwaitingResponse
        };
    }

    fn has_stop_record(&self) -> bool {
        self.buffer.iter().any(is_stop_record)
    }

    /// Response for a stop marker that no `*stopped` record will answer: the
    /// run control failed, or it was a monitor halt, which the probe server
    /// acknowledges without a stop notification.
    fn settle_marker(
        &self,
        command: &GdbCommand,
        response: &GdbServerResponse,
        records: &[Record],
    ) -> Option<GdbServerResponse> {
        if !command.is_run_control() {
            return None;
        }
        let marker = GdbCommand::WaitForStop;
        if !response.is_done() {
            let msg = response
                .status
                .msg
                .clone()
                .unwrap_or_else(|| format!("{} failed", command.name()));
            return Some(GdbServerResponse::failed(marker.name(), msg));
        }
        if *command != GdbCommand::MonitorHalt {
            return None;
        }
        if records.iter().any(is_stop_record) {
            Some(self.assembler.assemble(&marker, records))
        } else {
            Some(GdbServerResponse::new(marker.name()))
        }
    }

    /// Answer the stop marker at the head, if there is one, and move on.
    async fn complete_marker(&mut self, response: GdbServerResponse) -> Result<(), PipelineError> {
        if self.pipeline.current_command().ok() != Some(&GdbCommand::WaitForStop) {
            return Ok(());
        }
        debug!(session = %self.id, status = ?response.status, "Stop marker settled without a stop");
        let reply = self.pipeline.head_mut().and_then(|head| head.reply.take());
        self.deliver(response, reply);
        self.pipeline.notify_complete().await
    }

    fn dispatch(
        &mut self,
        group_status: GroupStatus,
        group_name: Option<String>,
        response: GdbServerResponse,
        reply: Option<Reply>,
    ) {
        match group_status {
            GroupStatus::Normal => self.deliver(response, reply),
            GroupStatus::Start => {
                let mut group =
                    GroupAccumulator::start(group_name.unwrap_or_else(|| response.command.clone()), reply);
                group.absorb(&response);
                self.group = Some(group);
            }
            GroupStatus::Running => match self.group.as_mut() {
                Some(group) => group.absorb(&response),
                None => warn!(session = %self.id, command = %response.command, "Group member without group"),
            },
            GroupStatus::End => match self.group.take() {
                Some(mut group) => {
                    group.absorb(&response);
                    let (response, reply) = group.finish();
                    self.deliver(response, reply);
                }
                None => self.deliver(response, reply),
            },
        }
    }

    fn deliver(&self, response: GdbServerResponse, reply: Option<Reply>) {
        self.sink.emit(SessionEvent::Response {
            session: self.id,
            response: response.clone(),
        });
        if let Some(reply) = reply {
            let _ = reply.send(Ok(response));
        }
    }

    /// End the session: reject everything pending and stop writing.
    pub fn abort(&mut self, error: SessionError) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        error!(session = %self.id, error = %error, "Aborting debug session");

        for entry in self.pipeline.drain() {
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(error.clone()));
            }
        }
        if let Some(group) = self.group.take() {
            if let Some(reply) = group.reply {
                let _ = reply.send(Err(error.clone()));
            }
        }
        self.buffer.clear();
        self.connected = None;

        self.sink.emit(SessionEvent::Aborted {
            session: self.id,
            reason: error.to_string(),
        });
    }
}

fn is_stop_record(record: &Record) -> bool {
    record.kind == RecordKind::AsyncExec && record.payload.starts_with("stopped")
}

enum Request {
    Execute {
        command: GdbCommand,
        reply: Reply,
    },
    Group {
        name: String,
        commands: Vec<GdbCommand>,
        reply: Reply,
    },
    Shutdown,
}

/// Handle to a running debug session
#[derive(Debug, Clone)]
pub struct DebugSession {
    id: Uuid,
    tx: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Execute { command, .. } => write!(f, "Execute({})", command),
            Request::Group { name, .. } => write!(f, "Group({})", name),
            Request::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl DebugSession {
    /// Spawn the debugger and wait for its first prompt.
    pub async fn connect(
        config: &GdbConfig,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let (session, ready, _task) = Self::spawn(config, sink)?;
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(_)) => Err(SessionError::ProcessExited),
            Err(_) => {
                session.shutdown();
                Err(SessionError::Timeout)
            }
        }
    }

    /// Spawn the debugger process. The receiver resolves at the first prompt.
    pub fn spawn(
        config: &GdbConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<(Self, oneshot::Receiver<()>, JoinHandle<()>), SessionError> {
        info!("Starting GDB: {} {:?}", config.gdb_path, config.gdb_args);

        let mut child = Command::new(&config.gdb_path)
            .args(&config.gdb_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("debugger stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn("debugger stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let stderr_rx = stderr.map(|stderr| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
            rx
        });

        Ok(Self::start(
            stdin,
            BufReader::new(stdout),
            config,
            sink,
            stderr_rx,
            Some(child),
        ))
    }

    /// Run a session over arbitrary streams.
    pub fn start<W, R>(
        writer: W,
        reader: R,
        config: &GdbConfig,
        sink: Arc<dyn EventSink>,
        stderr: Option<mpsc::UnboundedReceiver<String>>,
        child: Option<Child>,
    ) -> (Self, oneshot::Receiver<()>, JoinHandle<()>)
    where
        W: CommandWriter + 'static,
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let coordinator = Coordinator::new(id, writer, config, sink, Some(connected_tx));

        let span = info_span!("session", id = %id);
        let task = tokio::spawn(run(coordinator, reader, rx, stderr, child).instrument(span));

        (Self { id, tx }, connected_rx, task)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a command. Queue order is fixed when this returns; the future
    /// resolves once with the command's response.
    pub fn submit(
        &self,
        command: GdbCommand,
    ) -> impl Future<Output = Result<GdbServerResponse, SessionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(Request::Execute { command, reply }).is_ok();
        async move {
            if !sent {
                return Err(SessionError::Closed);
            }
            rx.await.unwrap_or(Err(SessionError::Closed))
        }
    }

    /// Queue a command group answered by one aggregate response.
    pub fn submit_group(
        &self,
        name: &str,
        commands: Vec<GdbCommand>,
    ) -> impl Future<Output = Result<GdbServerResponse, SessionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Request::Group {
                name: name.to_string(),
                commands,
                reply,
            })
            .is_ok();
        async move {
            if !sent {
                return Err(SessionError::Closed);
            }
            rx.await.unwrap_or(Err(SessionError::Closed))
        }
    }

    /// Queue a command whose response is only observed through the event sink.
    pub fn post(&self, command: GdbCommand) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        drop(self.submit(command));
        Ok(())
    }

    pub fn post_group(&self, name: &str, commands: Vec<GdbCommand>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        drop(self.submit_group(name, commands));
        Ok(())
    }

    /// Kill the debugger and reject everything still pending.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown);
    }
}

async fn next_stderr(stderr: Option<&mut mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match stderr {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run<W, R>(
    mut coordinator: Coordinator<W>,
    reader: R,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut stderr: Option<mpsc::UnboundedReceiver<String>>,
    child: Option<Child>,
) where
    W: CommandWriter,
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stderr_open = stderr.is_some();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    trace!(line = %line, "GDB output");
                    coordinator.handle_line(&line).await;
                }
                Ok(None) => {
                    coordinator.abort(SessionError::ProcessExited);
                }
                Err(e) => {
                    coordinator.abort(SessionError::ConnectionLost(e.to_string()));
                }
            },
            request = requests.recv() => match request {
                Some(Request::Execute { command, reply }) => {
                    coordinator.submit(command, reply).await;
                }
                Some(Request::Group { name, commands, reply }) => {
                    coordinator.submit_group(&name, commands, reply).await;
                }
                Some(Request::Shutdown) | None => {
                    coordinator.abort(SessionError::Closed);
                }
            },
            line = next_stderr(stderr.as_mut()), if stderr_open => match line {
                Some(line) => coordinator.handle_stderr(&line),
                None => stderr_open = false,
            },
        }

        if coordinator.state() == SessionState::Closed {
            break;
        }
    }

    if let Some(mut child) = child {
        if let Err(e) = child.kill().await {
            debug!("Failed to kill GDB: {}", e);
        }
    }
    info!("Debug session ended");
}
