//! Bridge Server
//!
//! Serves one IDE connection: requests become debugger commands, and the
//! session's responses stream back in pipeline order.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::bridge::protocol::*;
use crate::gdb::events::FanoutSink;
use crate::gdb::{
    BaseBreakPoint, ChannelSink, DebugSession, EventSink, GdbCommand, GdbConfig,
    GdbServerResponse, RemoteTargetConfig, SessionEvent, TracingSink,
};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:1122";

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the IDE connects to
    pub listen: String,
    pub gdb: GdbConfig,
    /// Probe server the `launch` request connects GDB to
    pub remote: RemoteTargetConfig,
    /// Bound on the wait for GDB's first prompt
    pub startup_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            gdb: GdbConfig::default(),
            remote: RemoteTargetConfig::default(),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// What an IDE request asks of the debugger
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Start the debugger, then load the ELF file
    Init { elf_path: String },
    Queue(Vec<GdbCommand>),
    /// Commands answered by one aggregate response
    Group {
        name: &'static str,
        commands: Vec<GdbCommand>,
    },
    /// End the debug session, keeping the connection
    Stop,
}

/// Map a `Debug` request onto debugger commands.
pub fn plan_request(content: &DebugContent, remote: &RemoteTargetConfig) -> Result<Plan, Message> {
    let plan = match content.command.as_str() {
        "init" => Plan::Init {
            elf_path: required(content)?.to_string(),
        },
        "launch" => Plan::Group {
            name: "launch",
            commands: vec![
                GdbCommand::TargetRemote {
                    target: remote.to_target_string(),
                },
                GdbCommand::MonitorReset,
                GdbCommand::Load,
                GdbCommand::Undisplay,
            ],
        },
        "break" => {
            let bp = breakpoint(content)?;
            let line = bp.line_num.ok_or_else(|| {
                Message::warning(format!("Breakpoint in '{}' has no line number", bp.source))
            })?;
            let condition = match bp.is_condition {
                Some(true) => bp.condition.as_deref().filter(|c| !c.trim().is_empty()),
                _ => None,
            };
            Plan::Queue(vec![GdbCommand::break_at(&bp.source, line, condition)])
        }
        "break main" => Plan::Queue(vec![GdbCommand::Break {
            location: "main".to_string(),
            condition: None,
        }]),
        "delete breakpoints" => match breakpoint(content)?.id {
            Some(id) => Plan::Queue(vec![GdbCommand::DeleteBreakpoints { id }]),
            None => {
                debug!("Breakpoint was never set, nothing to delete");
                Plan::Queue(Vec::new())
            }
        },
        "pause" => Plan::Queue(vec![GdbCommand::MonitorHalt, GdbCommand::WaitForStop]),
        "continue" => Plan::Queue(vec![GdbCommand::Continue, GdbCommand::WaitForStop]),
        "step" => Plan::Queue(vec![GdbCommand::Step, GdbCommand::WaitForStop]),
        "step over" => Plan::Queue(vec![GdbCommand::Next, GdbCommand::WaitForStop]),
        "info locals" => Plan::Queue(vec![GdbCommand::InfoLocals]),
        "info variables" => Plan::Queue(vec![GdbCommand::InfoVariables]),
        "info stack" => Plan::Queue(vec![GdbCommand::InfoStack]),
        "info registers" => Plan::Queue(vec![GdbCommand::InfoRegisters]),
        "print" => Plan::Queue(vec![GdbCommand::Print {
            expression: required(content)?.to_string(),
        }]),
        "set" => Plan::Queue(vec![GdbCommand::SetVar {
            assignment: required(content)?.to_string(),
        }]),
        "x" => Plan::Queue(vec![GdbCommand::Examine {
            address: required(content)?.to_string(),
        }]),
        "stop" => Plan::Stop,
        other => return Err(Message::warning(format!("Unknown command '{}'", other))),
    };
    Ok(plan)
}

fn required(content: &DebugContent) -> Result<&str, Message> {
    let data = content.data.trim();
    if data.is_empty() {
        return Err(Message::warning(format!(
            "Command '{}' needs an argument",
            content.command
        )));
    }
    Ok(data)
}

fn breakpoint(content: &DebugContent) -> Result<BaseBreakPoint, Message> {
    serde_json::from_str(&content.data).map_err(|e| {
        Message::warning(format!(
            "Invalid breakpoint for '{}': {}",
            content.command, e
        ))
    })
}

/// Accept one IDE connection and serve it until either side ends it.
pub async fn serve(listener: TcpListener, config: BridgeConfig) -> Result<()> {
    let (stream, peer) = listener.accept().await?;
    // One IDE per bridge process.
    drop(listener);
    info!("IDE connected from {}", peer);

    BridgeServer::new(Arc::new(config)).run(stream).await
}

/// State of one IDE connection
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    session: Option<DebugSession>,
    channel: ChannelSink,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl BridgeServer {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        let (channel, events) = ChannelSink::new();
        Self {
            config,
            session: None,
            channel,
            events,
        }
    }

    /// Sink for a session whose events this connection forwards
    pub fn session_sink(&self) -> Arc<dyn EventSink> {
        Arc::new(FanoutSink(vec![
            Box::new(TracingSink),
            Box::new(self.channel.clone()),
        ]))
    }

    /// Make `session` the connection's debug session, ending any previous one.
    pub fn attach(&mut self, session: DebugSession) {
        self.end_session();
        info!(session = %session.id(), "Debug session attached");
        self.session = Some(session);
    }

    pub async fn run<T>(mut self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(io, SeparatorCodec::new());

        loop {
            let outgoing: Vec<TcpData> = tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(e)) => {
                        warn!("Connection error: {}", e);
                        break;
                    }
                    None => {
                        info!("IDE disconnected");
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event).into_iter().collect(),
            };

            let mut closing = false;
            for frame in outgoing {
                closing = frame.is_close();
                framed.send(frame).await?;
                if closing {
                    break;
                }
            }
            if closing {
                framed.close().await?;
                break;
            }
        }

        self.end_session();
        Ok(())
    }

    async fn handle_frame(&mut self, frame: TcpData) -> Vec<TcpData> {
        match frame.tag.as_str() {
            TAG_DEBUG => match frame.debug_content() {
                Ok(content) => self.handle_debug(content).await,
                Err(e) => {
                    warn!("Invalid debug request: {}", e);
                    Vec::new()
                }
            },
            other => {
                report(&Message::warning(format!("UnknownMsg : {}", other)));
                Vec::new()
            }
        }
    }

    async fn handle_debug(&mut self, content: DebugContent) -> Vec<TcpData> {
        debug!(command = %content.command, data = %content.data, "IDE request");

        let plan = match plan_request(&content, &self.config.remote) {
            Ok(plan) => plan,
            Err(message) => {
                report(&message);
                return Vec::new();
            }
        };

        match plan {
            Plan::Init { elf_path } => self.init(elf_path).await,
            Plan::Stop => {
                self.end_session();
                Vec::new()
            }
            Plan::Queue(commands) => {
                let Some(session) = self.session.as_ref() else {
                    return not_started(&content.command);
                };
                for command in commands {
                    if let Err(e) = session.post(command) {
                        return failed(&content.command, &e.to_string());
                    }
                }
                Vec::new()
            }
            Plan::Group { name, commands } => {
                let Some(session) = self.session.as_ref() else {
                    return not_started(name);
                };
                match session.post_group(name, commands) {
                    Ok(()) => Vec::new(),
                    Err(e) => failed(name, &e.to_string()),
                }
            }
        }
    }

    async fn init(&mut self, elf_path: String) -> Vec<TcpData> {
        self.end_session();

        let sink = self.session_sink();
        let session =
            match DebugSession::connect(&self.config.gdb, sink, self.config.startup_timeout).await {
                Ok(session) => session,
                Err(e) => {
                    error!("Failed to start GDB: {}", e);
                    let mut frames = failed("init", &e.to_string());
                    frames.extend(
                        TcpData::close(&Message::exception("SessionError", &e.to_string())).ok(),
                    );
                    return frames;
                }
            };

        let frames = encode(&GdbServerResponse::new("init"));
        if let Err(e) = session.post(GdbCommand::File { path: elf_path }) {
            warn!("Failed to queue file: {}", e);
        }
        self.attach(session);
        frames
    }

    /// Frame for a session event. Only the attached session is forwarded.
    fn on_event(&mut self, event: SessionEvent) -> Option<TcpData> {
        let current = self.session.as_ref().map(DebugSession::id)?;
        match event {
            SessionEvent::Response { session, response } if session == current => {
                encode(&response).pop()
            }
            SessionEvent::Aborted { session, reason } if session == current => {
                self.session = None;
                match TcpData::close(&Message::error(reason)) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        error!("Failed to encode close message: {}", e);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            info!(session = %session.id(), "Ending debug session");
            session.shutdown();
        }
    }
}

fn report(message: &Message) {
    match message.kind {
        MessageType::Error => error!("{}", message.content),
        MessageType::Warning => warn!("{}", message.content),
        MessageType::Info => info!("{}", message.content),
    }
}

fn encode(response: &GdbServerResponse) -> Vec<TcpData> {
    match TcpData::debug(response) {
        Ok(frame) => vec![frame],
        Err(e) => {
            error!(command = %response.command, "Failed to encode response: {}", e);
            Vec::new()
        }
    }
}

fn failed(command: &str, msg: &str) -> Vec<TcpData> {
    encode(&GdbServerResponse::failed(command, msg))
}

fn not_started(command: &str) -> Vec<TcpData> {
    failed(command, "GDB is not started")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::ResponseResult;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;

    fn plan_for(command: &str, data: &str) -> Result<Plan, Message> {
        plan_request(&DebugContent::new(command, data), &RemoteTargetConfig::default())
    }

    #[test]
    fn test_plan_run_control() {
        assert_eq!(
            plan_for("continue", "").unwrap(),
            Plan::Queue(vec![GdbCommand::Continue, GdbCommand::WaitForStop])
        );
        assert_eq!(
            plan_for("step over", "").unwrap(),
            Plan::Queue(vec![GdbCommand::Next, GdbCommand::WaitForStop])
        );
        assert_eq!(
            plan_for("pause", "").unwrap(),
            Plan::Queue(vec![GdbCommand::MonitorHalt, GdbCommand::WaitForStop])
        );
        assert_eq!(plan_for("stop", "").unwrap(), Plan::Stop);
    }

    #[test]
    fn test_plan_launch_group() {
        let remote: RemoteTargetConfig = "10.0.0.2:3333".parse().unwrap();
        let plan = plan_request(&DebugContent::new("launch", ""), &remote).unwrap();
        match plan {
            Plan::Group { name, commands } => {
                assert_eq!(name, "launch");
                let text: Vec<String> = commands.iter().map(ToString::to_string).collect();
                assert_eq!(
                    text,
                    vec!["target remote 10.0.0.2:3333", "monitor reset", "load", "undisplay y"]
                );
            }
            other => panic!("Expected group, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_breakpoints() {
        let plan = plan_for(
            "break",
            r#"{"source":"src/main.c","verified":false,"lineNum":42,"isCondition":true,"condition":"i > 2"}"#,
        )
        .unwrap();
        assert_eq!(
            plan,
            Plan::Queue(vec![GdbCommand::break_at("src/main.c", 42, Some("i > 2"))])
        );

        // A condition only counts when flagged.
        let plan = plan_request(
            &DebugContent::new(
                "break",
                r#"{"source":"main.c","verified":false,"lineNum":7,"isCondition":false,"condition":"x"}"#,
            ),
            &RemoteTargetConfig::default(),
        )
        .unwrap();
        assert_eq!(plan, Plan::Queue(vec![GdbCommand::break_at("main.c", 7, None)]));

        assert_eq!(
            plan_request(
                &DebugContent::new("delete breakpoints", r#"{"source":"main.c","verified":true,"id":4}"#),
                &RemoteTargetConfig::default(),
            )
            .unwrap(),
            Plan::Queue(vec![GdbCommand::DeleteBreakpoints { id: 4 }])
        );
        assert_eq!(
            plan_request(
                &DebugContent::new("delete breakpoints", r#"{"source":"main.c","verified":false}"#),
                &RemoteTargetConfig::default(),
            )
            .unwrap(),
            Plan::Queue(Vec::new())
        );
    }

    #[test]
    fn test_plan_rejects() {
        let err = plan_for("frobnicate", "").unwrap_err();
        assert_eq!(err.kind, MessageType::Warning);
        assert_eq!(err.content, "Unknown command 'frobnicate'");

        assert!(plan_for("print", "  ").is_err());
        assert!(plan_for("break", "not json").is_err());
        assert!(plan_for("break", r#"{"source":"main.c","verified":false}"#).is_err());
        assert_eq!(
            plan_for("x", "0x20000000").unwrap(),
            Plan::Queue(vec![GdbCommand::Examine {
                address: "0x20000000".into()
            }])
        );
        assert_eq!(
            plan_for("init", r"C:\fw\app.elf").unwrap(),
            Plan::Init {
                elf_path: r"C:\fw\app.elf".into()
            }
        );
    }

    struct Harness {
        ide: Framed<DuplexStream, SeparatorCodec>,
        gdb_in: tokio::io::Lines<BufReader<DuplexStream>>,
        gdb_out: DuplexStream,
        server: JoinHandle<Result<()>>,
    }

    /// A bridge with a session attached to a scripted debugger.
    async fn harness() -> Harness {
        let mut server = BridgeServer::new(Arc::new(BridgeConfig::default()));

        let (session_in, gdb_in) = duplex(4096);
        let (mut gdb_out, session_out) = duplex(4096);
        let (session, ready, _task) = DebugSession::start(
            session_in,
            BufReader::new(session_out),
            &GdbConfig::default(),
            server.session_sink(),
            None,
            None,
        );
        gdb_out.write_all(b"(gdb) \n").await.unwrap();
        ready.await.unwrap();
        server.attach(session);

        let (ide, bridge) = duplex(4096);
        let server = tokio::spawn(server.run(bridge));
        Harness {
            ide: Framed::new(ide, SeparatorCodec::new()),
            gdb_in: BufReader::new(gdb_in).lines(),
            gdb_out,
            server,
        }
    }

    async fn request(ide: &mut Framed<DuplexStream, SeparatorCodec>, command: &str, data: &str) {
        let frame = DebugContent::new(command, data).to_frame().unwrap();
        ide.send(frame).await.unwrap();
    }

    async fn read_response(ide: &mut Framed<DuplexStream, SeparatorCodec>) -> GdbServerResponse {
        let frame = ide.next().await.unwrap().unwrap();
        assert_eq!(frame.tag, TAG_DEBUG);
        serde_json::from_str(&frame.data).unwrap()
    }

    #[tokio::test]
    async fn test_request_response_over_wire() {
        let mut h = harness().await;

        // Unknown tags are ignored without a reply.
        h.ide.send(TcpData::new("Ping", "")).await.unwrap();
        request(&mut h.ide, "info stack", "").await;
        assert_eq!(h.gdb_in.next_line().await.unwrap().unwrap(), "info stack");
        h.gdb_out
            .write_all(b"~\"#0  main () at main.c:10\\n\"\n^done\n(gdb) \n")
            .await
            .unwrap();

        let response = read_response(&mut h.ide).await;
        assert_eq!(response.command, "info stack");
        assert!(response.is_done());
        match response.result {
            Some(ResponseResult::Frames(frames)) => {
                assert_eq!(frames[0].func, "main");
                assert_eq!(frames[0].line.as_deref(), Some("10"));
            }
            other => panic!("Expected frames, got {:?}", other),
        }

        drop(h.ide);
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_continue_then_stop_event() {
        let mut h = harness().await;

        request(&mut h.ide, "continue", "").await;
        assert_eq!(h.gdb_in.next_line().await.unwrap().unwrap(), "continue");
        h.gdb_out
            .write_all(b"^running\n*running,thread-id=\"all\"\n(gdb) \n")
            .await
            .unwrap();
        let response = read_response(&mut h.ide).await;
        assert_eq!(response.command, "continue");
        assert!(response.is_done());

        h.gdb_out
            .write_all(b"*stopped,reason=\"breakpoint-hit\",disp=\"keep\",bkptno=\"1\",frame={addr=\"0x08000150\",func=\"main\",args=[],file=\"main.c\",fullname=\"/w/main.c\",line=\"12\"},thread-id=\"1\",stopped-threads=\"all\"\n(gdb) \n")
            .await
            .unwrap();
        let response = read_response(&mut h.ide).await;
        assert_eq!(response.command, "###");
        let status = response.running_status.unwrap();
        assert_eq!(status.info.reason.as_deref(), Some("breakpoint-hit"));
        assert_eq!(status.info.bkptno.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_failed_continue_keeps_session_usable() {
        let mut h = harness().await;

        request(&mut h.ide, "continue", "").await;
        request(&mut h.ide, "info registers", "").await;
        assert_eq!(h.gdb_in.next_line().await.unwrap().unwrap(), "continue");
        h.gdb_out
            .write_all(b"&\"continue\\n\"\n^error,msg=\"The program is not being run.\"\n(gdb) \n")
            .await
            .unwrap();

        let response = read_response(&mut h.ide).await;
        assert_eq!(response.command, "continue");
        assert!(!response.is_done());
        let response = read_response(&mut h.ide).await;
        assert_eq!(response.command, "###");
        assert_eq!(response.status.msg.as_deref(), Some("The program is not being run."));

        assert_eq!(h.gdb_in.next_line().await.unwrap().unwrap(), "info registers");
        h.gdb_out
            .write_all(b"~\"pc             0x8000150           0x8000150 <main+4>\\n\"\n^done\n(gdb) \n")
            .await
            .unwrap();
        let response = read_response(&mut h.ide).await;
        assert_eq!(response.command, "info registers");
        assert!(response.is_done());
    }

    #[tokio::test]
    async fn test_fatal_output_closes_connection() {
        let mut h = harness().await;

        h.gdb_out
            .write_all(b"&\"Remote communication error.  Target disconnected.: Connection reset by peer.\\n\"\n")
            .await
            .unwrap();

        let frame = h.ide.next().await.unwrap().unwrap();
        assert!(frame.is_close());
        let message: Message = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(message.kind, MessageType::Error);
        assert!(message.content.contains("Remote communication error"));

        assert!(h.ide.next().await.is_none());
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_request_without_session() {
        let server = BridgeServer::new(Arc::new(BridgeConfig::default()));
        let (ide, bridge) = duplex(4096);
        let task = tokio::spawn(server.run(bridge));
        let mut ide = Framed::new(ide, SeparatorCodec::new());

        request(&mut ide, "print", "counter").await;
        let response = read_response(&mut ide).await;
        assert_eq!(response.command, "print");
        assert!(!response.is_done());
        assert_eq!(response.status.msg.as_deref(), Some("GDB is not started"));

        request(&mut ide, "launch", "").await;
        let response = read_response(&mut ide).await;
        assert_eq!(response.command, "launch");
        assert!(!response.is_done());

        drop(ide);
        task.await.unwrap().unwrap();
    }
}
