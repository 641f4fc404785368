//! TCP server implementation.
//!
//! One runtime loop owns the [`CommandHandler`] and the [`ClientRegistry`].
//! Connection tasks decode lines into commands and forward them to the loop
//! through an mpsc inbox; the loop answers through each connection's bounded
//! outbox. Commands and timer expiries are therefore handled strictly one at
//! a time.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::handler::{CommandHandler, SessionAction};
use crate::registry::{ClientHandle, ClientRegistry};
use crate::session::{ClientId, Session};
use bytes::Bytes;
use fsmrun_core::Engine;
use fsmrun_protocol::{encode_line, Command, Event, LineDecoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the inbox shared by all connection tasks.
const INBOX_CAPACITY: usize = 1024;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 8192;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Interval between `ping` broadcasts.
    pub ping_interval: Option<Duration>,
    /// Outbound events queued per connection.
    pub outbox_capacity: usize,
    /// How long shutdown waits for connections to flush.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ServerConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
            ping_interval: network.ping_interval(),
            outbox_capacity: network.outbox_capacity.max(1),
            shutdown_grace: network.shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }
}

/// Message from a connection task to the runtime loop.
#[derive(Debug)]
enum Inbound {
    Command { id: ClientId, command: Command },
    Disconnected { id: ClientId },
}

/// TCP server for one running machine.
pub struct Server {
    config: ServerConfig,
    handler: Mutex<Option<CommandHandler>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server. The engine is started when the server runs.
    pub fn new(config: ServerConfig, engine: Engine) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler: Mutex::new(Some(CommandHandler::new(engine))),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the configured address and runs until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Runs on an already bound listener until shutdown.
    ///
    /// A server runs at most once.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut handler = self
            .handler
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        // Subscribe before flagging as running so a shutdown() observed
        // through is_running() is never missed.
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        info!("Server listening on {}", listener.local_addr()?);

        let (inbox_tx, mut inbox_rx) = mpsc::channel::<Inbound>(INBOX_CAPACITY);
        let mut registry = ClientRegistry::new();
        let mut connections = JoinSet::new();
        let mut ping = self.config.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        handler.start(Instant::now().into_std());

        let reason = loop {
            let deadline = handler.next_deadline().map(Instant::from_std);

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if connections.len() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                drop(stream);
                                continue;
                            }

                            let session = Session::new(addr);
                            let (outbox_tx, outbox_rx) = mpsc::channel(self.config.outbox_capacity);
                            registry.register(session.id, ClientHandle { addr, outbox: outbox_tx });
                            connections.spawn(Self::handle_connection(
                                stream,
                                session,
                                outbox_rx,
                                inbox_tx.clone(),
                                self.config.idle_timeout,
                            ));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }

                Some(inbound) = inbox_rx.recv() => {
                    match inbound {
                        Inbound::Command { id, command } => {
                            let reply = handler.handle(&command, Instant::now().into_std());
                            for event in &reply.to_sender {
                                registry.send_to(&id, encode_event(event));
                            }
                            broadcast_events(&mut registry, &reply.broadcast);

                            match reply.action {
                                Some(SessionAction::Close) => {
                                    registry.unregister(&id);
                                }
                                Some(SessionAction::Shutdown) => break "shutdown requested",
                                None => {}
                            }
                        }
                        Inbound::Disconnected { id } => {
                            registry.unregister(&id);
                        }
                    }
                }

                _ = sleep_until(deadline) => {
                    let events = handler.on_timer(Instant::now().into_std());
                    broadcast_events(&mut registry, &events);
                }

                _ = tick(&mut ping) => {
                    broadcast_events(&mut registry, &[Event::Ping]);
                }

                _ = shutdown_rx.recv() => break "server stopped",

                Some(result) = connections.join_next() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        };

        info!("Server shutting down: {}", reason);
        broadcast_events(
            &mut registry,
            &[Event::Shutdown {
                message: reason.to_string(),
            }],
        );
        // Closing every outbox lets writers flush what is queued and exit.
        registry.clear();
        drop(inbox_rx);
        drop(inbox_tx);

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connection(s) still open after {:?}, aborting",
                connections.len(),
                grace
            );
            connections.abort_all();
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handles a single connection until it closes, then notifies the loop.
    async fn handle_connection(
        stream: TcpStream,
        mut session: Session,
        outbox: mpsc::Receiver<Bytes>,
        inbox: mpsc::Sender<Inbound>,
        idle_timeout: Option<Duration>,
    ) {
        let addr = session.remote_addr;
        info!("Client connected: {}", addr);

        let result = Self::connection_loop(stream, &mut session, outbox, &inbox, idle_timeout).await;
        if let Err(e) = result {
            debug!("Connection {} error: {}", addr, e);
        }

        // The loop may already be gone during shutdown.
        let _ = inbox.send(Inbound::Disconnected { id: session.id }).await;
        info!(
            "Client disconnected: {} ({} commands in {:?})",
            addr,
            session.command_count(),
            session.age()
        );
    }

    async fn connection_loop(
        stream: TcpStream,
        session: &mut Session,
        mut outbox: mpsc::Receiver<Bytes>,
        inbox: &mpsc::Sender<Inbound>,
        idle_timeout: Option<Duration>,
    ) -> Result<(), ServerError> {
        let addr = session.remote_addr;
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let idle_deadline = session.idle_deadline(idle_timeout);

            tokio::select! {
                biased;

                line = outbox.recv() => {
                    match line {
                        Some(bytes) => writer.write_all(&bytes).await?,
                        None => {
                            debug!("[{}] Outbox closed", addr);
                            writer.shutdown().await?;
                            return Ok(());
                        }
                    }
                    continue;
                }

                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            debug!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                            session.touch();
                        }
                        Err(e) => return Err(ServerError::Io(e)),
                    }
                }

                _ = sleep_until(idle_deadline) => {
                    info!("[{}] Idle timeout after {:?}", addr, session.idle_duration());
                    return Ok(());
                }
            }

            loop {
                match decoder.decode_line() {
                    Ok(Some(line)) => {
                        debug!("[{}] <- {}", addr, line);
                        match Command::parse(&line) {
                            Ok(command) => {
                                session.record_command();
                                if inbox.send(Inbound::Command { id: session.id, command }).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) if e.is_malformed() => {
                                warn!("[{}] Discarding malformed line: {}", addr, e);
                            }
                            Err(e) => {
                                warn!("[{}] Rejected command: {}", addr, e);
                                write_event(&mut writer, &Event::error(e.error_code(), e.to_string())).await?;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[{}] Discarding line: {}", addr, e);
                        write_event(&mut writer, &Event::error(e.error_code(), e.to_string())).await?;
                    }
                }
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn encode_event(event: &Event) -> Bytes {
    encode_line(&event.to_xml())
}

fn broadcast_events(registry: &mut ClientRegistry, events: &[Event]) {
    for event in events {
        let dropped = registry.broadcast(&encode_event(event));
        if !dropped.is_empty() {
            debug!("{} client(s) dropped during broadcast", dropped.len());
        }
    }
}

async fn write_event(writer: &mut OwnedWriteHalf, event: &Event) -> Result<(), ServerError> {
    writer.write_all(&encode_event(event)).await?;
    Ok(())
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmrun_core::MachineDefinition;
    use fsmrun_protocol::ErrorCode;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const TIMER_OFF: &str = include_str!("../../models/timer_off.xml");

    const SHORT_TIMER: &str = r#"<automaton name="blink">
      <inputs><input name="go"/></inputs>
      <outputs><output name="led"/></outputs>
      <states>
        <state name="OFF" initial="true"><code>output("led", 0);</code></state>
        <state name="ON"><code>output("led", 1);</code></state>
      </states>
      <transitions>
        <transition from="OFF" to="ON"><condition event="go"/></transition>
        <transition from="ON" to="OFF"><delay>50</delay></transition>
      </transitions>
    </automaton>"#;

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, command: Command) {
            self.send_raw(&command.to_xml()).await;
        }

        async fn next_event(&mut self) -> Event {
            let line = timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for event")
                .unwrap()
                .expect("connection closed");
            Event::parse(&line).unwrap()
        }

        /// Reads events until one matches.
        async fn wait_for(&mut self, pred: impl Fn(&Event) -> bool) -> Event {
            loop {
                let event = self.next_event().await;
                if pred(&event) {
                    return event;
                }
            }
        }

        async fn status(&mut self) -> fsmrun_protocol::StatusReport {
            self.send(Command::Status).await;
            match self.wait_for(|e| matches!(e, Event::Status(_))).await {
                Event::Status(report) => report,
                _ => unreachable!(),
            }
        }
    }

    async fn start_server(
        model: &str,
        config: ServerConfig,
    ) -> (Arc<Server>, SocketAddr, JoinHandle<Result<(), ServerError>>) {
        let definition = MachineDefinition::from_xml(model).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config, Engine::new(definition)));

        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move { runner.run_with_listener(listener).await });
        (server, addr, handle)
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            ping_interval: None,
            shutdown_grace: Duration::from_millis(200),
            ..ServerConfig::new("127.0.0.1:0".parse().unwrap())
        }
    }

    fn set(name: &str, value: &str) -> Command {
        Command::Set {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_config_from_network() {
        let network = NetworkConfig {
            ping_interval_secs: 0,
            idle_timeout_secs: 7,
            ..Default::default()
        };
        let config = ServerConfig::from(&network);
        assert_eq!(config.ping_interval, None);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(7)));
        assert_eq!(config.bind_addr, network.bind_addr);
    }

    #[tokio::test]
    async fn test_status_over_tcp() {
        let (server, addr, handle) = start_server(TIMER_OFF, test_config()).await;
        let mut client = TestClient::connect(addr).await;

        client.send_raw(r#"<command type="status"></command>"#).await;
        let report = match client.next_event().await {
            Event::Status(report) => report,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(report.state, "IDLE");
        assert_eq!(report.outputs[0].name, "out");
        assert_eq!(report.outputs[0].value, "0");
        assert_eq!(report.variables[0].var_type, "int");
        assert!(report.timers.is_empty());

        client.send(set("in", "1")).await;
        client.send(set("in", "0")).await;
        let report = client.status().await;
        assert_eq!(report.state, "TIMING");
        assert_eq!(report.timers.len(), 1);
        assert!(report.timers[0].ms <= 5000 && report.timers[0].ms > 4000);

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_events_broadcast_to_all_clients() {
        let (server, addr, handle) = start_server(TIMER_OFF, test_config()).await;
        let mut first = TestClient::connect(addr).await;
        let mut second = TestClient::connect(addr).await;

        // Both connections are registered once each has been answered.
        first.status().await;
        second.status().await;

        first.send(set("in", "1")).await;

        let expected = Event::StateChange {
            name: "ACTIVE".to_string(),
            from: Some("IDLE".to_string()),
        };
        for client in [&mut first, &mut second] {
            client.wait_for(|e| *e == expected).await;
            let output = client.wait_for(|e| matches!(e, Event::Output { .. })).await;
            assert_eq!(
                output,
                Event::Output {
                    name: "out".to_string(),
                    value: "1".to_string()
                }
            );
        }

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_commands() {
        let (server, addr, handle) = start_server(TIMER_OFF, test_config()).await;
        let mut client = TestClient::connect(addr).await;

        // Malformed XML is dropped without a reply; the connection stays usable.
        client.send_raw("<command type=\"status\"").await;
        client.send_raw(r#"<command type="launch"/>"#).await;
        match client.next_event().await {
            Event::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownCommand),
            other => panic!("unexpected event: {:?}", other),
        }

        client.send(set("missing", "1")).await;
        match client.next_event().await {
            Event::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownName),
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(client.status().await.state, "IDLE");

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_closes_only_that_connection() {
        let (server, addr, handle) = start_server(TIMER_OFF, test_config()).await;
        let mut leaving = TestClient::connect(addr).await;
        let mut staying = TestClient::connect(addr).await;

        leaving.send(Command::Disconnect).await;
        assert!(matches!(leaving.next_event().await, Event::Disconnect { .. }));
        let eof = timeout(Duration::from_secs(5), leaving.lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());

        assert_eq!(staying.status().await.state, "IDLE");

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_command_notifies_clients() {
        let (server, addr, handle) = start_server(TIMER_OFF, test_config()).await;
        let mut controller = TestClient::connect(addr).await;
        let mut observer = TestClient::connect(addr).await;
        observer.status().await;

        controller.send(Command::Shutdown).await;
        for client in [&mut controller, &mut observer] {
            client.wait_for(|e| matches!(e, Event::Shutdown { .. })).await;
        }

        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_delayed_transition_fires() {
        let (server, addr, handle) = start_server(SHORT_TIMER, test_config()).await;
        let mut client = TestClient::connect(addr).await;

        client.send(Command::Call { name: "go".to_string() }).await;
        client
            .wait_for(|e| matches!(e, Event::TimerStart { ms: 50, .. }))
            .await;
        client
            .wait_for(|e| matches!(e, Event::TimerExpired { .. }))
            .await;
        let state = client
            .wait_for(|e| matches!(e, Event::StateChange { .. }))
            .await;
        assert_eq!(
            state,
            Event::StateChange {
                name: "OFF".to_string(),
                from: Some("ON".to_string())
            }
        );

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ping_broadcast() {
        let config = ServerConfig {
            ping_interval: Some(Duration::from_millis(50)),
            ..test_config()
        };
        let (server, addr, handle) = start_server(TIMER_OFF, config).await;
        let mut client = TestClient::connect(addr).await;

        client.wait_for(|e| *e == Event::Ping).await;
        client.send(Command::Pong).await;
        assert_eq!(client.status().await.state, "IDLE");

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };
        let (server, addr, handle) = start_server(TIMER_OFF, config).await;
        let mut client = TestClient::connect(addr).await;

        let eof = timeout(Duration::from_secs(5), client.lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let (server, addr, handle) = start_server(TIMER_OFF, config).await;
        let mut first = TestClient::connect(addr).await;
        first.status().await;

        let mut rejected = TestClient::connect(addr).await;
        let eof = timeout(Duration::from_secs(5), rejected.lines.next_line())
            .await
            .unwrap();
        // Closed without a single event, reset or clean EOF.
        assert!(matches!(eof, Ok(None) | Err(_)));

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (server, _addr, handle) = start_server(TIMER_OFF, test_config()).await;
        // Let the spawned run take the handler.
        while !server.is_running() {
            tokio::task::yield_now().await;
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = server.run_with_listener(listener).await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning));

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
