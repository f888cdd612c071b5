//! XMPP server connection layer.
//!
//! One TCP listener per enabled connection class. Each accepted socket gets
//! its own task: the [`handler::ConnectionHandler`] wires it, a
//! [`codec::XmppCodec`] frames inbound bytes into stanzas, and a writer task
//! drains the connection's outbound queue. Failures are always local to the
//! connection that caused them.

pub mod codec;
pub mod connection;
pub mod framing;
pub mod handler;
pub mod router;
pub mod stanza;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, ServerProperties};
use crate::error::{CodecError, ConfigError, ParseError, ServerError};
use codec::{ActivityClock, TrafficStats};
use connection::{MultiplexerRegistry, Outbound, StreamErrorCondition};
use handler::{AcceptedConnection, ConnectionHandler, ConnectionKind, ConnectionPolicy, IoSession};
use router::PacketRouter;

/// How long a closing connection may take to flush its queued output.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept (typically descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// RAII guard that decrements the connection counter when dropped.
/// Ensures cleanup even if the connection task panics or returns early.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    kind: ConnectionKind,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>, kind: ConnectionKind) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter, kind }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!(kind = %self.kind, active = prev - 1, "Connection released");
    }
}

/// Why a connection task ended. Logged once per connection.
#[derive(Debug)]
enum EndReason {
    PeerClosed,
    StreamClosed,
    ReadError(io::Error),
    ParseFailure(ParseError),
    StreamError(StreamErrorCondition),
    IdleTimeout,
    Shutdown,
}

pub struct XmppServer {
    config: ServerConfig,
    router: Arc<dyn PacketRouter>,
    properties: Arc<ServerProperties>,
    stats: Arc<TrafficStats>,
    registry: Arc<MultiplexerRegistry>,
    active: HashMap<ConnectionKind, Arc<AtomicUsize>>,
    local_addrs: Vec<(ConnectionKind, SocketAddr)>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl XmppServer {
    pub fn new(config: ServerConfig, router: Arc<dyn PacketRouter>) -> Self {
        let properties = Arc::new(config.properties());
        let active = ConnectionKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(AtomicUsize::new(0))))
            .collect();
        Self {
            config,
            router,
            properties,
            stats: Arc::new(TrafficStats::new()),
            registry: Arc::new(MultiplexerRegistry::new()),
            active,
            local_addrs: Vec::new(),
            tasks: Vec::new(),
            shutdown_tx: None,
        }
    }

    /// Bind every enabled listener and start accepting. Either all listeners
    /// start or none do.
    pub async fn start(&mut self) -> Result<Vec<(ConnectionKind, SocketAddr)>, ServerError> {
        if self.shutdown_tx.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let ip: IpAddr = self.config.server.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "bind_address '{}' is not an IP address",
                self.config.server.bind_address
            ))
        })?;

        let mut bound = Vec::new();
        for kind in ConnectionKind::ALL {
            let listener_config = self.config.listeners.get(kind);
            if !listener_config.enabled {
                continue;
            }
            let addr = SocketAddr::new(ip, listener_config.port);
            let bind_error = |source| ServerError::Bind {
                kind: kind.as_str(),
                addr: addr.to_string(),
                source,
            };
            let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
            let local_addr = listener.local_addr().map_err(bind_error)?;
            info!(kind = %kind, addr = %local_addr, "Listener bound");
            bound.push((kind, listener, local_addr));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        for (kind, listener, local_addr) in bound {
            let handler = Arc::new(ConnectionHandler::new(
                ConnectionPolicy::for_kind(kind, &self.registry),
                self.router.clone(),
                self.properties.clone(),
                &self.config.server.domain,
                self.stats.clone(),
            ));
            let counter = self.counter(kind);
            self.tasks.push(tokio::spawn(accept_loop(
                listener,
                handler,
                shutdown_tx.clone(),
                counter,
            )));
            self.local_addrs.push((kind, local_addr));
        }
        self.shutdown_tx = Some(shutdown_tx);

        info!(
            domain = %self.config.server.domain,
            listeners = self.local_addrs.len(),
            "XMPP server started"
        );
        Ok(self.local_addrs.clone())
    }

    /// Stop accepting, close every live connection with `system-shutdown`
    /// and wait (bounded) for their tasks to finish.
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = shutdown_tx.send(());

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Listener task join error");
            }
        }
        self.local_addrs.clear();

        let deadline = Instant::now() + WRITER_FLUSH_TIMEOUT + Duration::from_secs(1);
        while self.total_active_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!(
            remaining = self.total_active_connections(),
            "XMPP server stopped"
        );
    }

    pub fn local_addrs(&self) -> &[(ConnectionKind, SocketAddr)] {
        &self.local_addrs
    }

    pub fn local_addr(&self, kind: ConnectionKind) -> Option<SocketAddr> {
        self.local_addrs
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| *addr)
    }

    pub fn active_connections(&self, kind: ConnectionKind) -> usize {
        self.active
            .get(&kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_active_connections(&self) -> usize {
        self.active.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        self.stats.clone()
    }

    pub fn multiplexer_registry(&self) -> Arc<MultiplexerRegistry> {
        self.registry.clone()
    }

    fn counter(&self, kind: ConnectionKind) -> Arc<AtomicUsize> {
        self.active
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)))
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    shutdown_tx: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
) {
    let kind = handler.kind();
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                    info!(conn_id, kind = %kind, peer = %peer, "New connection");
                    let handler = handler.clone();
                    let shutdown = shutdown_tx.subscribe();
                    let guard = ConnectionGuard::new(active.clone(), kind);
                    tokio::spawn(async move {
                        let _guard = guard;
                        handle_connection(stream, peer, conn_id, handler, shutdown).await;
                    });
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown_rx.recv() => {
                info!(kind = %kind, "Listener shutting down");
                break;
            }
        }
    }
}

/// Resolves once `idle` has passed without inbound bytes. Never resolves when
/// the timeout is disabled.
async fn idle_expired(clock: &ActivityClock, idle: Option<Duration>) {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };
    loop {
        let deadline = clock.last_activity() + idle;
        if deadline <= Instant::now() {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

/// Drive one accepted socket until it closes.
async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    handler: Arc<ConnectionHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let kind = handler.kind();
    let connection_started = Instant::now();

    let mut session = IoSession::new(conn_id, peer);
    let AcceptedConnection {
        mut stanza_handler,
        codec,
        mut outbound,
    } = match handler.on_connection_accepted(&mut session) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(conn_id, kind = %kind, peer = %peer, error = %e, "Refusing connection");
            return;
        }
    };
    let Some(connection) = session.connection() else {
        error!(conn_id, kind = %kind, "Accepted session has no connection attached");
        return;
    };

    if let Err(e) = tcp.set_nodelay(true) {
        debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
    }
    let activity = codec.activity();
    let idle = session.idle_time();
    let (mut sink, mut stream) = Framed::new(tcp, codec).split();

    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Text(text) => {
                    debug!(conn_id, data = %text, "Sent");
                    if let Err(e) = sink.send(text).await {
                        debug!(conn_id, error = %e, "Write failed (peer likely gone)");
                        return;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = sink.close().await;
    });

    let end_reason = loop {
        tokio::select! {
            _ = connection.closed() => break EndReason::StreamClosed,
            _ = shutdown.recv() => {
                connection.close_with_error(StreamErrorCondition::SystemShutdown);
                break EndReason::Shutdown;
            }
            _ = idle_expired(&activity, idle) => {
                connection.close_with_error(StreamErrorCondition::ConnectionTimeout);
                break EndReason::IdleTimeout;
            }
            item = stream.next() => match item {
                Some(Ok(stanza)) => {
                    debug!(conn_id, data = %stanza, "Received");
                    if let Err(condition) = stanza_handler.process(&stanza) {
                        connection.close_with_error(condition);
                        break EndReason::StreamError(condition);
                    }
                    if connection.is_closing() {
                        break EndReason::StreamClosed;
                    }
                }
                Some(Err(CodecError::Parse(e))) => {
                    connection.close_with_error(e.stream_condition());
                    break EndReason::ParseFailure(e);
                }
                Some(Err(CodecError::Io(e))) => break EndReason::ReadError(e),
                None => break EndReason::PeerClosed,
            },
        }
    };

    // No-op unless the peer went away without closing its stream.
    connection.close();
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!(conn_id, "Writer flush timed out");
        writer.abort();
    }
    connection.mark_closed();
    session.attributes_mut().clear();
    drop(stream);
    drop(stanza_handler);

    let elapsed_ms = connection_started.elapsed().as_millis() as u64;
    match end_reason {
        EndReason::ParseFailure(e) => warn!(
            conn_id,
            kind = %kind,
            reason = e.kind(),
            error = %e,
            elapsed_ms,
            "Connection closed after stanza parse failure"
        ),
        EndReason::StreamError(condition) => info!(
            conn_id,
            kind = %kind,
            reason = %condition,
            elapsed_ms,
            "Connection closed with stream error"
        ),
        EndReason::ReadError(e) => info!(
            conn_id,
            kind = %kind,
            error = %e,
            elapsed_ms,
            "Connection closed after read error"
        ),
        EndReason::IdleTimeout => info!(
            conn_id,
            kind = %kind,
            idle_secs = idle.map(|d| d.as_secs()).unwrap_or(0),
            "Connection closed by idle timeout"
        ),
        EndReason::Shutdown => info!(conn_id, kind = %kind, elapsed_ms, "Connection closed by shutdown"),
        EndReason::PeerClosed => info!(conn_id, kind = %kind, elapsed_ms, "Connection closed by peer"),
        EndReason::StreamClosed => info!(conn_id, kind = %kind, elapsed_ms, "Stream closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenerConfig, ServerConfig};
    use crate::error::RouteError;
    use crate::xmpp_server::stanza::Packet;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const CLIENT_HEADER: &str = "<?xml version='1.0'?><stream:stream to='example.com' \
        xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";

    #[derive(Default)]
    struct RecordingRouter {
        packets: Mutex<Vec<Packet>>,
    }

    impl PacketRouter for RecordingRouter {
        fn route(&self, packet: Packet) -> Result<(), RouteError> {
            self.packets.lock().unwrap().push(packet);
            Ok(())
        }
    }

    impl RecordingRouter {
        fn count(&self) -> usize {
            self.packets.lock().unwrap().len()
        }
    }

    fn test_config(props: &[(&str, &str)]) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.domain = "example.com".to_string();
        config.server.bind_address = "127.0.0.1".to_string();
        config.listeners.client = ListenerConfig { enabled: true, port: 0 };
        config.listeners.server.enabled = false;
        config.listeners.component.enabled = false;
        config.listeners.multiplexer.enabled = false;
        for (k, v) in props {
            config.properties.insert(k.to_string(), v.to_string());
        }
        config
    }

    async fn start(props: &[(&str, &str)]) -> (XmppServer, SocketAddr, Arc<RecordingRouter>) {
        let router = Arc::new(RecordingRouter::default());
        let mut server = XmppServer::new(test_config(props), router.clone());
        server.start().await.expect("server should start");
        let addr = server
            .local_addr(ConnectionKind::Client)
            .expect("client listener bound");
        (server, addr, router)
    }

    /// Read until `needle` shows up, the peer closes, or 5 s pass.
    async fn read_until(socket: &mut TcpStream, needle: &str) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&out).contains(needle) {
            match tokio::time::timeout_at(deadline, socket.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    async fn read_to_close(socket: &mut TcpStream) -> String {
        read_until(socket, "\u{0}never").await
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[test]
    fn test_connection_guard_decrements_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _guard = ConnectionGuard::new(counter.clone(), ConnectionKind::Client);
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_negotiation_and_routing() {
        let (mut server, addr, router) = start(&[]).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();

        socket.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        let reply = read_until(&mut socket, "<stream:features/>").await;
        assert!(reply.starts_with("<?xml version='1.0'?><stream:stream "));
        assert!(reply.contains("from='example.com'"));
        assert!(reply.contains("xmlns='jabber:client'"));
        assert!(reply.ends_with("<stream:features/>"));

        socket
            .write_all(b"<message to='bob@example.com'><body>hi</body></message>")
            .await
            .unwrap();
        assert!(wait_for(|| router.count() == 1).await);
        assert_eq!(server.active_connections(ConnectionKind::Client), 1);

        socket.write_all(b"</stream:stream>").await.unwrap();
        let tail = read_to_close(&mut socket).await;
        assert_eq!(tail, "</stream:stream>");
        assert!(wait_for(|| server.total_active_connections() == 0).await);
        assert!(server.stats().stanzas_decoded() >= 3);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_fragmented_input_is_reassembled() {
        let (mut server, addr, router) = start(&[]).await;
        let stats = server.stats();
        let mut socket = TcpStream::connect(addr).await.unwrap();

        let input = format!(
            "{CLIENT_HEADER}<message to='bob@example.com'><body>héllo ✓!!</body></message>"
        );
        // Each chunk is read by the server before the next one is written, so
        // every read carries at most three bytes, the last one a single '>'.
        let mut sent = 0u64;
        for chunk in input.as_bytes().chunks(3) {
            socket.write_all(chunk).await.unwrap();
            sent += chunk.len() as u64;
            assert!(wait_for(|| stats.bytes_read() == sent).await);
        }
        assert_eq!(input.len() % 3, 1);

        assert!(wait_for(|| router.count() == 1).await);
        let packet = router.packets.lock().unwrap()[0].clone();
        assert_eq!(
            packet.xml,
            "<message to='bob@example.com'><body>héllo ✓!!</body></message>"
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stanza_completed_by_lone_final_byte_is_routed() {
        let (mut server, addr, router) = start(&[]).await;
        let stats = server.stats();
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        read_until(&mut socket, "<stream:features/>").await;

        let stanza = "<iq type='get' id='1' to='example.com'><ping xmlns='urn:xmpp:ping'/></iq>";
        let (head, tail) = stanza.split_at(stanza.len() - 1);
        socket.write_all(head.as_bytes()).await.unwrap();
        let expected = (CLIENT_HEADER.len() + head.len()) as u64;
        assert!(wait_for(|| stats.bytes_read() == expected).await);
        assert_eq!(router.count(), 0);

        socket.write_all(tail.as_bytes()).await.unwrap();
        assert!(wait_for(|| router.count() == 1).await);
        assert_eq!(router.packets.lock().unwrap()[0].xml, stanza);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_input_closes_only_that_connection() {
        let (mut server, addr, _router) = start(&[]).await;
        let mut healthy = TcpStream::connect(addr).await.unwrap();
        healthy.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        read_until(&mut healthy, "<stream:features/>").await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        read_until(&mut socket, "<stream:features/>").await;
        socket
            .write_all(b"<message><body>hi</message>")
            .await
            .unwrap();

        let reply = read_to_close(&mut socket).await;
        assert!(reply.contains(
            "<stream:error><not-well-formed xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>"
        ));
        assert!(reply.ends_with("</stream:stream>"));
        assert!(wait_for(|| server.active_connections(ConnectionKind::Client) == 1).await);

        healthy.write_all(b"<presence/>").await.unwrap();
        healthy.write_all(b"</stream:stream>").await.unwrap();
        assert_eq!(read_to_close(&mut healthy).await, "</stream:stream>");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_error_before_header_still_sends_header() {
        let (mut server, addr, _router) = start(&[]).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"hello").await.unwrap();

        let reply = read_to_close(&mut socket).await;
        assert!(reply.starts_with("<?xml version='1.0'?><stream:stream "));
        assert!(reply.contains("<not-well-formed "));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_buffer_overflow_is_policy_violation() {
        let (mut server, addr, _router) = start(&[("xmpp.parser.buffer.size", "256")]).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        read_until(&mut socket, "<stream:features/>").await;

        let payload = format!("<message><body>{}", "a".repeat(600));
        socket.write_all(payload.as_bytes()).await.unwrap();
        let reply = read_to_close(&mut socket).await;
        assert!(reply.contains("<policy-violation "));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_host_is_rejected() {
        let (mut server, addr, _router) = start(&[]).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(
                b"<stream:stream to='elsewhere.org' xmlns='jabber:client' \
                  xmlns:stream='http://etherx.jabber.org/streams'>",
            )
            .await
            .unwrap();
        let reply = read_to_close(&mut socket).await;
        assert!(reply.contains("<host-unknown "));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let (mut server, addr, _router) = start(&[("xmpp.client.idle", "1000")]).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();

        let started = Instant::now();
        let reply = read_to_close(&mut socket).await;
        assert!(reply.contains("<connection-timeout "));
        assert!(started.elapsed() < Duration::from_secs(4));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_sends_system_shutdown() {
        let (mut server, addr, _router) = start(&[]).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(CLIENT_HEADER.as_bytes()).await.unwrap();
        read_until(&mut socket, "<stream:features/>").await;

        server.stop().await;
        let reply = read_to_close(&mut socket).await;
        assert!(reply.contains("<system-shutdown "));
        assert_eq!(server.total_active_connections(), 0);
        assert!(server.local_addrs().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut server, _addr, _router) = start(&[]).await;
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyRunning)
        ));
        server.stop().await;
    }
}
