//! The listener engine: bind, accept (including the datagram "soft accept" that
//!  demultiplexes flows sharing one listening port), run the first-message handshake,
//!  and hand each accepted flow to its worker tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::client::{ClientFlow, FlowSocket};
use crate::config::{FlowSettings, Protocol, Role, TestMode};
use crate::context::EngineContext;
use crate::flow_table::{FlowKey, PushOutcome};
use crate::records::{record_ring, FullDuplexReport, RecordProducer, DEFAULT_RING_DEPTH};
use crate::server::{ServerFlow, ServerSocket};
use crate::timing::clock::{precise_sleep, Timestamp};
use crate::wire::{
    fixed_peek_len, settings_tail_len, ClientHeader, DatagramHeader, HeaderAck, HDR_EXTEND,
    HDR_KEYCHECK, HDR_SMALL_TRIPTIMES, HDR_V2PEERDETECT, HDR_VERSION1, HDR_VERSION2,
};

/// Poll cadence while single-client mode waits for the previous flow to finish.
///  Deliberately a plain delay: an event scheme between listener and traffic tasks is
///  more plumbing than this saves.
const SINGLE_CLIENT_POLL: Duration = Duration::from_millis(50);
/// Accepts block at most this long so the interrupt flag stays observed.
const ACCEPT_SLICE: Duration = Duration::from_millis(500);
const TEST_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(4);
/// Clamp bounds for the settings-ack send timeout.
const HDR_ACK_TIMEOUT_MIN: Duration = Duration::from_millis(10);
const HDR_ACK_TIMEOUT_MAX: Duration = Duration::from_millis(500);
/// Backoff between partial header peeks.
const PEEK_RETRY: Duration = Duration::from_millis(2);

/// How a server/client pair accepted on one connection is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSchedule {
    /// Both directions at once (full-duplex, legacy dual test).
    Parallel,
    /// Client runs after the server worker completes (legacy trade-off test).
    Sequential,
}

/// Seam between accept/handshake and flow execution. Production spawns tasks; tests
///  capture the flows instead.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlowDispatcher: Send + Sync {
    /// Ring for a new flow's packet records; the consumer side belongs to the reporter.
    fn open_ring(&self) -> RecordProducer;

    async fn dispatch(
        &self,
        server: Option<ServerFlow>,
        client: Option<ClientFlow>,
        schedule: PairSchedule,
    );
}

/// Spawns each flow as a task. Records are drained and dropped; a real deployment hangs
///  its reporter on the rings instead.
pub struct TokioDispatcher;

#[async_trait]
impl FlowDispatcher for TokioDispatcher {
    fn open_ring(&self) -> RecordProducer {
        let (producer, mut consumer) = record_ring(DEFAULT_RING_DEPTH);
        tokio::spawn(async move {
            while let Some(record) = consumer.recv().await {
                trace!(id = record.packet_id, len = record.packet_len, "record");
            }
        });
        producer
    }

    async fn dispatch(
        &self,
        server: Option<ServerFlow>,
        client: Option<ClientFlow>,
        schedule: PairSchedule,
    ) {
        match schedule {
            PairSchedule::Parallel => {
                if let Some(server) = server {
                    tokio::spawn(server.run());
                }
                if let Some(client) = client {
                    tokio::spawn(async move {
                        if let Err(e) = client.run().await {
                            warn!("paired client failed: {:#}", e);
                        }
                    });
                }
            }
            PairSchedule::Sequential => {
                tokio::spawn(async move {
                    if let Some(server) = server {
                        server.run().await;
                    }
                    if let Some(client) = client {
                        if let Err(e) = client.run().await {
                            warn!("trade-off client failed: {:#}", e);
                        }
                    }
                });
            }
        }
    }
}

enum AcceptedSocket {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

struct Accepted {
    socket: AcceptedSocket,
    peer: SocketAddr,
    local: SocketAddr,
    key: FlowKey,
    accept_time: Timestamp,
    /// Length of the peeked first datagram; zero for streams.
    first_len: usize,
}

pub struct Listener {
    settings: FlowSettings,
    ctx: Arc<EngineContext>,
    dispatcher: Arc<dyn FlowDispatcher>,
    /// Set when a client started this listener for a legacy dual/trade-off test; only
    ///  the expected peer may connect.
    client_listener: bool,
    time_limit: Option<Duration>,
    stream_listener: Option<TcpListener>,
    datagram_listener: Option<UdpSocket>,
    bound_addr: Option<SocketAddr>,
    peek_buf: Vec<u8>,
}

impl Listener {
    pub fn new(settings: FlowSettings, ctx: Arc<EngineContext>) -> Listener {
        Listener::with_dispatcher(settings, ctx, Arc::new(TokioDispatcher))
    }

    pub fn with_dispatcher(
        settings: FlowSettings,
        ctx: Arc<EngineContext>,
        dispatcher: Arc<dyn FlowDispatcher>,
    ) -> Listener {
        let peek = settings.payload_alloc_len();
        Listener {
            settings,
            ctx,
            dispatcher,
            client_listener: false,
            time_limit: None,
            stream_listener: None,
            datagram_listener: None,
            bound_addr: None,
            peek_buf: vec![0u8; peek],
        }
    }

    /// Mark this as a client-started secondary listener expecting `settings.peer_addr`.
    pub fn expect_peer_only(&mut self) {
        self.client_listener = true;
    }

    pub fn with_time_limit(&mut self, limit: Duration) {
        self.time_limit = Some(limit);
    }

    /// Bind the listening socket and return the resolved local address. `run` binds
    ///  lazily if this was not called first.
    pub async fn bind(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = self
            .settings
            .local_addr
            .context("listener requires a local address")?;
        let bound = match self.settings.protocol {
            Protocol::Stream => {
                let listener = self.bind_stream(addr)?;
                let bound = listener.local_addr()?;
                self.stream_listener = Some(listener);
                bound
            }
            Protocol::Datagram => {
                let sock = bind_datagram(addr)?;
                let bound = sock.local_addr()?;
                self.datagram_listener = Some(sock);
                bound
            }
        };
        self.bound_addr = Some(bound);
        debug!(addr = %bound, protocol = ?self.settings.protocol, "listener bound");
        Ok(bound)
    }

    fn bind_stream(&self, addr: SocketAddr) -> anyhow::Result<TcpListener> {
        let sock = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        sock.set_reuseaddr(true)?;
        sock.bind(addr).context("binding stream listener")?;
        // single-client and permit-key runs keep the backlog tight so strangers queue
        // behind the gate instead of piling in
        let backlog =
            if self.settings.flags.single_client || self.settings.permit_key.is_some() {
                self.settings.parallel.max(1)
            } else {
                i32::MAX as u32
            };
        Ok(sock.listen(backlog)?)
    }

    /// Accept flows until interrupted, the accept budget is spent, or the deadline hits.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        if self.bound_addr.is_none() {
            self.bind().await?;
        }
        let mut remaining = (self.settings.parallel > 0).then_some(self.settings.parallel);
        let deadline = self
            .time_limit
            .or_else(|| {
                self.settings
                    .permit_key
                    .as_ref()
                    .and_then(|_| self.settings.listener_timeout)
            })
            .map(|limit| Instant::now() + limit);
        info!(addr = ?self.bound_addr, "listener accepting");

        loop {
            if self.ctx.is_interrupted() || remaining == Some(0) {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    if self.settings.flags.compat {
                        bail!("expected reverse connect did not occur");
                    }
                    debug!("listener deadline reached");
                    break;
                }
            }
            if self.settings.flags.single_client && self.ctx.live_traffic_tasks() > 0 {
                precise_sleep(SINGLE_CLIENT_POLL).await;
                continue;
            }
            if self.settings.is_datagram() && self.datagram_listener.is_none() {
                // the previous flow stole the socket in the soft accept
                let addr = self.bound_addr.expect("bound before the accept loop");
                self.datagram_listener = Some(bind_datagram(addr)?);
            }

            let slice = deadline
                .map(|d| d.saturating_duration_since(Instant::now()).min(ACCEPT_SLICE))
                .unwrap_or(ACCEPT_SLICE);
            let accepted = match self.accept_one(slice).await {
                Ok(Some(accepted)) => accepted,
                Ok(None) => continue,
                Err(e) => {
                    warn!("accept failed: {:#}", e);
                    continue;
                }
            };
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
            if let Err(e) = self.handle_accepted(accepted).await {
                warn!("flow setup failed: {:#}", e);
            }
        }
        debug!("listener exiting");
        Ok(())
    }

    async fn accept_one(&mut self, wait: Duration) -> anyhow::Result<Option<Accepted>> {
        match self.settings.protocol {
            Protocol::Stream => {
                let listener = self
                    .stream_listener
                    .as_ref()
                    .expect("stream listener bound");
                let (stream, peer) = match timeout(wait, listener.accept()).await {
                    Ok(res) => res?,
                    Err(_) => return Ok(None),
                };
                let local = stream.local_addr()?;
                let key = FlowKey {
                    local,
                    peer,
                    protocol: Protocol::Stream,
                };
                self.ctx.flow_table.push(key);
                Ok(Some(Accepted {
                    socket: AcceptedSocket::Stream(stream),
                    peer,
                    local,
                    key,
                    accept_time: Timestamp::now(),
                    first_len: 0,
                }))
            }
            Protocol::Datagram => self.datagram_accept(wait).await,
        }
    }

    /// The datagram soft accept: peek the first message to learn the peer, register the
    ///  5-tuple, then steal the listening socket and connect it so the kernel routes
    ///  only this peer's traffic to the worker. The peeked bytes stay queued for the
    ///  worker's accounting. A known 5-tuple is a retransmitted first packet: consumed
    ///  and dropped, no second worker.
    async fn datagram_accept(&mut self, wait: Duration) -> anyhow::Result<Option<Accepted>> {
        let listener = self
            .datagram_listener
            .as_ref()
            .expect("datagram listener bound");
        let (len, peer) = match timeout(wait, listener.peek_from(&mut self.peek_buf)).await {
            Ok(res) => res?,
            Err(_) => return Ok(None),
        };
        let local = listener.local_addr()?;
        let key = FlowKey {
            local,
            peer,
            protocol: Protocol::Datagram,
        };
        if self.ctx.flow_table.push_conditional(key) == PushOutcome::Duplicate {
            let _ = listener.recv_from(&mut self.peek_buf).await;
            trace!(peer = %peer, "duplicate first datagram dropped");
            return Ok(None);
        }
        let sock = self
            .datagram_listener
            .take()
            .expect("datagram listener present");
        sock.connect(peer)
            .await
            .context("associating accepted datagram peer")?;
        Ok(Some(Accepted {
            socket: AcceptedSocket::Datagram(sock),
            peer,
            local,
            key,
            accept_time: Timestamp::now(),
            first_len: len,
        }))
    }

    async fn handle_accepted(&mut self, mut accepted: Accepted) -> anyhow::Result<()> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::DEBUG, "accepted_flow", %correlation_id, peer = %accepted.peer);
        let _entered = span.enter();

        let mut server = self.settings.clone();
        server.role = Role::Server;
        server.peer_addr = accepted.peer;
        server.local_addr = Some(accepted.local);
        server.test_mode = TestMode::Normal;
        server.peer_version = None;

        // a client-started listener only serves its own test peer, and a v6 peer needs
        // v6 enabled on this side
        if self.client_listener && accepted.peer.ip() != self.settings.peer_addr.ip() {
            info!(peer = %accepted.peer, "rejecting unexpected peer on client listener");
            self.ctx.flow_table.remove(&accepted.key);
            return Ok(());
        }
        if accepted.peer.is_ipv6() && !self.settings.flags.ipv6 {
            info!(peer = %accepted.peer, "rejecting v6 peer, listener is v4 only");
            self.ctx.flow_table.remove(&accepted.key);
            return Ok(());
        }

        let header = if self.settings.flags.compat {
            None
        } else {
            match self.apply_client_settings(&mut server, &mut accepted).await {
                Ok(header) => header,
                Err(e) => {
                    info!(peer = %accepted.peer, "handshake rejected: {:#}", e);
                    self.ctx.flow_table.remove(&accepted.key);
                    return Ok(());
                }
            }
        };
        if server.flags.l2_check {
            warn!("peer requested l2 length checks, not supported here");
        }
        info!(
            peer = %accepted.peer,
            accept_time = ?accepted.accept_time,
            trip_time = server.flags.trip_time,
            full_duplex = server.flags.full_duplex,
            reverse = server.flags.reverse,
            mode = ?server.test_mode,
            "flow accepted"
        );

        self.dispatch_flows(server, accepted, header).await;
        Ok(())
    }

    /// Build the worker (and, for full-duplex / reverse / legacy modes, the paired
    ///  client) and hand them to the dispatcher.
    async fn dispatch_flows(
        &mut self,
        server: FlowSettings,
        accepted: Accepted,
        header: Option<ClientHeader>,
    ) {
        let needs_pair = server.flags.full_duplex
            || server.flags.reverse
            || server.test_mode != TestMode::Normal;

        if !needs_pair {
            let socket = match accepted.socket {
                AcceptedSocket::Stream(stream) => ServerSocket::Stream(stream),
                AcceptedSocket::Datagram(sock) => ServerSocket::Datagram(Arc::new(sock)),
            };
            let flow = ServerFlow::new(
                server,
                self.ctx.clone(),
                self.dispatcher.open_ring(),
                socket,
                Some(accepted.key),
            );
            self.dispatcher
                .dispatch(Some(flow), None, PairSchedule::Parallel)
                .await;
            return;
        }

        if server.flags.full_duplex {
            let fd = Arc::new(FullDuplexReport::new());
            let client_settings = paired_client_settings(&server, header.as_ref());
            let (server_sock, client_sock) = match accepted.socket {
                AcceptedSocket::Stream(stream) => {
                    let (rx, tx) = stream.into_split();
                    (ServerSocket::StreamRx(rx), FlowSocket::StreamTx(tx))
                }
                AcceptedSocket::Datagram(sock) => {
                    let sock = Arc::new(sock);
                    (
                        ServerSocket::Datagram(sock.clone()),
                        FlowSocket::Datagram(sock),
                    )
                }
            };
            let mut server_flow = ServerFlow::new(
                server,
                self.ctx.clone(),
                self.dispatcher.open_ring(),
                server_sock,
                Some(accepted.key),
            );
            server_flow.attach_full_duplex(fd.clone());
            let mut client_flow = ClientFlow::from_accepted(
                client_settings,
                self.ctx.clone(),
                self.dispatcher.open_ring(),
                client_sock,
            );
            client_flow.attach_full_duplex(fd);
            self.dispatcher
                .dispatch(Some(server_flow), Some(client_flow), PairSchedule::Parallel)
                .await;
        } else if server.flags.reverse {
            // pure reverse: the accepted flow is a transmitter, nothing to receive
            let client_settings = paired_client_settings(&server, header.as_ref());
            let client_sock = match accepted.socket {
                AcceptedSocket::Stream(stream) => FlowSocket::Stream(stream),
                AcceptedSocket::Datagram(sock) => FlowSocket::Datagram(Arc::new(sock)),
            };
            let client_flow = ClientFlow::from_accepted(
                client_settings,
                self.ctx.clone(),
                self.dispatcher.open_ring(),
                client_sock,
            );
            self.dispatcher
                .dispatch(None, Some(client_flow), PairSchedule::Parallel)
                .await;
        } else {
            // legacy dual/trade-off: serve this direction and connect back to the
            // client's own listener for the other one
            let schedule = match server.test_mode {
                TestMode::DualTest => PairSchedule::Parallel,
                _ => PairSchedule::Sequential,
            };
            let socket = match accepted.socket {
                AcceptedSocket::Stream(stream) => ServerSocket::Stream(stream),
                AcceptedSocket::Datagram(sock) => ServerSocket::Datagram(Arc::new(sock)),
            };
            let server_flow = ServerFlow::new(
                server.clone(),
                self.ctx.clone(),
                self.dispatcher.open_ring(),
                socket,
                Some(accepted.key),
            );
            let client_flow = header.as_ref().map(|header| {
                let mut settings = paired_client_settings(&server, Some(header));
                settings.role = Role::Client;
                settings.peer_addr = SocketAddr::new(accepted.peer.ip(), header.port);
                // children of a legacy test carry no test flags of their own
                settings.flags.compat = true;
                ClientFlow::new(settings, self.ctx.clone(), self.dispatcher.open_ring())
                    .map_err(|e| warn!("legacy pair client invalid: {:#}", e))
                    .ok()
            });
            self.dispatcher
                .dispatch(Some(server_flow), client_flow.flatten(), schedule)
                .await;
        }
    }

    /// The first-message handshake. Peeks, never consumes: the worker re-reads the same
    ///  bytes so its accounting includes them.
    async fn apply_client_settings(
        &mut self,
        server: &mut FlowSettings,
        accepted: &mut Accepted,
    ) -> anyhow::Result<Option<ClientHeader>> {
        let now = Timestamp::now();
        match &mut accepted.socket {
            AcceptedSocket::Stream(stream) => {
                let header = self.peek_stream_header(stream).await?;
                if let Some(header) = &header {
                    header.apply_to(server, now);
                    // pre-v2 extend clients and v2 peer-detect both expect the ack
                    let wants_ack = (header.flags & HDR_EXTEND != 0
                        && header.flags & HDR_VERSION2 == 0)
                        || header.flags & HDR_V2PEERDETECT != 0;
                    if wants_ack {
                        send_settings_ack(server, stream).await;
                    }
                }
                Ok(header)
            }
            AcceptedSocket::Datagram(_) => {
                let raw = &self.peek_buf[..accepted.first_len];
                let mut body = &raw[..];
                let dgram = DatagramHeader::parse(true, &mut body)
                    .context("first datagram shorter than its header")?;
                if body.remaining() < 4 {
                    // bare data packet, nothing negotiated
                    return Ok(None);
                }
                let flags = (&body[..4]).get_u32();
                if flags & (HDR_VERSION1 | HDR_VERSION2 | HDR_EXTEND | HDR_SMALL_TRIPTIMES) == 0 {
                    return Ok(None);
                }
                if flags & HDR_SMALL_TRIPTIMES != 0 && dgram.id != 1 {
                    warn!(
                        id = dgram.id,
                        "first received packet was not the first sent packet, start time will be off"
                    );
                }
                let header = ClientHeader::parse(&mut body).context("first datagram settings")?;
                self.check_permit_key(&header)?;
                header.apply_to(server, now);
                Ok(Some(header))
            }
        }
    }

    /// Stream handshake peeks in stages: the flag word sizes the fixed blocks, the upper
    ///  flags size the tail, the key length sizes the key.
    async fn peek_stream_header(
        &mut self,
        stream: &TcpStream,
    ) -> anyhow::Result<Option<ClientHeader>> {
        let deadline = Instant::now() + TEST_EXCHANGE_TIMEOUT;
        peek_exact(stream, &mut self.peek_buf[..4], deadline).await?;
        let flags = (&self.peek_buf[..4]).get_u32();
        let negotiates = flags & (HDR_VERSION1 | HDR_VERSION2 | HDR_EXTEND) != 0;
        if !negotiates && self.settings.permit_key.is_none() {
            return Ok(None);
        }

        let fixed = fixed_peek_len(flags);
        peek_exact(stream, &mut self.peek_buf[..fixed], deadline).await?;
        let mut total = fixed;
        if flags & HDR_EXTEND != 0 {
            // upper flags sit after typelen in the extend block
            let upper = (&self.peek_buf[crate::wire::BASE_LEN + 8..][..2]).get_u16();
            total += settings_tail_len(upper);
            peek_exact(stream, &mut self.peek_buf[..total], deadline).await?;
        }
        if flags & HDR_KEYCHECK != 0 {
            peek_exact(stream, &mut self.peek_buf[..total + 2], deadline).await?;
            let key_len = (&self.peek_buf[total..][..2]).get_u16() as usize;
            total += 2 + key_len;
            if total > self.peek_buf.len() {
                bail!("settings header longer than the peek buffer");
            }
            peek_exact(stream, &mut self.peek_buf[..total], deadline).await?;
        }

        let header = ClientHeader::parse(&mut &self.peek_buf[..total])
            .context("stream settings header")?;
        self.check_permit_key(&header)?;
        Ok(Some(header))
    }

    fn check_permit_key(&self, header: &ClientHeader) -> anyhow::Result<()> {
        match (&self.settings.permit_key, &header.permit_key) {
            (None, None) => Ok(()),
            (None, Some(_)) => bail!("peer sent a permit key but none is configured"),
            (Some(_), None) => bail!("permit key required"),
            (Some(expected), Some(sent)) => {
                if expected != sent {
                    bail!("permit key mismatch");
                }
                Ok(())
            }
        }
    }
}

/// Reverse / full-duplex transmit settings for the listener side, shaped by the client's
///  announced test parameters.
fn paired_client_settings(server: &FlowSettings, header: Option<&ClientHeader>) -> FlowSettings {
    let mut settings = server.clone();
    settings.role = Role::ServerReverse;
    if let Some(header) = header {
        settings.mode = header.mode();
        if header.buf_len > 0 {
            settings.buf_len = header.buf_len as usize;
        }
        settings.rate = header.win_band as u64;
    }
    settings
}

/// Ack the settings header: Nagle off for the one write so the client is not left
///  waiting a full segment timer for 20 bytes, then back on.
async fn send_settings_ack(server: &FlowSettings, stream: &mut TcpStream) {
    let derived = server
        .report_interval
        .map(|i| i / 4)
        .or_else(|| server.duration().map(|d| d / 4))
        .unwrap_or(HDR_ACK_TIMEOUT_MAX);
    let send_timeout = derived
        .min(TEST_EXCHANGE_TIMEOUT)
        .clamp(HDR_ACK_TIMEOUT_MIN, HDR_ACK_TIMEOUT_MAX);

    let mut buf = BytesMut::with_capacity(crate::wire::HEADER_ACK_LEN);
    HeaderAck::ours().ser(&mut buf);
    if let Err(e) = stream.set_nodelay(true) {
        warn!("nodelay for ack failed: {}", e);
    }
    match timeout(send_timeout, stream.write_all(&buf)).await {
        Ok(Ok(())) => debug!("settings ack sent"),
        Ok(Err(e)) => warn!("settings ack failed: {}", e),
        Err(_) => warn!("settings ack timed out"),
    }
    let _ = stream.set_nodelay(false);
}

/// Peek until `buf` is full without consuming, bounded by `deadline`. Data accumulates
///  in the receive queue between attempts.
async fn peek_exact(stream: &TcpStream, buf: &mut [u8], deadline: Instant) -> io::Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let n = match timeout(remaining, stream.peek(buf)).await {
            Ok(res) => res?,
            Err(_) => return Err(io::Error::from(io::ErrorKind::TimedOut)),
        };
        if n >= buf.len() {
            return Ok(());
        }
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

/// Datagram listen sockets are recreated on the same port after every soft accept, so
///  address reuse has to be set before the bind.
fn bind_datagram(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into()).context("binding datagram listener")?;
    sock.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(sock.into())?)
}
