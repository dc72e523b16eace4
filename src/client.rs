//! The client engine: connect, first-message settings exchange, one of six transmit
//!  loops, and the protocol-specific teardown handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::barrier::StartBarrier;
use crate::config::{BurstMode, DurationOrAmount, FlowSettings, Protocol, RateUnits};
use crate::context::EngineContext;
use crate::flow_table::FlowKey;
use crate::records::{FullDuplexReport, GroupSumReport, PacketRecord, RecordProducer, WriteStatus};
use crate::timing::clock::{precise_sleep, sleep_until_wall, Timestamp};
use crate::timing::frame_counter::FrameCounter;
use crate::timing::pacer::{RunningDelayPacer, ISOCH_SLEEP_THRESHOLD, UNRATED_SLEEP_THRESHOLD};
use crate::timing::pdf::{lognormal, VaryingRate};
use crate::timing::token_bucket::{TokenBucket, TOKEN_FILL_RETRY};
use crate::wire::{
    ClientHeader, DatagramHeader, HeaderAck, IsochPayload, ServerReport, StreamBurstHeader,
    DEFAULT_BURST_IPG_MICROS, ISOCH_PAYLOAD_LEN, STREAM_BURST_HEADER_LEN,
};

/// Send/receive timeout for the first-message exchange, before the per-flow timers are
///  derived from interval or duration.
const TEST_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(4);
const CONNECT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
/// Reverse datagram flows retry the first payload this many times before giving up on
///  provoking the server into transmitting.
const FIRST_PAYLOAD_RESENDS: u32 = 100;
/// Floor for the stream teardown's wait on the server's close.
const MIN_AWAIT_CLOSE: Duration = Duration::from_secs(2);
const FIN_RETRY_GRANULARITY: Duration = Duration::from_millis(10);
/// Two seconds worth of FIN retries.
const FIN_RETRY_COUNT: u32 = 200;
const MAX_DATAGRAM_READ: usize = 2048;

/// A connected transmit endpoint. Full-duplex pairs run on split halves of one stream so
///  the paired receive loop owns the read side.
pub enum FlowSocket {
    Stream(TcpStream),
    StreamTx(OwnedWriteHalf),
    Datagram(Arc<UdpSocket>),
}
impl FlowSocket {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FlowSocket::Stream(s) => s.write(buf).await,
            FlowSocket::StreamTx(s) => s.write(buf).await,
            FlowSocket::Datagram(s) => s.send(buf).await,
        }
    }

    async fn write_timeout(&mut self, buf: &[u8], dur: Duration) -> io::Result<usize> {
        match timeout(dur, self.write(buf)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    /// Write the whole buffer or fail; burst headers must not tear.
    async fn write_all_timeout(&mut self, buf: &[u8], dur: Duration) -> io::Result<usize> {
        let fut = async {
            match self {
                FlowSocket::Stream(s) => s.write_all(buf).await,
                FlowSocket::StreamTx(s) => s.write_all(buf).await,
                FlowSocket::Datagram(s) => s.send(buf).await.map(|_| ()),
            }
        };
        match timeout(dur, fut).await {
            Ok(Ok(())) => Ok(buf.len()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FlowSocket::Stream(s) => s.read(buf).await,
            FlowSocket::StreamTx(_) => Err(io::Error::from(io::ErrorKind::Unsupported)),
            FlowSocket::Datagram(s) => s.recv(buf).await,
        }
    }

    async fn read_timeout(&mut self, buf: &mut [u8], dur: Duration) -> io::Result<usize> {
        match timeout(dur, self.read(buf)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    /// Wait for write-readiness; `false` on timeout.
    async fn writable_timeout(&self, dur: Duration) -> io::Result<bool> {
        let ready = match self {
            FlowSocket::Stream(s) => timeout(dur, s.writable()).await,
            FlowSocket::StreamTx(s) => timeout(dur, s.as_ref().writable()).await,
            FlowSocket::Datagram(s) => timeout(dur, s.writable()).await,
        };
        match ready {
            Ok(res) => res.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    async fn readable_timeout(&self, dur: Duration) -> io::Result<bool> {
        let ready = match self {
            FlowSocket::Stream(s) => timeout(dur, s.readable()).await,
            FlowSocket::StreamTx(_) => return Err(io::Error::from(io::ErrorKind::Unsupported)),
            FlowSocket::Datagram(s) => timeout(dur, s.readable()).await,
        };
        match ready {
            Ok(res) => res.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    async fn shutdown_write(&mut self) -> io::Result<()> {
        match self {
            FlowSocket::Stream(s) => s.shutdown().await,
            FlowSocket::StreamTx(s) => s.shutdown().await,
            FlowSocket::Datagram(_) => Ok(()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            FlowSocket::Stream(s) => s.local_addr(),
            FlowSocket::StreamTx(s) => s.local_addr(),
            FlowSocket::Datagram(s) => s.local_addr(),
        }
    }

    /// Smoothed RTT from the kernel, for near-congestion pacing.
    #[cfg(target_os = "linux")]
    fn tcp_rtt_micros(&self) -> Option<u32> {
        use std::os::unix::io::AsRawFd;
        let fd = match self {
            FlowSocket::Stream(s) => s.as_raw_fd(),
            FlowSocket::StreamTx(s) => s.as_ref().as_raw_fd(),
            FlowSocket::Datagram(_) => return None,
        };
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == 0 {
            Some(info.tcpi_rtt)
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn tcp_rtt_micros(&self) -> Option<u32> {
        None
    }
}

/// What a finished flow hands back to its caller.
#[derive(Debug, Default, Clone)]
pub struct ClientSummary {
    pub total_bytes: u64,
    pub start_time: Timestamp,
    pub connect_time: Option<Duration>,
    pub peer_version: Option<(u32, u32)>,
    pub server_report: Option<ServerReport>,
}

pub struct ClientFlow {
    settings: FlowSettings,
    ctx: Arc<EngineContext>,
    records: RecordProducer,
    socket: Option<FlowSocket>,

    buf: Vec<u8>,
    packet_id: i64,
    total_sent: u64,
    amount_remaining: u64,
    end_time: Option<Instant>,
    start_time: Timestamp,
    prev_packet_time: Timestamp,
    last_packet_time: Timestamp,
    peer_close: bool,
    connect_time: Option<Duration>,
    frame_counter: Option<FrameCounter>,
    send_timeout: Duration,
    one_report: bool,
    udp_payload_minimum: usize,
    apply_first_datagram_delay: bool,
    server_report: Option<ServerReport>,
    flow_key: Option<FlowKey>,

    group: Option<Arc<GroupSumReport>>,
    full_duplex: Option<Arc<FullDuplexReport>>,
    start_barrier: Option<Arc<StartBarrier>>,
}

impl ClientFlow {
    pub fn new(
        settings: FlowSettings,
        ctx: Arc<EngineContext>,
        records: RecordProducer,
    ) -> anyhow::Result<ClientFlow> {
        settings.validate()?;
        Ok(Self::build(settings, ctx, records, None))
    }

    /// A reverse-direction client running on the listener side over an already accepted
    ///  socket; there is no connect and no first-message send of its own unless trip
    ///  times or periodic bursts need one.
    pub fn from_accepted(
        settings: FlowSettings,
        ctx: Arc<EngineContext>,
        records: RecordProducer,
        socket: FlowSocket,
    ) -> ClientFlow {
        Self::build(settings, ctx, records, Some(socket))
    }

    fn build(
        settings: FlowSettings,
        ctx: Arc<EngineContext>,
        records: RecordProducer,
        socket: Option<FlowSocket>,
    ) -> ClientFlow {
        let alloc = settings.payload_alloc_len();
        let mut buf = vec![0u8; alloc];
        fill_pattern(&mut buf);
        let amount_remaining = match settings.mode {
            DurationOrAmount::Amount(a) => a,
            DurationOrAmount::Time(_) => 0,
        };
        ClientFlow {
            settings,
            ctx,
            records,
            socket,
            buf,
            packet_id: 1,
            total_sent: 0,
            amount_remaining,
            end_time: None,
            start_time: Timestamp::now(),
            prev_packet_time: Timestamp::now(),
            last_packet_time: Timestamp::now(),
            peer_close: false,
            connect_time: None,
            frame_counter: None,
            send_timeout: TEST_EXCHANGE_TIMEOUT,
            one_report: false,
            udp_payload_minimum: 1,
            apply_first_datagram_delay: false,
            server_report: None,
            flow_key: None,
            group: None,
            full_duplex: None,
            start_barrier: None,
        }
    }

    pub fn attach_group(&mut self, group: Arc<GroupSumReport>) {
        self.group = Some(group);
    }

    pub fn attach_full_duplex(&mut self, report: Arc<FullDuplexReport>) {
        self.full_duplex = Some(report);
    }

    pub fn attach_start_barrier(&mut self, barrier: Arc<StartBarrier>) {
        self.start_barrier = Some(barrier);
    }

    pub async fn run(mut self) -> anyhow::Result<ClientSummary> {
        let _guard = self.ctx.traffic_task_guard();

        if self.settings.connect_only.is_some() {
            self.connect_periodic().await;
            return Ok(self.summary());
        }
        if self.socket.is_none() {
            self.connect().await?;
        }
        self.start_synch().await?;
        self.init_traffic_loop();

        if self.settings.is_datagram() {
            if self.settings.burst.is_isochronous() {
                self.run_datagram_isochronous().await;
            } else {
                self.run_datagram().await;
            }
        } else if self.settings.rate > 0 {
            self.run_stream_rate_limited().await;
        } else if self.settings.near_congest_divider.is_some() {
            self.run_stream_near_congestion().await;
        } else if self.settings.flags.write_prefetch {
            self.run_stream_write_events().await;
        } else {
            self.run_stream().await;
        }

        self.finish().await;
        Ok(self.summary())
    }

    fn summary(&self) -> ClientSummary {
        ClientSummary {
            total_bytes: self.total_sent,
            start_time: self.start_time,
            connect_time: self.connect_time,
            peer_version: self.settings.peer_version,
            server_report: self.server_report,
        }
    }

    /// Create and connect the flow's socket. Stream connects retry with a fixed backoff
    ///  and are timed; datagram sockets connect so the send path and the kernel's
    ///  demultiplexing are both per-peer.
    async fn connect(&mut self) -> anyhow::Result<()> {
        let peer = self.settings.peer_addr;
        match self.settings.protocol {
            Protocol::Stream => {
                let mut attempts = self.settings.connect_retries + 1;
                loop {
                    let sock = if peer.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    if let Some(local) = self.settings.local_addr {
                        sock.bind(local).context("binding local address")?;
                    }
                    let started = Instant::now();
                    match timeout(TEST_EXCHANGE_TIMEOUT, sock.connect(peer)).await {
                        Ok(Ok(stream)) => {
                            self.connect_time = Some(started.elapsed());
                            self.socket = Some(FlowSocket::Stream(stream));
                            break;
                        }
                        Ok(Err(e)) => {
                            attempts -= 1;
                            if attempts == 0 {
                                return Err(e).context(format!("stream connect to {}", peer));
                            }
                            warn!("connect to {} failed ({}), retrying", peer, e);
                            precise_sleep(CONNECT_RETRY_BACKOFF).await;
                        }
                        Err(_) => {
                            attempts -= 1;
                            if attempts == 0 {
                                bail!("stream connect to {} timed out", peer);
                            }
                            precise_sleep(CONNECT_RETRY_BACKOFF).await;
                        }
                    }
                }
            }
            Protocol::Datagram => {
                let local = self.settings.local_addr.unwrap_or_else(|| {
                    if peer.is_ipv4() {
                        "0.0.0.0:0".parse().expect("unspecified v4 addr")
                    } else {
                        "[::]:0".parse().expect("unspecified v6 addr")
                    }
                });
                let sock = UdpSocket::bind(local).await.context("binding datagram socket")?;
                sock.connect(peer).await.context("associating datagram peer")?;
                self.connect_time = Some(Duration::ZERO); // no handshake to time
                self.socket = Some(FlowSocket::Datagram(Arc::new(sock)));
            }
        }

        let socket = self.socket.as_ref().expect("socket just connected");
        let key = FlowKey {
            local: socket.local_addr()?,
            peer,
            protocol: self.settings.protocol,
        };
        self.ctx.flow_table.push(key);
        self.flow_key = Some(key);
        info!(
            local = %key.local,
            peer = %key.peer,
            connect_time = ?self.connect_time,
            "client connected"
        );
        Ok(())
    }

    /// Connect-only operation: time handshakes on a cadence instead of moving data.
    async fn connect_periodic(&mut self) {
        let connect_only = self.settings.connect_only.expect("connect-only settings");
        let end = self
            .settings
            .duration()
            .map(|d| Instant::now() + d);
        let mut remaining = match connect_only.count {
            Some(0) => None, // zero means "until the duration elapses"
            Some(n) => Some(n),
            // without an interval a bounded default stops a runaway loop
            None if connect_only.interval.is_none() => Some(10),
            None => None,
        };
        let mut next = Instant::now();
        loop {
            if self.ctx.is_interrupted() {
                break;
            }
            match self.connect().await {
                Ok(()) => {
                    if let Some(key) = self.flow_key.take() {
                        self.ctx.flow_table.remove(&key);
                    }
                    self.socket = None;
                }
                Err(e) => warn!("periodic connect failed: {:#}", e),
            }
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
                if *n == 0 {
                    break;
                }
            }
            if let Some(interval) = connect_only.interval {
                let now = Instant::now();
                while next <= now {
                    next += interval;
                }
                if let Some(end) = end {
                    if next >= end {
                        break;
                    }
                }
                tokio::time::sleep_until(next).await;
            } else if let Some(end) = end {
                if Instant::now() >= end {
                    break;
                }
            }
        }
    }

    /// Compose the settings header and push it onto the wire. Datagram flows carry it in
    ///  a full-size first packet so the server's accounting sees a representative
    ///  payload; stream flows send exactly the header.
    async fn send_first_payload(&mut self) -> anyhow::Result<usize> {
        let stamp = self
            .settings
            .tx_epoch_start
            .unwrap_or_else(Timestamp::now);
        let header = ClientHeader::from_settings(&self.settings, stamp);
        let header_len = header.wire_len();

        let written = if self.settings.is_datagram() {
            let dgram_len = DatagramHeader::wire_len(true);
            let total = (dgram_len + header_len).max(self.settings.buf_len);
            {
                let mut slice = &mut self.buf[..dgram_len];
                // the first message always carries the 64-bit layout so the receiver can
                // parse it before any flags are known
                DatagramHeader {
                    id: self.packet_id,
                    timestamp: Timestamp::now(),
                }
                .ser(true, &mut slice);
            }
            {
                let mut slice = &mut self.buf[dgram_len..dgram_len + header_len];
                header.ser(&mut slice);
            }
            self.udp_payload_minimum = dgram_len + header_len;
            self.apply_first_datagram_delay = true;
            self.socket
                .as_mut()
                .expect("socket connected before first payload")
                .write_timeout(&self.buf[..total], TEST_EXCHANGE_TIMEOUT)
                .await?
        } else {
            {
                let mut slice = &mut self.buf[..header_len];
                header.ser(&mut slice);
            }
            let n = self
                .socket
                .as_mut()
                .expect("socket connected before first payload")
                .write_all_timeout(&self.buf[..header_len], TEST_EXCHANGE_TIMEOUT)
                .await?;
            if self.settings.flags.peer_version_detect && !self.settings.is_server_reverse() {
                self.peer_exchange().await;
            }
            n
        };
        // the header bytes were overwritten, restore the payload pattern
        fill_pattern(&mut self.buf);
        trace!("sent first payload of {} bytes", written);
        Ok(written)
    }

    /// Hang a read for the server's 20-byte ack and learn the peer version from it.
    async fn peer_exchange(&mut self) {
        let mut raw = [0u8; crate::wire::HEADER_ACK_LEN];
        let sock = self.socket.as_mut().expect("socket connected for peer exchange");
        let read = async {
            let mut filled = 0;
            while filled < raw.len() {
                match sock.read(&mut raw[filled..]).await {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                    Ok(n) => filled += n,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };
        let result = timeout(TEST_EXCHANGE_TIMEOUT, read).await;
        match result {
            Ok(Ok(())) => match HeaderAck::parse(&mut &raw[..]) {
                Ok(ack) => {
                    debug!(version_u = ack.version_u, version_l = ack.version_l, "peer version");
                    self.settings.peer_version = Some((ack.version_u, ack.version_l));
                }
                Err(e) => warn!("malformed header ack: {:#}", e),
            },
            Ok(Err(e)) => warn!("peer version exchange read failed: {}", e),
            Err(_) => warn!("peer version exchange timed out"),
        }
    }

    /// Start-of-test synchronisation: first payload (with the reverse-datagram resend
    ///  dance), transmit-start delays, frame schedule, and the full-duplex barrier.
    async fn start_synch(&mut self) -> anyhow::Result<()> {
        let mut first_len = 0usize;
        if !self.settings.is_server_reverse() {
            if !self.settings.flags.compat {
                first_len = self.send_first_payload().await?;
                if self.settings.flags.reverse && self.settings.is_datagram() {
                    first_len = 0;
                    let mut resend = FIRST_PAYLOAD_RESENDS;
                    while resend > 0 {
                        resend -= 1;
                        let gap = Duration::from_micros(rand::thread_rng().gen_range(0..20_000));
                        let ready = self
                            .socket
                            .as_ref()
                            .expect("socket connected")
                            .readable_timeout(gap)
                            .await;
                        match ready {
                            Ok(true) => break,
                            Ok(false) => {
                                self.send_first_payload().await?;
                            }
                            Err(e) => {
                                warn!("reverse first payload wait failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            if let Some(epoch) = self.settings.tx_epoch_start {
                sleep_until_wall(epoch).await;
            } else if let Some(holdback) = self.settings.tx_holdback {
                precise_sleep(holdback).await;
            }
        } else if self.settings.flags.trip_time || self.settings.burst.is_periodic() {
            first_len = self.send_first_payload().await?;
        }

        if let Some(fps) = self.settings.burst.fps() {
            self.frame_counter = Some(match self.settings.tx_epoch_start {
                Some(epoch) => FrameCounter::with_epoch_start(fps, epoch),
                None => FrameCounter::new(fps),
            });
        }

        if let Some(barrier) = &self.start_barrier {
            barrier.wait().await;
        }
        // both directions of a full-duplex pair rendezvous here, whichever side of the
        // connection they run on
        if let Some(fd) = &self.full_duplex {
            fd.barrier.wait().await;
        }

        self.start_time = Timestamp::now();
        self.prev_packet_time = self.start_time;
        self.last_packet_time = self.start_time;
        if let Some(group) = &self.group {
            group.start_time.set_once(self.start_time);
        }
        if let Some(fd) = &self.full_duplex {
            fd.start_time.set_once(self.start_time);
        }

        if first_len > 0 {
            let record = PacketRecord {
                packet_id: self.packet_id,
                packet_len: first_len,
                packet_time: self.start_time,
                sent_time: self.start_time,
                prev_sent_time: self.start_time,
                ..PacketRecord::default()
            };
            self.report_packet(record).await;
            self.packet_id += 1;
        }
        Ok(())
    }

    /// Derive the per-flow send timeout and reporting shape before entering a loop.
    fn init_traffic_loop(&mut self) {
        self.send_timeout = match (&self.settings.burst, self.settings.report_interval) {
            (BurstMode::Periodic { fps, .. }, _) if *fps > 0.0 => {
                Duration::from_secs_f64(0.25 / fps)
            }
            (_, Some(interval)) => interval / 2,
            _ => self
                .settings
                .duration()
                .map(|d| d / 2)
                .unwrap_or(TEST_EXCHANGE_TIMEOUT),
        };
        if let Some(duration) = self.settings.duration() {
            self.end_time = Some(Instant::now() + duration);
        }
        self.one_report = self.settings.is_stream()
            && self.settings.report_interval.is_none()
            && self.settings.burst == BurstMode::None
            && !self.settings.flags.trip_time
            && !self.settings.flags.reverse;
        debug!(
            send_timeout = ?self.send_timeout,
            one_report = self.one_report,
            "traffic loop starting"
        );
    }

    fn in_progress(&self) -> bool {
        if self.ctx.is_interrupted() || self.peer_close {
            return false;
        }
        match self.settings.mode {
            DurationOrAmount::Time(_) => self
                .end_time
                .map(|end| Instant::now() < end)
                .unwrap_or(true),
            DurationOrAmount::Amount(_) => self.amount_remaining > 0,
        }
    }

    async fn report_packet(&mut self, mut record: PacketRecord) {
        record.prev_packet_time = self.prev_packet_time;
        let packet_time = record.packet_time;
        let empty = record.empty_report;
        self.records.push(record).await;
        if !empty {
            self.prev_packet_time = packet_time;
        }
    }

    async fn post_null_event(&mut self) {
        let record = PacketRecord::null_event(Timestamp::now());
        self.records.push(record).await;
    }

    fn consume_amount(&mut self, n: usize) {
        if matches!(self.settings.mode, DurationOrAmount::Amount(_)) {
            self.amount_remaining = self.amount_remaining.saturating_sub(n as u64);
        }
    }

    /// Clamp a wish to the remaining byte amount.
    fn next_write_len(&self, wish: usize) -> usize {
        match self.settings.mode {
            DurationOrAmount::Amount(_) => wish.min(self.amount_remaining as usize).max(1),
            DurationOrAmount::Time(_) => wish,
        }
    }

    fn is_stream_burst(&self) -> bool {
        self.settings.burst != BurstMode::None
            || (self.settings.flags.trip_time && self.settings.is_stream())
    }

    fn next_burst_len(&self) -> usize {
        let burst = match self.settings.burst {
            BurstMode::Isochronous { fps, mean, variance } => {
                (lognormal(mean, variance) / (fps * 8.0)) as usize
            }
            BurstMode::Periodic { size, .. } => size as usize,
            BurstMode::None => self.settings.buf_len,
        };
        burst.max(STREAM_BURST_HEADER_LEN)
    }

    /// Stamp a stream burst header at the front of the payload. Packet ids advance by
    ///  the burst size here so the receiver sees contiguous ranges.
    fn stamp_burst_header(&mut self, burst_len: usize, burst_id: u32, write_time: Timestamp) {
        self.packet_id += burst_len as i64;
        let header = StreamBurstHeader {
            start_time: self.start_time,
            packet_id: self.packet_id,
            write_time,
            burst_id,
            burst_size: burst_len as u32,
            burst_period_micros: self
                .frame_counter
                .as_ref()
                .map(|f| f.period_micros())
                .unwrap_or(0),
        };
        let mut slice = &mut self.buf[..STREAM_BURST_HEADER_LEN];
        header.ser(&mut slice);
    }

    fn stamp_datagram_header(&mut self, id: i64, ts: Timestamp) {
        let len = DatagramHeader::wire_len(self.settings.flags.seqno_64bit);
        let mut slice = &mut self.buf[..len];
        DatagramHeader { id, timestamp: ts }.ser(self.settings.flags.seqno_64bit, &mut slice);
    }

    /// Unrated stream loop: the kernel paces, we account.
    async fn run_stream(&mut self) {
        let mut burst_remaining = 0usize;
        let mut burst_id: u32 = 1;
        let isburst = self.is_stream_burst();

        while self.in_progress() {
            let mut record = PacketRecord::default();
            let n;
            if isburst && burst_remaining == 0 {
                burst_remaining = self.next_burst_len();
                if let Some(counter) = self.frame_counter.as_mut() {
                    burst_id = counter.wait_tick().await as u32;
                    if self.settings.burst.is_periodic() {
                        // the wait may have crossed the termination boundary, and any
                        // interval crossings during it need the ring flushed
                        if !self.in_progress() {
                            self.report_packet(PacketRecord::null_event(Timestamp::now())).await;
                            break;
                        }
                        self.post_null_event().await;
                    }
                }
                let packet_time = Timestamp::now();
                self.stamp_burst_header(burst_remaining, burst_id, packet_time);
                burst_id = burst_id.wrapping_add(1);
                record.packet_time = packet_time;
                record.sent_time = packet_time;
                record.frame_id = burst_id as u64 - 1;
                record.burst_size = burst_remaining as u32;
                let writelen = self.next_write_len(self.settings.buf_len.min(burst_remaining));
                // a torn burst header would desynchronize the receiver for good
                n = self
                    .socket
                    .as_mut()
                    .expect("socket connected in traffic loop")
                    .write_all_timeout(&self.buf[..writelen], self.send_timeout)
                    .await;
            } else {
                let wish = if isburst {
                    self.settings.buf_len.min(burst_remaining)
                } else {
                    self.settings.buf_len
                };
                let writelen = self.next_write_len(wish);
                n = self
                    .socket
                    .as_mut()
                    .expect("socket connected in traffic loop")
                    .write_timeout(&self.buf[..writelen], self.send_timeout)
                    .await;
                let packet_time = Timestamp::now();
                record.packet_time = packet_time;
                record.sent_time = packet_time;
            }

            match n {
                Ok(0) => {
                    self.peer_close = true;
                    record.empty_report = true;
                    self.report_packet(record).await;
                    continue;
                }
                Ok(written) => {
                    record.packet_len = written;
                    self.total_sent += written as u64;
                    if isburst {
                        burst_remaining = burst_remaining.saturating_sub(written);
                        record.transit_ready = burst_remaining == 0;
                    }
                    self.consume_amount(written);
                }
                Err(e) => {
                    let status = WriteStatus::classify(&e);
                    if status.is_fatal() {
                        warn!("stream write failed: {}", e);
                        break;
                    }
                    record.status = status;
                    record.empty_report = true;
                }
            }
            if !self.one_report {
                self.report_packet(record).await;
            }
        }
    }

    /// Token-bucket limited stream loop.
    async fn run_stream_rate_limited(&mut self) {
        let mut bucket = TokenBucket::new();
        let mut vary = self
            .settings
            .flags
            .vary_load
            .then(|| VaryingRate::new(self.settings.rate as f64, self.settings.rate_variance));
        let mut last_refill = Instant::now();
        let mut burst_remaining = 0usize;
        let mut burst_id: u32 = 1;
        let stamp_bursts = self.settings.flags.trip_time;

        while self.in_progress() {
            let now = Instant::now();
            let rate = vary
                .as_mut()
                .map(|v| v.current(now))
                .unwrap_or(self.settings.rate as f64);
            bucket.refill(now - last_refill, rate);
            last_refill = now;
            if !bucket.ready() {
                precise_sleep(TOKEN_FILL_RETRY).await;
                continue;
            }

            let mut record = PacketRecord::default();
            let mut writelen = self.next_write_len(self.settings.buf_len);
            let packet_time = Timestamp::now();
            if stamp_bursts {
                if burst_remaining == 0 {
                    burst_remaining = self.settings.buf_len.max(STREAM_BURST_HEADER_LEN);
                    self.stamp_burst_header(burst_remaining, burst_id, packet_time);
                    record.burst_size = burst_remaining as u32;
                    record.frame_id = burst_id as u64;
                    burst_id = burst_id.wrapping_add(1);
                }
                writelen = writelen.min(burst_remaining);
            }
            record.packet_time = packet_time;
            record.sent_time = packet_time;

            let wrote = self
                .socket
                .as_mut()
                .expect("socket connected in traffic loop")
                .write_timeout(&self.buf[..writelen], self.send_timeout)
                .await;
            match wrote {
                Ok(0) => {
                    self.peer_close = true;
                    record.empty_report = true;
                }
                Ok(written) => {
                    bucket.consume(written);
                    self.total_sent += written as u64;
                    record.packet_len = written;
                    if stamp_bursts {
                        burst_remaining = burst_remaining.saturating_sub(written);
                        record.transit_ready = burst_remaining == 0;
                    }
                    self.consume_amount(written);
                }
                Err(e) => {
                    let status = WriteStatus::classify(&e);
                    if status.is_fatal() {
                        warn!("rate-limited stream write failed: {}", e);
                        break;
                    }
                    record.status = status;
                    record.empty_report = true;
                }
            }
            if !self.one_report {
                self.report_packet(record).await;
            }
        }
    }

    /// Keep the socket just below congestion: after each completed burst, sleep a
    ///  fraction of the kernel's current RTT estimate.
    async fn run_stream_near_congestion(&mut self) {
        let divider = self
            .settings
            .near_congest_divider
            .expect("near-congestion divider checked by caller");
        let mut burst_remaining = 0usize;
        let mut burst_id: u32 = 1;

        while self.in_progress() {
            let mut record = PacketRecord::default();
            let n;
            if burst_remaining == 0 {
                burst_remaining = self.settings.buf_len.max(STREAM_BURST_HEADER_LEN);
                let packet_time = Timestamp::now();
                self.stamp_burst_header(burst_remaining, burst_id, packet_time);
                record.burst_size = burst_remaining as u32;
                record.frame_id = burst_id as u64;
                burst_id = burst_id.wrapping_add(1);
                record.packet_time = packet_time;
                record.sent_time = packet_time;
                let writelen = self.next_write_len(self.settings.buf_len.min(burst_remaining));
                n = self
                    .socket
                    .as_mut()
                    .expect("socket connected in traffic loop")
                    .write_all_timeout(&self.buf[..writelen], self.send_timeout)
                    .await;
            } else {
                let writelen = self.next_write_len(self.settings.buf_len.min(burst_remaining));
                n = self
                    .socket
                    .as_mut()
                    .expect("socket connected in traffic loop")
                    .write_timeout(&self.buf[..writelen], self.send_timeout)
                    .await;
                let packet_time = Timestamp::now();
                record.packet_time = packet_time;
                record.sent_time = packet_time;
            }

            match n {
                Ok(0) => {
                    self.peer_close = true;
                    record.empty_report = true;
                }
                Ok(written) => {
                    record.packet_len = written;
                    self.total_sent += written as u64;
                    burst_remaining = burst_remaining.saturating_sub(written);
                    record.transit_ready = burst_remaining == 0;
                    self.consume_amount(written);
                }
                Err(e) => {
                    let status = WriteStatus::classify(&e);
                    if status.is_fatal() {
                        warn!("near-congestion stream write failed: {}", e);
                        break;
                    }
                    record.status = status;
                    record.empty_report = true;
                }
            }

            // pace after the burst completes, scaled from the rtt sample in the record
            let pace = record.transit_ready;
            if pace {
                record.tcp_rtt_micros = self
                    .socket
                    .as_ref()
                    .expect("socket connected in traffic loop")
                    .tcp_rtt_micros();
            }
            let rtt = record.tcp_rtt_micros;
            self.report_packet(record).await;
            if pace {
                if let Some(rtt) = rtt {
                    let delay_micros = (rtt as f64 * divider).ceil() as u64;
                    precise_sleep(Duration::from_micros(delay_micros)).await;
                }
            }
        }
    }

    /// Write-event driven stream loop: transmit only when the socket reports writability,
    ///  so queueing stays in the application instead of the socket buffer.
    async fn run_stream_write_events(&mut self) {
        let event_timeout = match self.settings.mode {
            DurationOrAmount::Time(d) => self
                .settings
                .report_interval
                .map(|i| i * 2)
                .unwrap_or(d * 4),
            DurationOrAmount::Amount(_) => Duration::from_secs(10),
        };
        let mut burst_id: u32 = 0;

        while self.in_progress() {
            let writelen = self.next_write_len(self.settings.buf_len);
            let mut record = PacketRecord::default();
            record.packet_time = Timestamp::now();

            let writable = self
                .socket
                .as_ref()
                .expect("socket connected in traffic loop")
                .writable_timeout(event_timeout)
                .await;
            match writable {
                Ok(false) => {
                    debug!("write event timeout");
                    // no progress events left, treat the flow as gone
                    self.peer_close = true;
                    record.empty_report = true;
                }
                Err(e) => {
                    warn!("write readiness failed: {}", e);
                    break;
                }
                Ok(true) => {
                    let packet_time = Timestamp::now();
                    burst_id += 1;
                    self.stamp_burst_header(writelen, burst_id, packet_time);
                    record.packet_time = packet_time;
                    record.sent_time = packet_time;
                    record.burst_size = writelen as u32;
                    record.frame_id = burst_id as u64;
                    let wrote = self
                        .socket
                        .as_mut()
                        .expect("socket connected in traffic loop")
                        .write_all_timeout(&self.buf[..writelen], event_timeout)
                        .await;
                    match wrote {
                        Ok(written) => {
                            record.packet_len = written;
                            record.transit_ready = true;
                            self.total_sent += written as u64;
                            self.consume_amount(written);
                        }
                        Err(e) => {
                            let status = WriteStatus::classify(&e);
                            if status.is_fatal() {
                                warn!("write-events stream write failed: {}", e);
                                break;
                            }
                            record.status = status;
                            record.empty_report = true;
                        }
                    }
                }
            }
            if !self.one_report {
                self.report_packet(record).await;
            }
        }
    }

    fn datagram_delay_target(&self) -> Duration {
        if let Some(ipg) = self.settings.burst_ipg {
            return ipg;
        }
        if self.settings.rate == 0 {
            return Duration::ZERO;
        }
        match self.settings.rate_units {
            RateUnits::BitsPerSecond => Duration::from_nanos(
                (self.settings.buf_len as f64 * 8.0 * 1e9 / self.settings.rate as f64) as u64,
            ),
            RateUnits::PacketsPerSecond => {
                Duration::from_nanos((1e9 / self.settings.rate as f64) as u64)
            }
        }
    }

    /// Datagram loop with running-delay pacing.
    async fn run_datagram(&mut self) {
        let mut pacer =
            RunningDelayPacer::bounded(self.datagram_delay_target(), self.send_timeout);
        let mut vary = (self.settings.flags.vary_load
            && self.settings.rate_units == RateUnits::BitsPerSecond)
            .then(|| VaryingRate::new(self.settings.rate as f64, self.settings.rate_variance));
        let mut last_write_ok = true;

        if self.apply_first_datagram_delay && pacer.target() > Duration::from_micros(100) {
            // the first data packet follows the first payload by one gap
            precise_sleep(pacer.target()).await;
        }

        while self.in_progress() {
            let packet_time = Timestamp::now();
            let mut record = PacketRecord {
                packet_time,
                sent_time: packet_time,
                ..PacketRecord::default()
            };

            if let Some(vary) = vary.as_mut() {
                let rate = vary.current(Instant::now());
                if rate > 0.0 {
                    pacer.set_target(Duration::from_nanos(
                        (self.settings.buf_len as f64 * 8.0 * 1e9 / rate) as u64,
                    ));
                }
            }

            self.stamp_datagram_header(self.packet_id, packet_time);
            pacer.advance(packet_time.micros_since(self.last_packet_time), last_write_ok);
            self.last_packet_time = packet_time;

            let writelen = self.next_write_len(self.settings.buf_len);
            let wrote = self
                .socket
                .as_mut()
                .expect("socket connected in traffic loop")
                .write_timeout(&self.buf[..writelen], self.send_timeout)
                .await;
            match wrote {
                Ok(written) => {
                    last_write_ok = true;
                    self.total_sent += written as u64;
                    self.consume_amount(written);
                    record.packet_len = written;
                    record.packet_id = self.packet_id;
                    self.report_packet(record).await;
                    self.packet_id += 1;
                }
                Err(e) => {
                    last_write_ok = false;
                    let status = WriteStatus::classify(&e);
                    if status.is_fatal() {
                        warn!("datagram write failed: {}", e);
                        break;
                    }
                    // the id was never delivered, reuse it for the next datagram
                    record.status = status;
                    record.empty_report = true;
                    record.packet_id = self.packet_id - 1;
                    self.report_packet(record).await;
                }
            }

            if let Some(sleep) = pacer.pending_sleep(UNRATED_SLEEP_THRESHOLD) {
                precise_sleep(sleep).await;
            }
        }
    }

    /// Isochronous datagram loop: the frame counter ticks the outer schedule, the
    ///  running-delay pacer spreads each burst's packets.
    async fn run_datagram_isochronous(&mut self) {
        let (fps, mean, variance) = match self.settings.burst {
            BurstMode::Isochronous { fps, mean, variance } => (fps, mean, variance),
            _ => return,
        };
        if self.frame_counter.is_none() {
            self.frame_counter = Some(FrameCounter::new(fps));
        }
        let burst_ipg = self
            .settings
            .burst_ipg
            .unwrap_or(Duration::from_micros(DEFAULT_BURST_IPG_MICROS));
        // the delay is never reset between frames; a late frame catches up as fast as
        // the socket allows
        let mut pacer = RunningDelayPacer::unbounded(burst_ipg);
        let mut last_write_ok = true;
        let mut prev_frame_id: u64 = 0;

        let dgram_len = DatagramHeader::wire_len(self.settings.flags.seqno_64bit);
        let header_len = dgram_len + ISOCH_PAYLOAD_LEN;
        let min_payload = self.udp_payload_minimum.max(header_len);
        let burst_period_micros = self
            .frame_counter
            .as_ref()
            .map(|f| f.period_micros() as u32)
            .unwrap_or(0);
        let frame_start = self
            .frame_counter
            .as_ref()
            .map(|f| f.start_wall())
            .unwrap_or(self.start_time);

        while self.in_progress() {
            let mut burst_bytes = ((lognormal(mean, variance) / (fps * 8.0)) as usize)
                .max(min_payload);
            let mut frame_burst = burst_bytes as u32;
            let frame_id = self
                .frame_counter
                .as_mut()
                .expect("frame counter initialized above")
                .wait_tick()
                .await;
            // idle time between frames is schedule, not pacing debt
            self.last_packet_time = Timestamp::now();

            while burst_bytes > 0 && self.in_progress() {
                let packet_time = Timestamp::now();
                let mut record = PacketRecord {
                    packet_time,
                    sent_time: packet_time,
                    frame_id,
                    burst_size: frame_burst,
                    ..PacketRecord::default()
                };

                self.stamp_datagram_header(self.packet_id, packet_time);
                let remaining = match self.settings.mode {
                    DurationOrAmount::Amount(_)
                        if (self.amount_remaining as usize) < self.settings.buf_len =>
                    {
                        self.amount_remaining as usize
                    }
                    _ => burst_bytes,
                };
                {
                    let payload = IsochPayload {
                        burst_period_micros,
                        burst_size: frame_burst,
                        prev_frame_id: prev_frame_id as u32,
                        frame_id: frame_id as u32,
                        remaining: remaining as u32,
                        start_time: frame_start,
                    };
                    let mut slice = &mut self.buf[dgram_len..header_len];
                    payload.ser(&mut slice);
                }
                record.remaining = remaining as u64;

                pacer.advance(packet_time.micros_since(self.last_packet_time), last_write_ok);
                self.last_packet_time = packet_time;

                let writelen = self.next_write_len(burst_bytes.min(self.settings.buf_len));
                let wrote = self
                    .socket
                    .as_mut()
                    .expect("socket connected in traffic loop")
                    .write_timeout(&self.buf[..writelen], self.send_timeout)
                    .await;
                match wrote {
                    Ok(written) => {
                        last_write_ok = true;
                        self.total_sent += written as u64;
                        self.consume_amount(written);
                        burst_bytes = burst_bytes.saturating_sub(written);
                        record.transit_ready = burst_bytes == 0;
                        // keep the burst tail at least one minimum payload long
                        if burst_bytes > 0 && burst_bytes < min_payload {
                            burst_bytes = min_payload;
                            frame_burst = burst_bytes as u32;
                            record.burst_size = frame_burst;
                        }
                        record.packet_len = written;
                        record.packet_id = self.packet_id;
                        self.report_packet(record).await;
                        self.packet_id += 1;
                    }
                    Err(e) => {
                        last_write_ok = false;
                        let status = WriteStatus::classify(&e);
                        if status.is_fatal() {
                            warn!("isochronous datagram write failed: {}", e);
                            return;
                        }
                        record.status = status;
                        record.empty_report = true;
                        record.packet_id = self.packet_id - 1;
                        self.report_packet(record).await;
                    }
                }

                if let Some(sleep) = pacer.pending_sleep(ISOCH_SLEEP_THRESHOLD) {
                    precise_sleep(sleep).await;
                }
            }
            prev_frame_id = frame_id;
        }
    }

    /// Teardown: stream flows half-close and wait for the server to finish; datagram
    ///  flows run the negated-id FIN handshake.
    async fn finish(&mut self) {
        if self.settings.is_stream() {
            if let Some(sock) = self.socket.as_mut() {
                if let Err(e) = sock.shutdown_write().await {
                    warn!("stream shutdown failed: {}", e);
                } else if !self.settings.flags.full_duplex {
                    self.await_server_close().await;
                }
            }
            if self.one_report {
                // the whole transfer reported as one record
                let now = Timestamp::now();
                let record = PacketRecord {
                    packet_id: self.packet_id,
                    packet_len: self.total_sent as usize,
                    packet_time: now,
                    sent_time: now,
                    ..PacketRecord::default()
                };
                self.report_packet(record).await;
            }
        } else {
            self.send_final_datagram().await;
            if !self.settings.flags.no_udp_fin {
                self.await_server_fin().await;
            }
        }
        if let Some(key) = self.flow_key.take() {
            self.ctx.flow_table.remove(&key);
        }
        debug!(total = self.total_sent, "flow finished");
    }

    /// The negated sequence number tells the server this flow is terminating.
    async fn send_final_datagram(&mut self) {
        let now = Timestamp::now();
        self.stamp_datagram_header(-self.packet_id, now);
        let len = self.settings.buf_len.min(self.buf.len());
        let wrote = self
            .socket
            .as_mut()
            .expect("socket connected at teardown")
            .write_timeout(&self.buf[..len], self.send_timeout)
            .await;
        match wrote {
            Ok(written) => {
                let record = PacketRecord {
                    packet_id: -self.packet_id,
                    packet_len: written,
                    packet_time: now,
                    sent_time: now,
                    ..PacketRecord::default()
                };
                self.report_packet(record).await;
            }
            Err(e) => warn!("final datagram failed: {}", e),
        }
    }

    /// Wait for the server's closing report, retransmitting negated-id datagrams on a
    ///  10 ms cadence. Ids keep decreasing so retries cannot be mistaken for reordering.
    async fn await_server_fin(&mut self) {
        let mut raw = [0u8; MAX_DATAGRAM_READ];
        let dgram_len = DatagramHeader::wire_len(self.settings.flags.seqno_64bit);
        for _ in 0..FIN_RETRY_COUNT {
            if self.ctx.is_interrupted() {
                break;
            }
            let read = self
                .socket
                .as_mut()
                .expect("socket connected at teardown")
                .read_timeout(&mut raw, FIN_RETRY_GRANULARITY)
                .await;
            match read {
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    self.packet_id += 1;
                    let now = Timestamp::now();
                    self.stamp_datagram_header(-self.packet_id, now);
                    let len = self.settings.buf_len.min(self.buf.len());
                    if let Err(e) = self
                        .socket
                        .as_mut()
                        .expect("socket connected at teardown")
                        .write(&self.buf[..len])
                        .await
                    {
                        warn!("fin retransmit failed: {}", e);
                    }
                }
                Err(e) => {
                    warn!("fin wait read failed: {}", e);
                    return;
                }
                Ok(n) => {
                    // a straggling settings ack from the start of the test
                    if HeaderAck::matches(&raw[..n]) {
                        continue;
                    }
                    if n > dgram_len {
                        let mut body = &raw[dgram_len..n];
                        match ServerReport::parse(&mut body) {
                            Ok(report) => {
                                info!(
                                    total = report.total_len,
                                    datagrams = report.datagrams,
                                    errors = report.error_count,
                                    "server relay report"
                                );
                                self.server_report = Some(report);
                                return;
                            }
                            Err(e) => trace!("not a server report: {:#}", e),
                        }
                    }
                }
            }
        }
        warn!("no server fin report received within the retry budget");
    }

    /// Read until the server closes its half of the connection; its zero-length read is
    ///  the true end of the test from the network's perspective.
    async fn await_server_close(&mut self) {
        self.post_null_event().await;
        let wait = self
            .settings
            .duration()
            .unwrap_or(MIN_AWAIT_CLOSE)
            .max(MIN_AWAIT_CLOSE);
        let deadline = Instant::now() + wait;
        let mut raw = [0u8; 4096];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("server close wait timed out");
                return;
            }
            match self
                .socket
                .as_mut()
                .expect("socket connected at teardown")
                .read_timeout(&mut raw, remaining)
                .await
            {
                Ok(0) => {
                    debug!("server closed the connection");
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    if e.kind() != io::ErrorKind::TimedOut {
                        warn!("server close wait failed: {}", e);
                    }
                    return;
                }
            }
        }
    }
}

/// Deterministic payload pattern, cyclic decimal digits; compressible the same way
///  between runs so compression middleboxes affect tests repeatably.
fn fill_pattern(buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = b'0' + (i % 10) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::records::record_ring;
    use crate::wire::MessageType;
    use bytes::BytesMut;
    use rstest::rstest;
    use tokio::net::TcpListener;

    fn test_settings(protocol: Protocol, peer: SocketAddr) -> FlowSettings {
        let mut settings = FlowSettings::new(protocol, Role::Client, peer);
        settings.buf_len = 8 * 1024;
        settings.mode = DurationOrAmount::Amount(64 * 1024);
        settings
    }

    async fn drain_stream_server(listener: TcpListener) -> u64 {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n as u64,
            }
        }
        total
    }

    #[rstest]
    fn test_fill_pattern_cycles() {
        let mut buf = [0u8; 25];
        fill_pattern(&mut buf);
        assert_eq!(&buf[..12], b"012345678901");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unrated_stream_amount_mode() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        let server = tokio::spawn(drain_stream_server(listener));

        let ctx = EngineContext::new();
        let (producer, mut consumer) = record_ring(1024);
        let settings = test_settings(Protocol::Stream, peer);
        let amount = match settings.mode {
            DurationOrAmount::Amount(a) => a,
            _ => unreachable!(),
        };
        let buf_len = settings.buf_len as u64;
        let flow = ClientFlow::new(settings, ctx.clone(), producer).unwrap();
        let summary = flow.run().await.unwrap();

        assert!(summary.total_bytes >= amount);
        assert!(summary.total_bytes < amount + buf_len);
        // flow removed itself from the table on teardown
        assert!(ctx.flow_table.is_empty());
        // one_report mode: a single closing record with the whole total
        let records = consumer.drain();
        let last = records.iter().rev().find(|r| !r.empty_report).unwrap();
        assert_eq!(last.packet_len as u64, summary.total_bytes);

        let received = server.await.unwrap();
        // server saw the first payload too
        assert!(received >= summary.total_bytes);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rate_limited_stream_records_monotonic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        let server = tokio::spawn(drain_stream_server(listener));

        let ctx = EngineContext::new();
        let (producer, mut consumer) = record_ring(4096);
        let mut settings = test_settings(Protocol::Stream, peer);
        settings.mode = DurationOrAmount::Amount(32 * 1024);
        settings.rate = 50_000_000; // fast enough that the test finishes promptly
        settings.flags.trip_time = false;
        let flow = ClientFlow::new(settings, ctx, producer).unwrap();
        let summary = flow.run().await.unwrap();
        assert!(summary.total_bytes >= 32 * 1024);
        server.await.unwrap();

        let records = consumer.drain();
        assert!(!records.is_empty());
        let mut prev_id = i64::MIN;
        for record in records.iter().filter(|r| !r.empty_report && r.packet_id > 0) {
            assert!(record.packet_id >= prev_id);
            prev_id = record.packet_id;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_datagram_flow_fin_handshake() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = server_sock.local_addr().unwrap();

        // fake server: count datagrams until the negated id, then send the relay report
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_READ];
            let mut datagrams = 0u32;
            loop {
                let (n, from) = server_sock.recv_from(&mut buf).await.unwrap();
                let header = DatagramHeader::parse(true, &mut &buf[..n]).unwrap();
                if header.id < 0 {
                    let mut reply = BytesMut::new();
                    DatagramHeader {
                        id: header.id,
                        timestamp: Timestamp::now(),
                    }
                    .ser(true, &mut reply);
                    ServerReport {
                        flags: 0,
                        total_len: 12345,
                        elapsed: Timestamp::from_parts(1, 0),
                        error_count: 0,
                        out_of_order: 0,
                        datagrams,
                        jitter_micros: 10,
                    }
                    .ser(&mut reply);
                    server_sock.send_to(&reply, from).await.unwrap();
                    return datagrams;
                }
                datagrams += 1;
            }
        });

        let ctx = EngineContext::new();
        let (producer, mut consumer) = record_ring(4096);
        let mut settings = test_settings(Protocol::Datagram, peer);
        settings.buf_len = 1470;
        settings.mode = DurationOrAmount::Amount(16 * 1470);
        settings.rate = 0; // unpaced, finish fast
        let flow = ClientFlow::new(settings, ctx, producer).unwrap();
        let summary = flow.run().await.unwrap();

        let report = summary.server_report.expect("server report received");
        assert_eq!(report.total_len, 12345);
        server.await.unwrap();

        // exactly one negated-id record, and it is the last non-empty one
        let records = consumer.drain();
        let finals: Vec<_> = records.iter().filter(|r| r.is_final()).collect();
        assert_eq!(finals.len(), 1);
        let last_real = records.iter().rev().find(|r| !r.empty_report).unwrap();
        assert!(last_real.is_final());
        // data records are strictly increasing
        let mut prev = 0i64;
        for record in records.iter().filter(|r| r.packet_id > 0 && !r.empty_report) {
            assert!(record.packet_id > prev, "{} after {}", record.packet_id, prev);
            prev = record.packet_id;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_datagram_isochronous_frame_ids() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = server_sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_READ];
            loop {
                if server_sock.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });

        let ctx = EngineContext::new();
        let (producer, mut consumer) = record_ring(8192);
        let mut settings = test_settings(Protocol::Datagram, peer);
        settings.buf_len = 1470;
        settings.mode = DurationOrAmount::Time(Duration::from_millis(300));
        settings.burst = BurstMode::Isochronous {
            fps: 50.0,
            mean: 2_000_000.0,
            variance: 0.0,
        };
        settings.flags.no_udp_fin = true;
        let flow = ClientFlow::new(settings, ctx, producer).unwrap();
        flow.run().await.unwrap();

        let records = consumer.drain();
        let frame_ids: Vec<u64> = records
            .iter()
            .filter(|r| !r.empty_report && r.packet_id > 0 && r.frame_id > 0)
            .map(|r| r.frame_id)
            .collect();
        assert!(!frame_ids.is_empty());
        // consecutive bursts differ by exactly one frame
        for pair in frame_ids.windows(2) {
            assert!(pair[1] == pair[0] || pair[1] == pair[0] + 1, "{:?}", pair);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_payload_parses_as_settings_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = vec![0u8; 4096];
            let mut filled = 0usize;
            // base + extend + start-time block, per the flags this test sets
            let expected =
                crate::wire::BASE_LEN + crate::wire::EXTEND_LEN + crate::wire::START_TIME_LEN;
            while filled < expected {
                let n = stream.read(&mut raw[filled..]).await.unwrap();
                assert!(n > 0);
                filled += n;
            }
            let header = ClientHeader::parse(&mut &raw[..filled]).unwrap();
            // drain the rest so the client's amount completes
            loop {
                match stream.read(&mut raw).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            header
        });

        let ctx = EngineContext::new();
        let (producer, _consumer) = record_ring(1024);
        let mut settings = test_settings(Protocol::Stream, peer);
        settings.flags.trip_time = true;
        settings.mode = DurationOrAmount::Amount(16 * 1024);
        let flow = ClientFlow::new(settings, ctx, producer).unwrap();
        flow.run().await.unwrap();

        let header = server.await.unwrap();
        assert!(header.flags & crate::wire::HDR_VERSION2 != 0);
        assert!(header.upper_flags() & crate::wire::UPPER_TRIPTIME != 0);
        assert_eq!(header.mode(), DurationOrAmount::Amount(16 * 1024));
    }

    #[rstest]
    fn test_datagram_delay_target_examples() {
        let ctx = EngineContext::new();
        let (producer, _consumer) = record_ring(16);
        let mut settings = test_settings(Protocol::Datagram, "127.0.0.1:5001".parse().unwrap());
        settings.buf_len = 1470;
        settings.rate = 1_000_000;
        let flow = ClientFlow::new(settings, ctx, producer).unwrap();
        // 1470 bytes at 1 Mb/s: 11.76 ms between packets
        assert_eq!(flow.datagram_delay_target(), Duration::from_nanos(11_760_000));
    }

    #[rstest]
    fn test_message_type_discrimination() {
        assert_eq!(MessageType::try_from(2u32), Ok(MessageType::ClientHdrAck));
        assert!(MessageType::try_from(99u32).is_err());
    }
}
