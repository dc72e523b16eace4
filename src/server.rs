//! Per-flow server worker. Streams are drained until the peer's half-close; datagrams
//!  are sequence-accounted until the negated-id FIN arrives, which is answered with the
//!  server's relay report.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::FlowSettings;
use crate::context::EngineContext;
use crate::flow_table::FlowKey;
use crate::records::{FullDuplexReport, PacketRecord, RecordProducer};
use crate::timing::clock::Timestamp;
use crate::wire::{DatagramHeader, IsochPayload, ServerReport, ISOCH_PAYLOAD_LEN};

/// Receive timeout for one read; timeouts emit empty records so interval accounting
///  stays live on an idle flow.
const RECEIVE_SLICE: Duration = Duration::from_millis(500);
/// A flow with no traffic for this long is considered abandoned (the FIN may have been
///  lost along with the client).
const SILENCE_LIMIT: Duration = Duration::from_secs(10);

/// The receive side of an accepted flow. Full-duplex streams hand the worker the read
///  half while the paired reverse client owns the write half.
pub enum ServerSocket {
    Stream(TcpStream),
    StreamRx(OwnedReadHalf),
    Datagram(Arc<UdpSocket>),
}
impl ServerSocket {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ServerSocket::Stream(s) => s.read(buf).await,
            ServerSocket::StreamRx(s) => s.read(buf).await,
            ServerSocket::Datagram(s) => s.recv(buf).await,
        }
    }

    async fn read_timeout(&mut self, buf: &mut [u8], dur: Duration) -> io::Result<usize> {
        match timeout(dur, self.read(buf)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ServerSocket::Datagram(s) => s.send(buf).await,
            _ => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ServerSocket::Stream(s) => s.local_addr(),
            ServerSocket::StreamRx(s) => s.local_addr(),
            ServerSocket::Datagram(s) => s.local_addr(),
        }
    }
}

/// Receive-side totals, also the payload of the datagram relay report.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerSummary {
    pub total_bytes: u64,
    pub datagrams: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub jitter_micros: u32,
}

pub struct ServerFlow {
    settings: FlowSettings,
    ctx: Arc<EngineContext>,
    records: RecordProducer,
    socket: ServerSocket,
    flow_key: Option<FlowKey>,
    full_duplex: Option<Arc<FullDuplexReport>>,

    total_received: u64,
    datagrams: u64,
    lost: u64,
    out_of_order: u64,
    next_expected_id: i64,
    jitter_micros: f64,
    prev_transit_micros: Option<i64>,
    start_wall: Timestamp,
    started: Instant,
    prev_packet_time: Timestamp,
}

impl ServerFlow {
    pub fn new(
        settings: FlowSettings,
        ctx: Arc<EngineContext>,
        records: RecordProducer,
        socket: ServerSocket,
        flow_key: Option<FlowKey>,
    ) -> ServerFlow {
        let now = Timestamp::now();
        ServerFlow {
            settings,
            ctx,
            records,
            socket,
            flow_key,
            full_duplex: None,
            total_received: 0,
            datagrams: 0,
            lost: 0,
            out_of_order: 0,
            next_expected_id: 1,
            jitter_micros: 0.0,
            prev_transit_micros: None,
            start_wall: now,
            started: Instant::now(),
            prev_packet_time: now,
        }
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn attach_full_duplex(&mut self, report: Arc<FullDuplexReport>) {
        self.full_duplex = Some(report);
    }

    pub async fn run(mut self) -> ServerSummary {
        let _guard = self.ctx.traffic_task_guard();
        if let Some(fd) = self.full_duplex.clone() {
            fd.barrier.wait().await;
            fd.start_time.set_once(Timestamp::now());
        }
        self.start_wall = Timestamp::now();
        self.started = Instant::now();
        self.prev_packet_time = self.start_wall;

        if self.settings.is_datagram() {
            self.run_datagram().await;
        } else {
            self.run_stream().await;
        }

        if let Some(key) = self.flow_key.take() {
            self.ctx.flow_table.remove(&key);
        }
        let summary = self.summary();
        info!(
            total = summary.total_bytes,
            datagrams = summary.datagrams,
            lost = summary.lost,
            "server flow finished"
        );
        summary
    }

    fn summary(&self) -> ServerSummary {
        ServerSummary {
            total_bytes: self.total_received,
            datagrams: self.datagrams,
            lost: self.lost,
            out_of_order: self.out_of_order,
            jitter_micros: self.jitter_micros as u32,
        }
    }

    async fn report(&mut self, mut record: PacketRecord) {
        record.prev_packet_time = self.prev_packet_time;
        let packet_time = record.packet_time;
        let empty = record.empty_report;
        self.records.push(record).await;
        if !empty {
            self.prev_packet_time = packet_time;
        }
    }

    /// Drain the stream until the client's half-close. The first read re-accounts the
    ///  settings header the listener only peeked at.
    async fn run_stream(&mut self) {
        let mut buf = vec![0u8; self.settings.payload_alloc_len()];
        let mut last_traffic = Instant::now();
        loop {
            if self.ctx.is_interrupted() {
                break;
            }
            let read = self.socket.read_timeout(&mut buf, RECEIVE_SLICE).await;
            match read {
                Ok(0) => {
                    debug!("peer closed its write side");
                    break;
                }
                Ok(n) => {
                    last_traffic = Instant::now();
                    self.total_received += n as u64;
                    let now = Timestamp::now();
                    let record = PacketRecord {
                        packet_len: n,
                        packet_time: now,
                        sent_time: now,
                        ..PacketRecord::default()
                    };
                    self.report(record).await;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    self.report(PacketRecord::null_event(Timestamp::now())).await;
                    if last_traffic.elapsed() > SILENCE_LIMIT {
                        warn!("stream silent for {:?}, giving up", SILENCE_LIMIT);
                        break;
                    }
                }
                Err(e) => {
                    warn!("stream read failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn run_datagram(&mut self) {
        let mut buf = vec![0u8; self.settings.payload_alloc_len().max(2048)];
        let mut last_traffic = Instant::now();
        let mut first = true;
        loop {
            if self.ctx.is_interrupted() {
                break;
            }
            let read = self.socket.read_timeout(&mut buf, RECEIVE_SLICE).await;
            match read {
                Ok(n) => {
                    last_traffic = Instant::now();
                    // the first message always uses the 64-bit id layout
                    let wide = first || self.settings.flags.seqno_64bit;
                    first = false;
                    let header = match DatagramHeader::parse(wide, &mut &buf[..n]) {
                        Ok(header) => header,
                        Err(e) => {
                            trace!("runt datagram ({} bytes): {:#}", n, e);
                            continue;
                        }
                    };
                    if header.id < 0 {
                        self.on_fin(header, n).await;
                        break;
                    }
                    self.account_datagram(&header, &buf[..n]).await;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    self.report(PacketRecord::null_event(Timestamp::now())).await;
                    if last_traffic.elapsed() > SILENCE_LIMIT {
                        warn!("datagram flow silent for {:?}, giving up", SILENCE_LIMIT);
                        break;
                    }
                }
                Err(e) => {
                    warn!("datagram read failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn account_datagram(&mut self, header: &DatagramHeader, packet: &[u8]) {
        let len = packet.len();
        self.total_received += len as u64;
        self.datagrams += 1;

        // iperf-style gap accounting: a jump forward counts the gap as lost, packets
        // from the past are reordered (and repair one previously counted loss)
        if header.id == self.next_expected_id {
            self.next_expected_id += 1;
        } else if header.id > self.next_expected_id {
            self.lost += (header.id - self.next_expected_id) as u64;
            self.next_expected_id = header.id + 1;
        } else {
            self.out_of_order += 1;
            self.lost = self.lost.saturating_sub(1);
        }

        let now = Timestamp::now();
        let transit = now.micros_since(header.timestamp);
        if let Some(prev) = self.prev_transit_micros {
            let d = (transit - prev).abs() as f64;
            self.jitter_micros += (d - self.jitter_micros) / 16.0;
        }
        self.prev_transit_micros = Some(transit);

        let mut record = PacketRecord {
            packet_id: header.id,
            packet_len: len,
            packet_time: now,
            sent_time: header.timestamp,
            ..PacketRecord::default()
        };
        let header_len = DatagramHeader::wire_len(self.settings.flags.seqno_64bit);
        if self.settings.burst.is_isochronous() && len >= header_len + ISOCH_PAYLOAD_LEN {
            let mut body = &packet[header_len..];
            if let Ok(payload) = IsochPayload::parse(&mut body) {
                record.frame_id = payload.frame_id as u64;
                record.burst_size = payload.burst_size;
                record.remaining = payload.remaining as u64;
            }
        }
        self.report(record).await;
    }

    /// Answer the FIN with the relay report and emit the closing record.
    async fn on_fin(&mut self, header: DatagramHeader, len: usize) {
        debug!(id = header.id, "fin datagram received");
        let now = Timestamp::now();
        self.total_received += len as u64;
        let record = PacketRecord {
            packet_id: header.id,
            packet_len: len,
            packet_time: now,
            sent_time: header.timestamp,
            ..PacketRecord::default()
        };
        self.report(record).await;

        if self.settings.flags.no_udp_fin {
            return;
        }
        let elapsed = self.started.elapsed();
        let report = ServerReport {
            flags: 0,
            total_len: self.total_received,
            elapsed: Timestamp::from_parts(
                elapsed.as_secs() as i64,
                elapsed.subsec_micros() as i64,
            ),
            error_count: self.lost.min(u32::MAX as u64) as u32,
            out_of_order: self.out_of_order.min(u32::MAX as u64) as u32,
            datagrams: self.datagrams.min(u32::MAX as u64) as u32,
            jitter_micros: self.jitter_micros as u32,
        };
        let mut reply = bytes::BytesMut::with_capacity(128);
        DatagramHeader {
            id: header.id,
            timestamp: now,
        }
        .ser(self.settings.flags.seqno_64bit, &mut reply);
        report.ser(&mut reply);
        if let Err(e) = self.socket.send(&reply).await {
            warn!("relay report send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, Role};
    use crate::records::record_ring;
    use bytes::BytesMut;
    use std::str::FromStr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn server_settings(protocol: Protocol) -> FlowSettings {
        let mut settings = FlowSettings::new(
            protocol,
            Role::Server,
            SocketAddr::from_str("127.0.0.1:1").unwrap(),
        );
        settings.buf_len = 1470;
        settings
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_drain_until_half_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let payload = vec![7u8; 10_000];
            for _ in 0..4 {
                stream.write_all(&payload).await.unwrap();
            }
            stream.shutdown().await.unwrap();
        });
        let (accepted, _) = listener.accept().await.unwrap();

        let ctx = EngineContext::new();
        let (producer, mut consumer) = record_ring(1024);
        let flow = ServerFlow::new(
            server_settings(Protocol::Stream),
            ctx,
            producer,
            ServerSocket::Stream(accepted),
            None,
        );
        let summary = flow.run().await;
        client.await.unwrap();
        assert_eq!(summary.total_bytes, 40_000);
        let records = consumer.drain();
        let received: usize = records.iter().map(|r| r.packet_len).sum();
        assert_eq!(received, 40_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_datagram_accounting_and_fin_reply() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_sock.local_addr().unwrap();
        let client_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_sock.connect(server_addr).await.unwrap();
        server_sock
            .connect(client_sock.local_addr().unwrap())
            .await
            .unwrap();

        let ctx = EngineContext::new();
        let (producer, mut consumer) = record_ring(1024);
        let flow = ServerFlow::new(
            server_settings(Protocol::Datagram),
            ctx,
            producer,
            ServerSocket::Datagram(Arc::new(server_sock)),
            None,
        );
        let server = tokio::spawn(flow.run());

        // ids 1,2,4 (3 lost), then the fin
        for id in [1i64, 2, 4] {
            let mut msg = BytesMut::new();
            DatagramHeader {
                id,
                timestamp: Timestamp::now(),
            }
            .ser(true, &mut msg);
            msg.resize(200, 0);
            client_sock.send(&msg).await.unwrap();
        }
        let mut fin = BytesMut::new();
        DatagramHeader {
            id: -5,
            timestamp: Timestamp::now(),
        }
        .ser(true, &mut fin);
        fin.resize(200, 0);
        client_sock.send(&fin).await.unwrap();

        // the fin reply carries the relay report
        let mut raw = [0u8; 512];
        let n = timeout(Duration::from_secs(2), client_sock.recv(&mut raw))
            .await
            .unwrap()
            .unwrap();
        let mut body = &raw[DatagramHeader::wire_len(true)..n];
        let report = ServerReport::parse(&mut body).unwrap();
        assert_eq!(report.datagrams, 3);
        assert_eq!(report.error_count, 1);

        let summary = server.await.unwrap();
        assert_eq!(summary.datagrams, 3);
        assert_eq!(summary.lost, 1);

        // the closing record is the negated-id one
        let records = consumer.drain();
        let last = records.iter().rev().find(|r| !r.empty_report).unwrap();
        assert!(last.is_final());
    }

    #[tokio::test]
    async fn test_gap_accounting() {
        let ctx = EngineContext::new();
        let (producer, _consumer) = record_ring(64);
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut flow = ServerFlow::new(
            server_settings(Protocol::Datagram),
            ctx,
            producer,
            ServerSocket::Datagram(Arc::new(sock)),
            None,
        );
        let packet = [0u8; 100];
        for (id, expected_lost, expected_ooo) in
            [(1i64, 0u64, 0u64), (2, 0, 0), (5, 2, 0), (4, 1, 1), (6, 1, 1)]
        {
            let header = DatagramHeader {
                id,
                timestamp: Timestamp::now(),
            };
            flow.account_datagram(&header, &packet).await;
            assert_eq!(flow.lost, expected_lost, "id {}", id);
            assert_eq!(flow.out_of_order, expected_ooo, "id {}", id);
        }
    }
}
