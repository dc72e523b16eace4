use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::timing::clock::Timestamp;

pub const MIN_PERMIT_KEY_LEN: usize = 2;
pub const MAX_PERMIT_KEY_LEN: usize = 128;

/// Smallest payload allocation regardless of the configured buffer length. First-message
///  headers (settings + permit key) must fit the payload buffer even for tiny buffer
///  length configurations.
pub const MIN_PAYLOAD_ALLOC: usize = 1470;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Stream,
    Datagram,
}

/// The role a flow plays on this host. `ServerReverse` is a client transmit loop running
///  on the listener side over an already-accepted socket (the peer asked for reverse or
///  full-duplex traffic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    ServerReverse,
}

/// Legacy test scheduling negotiated by a VERSION1-only handshake: `DualTest` runs the
///  complementary direction in parallel, `TradeOff` runs it after the first direction
///  completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    Normal,
    DualTest,
    TradeOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnits {
    BitsPerSecond,
    PacketsPerSecond,
}

/// Burst shaping of the transmit loops. `Periodic` sends a fixed-size burst per frame
///  boundary; `Isochronous` draws a lognormal burst size per frame (mean/variance are in
///  bits per second of offered load).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BurstMode {
    None,
    Periodic { fps: f64, size: u32 },
    Isochronous { fps: f64, mean: f64, variance: f64 },
}
impl BurstMode {
    pub fn fps(&self) -> Option<f64> {
        match self {
            BurstMode::None => None,
            BurstMode::Periodic { fps, .. } => Some(*fps),
            BurstMode::Isochronous { fps, .. } => Some(*fps),
        }
    }

    pub fn is_isochronous(&self) -> bool {
        matches!(self, BurstMode::Isochronous { .. })
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, BurstMode::Periodic { .. })
    }
}

/// Exactly one of test duration or byte amount bounds a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationOrAmount {
    Time(Duration),
    Amount(u64),
}
impl DurationOrAmount {
    pub fn is_time(&self) -> bool {
        matches!(self, DurationOrAmount::Time(_))
    }
}

/// Boolean feature switches carried by a flow. The wire bitmask representation lives in
///  `wire`; engine code only ever sees these fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowFlags {
    pub full_duplex: bool,
    pub reverse: bool,
    pub trip_time: bool,
    pub small_trip_times: bool,
    pub write_prefetch: bool,
    pub l2_check: bool,
    pub no_udp_fin: bool,
    pub seqno_64bit: bool,
    pub ipv6: bool,
    pub peer_version_detect: bool,
    pub compat: bool,
    pub single_client: bool,
    pub vary_load: bool,
}

/// Connect-only operation: repeatedly connect, time the handshake, close. `count` of zero
///  means "until the test duration elapses".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectOnly {
    pub count: Option<u32>,
    pub interval: Option<Duration>,
}

/// Per-flow settings, agreed between the two sides by the first-message handshake and
///  immutable afterwards (the transmit loops keep their own running counters).
///
/// A listener copies its own settings into each accepted flow and then lets the settings
///  codec overwrite the negotiated fields from the client's first message.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub protocol: Protocol,
    pub role: Role,
    pub test_mode: TestMode,

    pub local_addr: Option<SocketAddr>,
    pub peer_addr: SocketAddr,
    pub interface: Option<String>,

    pub buf_len: usize,
    pub mode: DurationOrAmount,
    pub report_interval: Option<Duration>,

    /// Offered application rate; 0 means unpaced.
    pub rate: u64,
    pub rate_units: RateUnits,
    /// Variance for vary-load resampling of `rate` (lognormal, every 100 ms).
    pub rate_variance: f64,
    /// Explicit inter-packet gap overriding the rate-derived one (datagram only).
    pub burst_ipg: Option<Duration>,

    pub burst: BurstMode,
    pub flags: FlowFlags,

    pub tx_holdback: Option<Duration>,
    pub tx_epoch_start: Option<Timestamp>,
    /// Near-congestion pacing: sleep `ceil(rtt * divider)` after each burst.
    pub near_congest_divider: Option<f64>,

    pub permit_key: Option<String>,
    pub peer_version: Option<(u32, u32)>,

    pub parallel: u32,
    pub connect_retries: u32,
    pub connect_only: Option<ConnectOnly>,
    pub listener_timeout: Option<Duration>,
    pub tos: u16,
}

impl FlowSettings {
    pub fn new(protocol: Protocol, role: Role, peer_addr: SocketAddr) -> FlowSettings {
        FlowSettings {
            protocol,
            role,
            test_mode: TestMode::Normal,
            local_addr: None,
            peer_addr,
            interface: None,
            buf_len: match protocol {
                Protocol::Stream => 128 * 1024,
                Protocol::Datagram => 1470,
            },
            mode: DurationOrAmount::Time(Duration::from_secs(10)),
            report_interval: None,
            rate: 0,
            rate_units: RateUnits::BitsPerSecond,
            rate_variance: 0.0,
            burst_ipg: None,
            burst: BurstMode::None,
            flags: FlowFlags {
                seqno_64bit: true,
                ..FlowFlags::default()
            },
            tx_holdback: None,
            tx_epoch_start: None,
            near_congest_divider: None,
            permit_key: None,
            peer_version: None,
            parallel: 1,
            connect_retries: 0,
            connect_only: None,
            listener_timeout: None,
            tos: 0,
        }
    }

    pub fn is_stream(&self) -> bool {
        self.protocol == Protocol::Stream
    }

    pub fn is_datagram(&self) -> bool {
        self.protocol == Protocol::Datagram
    }

    pub fn is_server_reverse(&self) -> bool {
        self.role == Role::ServerReverse
    }

    /// Remaining test duration, or `None` in amount mode.
    pub fn duration(&self) -> Option<Duration> {
        match self.mode {
            DurationOrAmount::Time(d) => Some(d),
            DurationOrAmount::Amount(_) => None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(fps) = self.burst.fps() {
            if fps <= 0.0 {
                bail!("burst shaping requires a positive frame rate, got {}", fps);
            }
        }
        if let BurstMode::Isochronous { mean, .. } = self.burst {
            if mean <= 0.0 {
                bail!("isochronous offered load (mean) must be positive, got {}", mean);
            }
        }
        if let Some(key) = &self.permit_key {
            if key.len() < MIN_PERMIT_KEY_LEN || key.len() > MAX_PERMIT_KEY_LEN {
                bail!(
                    "permit key length must be within {}..={} bytes, got {}",
                    MIN_PERMIT_KEY_LEN,
                    MAX_PERMIT_KEY_LEN,
                    key.len()
                );
            }
        }
        if let Some(divider) = self.near_congest_divider {
            if divider <= 0.0 {
                bail!("near-congestion rtt divider must be positive, got {}", divider);
            }
        }
        if self.buf_len == 0 {
            bail!("buffer length must be positive");
        }
        Ok(())
    }

    /// Payload allocation size for this flow's transmit buffer.
    pub fn payload_alloc_len(&self) -> usize {
        self.buf_len.max(MIN_PAYLOAD_ALLOC)
    }
}
