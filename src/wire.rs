//! The wire formats both peers agree on: the client's first-message settings header, the
//!  server's 20-byte ack, the per-datagram header, the isochronous payload fields, the
//!  stream burst header and the server's closing report.
//!
//! Everything is big-endian. Parsing uses checked reads throughout; a short or
//!  inconsistent header is a handshake rejection, not a panic.

use std::time::Duration;

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::{
    BurstMode, DurationOrAmount, FlowSettings, Protocol, TestMode, MAX_PERMIT_KEY_LEN,
    MIN_PERMIT_KEY_LEN,
};
use crate::timing::clock::Timestamp;

// Flag word of the base header.
pub const HDR_VERSION1: u32 = 0x8000_0000;
pub const HDR_EXTEND: u32 = 0x4000_0000;
pub const HDR_UDPTESTS: u32 = 0x2000_0000;
pub const HDR_SEQNO64B: u32 = 0x1000_0000;
pub const HDR_VERSION2: u32 = 0x0800_0000;
pub const HDR_V2PEERDETECT: u32 = 0x0400_0000;
pub const HDR_KEYCHECK: u32 = 0x0200_0000;
pub const HDR_SMALL_TRIPTIMES: u32 = 0x0100_0000;
pub const HDR_RUN_NOW: u32 = 0x0000_0001;

// Upper flag word, carried by the extend block.
pub const UPPER_ISOCH: u16 = 0x0001;
pub const UPPER_L2ETHPIPV6: u16 = 0x0002;
pub const UPPER_L2LENCHECK: u16 = 0x0004;
pub const UPPER_NOUDPFIN: u16 = 0x0008;
pub const UPPER_EPOCH_START: u16 = 0x0010;
pub const UPPER_TRIPTIME: u16 = 0x0020;
pub const UPPER_FULLDUPLEX: u16 = 0x0040;
pub const UPPER_REVERSE: u16 = 0x0080;
pub const UPPER_PERIODICBURST: u16 = 0x0100;

pub const BASE_LEN: usize = 24;
pub const EXTEND_LEN: usize = 24;
pub const ISOCH_LEN: usize = 32;
pub const START_TIME_LEN: usize = 8;
pub const HEADER_ACK_LEN: usize = 20;
pub const SERVER_REPORT_LEN: usize = 44;
pub const STREAM_BURST_HEADER_LEN: usize = 40;
pub const ISOCH_PAYLOAD_LEN: usize = 28;

/// Version pair advertised in extend blocks and acks, hex-coded major/minor.
pub const VERSION_UPPER: u32 = 0x0002_0000;
pub const VERSION_LOWER: u32 = 0x0000_000e;

/// Gap between the packets of one isochronous burst when the flow does not configure an
///  explicit one.
pub const DEFAULT_BURST_IPG_MICROS: u64 = 5;

/// A client epoch-start more than this many seconds away from the server's clock is
///  ignored rather than scheduling traffic far in the past or future.
pub const MAX_EPOCH_START_SKEW_SECS: i64 = 10;
/// Trip-time measurement needs loosely synchronised clocks; beyond this skew the
///  timestamps would be meaningless.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum MessageType {
    ClientSettings = 0x1,
    ClientHdrAck = 0x2,
    ServerReport = 0x3,
}

/// Split a non-negative value into its integer part and millionths remainder, the wire
///  encoding of fractional rates.
fn split_millionths(value: f64) -> (u32, u32) {
    let whole = value.max(0.0).trunc();
    let frac = ((value.max(0.0) - whole) * 1e6).round();
    (whole as u32, frac as u32)
}

fn join_millionths(whole: u32, millionths: u32) -> f64 {
    whole as f64 + millionths as f64 / 1e6
}

/// The optional extend block: upper flags plus the peer's version advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendBlock {
    pub upper_flags: u16,
    pub tos: u16,
    pub version_u: u32,
    pub version_l: u32,
}

/// Burst shaping parameters; `mean` doubles as the fixed burst size in periodic mode.
///  Rates are quantized to millionths on the wire, the gap to whole microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsochBlock {
    pub fps: f64,
    pub mean: f64,
    pub variance: f64,
    pub burst_ipg_micros: u64,
}

/// The client's first message. Which blocks are present is governed by the flag bits,
///  which is also how the listener computes how far to peek.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHeader {
    pub flags: u32,
    pub num_threads: u32,
    pub port: u16,
    pub buf_len: u32,
    pub win_band: u32,
    /// Negative: test duration in 10 ms units. Positive: byte amount.
    pub amount: i32,
    pub extend: Option<ExtendBlock>,
    pub isoch: Option<IsochBlock>,
    pub start_time: Option<Timestamp>,
    pub permit_key: Option<String>,
}

impl ClientHeader {
    pub fn from_settings(settings: &FlowSettings, start_time: Timestamp) -> ClientHeader {
        let amount = match settings.mode {
            DurationOrAmount::Time(d) => -(((d.as_millis() / 10).max(1)) as i64 as i32),
            DurationOrAmount::Amount(a) => a.min(i32::MAX as u64) as i32,
        };
        let base = ClientHeader {
            flags: 0,
            num_threads: settings.parallel,
            port: settings.peer_addr.port(),
            buf_len: settings.buf_len as u32,
            win_band: settings.rate.min(u32::MAX as u64) as u32,
            amount,
            extend: None,
            isoch: None,
            start_time: None,
            permit_key: None,
        };

        // minimal datagram-only header: just enough for the server to learn trip times
        if settings.flags.small_trip_times && settings.is_datagram() {
            return ClientHeader {
                flags: HDR_SMALL_TRIPTIMES
                    | if settings.flags.seqno_64bit { HDR_SEQNO64B } else { 0 },
                ..base
            };
        }

        let mut flags = 0u32;
        match settings.test_mode {
            TestMode::Normal => {}
            TestMode::DualTest => flags |= HDR_VERSION1 | HDR_RUN_NOW,
            TestMode::TradeOff => flags |= HDR_VERSION1,
        }
        if settings.flags.seqno_64bit {
            flags |= HDR_SEQNO64B;
        }
        if settings.flags.compat {
            // a version 1 peer understands nothing past the base header
            return ClientHeader { flags, ..base };
        }

        // legacy dual/trade-off is signalled by VERSION1 alone; VERSION2 would reclassify
        // the handshake as a modern test
        flags |= HDR_EXTEND;
        if settings.test_mode == TestMode::Normal {
            flags |= HDR_VERSION2;
        }
        if settings.is_datagram() {
            flags |= HDR_UDPTESTS;
        }
        if settings.flags.peer_version_detect && settings.is_stream() {
            flags |= HDR_V2PEERDETECT;
        }

        let mut upper = 0u16;
        match settings.burst {
            BurstMode::None => {}
            BurstMode::Periodic { .. } => upper |= UPPER_PERIODICBURST,
            BurstMode::Isochronous { .. } => upper |= UPPER_ISOCH,
        }
        if settings.flags.ipv6 {
            upper |= UPPER_L2ETHPIPV6;
        }
        if settings.flags.l2_check {
            upper |= UPPER_L2LENCHECK;
        }
        if settings.flags.no_udp_fin {
            upper |= UPPER_NOUDPFIN;
        }
        if settings.tx_epoch_start.is_some() {
            upper |= UPPER_EPOCH_START;
        }
        if settings.flags.trip_time {
            upper |= UPPER_TRIPTIME;
        }
        if settings.flags.full_duplex {
            upper |= UPPER_FULLDUPLEX;
        }
        if settings.flags.reverse {
            upper |= UPPER_REVERSE;
        }

        // the intra-burst packet gap, not the frame period
        let burst_ipg_micros = settings
            .burst_ipg
            .map(|d| d.as_micros() as u64)
            .unwrap_or(DEFAULT_BURST_IPG_MICROS);
        let isoch = match settings.burst {
            BurstMode::None => None,
            BurstMode::Periodic { fps, size } => Some(IsochBlock {
                fps,
                mean: size as f64,
                variance: 0.0,
                burst_ipg_micros,
            }),
            BurstMode::Isochronous { fps, mean, variance } => Some(IsochBlock {
                fps,
                mean,
                variance,
                burst_ipg_micros,
            }),
        };

        let header_start_time = if upper & (UPPER_EPOCH_START | UPPER_TRIPTIME) != 0 {
            Some(settings.tx_epoch_start.unwrap_or(start_time))
        } else {
            None
        };

        if settings.permit_key.is_some() {
            flags |= HDR_KEYCHECK;
        }

        ClientHeader {
            flags,
            extend: Some(ExtendBlock {
                upper_flags: upper,
                tos: settings.tos,
                version_u: VERSION_UPPER,
                version_l: VERSION_LOWER,
            }),
            isoch,
            start_time: header_start_time,
            permit_key: settings.permit_key.clone(),
            ..base
        }
    }

    pub fn upper_flags(&self) -> u16 {
        self.extend.map(|e| e.upper_flags).unwrap_or(0)
    }

    /// The test bound this header announces.
    pub fn mode(&self) -> DurationOrAmount {
        if self.amount < 0 {
            DurationOrAmount::Time(Duration::from_millis(-(self.amount as i64) as u64 * 10))
        } else {
            DurationOrAmount::Amount(self.amount as u64)
        }
    }

    pub fn wire_len(&self) -> usize {
        let mut len = BASE_LEN;
        if self.extend.is_some() {
            len += EXTEND_LEN;
        }
        if self.isoch.is_some() {
            len += ISOCH_LEN;
        }
        if self.start_time.is_some() {
            len += START_TIME_LEN;
        }
        if let Some(key) = &self.permit_key {
            len += 2 + key.len();
        }
        len
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.flags);
        buf.put_u32(self.num_threads);
        buf.put_u32(self.port as u32);
        buf.put_u32(self.buf_len);
        buf.put_u32(self.win_band);
        buf.put_i32(self.amount);

        if let Some(extend) = &self.extend {
            buf.put_u32(MessageType::ClientSettings.into());
            buf.put_u32(EXTEND_LEN as u32);
            buf.put_u16(extend.upper_flags);
            buf.put_u16(extend.tos);
            buf.put_u32(extend.version_u);
            buf.put_u32(extend.version_l);
            buf.put_u32(0); // reserved
        }
        if let Some(isoch) = &self.isoch {
            let (fps_l, fps_u) = split_millionths(isoch.fps);
            let (mean_l, mean_u) = split_millionths(isoch.mean);
            let (var_l, var_u) = split_millionths(isoch.variance);
            buf.put_u32(fps_l);
            buf.put_u32(fps_u);
            buf.put_u32(mean_l);
            buf.put_u32(mean_u);
            buf.put_u32(var_l);
            buf.put_u32(var_u);
            buf.put_u32((isoch.burst_ipg_micros / 1_000_000) as u32);
            buf.put_u32((isoch.burst_ipg_micros % 1_000_000) as u32);
        }
        if let Some(start) = &self.start_time {
            let (sec, usec) = start.as_wire();
            buf.put_u32(sec);
            buf.put_u32(usec);
        }
        if let Some(key) = &self.permit_key {
            buf.put_u16(key.len() as u16);
            buf.put_slice(key.as_bytes());
        }
    }

    pub fn parse(buf: &mut impl Buf) -> anyhow::Result<ClientHeader> {
        let flags = buf.try_get_u32()?;
        let num_threads = buf.try_get_u32()?;
        let port = buf.try_get_u32()? as u16;
        let buf_len = buf.try_get_u32()?;
        let win_band = buf.try_get_u32()?;
        let amount = buf.try_get_i32()?;

        let mut header = ClientHeader {
            flags,
            num_threads,
            port,
            buf_len,
            win_band,
            amount,
            extend: None,
            isoch: None,
            start_time: None,
            permit_key: None,
        };

        if flags & HDR_EXTEND != 0 {
            let type_raw = buf.try_get_u32()?;
            match MessageType::try_from(type_raw) {
                Ok(MessageType::ClientSettings) => {}
                _ => bail!("unexpected extend block type {:#x}", type_raw),
            }
            let length = buf.try_get_u32()? as usize;
            if length != EXTEND_LEN {
                bail!("extend block length {} does not match expected {}", length, EXTEND_LEN);
            }
            let upper_flags = buf.try_get_u16()?;
            let tos = buf.try_get_u16()?;
            let version_u = buf.try_get_u32()?;
            let version_l = buf.try_get_u32()?;
            let _reserved = buf.try_get_u32()?;
            header.extend = Some(ExtendBlock {
                upper_flags,
                tos,
                version_u,
                version_l,
            });

            if upper_flags & (UPPER_ISOCH | UPPER_PERIODICBURST) != 0 {
                let fps = join_millionths(buf.try_get_u32()?, buf.try_get_u32()?);
                let mean = join_millionths(buf.try_get_u32()?, buf.try_get_u32()?);
                let variance = join_millionths(buf.try_get_u32()?, buf.try_get_u32()?);
                let ipg_s = buf.try_get_u32()? as u64;
                let ipg_us = buf.try_get_u32()? as u64;
                header.isoch = Some(IsochBlock {
                    fps,
                    mean,
                    variance,
                    burst_ipg_micros: ipg_s * 1_000_000 + ipg_us,
                });
            }
            if upper_flags & (UPPER_EPOCH_START | UPPER_TRIPTIME) != 0 {
                let sec = buf.try_get_u32()?;
                let usec = buf.try_get_u32()?;
                header.start_time = Some(Timestamp::from_wire(sec, usec));
            }
        }

        if flags & HDR_KEYCHECK != 0 {
            let key_len = buf.try_get_u16()? as usize;
            if !(MIN_PERMIT_KEY_LEN..=MAX_PERMIT_KEY_LEN).contains(&key_len) {
                bail!("permit key length {} out of bounds", key_len);
            }
            if buf.remaining() < key_len {
                bail!("short permit key: {} of {} bytes", buf.remaining(), key_len);
            }
            let mut raw = vec![0u8; key_len];
            buf.copy_to_slice(&mut raw);
            match String::from_utf8(raw) {
                Ok(key) => header.permit_key = Some(key),
                Err(_) => bail!("permit key is not valid utf-8"),
            }
        }

        Ok(header)
    }

    /// Overwrite the negotiated fields of a freshly accepted server-side flow. Timestamps
    ///  failing the skew sanity checks clear their feature with a warning instead of
    ///  rejecting the flow.
    pub fn apply_to(&self, settings: &mut FlowSettings, now: Timestamp) {
        if self.flags & HDR_SEQNO64B != 0 {
            settings.flags.seqno_64bit = true;
        }
        if self.flags & HDR_SMALL_TRIPTIMES != 0 {
            settings.flags.trip_time = true;
            settings.flags.small_trip_times = true;
            return;
        }
        if self.flags & HDR_VERSION1 != 0 && self.flags & HDR_VERSION2 == 0 {
            settings.test_mode = if self.flags & HDR_RUN_NOW != 0 {
                TestMode::DualTest
            } else {
                TestMode::TradeOff
            };
        }
        let Some(extend) = &self.extend else {
            return;
        };
        let upper = extend.upper_flags;
        settings.tos = extend.tos;
        settings.peer_version = Some((extend.version_u, extend.version_l));

        // stateless datagram bits are only honored when the client marked the upper
        // flags as applying to datagram tests
        let datagram_bits = settings.is_stream() || self.flags & HDR_UDPTESTS != 0;
        if datagram_bits {
            if upper & UPPER_ISOCH != 0 {
                if let Some(isoch) = &self.isoch {
                    settings.burst = BurstMode::Isochronous {
                        fps: if isoch.fps > 0.0 { isoch.fps } else { 1.0 },
                        mean: isoch.mean,
                        variance: isoch.variance,
                    };
                }
            }
            settings.flags.ipv6 = upper & UPPER_L2ETHPIPV6 != 0;
            if upper & UPPER_L2LENCHECK != 0 {
                settings.flags.l2_check = true;
            }
            if upper & UPPER_NOUDPFIN != 0 {
                settings.flags.no_udp_fin = true;
            }
        }
        if upper & UPPER_PERIODICBURST != 0 {
            if let Some(isoch) = &self.isoch {
                settings.burst = BurstMode::Periodic {
                    fps: if isoch.fps > 0.0 { isoch.fps } else { 1.0 },
                    size: isoch.mean as u32,
                };
            }
        }
        if upper & UPPER_EPOCH_START != 0 {
            if let Some(start) = self.start_time {
                if (now.secs() - start.secs()).abs() > MAX_EPOCH_START_SKEW_SECS + 1 {
                    tracing::warn!(
                        "ignoring transmit epoch start: client timestamp is not within {}s of now",
                        MAX_EPOCH_START_SKEW_SECS
                    );
                } else {
                    settings.tx_epoch_start = Some(start);
                }
            }
        }
        if upper & UPPER_TRIPTIME != 0 {
            if let Some(start) = self.start_time {
                if settings.tx_epoch_start.is_none()
                    && (now.secs() - start.secs()).abs() > MAX_TIMESTAMP_SKEW_SECS + 1
                {
                    tracing::warn!(
                        "ignoring trip times: client timestamp is not within {}s of now",
                        MAX_TIMESTAMP_SKEW_SECS
                    );
                } else {
                    settings.flags.trip_time = true;
                }
            }
        }
        if self.flags & HDR_VERSION2 != 0 {
            if upper & UPPER_FULLDUPLEX != 0 {
                settings.flags.full_duplex = true;
            }
            if upper & UPPER_REVERSE != 0 {
                settings.flags.reverse = true;
                if settings.is_datagram() {
                    settings.flags.no_udp_fin = true;
                }
            }
        }
    }
}

/// Fixed-length prefix of the settings header determined by the first flag word alone.
pub fn fixed_peek_len(flags: u32) -> usize {
    if flags & HDR_EXTEND != 0 {
        BASE_LEN + EXTEND_LEN
    } else {
        BASE_LEN
    }
}

/// Length of the optional blocks after the extend block, determined by the upper flags.
///  The permit key is excluded: its length is only known after another peek.
pub fn settings_tail_len(upper_flags: u16) -> usize {
    let mut len = 0;
    if upper_flags & (UPPER_ISOCH | UPPER_PERIODICBURST) != 0 {
        len += ISOCH_LEN;
    }
    if upper_flags & (UPPER_EPOCH_START | UPPER_TRIPTIME) != 0 {
        len += START_TIME_LEN;
    }
    len
}

/// The server's reply to a settings header that asked for an ack: 20 bytes carrying the
///  server version so the client can adapt to an older peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderAck {
    pub flags: u16,
    pub version_u: u32,
    pub version_l: u32,
}
impl HeaderAck {
    pub fn ours() -> HeaderAck {
        HeaderAck {
            flags: 0,
            version_u: VERSION_UPPER,
            version_l: VERSION_LOWER,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(MessageType::ClientHdrAck.into());
        buf.put_u32(HEADER_ACK_LEN as u32);
        buf.put_u16(self.flags);
        buf.put_u16(0); // reserved
        buf.put_u32(self.version_u);
        buf.put_u32(self.version_l);
    }

    pub fn parse(buf: &mut impl Buf) -> anyhow::Result<HeaderAck> {
        let type_raw = buf.try_get_u32()?;
        if MessageType::try_from(type_raw) != Ok(MessageType::ClientHdrAck) {
            bail!("not a header ack: type {:#x}", type_raw);
        }
        let length = buf.try_get_u32()? as usize;
        if length != HEADER_ACK_LEN {
            bail!("header ack length {} does not match expected {}", length, HEADER_ACK_LEN);
        }
        let flags = buf.try_get_u16()?;
        let _reserved = buf.try_get_u16()?;
        Ok(HeaderAck {
            flags,
            version_u: buf.try_get_u32()?,
            version_l: buf.try_get_u32()?,
        })
    }

    /// Whether a raw first read looks like an ack; used to discard stale acks during the
    ///  datagram FIN await.
    pub fn matches(raw: &[u8]) -> bool {
        raw.len() == HEADER_ACK_LEN
            && (&raw[..4]).get_u32() == u32::from(MessageType::ClientHdrAck)
    }
}

/// Per-datagram header: sequence number plus the sender's wall clock. The first message
///  of a flow always carries the 64-bit layout; data packets use the negotiated width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub id: i64,
    pub timestamp: Timestamp,
}
impl DatagramHeader {
    pub fn wire_len(seqno_64bit: bool) -> usize {
        if seqno_64bit {
            16
        } else {
            12
        }
    }

    pub fn ser(&self, seqno_64bit: bool, buf: &mut impl BufMut) {
        buf.put_u32(self.id as u32);
        if seqno_64bit {
            buf.put_u32((self.id as u64 >> 32) as u32);
        }
        let (sec, usec) = self.timestamp.as_wire();
        buf.put_u32(sec);
        buf.put_u32(usec);
    }

    pub fn parse(seqno_64bit: bool, buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let id = if seqno_64bit {
            let low = buf.try_get_u32()? as u64;
            let high = buf.try_get_u32()? as u64;
            (low | (high << 32)) as i64
        } else {
            buf.try_get_u32()? as i32 as i64
        };
        let sec = buf.try_get_u32()?;
        let usec = buf.try_get_u32()?;
        Ok(DatagramHeader {
            id,
            timestamp: Timestamp::from_wire(sec, usec),
        })
    }
}

/// Isochronous fields following the datagram header in every isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsochPayload {
    pub burst_period_micros: u32,
    pub burst_size: u32,
    pub prev_frame_id: u32,
    pub frame_id: u32,
    pub remaining: u32,
    pub start_time: Timestamp,
}
impl IsochPayload {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.burst_period_micros);
        buf.put_u32(self.burst_size);
        buf.put_u32(self.prev_frame_id);
        buf.put_u32(self.frame_id);
        buf.put_u32(self.remaining);
        let (sec, usec) = self.start_time.as_wire();
        buf.put_u32(sec);
        buf.put_u32(usec);
    }

    pub fn parse(buf: &mut impl Buf) -> anyhow::Result<IsochPayload> {
        Ok(IsochPayload {
            burst_period_micros: buf.try_get_u32()?,
            burst_size: buf.try_get_u32()?,
            prev_frame_id: buf.try_get_u32()?,
            frame_id: buf.try_get_u32()?,
            remaining: buf.try_get_u32()?,
            start_time: {
                let sec = buf.try_get_u32()?;
                let usec = buf.try_get_u32()?;
                Timestamp::from_wire(sec, usec)
            },
        })
    }
}

/// Header stamped at the head of every stream burst, carrying the flow start, the packet
///  id range and the write timestamp for one-way delay measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBurstHeader {
    pub start_time: Timestamp,
    pub packet_id: i64,
    pub write_time: Timestamp,
    pub burst_id: u32,
    pub burst_size: u32,
    pub burst_period_micros: u64,
}
impl StreamBurstHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        let (start_sec, start_usec) = self.start_time.as_wire();
        buf.put_u32(start_sec);
        buf.put_u32(start_usec);
        buf.put_u32(self.packet_id as u32);
        buf.put_u32((self.packet_id as u64 >> 32) as u32);
        let (write_sec, write_usec) = self.write_time.as_wire();
        buf.put_u32(write_sec);
        buf.put_u32(write_usec);
        buf.put_u32(self.burst_id);
        buf.put_u32(self.burst_size);
        buf.put_u32((self.burst_period_micros / 1_000_000) as u32);
        buf.put_u32((self.burst_period_micros % 1_000_000) as u32);
    }

    pub fn parse(buf: &mut impl Buf) -> anyhow::Result<StreamBurstHeader> {
        let start_sec = buf.try_get_u32()?;
        let start_usec = buf.try_get_u32()?;
        let seq_low = buf.try_get_u32()? as u64;
        let seq_high = buf.try_get_u32()? as u64;
        let write_sec = buf.try_get_u32()?;
        let write_usec = buf.try_get_u32()?;
        let burst_id = buf.try_get_u32()?;
        let burst_size = buf.try_get_u32()?;
        let period_s = buf.try_get_u32()? as u64;
        let period_us = buf.try_get_u32()? as u64;
        Ok(StreamBurstHeader {
            start_time: Timestamp::from_wire(start_sec, start_usec),
            packet_id: (seq_low | (seq_high << 32)) as i64,
            write_time: Timestamp::from_wire(write_sec, write_usec),
            burst_id,
            burst_size,
            burst_period_micros: period_s * 1_000_000 + period_us,
        })
    }
}

/// Server-side totals returned in the datagram FIN handshake so the client can print the
///  receive-side view of the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerReport {
    pub flags: u32,
    pub total_len: u64,
    pub elapsed: Timestamp,
    pub error_count: u32,
    pub out_of_order: u32,
    pub datagrams: u32,
    pub jitter_micros: u32,
}
impl ServerReport {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(MessageType::ServerReport.into());
        buf.put_u32(SERVER_REPORT_LEN as u32);
        buf.put_u32(self.flags);
        buf.put_u64(self.total_len);
        let (sec, usec) = self.elapsed.as_wire();
        buf.put_u32(sec);
        buf.put_u32(usec);
        buf.put_u32(self.error_count);
        buf.put_u32(self.out_of_order);
        buf.put_u32(self.datagrams);
        buf.put_u32(self.jitter_micros);
    }

    pub fn parse(buf: &mut impl Buf) -> anyhow::Result<ServerReport> {
        let type_raw = buf.try_get_u32()?;
        if MessageType::try_from(type_raw) != Ok(MessageType::ServerReport) {
            bail!("not a server report: type {:#x}", type_raw);
        }
        let length = buf.try_get_u32()? as usize;
        if length != SERVER_REPORT_LEN {
            bail!("server report length {} does not match expected {}", length, SERVER_REPORT_LEN);
        }
        Ok(ServerReport {
            flags: buf.try_get_u32()?,
            total_len: buf.try_get_u64()?,
            elapsed: {
                let sec = buf.try_get_u32()?;
                let usec = buf.try_get_u32()?;
                Timestamp::from_wire(sec, usec)
            },
            error_count: buf.try_get_u32()?,
            out_of_order: buf.try_get_u32()?,
            datagrams: buf.try_get_u32()?,
            jitter_micros: buf.try_get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlowFlags, Role};
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::str::FromStr;

    fn client_settings(protocol: Protocol) -> FlowSettings {
        FlowSettings::new(protocol, Role::Client, SocketAddr::from_str("10.1.1.1:5001").unwrap())
    }

    fn round_trip(header: &ClientHeader) -> ClientHeader {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), header.wire_len());
        let parsed = ClientHeader::parse(&mut buf.freeze()).unwrap();
        parsed
    }

    #[rstest]
    fn test_round_trip_base_only() {
        let mut settings = client_settings(Protocol::Stream);
        settings.flags.compat = true;
        let header = ClientHeader::from_settings(&settings, Timestamp::now());
        assert_eq!(round_trip(&header), header);
        assert!(header.extend.is_none());
    }

    #[rstest]
    fn test_round_trip_extended_datagram() {
        let mut settings = client_settings(Protocol::Datagram);
        settings.flags.trip_time = true;
        settings.flags.no_udp_fin = true;
        settings.burst = BurstMode::Isochronous {
            fps: 60.0,
            mean: 20e6,
            variance: 1e6,
        };
        let header = ClientHeader::from_settings(&settings, Timestamp::from_parts(1000, 250_000));
        assert_eq!(round_trip(&header), header);
        assert!(header.flags & HDR_UDPTESTS != 0);
        assert!(header.upper_flags() & UPPER_ISOCH != 0);
        assert!(header.upper_flags() & UPPER_TRIPTIME != 0);
        assert!(header.upper_flags() & UPPER_NOUDPFIN != 0);
        assert_eq!(header.start_time, Some(Timestamp::from_parts(1000, 250_000)));
    }

    #[rstest]
    fn test_round_trip_permit_key() {
        let mut settings = client_settings(Protocol::Stream);
        settings.permit_key = Some("super-secret".to_string());
        let header = ClientHeader::from_settings(&settings, Timestamp::now());
        assert!(header.flags & HDR_KEYCHECK != 0);
        assert_eq!(round_trip(&header), header);
    }

    #[rstest]
    fn test_round_trip_full_duplex_reverse_epoch() {
        let mut settings = client_settings(Protocol::Stream);
        settings.flags.full_duplex = true;
        settings.flags.reverse = true;
        settings.tx_epoch_start = Some(Timestamp::from_parts(2000, 1));
        let header = ClientHeader::from_settings(&settings, Timestamp::now());
        assert_eq!(round_trip(&header), header);
        assert_eq!(header.start_time, Some(Timestamp::from_parts(2000, 1)));
    }

    #[rstest]
    #[case::no_extend(0, BASE_LEN)]
    #[case::extend(HDR_EXTEND, BASE_LEN + EXTEND_LEN)]
    #[case::extend_v2(HDR_EXTEND | HDR_VERSION2 | HDR_SEQNO64B, BASE_LEN + EXTEND_LEN)]
    #[case::version1_only(HDR_VERSION1, BASE_LEN)]
    fn test_fixed_peek_len(#[case] flags: u32, #[case] expected: usize) {
        assert_eq!(fixed_peek_len(flags), expected);
    }

    #[rstest]
    #[case::nothing(0, 0)]
    #[case::isoch(UPPER_ISOCH, ISOCH_LEN)]
    #[case::periodic(UPPER_PERIODICBURST, ISOCH_LEN)]
    #[case::triptime(UPPER_TRIPTIME, START_TIME_LEN)]
    #[case::epoch(UPPER_EPOCH_START, START_TIME_LEN)]
    #[case::both(UPPER_ISOCH | UPPER_TRIPTIME, ISOCH_LEN + START_TIME_LEN)]
    fn test_settings_tail_len(#[case] upper: u16, #[case] expected: usize) {
        assert_eq!(settings_tail_len(upper), expected);
    }

    #[rstest]
    fn test_peek_len_matches_wire_len() {
        let mut settings = client_settings(Protocol::Stream);
        settings.flags.trip_time = true;
        settings.burst = BurstMode::Periodic { fps: 2.0, size: 4096 };
        let header = ClientHeader::from_settings(&settings, Timestamp::now());
        assert_eq!(
            fixed_peek_len(header.flags) + settings_tail_len(header.upper_flags()),
            header.wire_len()
        );
    }

    #[rstest]
    fn test_parse_rejects_short_buffer() {
        let mut settings = client_settings(Protocol::Stream);
        settings.flags.trip_time = true;
        let header = ClientHeader::from_settings(&settings, Timestamp::now());
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        let truncated = buf.freeze().slice(..BASE_LEN + 4);
        assert!(ClientHeader::parse(&mut truncated.clone()).is_err());
    }

    #[rstest]
    #[case::zero_len(0u16)]
    #[case::too_long(4096u16)]
    fn test_parse_rejects_bad_key_length(#[case] bad_len: u16) {
        let mut buf = BytesMut::new();
        ClientHeader {
            flags: HDR_KEYCHECK,
            num_threads: 1,
            port: 5001,
            buf_len: 1470,
            win_band: 0,
            amount: -1000,
            extend: None,
            isoch: None,
            start_time: None,
            permit_key: None,
        }
        .ser(&mut buf);
        buf.put_u16(bad_len);
        buf.put_slice(&vec![b'x'; 16]);
        assert!(ClientHeader::parse(&mut buf.freeze()).is_err());
    }

    #[rstest]
    #[case::time(DurationOrAmount::Time(Duration::from_secs(10)))]
    #[case::amount(DurationOrAmount::Amount(5_000_000))]
    fn test_mode_round_trip(#[case] mode: DurationOrAmount) {
        let mut settings = client_settings(Protocol::Stream);
        settings.mode = mode;
        let header = ClientHeader::from_settings(&settings, Timestamp::now());
        assert_eq!(header.mode(), mode);
    }

    #[rstest]
    fn test_apply_to_isochronous() {
        let mut client = client_settings(Protocol::Datagram);
        client.burst = BurstMode::Isochronous {
            fps: 60.0,
            mean: 20e6,
            variance: 0.0,
        };
        client.flags.no_udp_fin = true;
        let header = ClientHeader::from_settings(&client, Timestamp::now());

        let mut server = client_settings(Protocol::Datagram);
        server.role = Role::Server;
        server.flags = FlowFlags::default();
        header.apply_to(&mut server, Timestamp::now());

        assert_eq!(
            server.burst,
            BurstMode::Isochronous {
                fps: 60.0,
                mean: 20e6,
                variance: 0.0
            }
        );
        assert!(server.flags.no_udp_fin);
        assert!(server.flags.seqno_64bit);
        assert_eq!(server.peer_version, Some((VERSION_UPPER, VERSION_LOWER)));
    }

    #[rstest]
    fn test_apply_to_stale_epoch_start_ignored() {
        let mut client = client_settings(Protocol::Stream);
        client.tx_epoch_start = Some(Timestamp::from_parts(1000, 0));
        let header = ClientHeader::from_settings(&client, Timestamp::from_parts(1000, 0));

        let mut server = client_settings(Protocol::Stream);
        server.role = Role::Server;
        // the server clock is hours away from the client's epoch
        header.apply_to(&mut server, Timestamp::from_parts(50_000, 0));
        assert!(server.tx_epoch_start.is_none());
    }

    #[rstest]
    fn test_apply_to_version1_modes() {
        for (flags, expected) in [
            (HDR_VERSION1, TestMode::TradeOff),
            (HDR_VERSION1 | HDR_RUN_NOW, TestMode::DualTest),
        ] {
            let header = ClientHeader {
                flags,
                num_threads: 1,
                port: 5001,
                buf_len: 128 * 1024,
                win_band: 0,
                amount: -1000,
                extend: None,
                isoch: None,
                start_time: None,
                permit_key: None,
            };
            let mut server = client_settings(Protocol::Stream);
            header.apply_to(&mut server, Timestamp::now());
            assert_eq!(server.test_mode, expected);
        }
    }

    #[rstest]
    fn test_small_trip_times_header() {
        let mut settings = client_settings(Protocol::Datagram);
        settings.flags.small_trip_times = true;
        let header = ClientHeader::from_settings(&settings, Timestamp::now());
        assert!(header.flags & HDR_SMALL_TRIPTIMES != 0);
        assert!(header.extend.is_none());
        assert_eq!(header.wire_len(), BASE_LEN);

        let mut server = client_settings(Protocol::Datagram);
        server.flags = FlowFlags::default();
        header.apply_to(&mut server, Timestamp::now());
        assert!(server.flags.trip_time);
    }

    #[rstest]
    fn test_header_ack_round_trip() {
        let ack = HeaderAck::ours();
        let mut buf = BytesMut::new();
        ack.ser(&mut buf);
        assert_eq!(buf.len(), HEADER_ACK_LEN);
        assert!(HeaderAck::matches(&buf));
        assert_eq!(HeaderAck::parse(&mut buf.freeze()).unwrap(), ack);
    }

    #[rstest]
    #[case::positive_64(true, 42)]
    #[case::negative_64(true, -987_654_321_012)]
    #[case::positive_32(false, 42)]
    #[case::negative_32(false, -2_000_000_000)]
    fn test_datagram_header_round_trip(#[case] seqno_64bit: bool, #[case] id: i64) {
        let header = DatagramHeader {
            id,
            timestamp: Timestamp::from_parts(123, 456),
        };
        let mut buf = BytesMut::new();
        header.ser(seqno_64bit, &mut buf);
        assert_eq!(buf.len(), DatagramHeader::wire_len(seqno_64bit));
        assert_eq!(DatagramHeader::parse(seqno_64bit, &mut buf.freeze()).unwrap(), header);
    }

    #[rstest]
    fn test_stream_burst_header_round_trip() {
        let header = StreamBurstHeader {
            start_time: Timestamp::from_parts(100, 1),
            packet_id: 5_000_000_000,
            write_time: Timestamp::from_parts(101, 2),
            burst_id: 7,
            burst_size: 131_072,
            burst_period_micros: 2_500_000,
        };
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), STREAM_BURST_HEADER_LEN);
        assert_eq!(StreamBurstHeader::parse(&mut buf.freeze()).unwrap(), header);
    }

    #[rstest]
    fn test_isoch_payload_round_trip() {
        let payload = IsochPayload {
            burst_period_micros: 16_666,
            burst_size: 41_666,
            prev_frame_id: 9,
            frame_id: 10,
            remaining: 1470,
            start_time: Timestamp::from_parts(55, 66),
        };
        let mut buf = BytesMut::new();
        payload.ser(&mut buf);
        assert_eq!(buf.len(), ISOCH_PAYLOAD_LEN);
        assert_eq!(IsochPayload::parse(&mut buf.freeze()).unwrap(), payload);
    }

    #[rstest]
    fn test_server_report_round_trip() {
        let report = ServerReport {
            flags: 0,
            total_len: 123_456_789,
            elapsed: Timestamp::from_parts(10, 500_000),
            error_count: 3,
            out_of_order: 1,
            datagrams: 84_000,
            jitter_micros: 250,
        };
        let mut buf = BytesMut::new();
        report.ser(&mut buf);
        assert_eq!(buf.len(), SERVER_REPORT_LEN);
        assert_eq!(ServerReport::parse(&mut buf.freeze()).unwrap(), report);
    }

    #[rstest]
    fn test_ack_not_confused_with_server_report() {
        let mut buf = BytesMut::new();
        ServerReport::default().ser(&mut buf);
        assert!(!HeaderAck::matches(&buf));
        assert!(HeaderAck::parse(&mut buf.freeze()).is_err());
    }
}
