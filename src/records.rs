//! Per-packet accounting records and the per-flow ring that carries them from a traffic
//!  task to the reporter, plus the shared aggregates a flow may be attached to.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use crate::barrier::StartBarrier;
use crate::timing::clock::Timestamp;

/// Default ring depth; deep enough that a reporter stalled for a full interval does not
///  stall the producer.
pub const DEFAULT_RING_DEPTH: usize = 4096;

/// Outcome classification of a single write, driving accounting downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteStatus {
    #[default]
    NoErr,
    /// Non-fatal and counted against the offered load (the kernel dropped it on the
    ///  floor after accepting the cost, e.g. ENOBUFS).
    ErrAccount,
    /// Non-fatal and not counted (nothing left the socket, e.g. would-block).
    ErrNoAccount,
    /// The transmit loop must exit.
    ErrFatal,
}
impl WriteStatus {
    /// Map an I/O error to the accounting bucket. Would-block, interruptions and
    ///  timeouts never left the stack; ENOBUFS charged the attempt; anything else ends
    ///  the flow.
    pub fn classify(err: &io::Error) -> WriteStatus {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
                WriteStatus::ErrNoAccount
            }
            _ if err.raw_os_error() == Some(libc::ENOBUFS) => WriteStatus::ErrAccount,
            _ => WriteStatus::ErrFatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        *self == WriteStatus::ErrFatal
    }
}

/// One entry of a flow's record stream. Packet ids are strictly increasing per flow; a
///  negated id is the datagram termination marker and is always last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketRecord {
    pub packet_id: i64,
    pub packet_len: usize,
    pub packet_time: Timestamp,
    pub sent_time: Timestamp,
    pub prev_sent_time: Timestamp,
    pub prev_packet_time: Timestamp,
    pub status: WriteStatus,
    /// Advances interval accounting when no I/O happened; carries `packet_len == 0`.
    pub empty_report: bool,
    /// Set on the write completing a burst; the receiver can compute trip time from it.
    pub transit_ready: bool,
    pub frame_id: u64,
    pub burst_size: u32,
    pub remaining: u64,
    pub tcp_rtt_micros: Option<u32>,
}
impl PacketRecord {
    /// A null event: nothing was sent, the reporter should just advance its interval
    ///  boundaries up to `now`.
    pub fn null_event(now: Timestamp) -> PacketRecord {
        PacketRecord {
            packet_time: now,
            empty_report: true,
            ..PacketRecord::default()
        }
    }

    pub fn is_final(&self) -> bool {
        self.packet_id < 0
    }
}

/// Create a single-producer single-consumer record ring of the given depth.
pub fn record_ring(depth: usize) -> (RecordProducer, RecordConsumer) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (RecordProducer { tx }, RecordConsumer { rx })
}

#[derive(Clone)]
pub struct RecordProducer {
    tx: mpsc::Sender<PacketRecord>,
}
impl RecordProducer {
    /// Enqueue a record. The fast path never waits; with the ring full the producer
    ///  waits for a slot, which bounds the latency at one consumer dequeue.
    pub async fn push(&self, record: PacketRecord) {
        if let Err(mpsc::error::TrySendError::Full(record)) = self.tx.try_send(record) {
            if self.tx.send(record).await.is_err() {
                warn!("record ring consumer is gone, dropping packet record");
            }
        }
    }
}

pub struct RecordConsumer {
    rx: mpsc::Receiver<PacketRecord>,
}
impl RecordConsumer {
    /// `None` once the producer is dropped and the ring is drained.
    pub async fn recv(&mut self) -> Option<PacketRecord> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PacketRecord> {
        self.rx.try_recv().ok()
    }

    /// Drain whatever is currently buffered.
    pub fn drain(&mut self) -> Vec<PacketRecord> {
        let mut out = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            out.push(record);
        }
        out
    }
}

/// A start time assigned exactly once, by the first flow to arrive, under the lock.
#[derive(Default)]
pub struct StartTimeCell {
    inner: Mutex<Option<Timestamp>>,
}
impl StartTimeCell {
    /// Returns `true` if this call stored the value.
    pub fn set_once(&self, ts: Timestamp) -> bool {
        let mut guard = self.inner.lock().expect("start time mutex poisoned");
        if guard.is_none() {
            *guard = Some(ts);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<Timestamp> {
        *self.inner.lock().expect("start time mutex poisoned")
    }
}

/// Aggregate over a group of parallel streams. The aggregate owns no flows; flows hold
///  shared references and the last one out drops it.
#[derive(Default)]
pub struct GroupSumReport {
    pub start_time: StartTimeCell,
    members: AtomicUsize,
}
impl GroupSumReport {
    pub fn new(members: usize) -> GroupSumReport {
        GroupSumReport {
            start_time: StartTimeCell::default(),
            members: AtomicUsize::new(members),
        }
    }

    /// Decrement on flow exit; returns `true` when this was the last member.
    pub fn leave(&self) -> bool {
        self.members.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Aggregate binding the two directions of a full-duplex pair: a two-way start barrier
///  and the shared start time, assigned once by whichever direction arrives first.
pub struct FullDuplexReport {
    pub start_time: StartTimeCell,
    pub barrier: StartBarrier,
}
impl FullDuplexReport {
    pub fn new() -> FullDuplexReport {
        FullDuplexReport {
            start_time: StartTimeCell::default(),
            barrier: StartBarrier::new(2),
        }
    }
}
impl Default for FullDuplexReport {
    fn default() -> Self {
        Self::new()
    }
}
