//! Table of live flows keyed by the 5-tuple. The datagram listener depends on the
//!  conditional insert: a retransmitted first packet from a peer already in the table
//!  must be dropped instead of spawning a second server worker.

use std::net::SocketAddr;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::Protocol;
use crate::timing::clock::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowEntry {
    pub accepted_at: Timestamp,
}

#[derive(Default)]
pub struct FlowTable {
    inner: Mutex<FxHashMap<FlowKey, FlowEntry>>,
}
impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable::default()
    }

    /// Unconditional insert; replaces any previous entry for the key.
    pub fn push(&self, key: FlowKey) {
        let entry = FlowEntry {
            accepted_at: Timestamp::now(),
        };
        self.inner.lock().expect("flow table mutex poisoned").insert(key, entry);
    }

    /// Insert only if the key is new. Duplicates are first-packet retransmits.
    pub fn push_conditional(&self, key: FlowKey) -> PushOutcome {
        let mut map = self.inner.lock().expect("flow table mutex poisoned");
        if map.contains_key(&key) {
            debug!(?key, "duplicate flow, dropping");
            return PushOutcome::Duplicate;
        }
        map.insert(
            key,
            FlowEntry {
                accepted_at: Timestamp::now(),
            },
        );
        PushOutcome::Inserted
    }

    /// Returns `true` if the flow was present.
    pub fn remove(&self, key: &FlowKey) -> bool {
        self.inner.lock().expect("flow table mutex poisoned").remove(key).is_some()
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.inner.lock().expect("flow table mutex poisoned").contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("flow table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    fn key(peer_port: u16, protocol: Protocol) -> FlowKey {
        FlowKey {
            local: SocketAddr::from_str("10.0.0.1:5001").unwrap(),
            peer: SocketAddr::from_str(&format!("10.0.0.2:{}", peer_port)).unwrap(),
            protocol,
        }
    }

    #[rstest]
    fn test_push_conditional_inserted_then_duplicate() {
        let table = FlowTable::new();
        assert_eq!(table.push_conditional(key(4000, Protocol::Datagram)), PushOutcome::Inserted);
        assert_eq!(table.push_conditional(key(4000, Protocol::Datagram)), PushOutcome::Duplicate);
        assert_eq!(table.len(), 1);
    }

    #[rstest]
    fn test_distinct_tuples_coexist() {
        let table = FlowTable::new();
        assert_eq!(table.push_conditional(key(4000, Protocol::Datagram)), PushOutcome::Inserted);
        assert_eq!(table.push_conditional(key(4001, Protocol::Datagram)), PushOutcome::Inserted);
        // same 5-tuple except protocol is a different flow
        assert_eq!(table.push_conditional(key(4000, Protocol::Stream)), PushOutcome::Inserted);
        assert_eq!(table.len(), 3);
    }

    #[rstest]
    fn test_remove_then_reinsert() {
        let table = FlowTable::new();
        let k = key(4000, Protocol::Datagram);
        table.push(k);
        assert!(table.remove(&k));
        assert!(!table.remove(&k));
        assert_eq!(table.push_conditional(k), PushOutcome::Inserted);
    }
}
