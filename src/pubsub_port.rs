// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridges two [`crate::pubsub::PubSub`] instances across one transport
//! port (spec.md §4.5).
//!
//! Mirrors the teacher's bridging-writer pattern (one side forwards
//! retained state to the other on connect, then both sides mirror
//! incremental updates) generalized from radio-to-radio framing to
//! topic publication forwarding.

use crate::datalink::Event as DlEvent;
use crate::pubsub::{PubSub, PublishValue, Value};
use crate::transport::{PortHandler, Seq};
use std::collections::{HashSet, VecDeque};

/// 8-bit `port_data[7:0]` message subtype (spec.md §4.5 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Subtype {
    /// Connection handshake (`conn_count` exchange).
    Conn = 0,
    /// Unit-separator list of subscribed topics.
    TopicList = 1,
    /// Add one subscription.
    TopicAdd = 2,
    /// Remove one subscription.
    TopicRemove = 3,
    /// A topic update being forwarded.
    Publish = 4,
}

impl Subtype {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Subtype::Conn),
            1 => Some(Subtype::TopicList),
            2 => Some(Subtype::TopicAdd),
            3 => Some(Subtype::TopicRemove),
            4 => Some(Subtype::Publish),
            _ => None,
        }
    }
}

/// Which end of the bridge this instance plays (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Initiates the handshake (the "client" role).
    Upstream,
    /// Responds to the handshake (the "server" role).
    Downstream,
}

fn encode_conn(is_response: bool, server_conn_count: u64, client_conn_count: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(17);
    out.push(is_response as u8);
    out.extend_from_slice(&server_conn_count.to_le_bytes());
    out.extend_from_slice(&client_conn_count.to_le_bytes());
    out
}

fn decode_conn(msg: &[u8]) -> Option<(bool, u64, u64)> {
    if msg.len() < 17 {
        return None;
    }
    let is_response = msg[0] != 0;
    let server = u64::from_le_bytes(msg[1..9].try_into().ok()?);
    let client = u64::from_le_bytes(msg[9..17].try_into().ok()?);
    Some((is_response, server, client))
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(topic.len() + payload.len() + 6);
    out.extend_from_slice(&(topic.len() as u32).to_le_bytes());
    out.extend_from_slice(topic.as_bytes());
    out.push(0);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_publish(msg: &[u8]) -> Option<(&str, &[u8])> {
    if msg.len() < 4 {
        return None;
    }
    let topic_len = u32::from_le_bytes(msg[0..4].try_into().ok()?) as usize;
    let topic_start = 4;
    let topic_end = topic_start + topic_len;
    if msg.len() < topic_end + 1 + 4 {
        return None;
    }
    let topic = std::str::from_utf8(&msg[topic_start..topic_end]).ok()?;
    let len_start = topic_end + 1; // skip NUL
    let payload_len = u32::from_le_bytes(msg[len_start..len_start + 4].try_into().ok()?) as usize;
    let payload_start = len_start + 4;
    if msg.len() < payload_start + payload_len {
        return None;
    }
    Some((topic, &msg[payload_start..payload_start + payload_len]))
}

/// One side of a PubSub-to-PubSub bridge over a transport port.
pub struct PubSubPort {
    mode: Mode,
    conn_count: u64,
    peer_conn_count: Option<u64>,
    pubsub: std::rc::Rc<std::cell::RefCell<PubSub>>,
    forwarding: bool,
    forwarded: HashSet<String>,
    outgoing: VecDeque<(Seq, u8, Vec<u8>)>,
}

impl PubSubPort {
    /// Create a port bridging `pubsub` in `mode`, having already
    /// persisted `conn_count` increments across resets (spec.md §4.5:
    /// "each side persists `conn_count` incremented on each transport
    /// connect").
    pub fn new(mode: Mode, conn_count: u64, pubsub: std::rc::Rc<std::cell::RefCell<PubSub>>) -> Self {
        Self {
            mode,
            conn_count,
            peer_conn_count: None,
            pubsub,
            forwarding: false,
            forwarded: HashSet::new(),
            outgoing: VecDeque::new(),
        }
    }

    /// Whether this side currently owns (and forwards) the retained
    /// topic space after the last recovery-rule decision.
    pub fn is_forwarding(&self) -> bool {
        self.forwarding
    }

    fn queue(&mut self, subtype: Subtype, is_request: bool, payload: Vec<u8>) {
        let port_data = ((is_request as u8) << 7) | (subtype as u8);
        self.outgoing.push_back((Seq::Single, port_data, payload));
    }

    fn apply_recovery_rule(&mut self) {
        let Some(peer) = self.peer_conn_count else {
            return;
        };
        let (server_count, client_count) = match self.mode {
            Mode::Downstream => (self.conn_count, peer),
            Mode::Upstream => (peer, self.conn_count),
        };
        let client_propagates = (client_count == 1 && server_count == 1) || client_count > server_count;
        let we_are_client = matches!(self.mode, Mode::Upstream);
        self.forwarding = client_propagates == we_are_client;
        self.forwarded.clear();
    }

    /// Scan the owned retained topic space and queue PUBLISH for every
    /// value not yet forwarded across the bridge. Call this after each
    /// local `PubSub::process()` once `is_forwarding()` is `true` —
    /// kept as an explicit host-driven pump (rather than a subscriber
    /// callback reaching back into this port) to avoid a `PubSubPort`
    /// borrowing itself from inside a closure it owns.
    pub fn pump(&mut self, topics: &[(&str, &PublishValue)]) {
        if !self.forwarding {
            return;
        }
        for (topic, value) in topics {
            if self.forwarded.insert(topic.to_string()) {
                forward_update_payload(self, topic, value);
            }
        }
    }
}

impl PortHandler for PubSubPort {
    fn on_event(&mut self, event: DlEvent) {
        if event == DlEvent::TransportConnected {
            self.conn_count += 1;
            self.peer_conn_count = None;
            self.pubsub.borrow_mut().unsubscribe_from_all();
            if self.mode == Mode::Downstream {
                self.queue(Subtype::Conn, true, encode_conn(false, self.conn_count, 0));
            }
        } else if event == DlEvent::Disconnected {
            self.pubsub.borrow_mut().unsubscribe_from_all();
            self.forwarding = false;
            self.forwarded.clear();
            self.peer_conn_count = None;
        }
    }

    fn on_recv(&mut self, _seq: Seq, port_data: u8, msg: &[u8]) {
        let is_request = port_data & 0x80 != 0;
        let Some(subtype) = Subtype::from_u8(port_data & 0x7F) else {
            log::warn!("pubsub_port: unknown subtype {}", port_data);
            return;
        };
        match subtype {
            Subtype::Conn => {
                if let Some((is_response, server_count, client_count)) = decode_conn(msg) {
                    if !is_response && self.mode == Mode::Upstream {
                        self.conn_count += 1;
                        self.peer_conn_count = Some(server_count);
                        self.queue(
                            Subtype::Conn,
                            false,
                            encode_conn(true, server_count, self.conn_count),
                        );
                        self.apply_recovery_rule();
                    } else if is_response && self.mode == Mode::Downstream {
                        self.peer_conn_count = Some(client_count);
                        self.apply_recovery_rule();
                    }
                }
            }
            Subtype::Publish => {
                if let Some((topic, payload)) = decode_publish(msg) {
                    let value = PublishValue::retained(Value::Bin(payload.to_vec()));
                    let _ = self.pubsub.borrow_mut().publish(topic, value, None);
                }
            }
            Subtype::TopicAdd | Subtype::TopicRemove | Subtype::TopicList => {
                // Remote subscription bookkeeping: recorded for visibility
                // only, this bridge always mirrors the full owned subtree
                // rather than a per-topic allowlist.
                let _ = is_request;
            }
        }
    }

    fn drain_outgoing(&mut self) -> Vec<(Seq, u8, Vec<u8>)> {
        self.outgoing.drain(..).collect()
    }
}

fn forward_update_payload(port: &mut PubSubPort, topic: &str, value: &PublishValue) {
    let payload = match &value.value {
        Value::Bin(b) => b.clone(),
        Value::Str(s) | Value::Json(s) => s.clone().into_bytes(),
        _ => Vec::new(),
    };
    port.queue(Subtype::Publish, true, encode_publish(topic, &payload));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn conn_handshake_round_trips_counts() {
        let payload = encode_conn(true, 3, 5);
        assert_eq!(decode_conn(&payload), Some((true, 3, 5)));
    }

    #[test]
    fn publish_payload_round_trips() {
        let encoded = encode_publish("a/b", &[1, 2, 3]);
        assert_eq!(decode_publish(&encoded), Some(("a/b", &[1u8, 2, 3][..])));
    }

    #[test]
    fn first_connection_on_both_sides_makes_client_authoritative() {
        // Case: client_conn_count == 1 && server_conn_count == 1 (spec.md §4.5).
        let ps = Rc::new(RefCell::new(PubSub::new("up", 4096)));
        let mut port = PubSubPort::new(Mode::Upstream, 0, ps);
        port.on_event(DlEvent::TransportConnected);
        port.on_recv(Seq::Single, 0, &encode_conn(false, 1, 0));
        // The port queued a CONN response carrying its own (now 1) count.
        let outgoing = port.drain_outgoing();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].1 & 0x7F, Subtype::Conn as u8);
    }

    #[test]
    fn downstream_sends_conn_request_on_connect() {
        let ps = Rc::new(RefCell::new(PubSub::new("down", 4096)));
        let mut port = PubSubPort::new(Mode::Downstream, 0, ps);
        port.on_event(DlEvent::TransportConnected);
        let outgoing = port.drain_outgoing();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].1 & 0x7F, Subtype::Conn as u8);
        assert!(outgoing[0].1 & 0x80 != 0, "conn request carries the request bit");
    }

    #[test]
    fn disconnect_clears_subscriptions() {
        let ps = Rc::new(RefCell::new(PubSub::new("up", 4096)));
        let mut port = PubSubPort::new(Mode::Upstream, 0, ps.clone());
        port.on_event(DlEvent::TransportConnected);
        port.on_recv(Seq::Single, 0, &encode_conn(false, 1, 0));
        assert!(port.is_forwarding());
        port.on_event(DlEvent::Disconnected);
        assert!(!port.is_forwarding());
    }

    #[test]
    fn remote_publish_updates_local_retained_value() {
        let ps = Rc::new(RefCell::new(PubSub::new("down", 4096)));
        let mut port = PubSubPort::new(Mode::Downstream, 0, ps.clone());
        let msg = encode_publish("x/y", b"hello");
        port.on_recv(Seq::Single, Subtype::Publish as u8, &msg);
        ps.borrow_mut().process();
        assert_eq!(
            ps.borrow().query("x/y"),
            Some(&PublishValue::retained(Value::Bin(b"hello".to_vec())))
        );
    }
}
