// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Port multiplexing and message segmentation (spec.md §4.3).
//!
//! Maps the 16-bit frame metadata to `{port_id, seq, port_data}`,
//! dispatching to one of 32 registered ports (plus a default handler for
//! unbound ports), the way `hdds-micro`'s transport layer demultiplexes
//! onto its backend drivers — generalized here from "which radio" to
//! "which logical port".

use crate::datalink::Event as DlEvent;
use std::collections::HashMap;

/// Number of addressable ports (5-bit `port_id`).
pub const PORT_COUNT: usize = 32;

/// Logical message-boundary code derived from the start/stop metadata bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seq {
    /// A complete message in a single frame.
    Single,
    /// First frame of a multi-frame message.
    Start,
    /// An interior frame of a multi-frame message.
    Middle,
    /// Final frame of a multi-frame message.
    Stop,
}

impl Seq {
    fn from_bits(start: bool, stop: bool) -> Self {
        match (start, stop) {
            (true, true) => Seq::Single,
            (true, false) => Seq::Start,
            (false, false) => Seq::Middle,
            (false, true) => Seq::Stop,
        }
    }

    fn bits(self) -> (bool, bool) {
        match self {
            Seq::Single => (true, true),
            Seq::Start => (true, false),
            Seq::Middle => (false, false),
            Seq::Stop => (false, true),
        }
    }
}

/// Decoded 16-bit transport metadata (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Message-boundary code.
    pub seq: Seq,
    /// 0..=31 port id.
    pub port_id: u8,
    /// Per-port byte.
    pub port_data: u8,
}

impl Metadata {
    /// Decode the 16-bit wire metadata.
    pub fn decode(raw: u16) -> Self {
        let start = raw & 0x8000 != 0;
        let stop = raw & 0x4000 != 0;
        let port_id = ((raw >> 8) & 0x1F) as u8;
        let port_data = (raw & 0xFF) as u8;
        Self {
            seq: Seq::from_bits(start, stop),
            port_id,
            port_data,
        }
    }

    /// Encode to the 16-bit wire metadata.
    pub fn encode(self) -> u16 {
        let (start, stop) = self.seq.bits();
        let mut raw = 0u16;
        if start {
            raw |= 0x8000;
        }
        if stop {
            raw |= 0x4000;
        }
        raw |= (u16::from(self.port_id) & 0x1F) << 8;
        raw |= u16::from(self.port_data);
        raw
    }
}

/// Per-port collaborator registered via [`Transport::port_register`].
pub trait PortHandler {
    /// A link/transport event fired.
    fn on_event(&mut self, event: DlEvent);
    /// A message addressed to this port was reassembled (or arrived as
    /// a single frame).
    fn on_recv(&mut self, seq: Seq, port_data: u8, msg: &[u8]);
    /// Drain any replies this handler queued while processing the most
    /// recent `on_event`/`on_recv` call (e.g. Port0's RPC responses,
    /// PubSubPort's forwarded publications). Default: nothing queued.
    fn drain_outgoing(&mut self) -> Vec<(Seq, u8, Vec<u8>)> {
        Vec::new()
    }
}

struct PortEntry {
    meta_json: Option<String>,
    handler: Box<dyn PortHandler>,
}

/// Trait the caller must supply to actually push bytes down to the data
/// link (kept separate from [`crate::datalink::DataLink`]'s concrete
/// type so `Transport` doesn't need the link's const generics).
pub trait FrameSender {
    /// Send one data-link frame with the given 16-bit metadata.
    fn send_frame(&mut self, metadata: u16, msg: &[u8]) -> crate::error::Result<()>;
}

/// Port multiplexer sitting between [`crate::datalink::DataLink`] and
/// per-port handlers such as [`crate::port0::Port0`] or
/// [`crate::pubsub_port::PubSubPort`].
#[derive(Default)]
pub struct Transport {
    ports: HashMap<u8, PortEntry>,
    default_handler: Option<Box<dyn PortHandler>>,
}

impl Transport {
    /// Create an empty transport with no ports registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `port_id` (spec.md §4.3). Each
    /// registration immediately receives `current_event`, mirroring "each
    /// registration immediately delivers the current connection event".
    pub fn port_register(
        &mut self,
        port_id: u8,
        meta_json: Option<String>,
        mut handler: Box<dyn PortHandler>,
        current_event: DlEvent,
    ) -> crate::error::Result<()> {
        if port_id as usize >= PORT_COUNT {
            return Err(crate::error::Error::ParameterInvalid);
        }
        handler.on_event(current_event);
        self.ports.insert(
            port_id,
            PortEntry {
                meta_json,
                handler,
            },
        );
        Ok(())
    }

    /// Register the handler used for any `port_id` with no explicit
    /// registration.
    pub fn port_register_default(&mut self, handler: Box<dyn PortHandler>) {
        self.default_handler = Some(handler);
    }

    /// Encode metadata and hand the message to `sender` as one DL frame.
    ///
    /// Large messages are the caller's responsibility to pre-segment
    /// (spec.md leaves segmentation policy — how many bytes per frame —
    /// to the layer above Transport; Transport only encodes whichever
    /// `seq` it is told).
    pub fn send(
        &self,
        sender: &mut impl FrameSender,
        port_id: u8,
        seq: Seq,
        port_data: u8,
        msg: &[u8],
    ) -> crate::error::Result<()> {
        if port_id as usize >= PORT_COUNT {
            return Err(crate::error::Error::ParameterInvalid);
        }
        let metadata = Metadata {
            seq,
            port_id,
            port_data,
        }
        .encode();
        sender.send_frame(metadata, msg)
    }

    /// Decode `metadata` and dispatch `msg` to the registered (or
    /// default) port handler, then flush any reply the handler queued
    /// back out through `sender`. Invalid `port_id` values are logged
    /// and dropped (spec.md §7: "Transport surfaces receiver errors...as
    /// a log message; the frame is dropped").
    pub fn on_recv(&mut self, sender: &mut impl FrameSender, metadata: u16, msg: &[u8]) {
        let decoded = Metadata::decode(metadata);
        if decoded.port_id as usize >= PORT_COUNT {
            log::warn!("transport: dropping frame for invalid port {}", decoded.port_id);
            return;
        }
        let outgoing = if let Some(entry) = self.ports.get_mut(&decoded.port_id) {
            entry.handler.on_recv(decoded.seq, decoded.port_data, msg);
            entry.handler.drain_outgoing()
        } else if let Some(handler) = self.default_handler.as_mut() {
            handler.on_recv(decoded.seq, decoded.port_data, msg);
            handler.drain_outgoing()
        } else {
            log::debug!("transport: no handler for port {}", decoded.port_id);
            Vec::new()
        };
        for (seq, port_data, reply) in outgoing {
            let _ = self.send(sender, decoded.port_id, seq, port_data, &reply);
        }
    }

    /// Fan an event out to every registered port (and the default handler).
    pub fn on_event(&mut self, event: DlEvent) {
        for entry in self.ports.values_mut() {
            entry.handler.on_event(event);
        }
        if let Some(handler) = self.default_handler.as_mut() {
            handler.on_event(event);
        }
    }

    /// Inject `TRANSPORT_CONNECTED` or `APP_CONNECTED` (spec.md §4.3:
    /// `event_inject` restricted to these two).
    pub fn event_inject(&mut self, event: DlEvent) {
        if matches!(event, DlEvent::TransportConnected | DlEvent::AppConnected) {
            self.on_event(event);
        }
    }

    /// The stored JSON metadata string for `port_id`, if any.
    pub fn meta_get(&self, port_id: u8) -> Option<&str> {
        self.ports.get(&port_id).and_then(|e| e.meta_json.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorded {
        events: Vec<DlEvent>,
        recvs: Vec<(Seq, u8, Vec<u8>)>,
    }

    struct Recorder(Rc<RefCell<Recorded>>);
    impl PortHandler for Recorder {
        fn on_event(&mut self, event: DlEvent) {
            self.0.borrow_mut().events.push(event);
        }
        fn on_recv(&mut self, seq: Seq, port_data: u8, msg: &[u8]) {
            self.0.borrow_mut().recvs.push((seq, port_data, msg.to_vec()));
        }
    }

    #[derive(Default)]
    struct CapturingSender {
        sent: Vec<(u16, Vec<u8>)>,
    }
    impl FrameSender for CapturingSender {
        fn send_frame(&mut self, metadata: u16, msg: &[u8]) -> crate::error::Result<()> {
            self.sent.push((metadata, msg.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn metadata_round_trips_through_encode_decode() {
        for seq in [Seq::Single, Seq::Start, Seq::Middle, Seq::Stop] {
            let m = Metadata {
                seq,
                port_id: 17,
                port_data: 0xAB,
            };
            let raw = m.encode();
            assert_eq!(Metadata::decode(raw), m);
        }
    }

    #[test]
    fn registration_delivers_current_event_immediately() {
        let mut t = Transport::new();
        let shared = Rc::new(RefCell::new(Recorded::default()));
        t.port_register(3, None, Box::new(Recorder(shared.clone())), DlEvent::Connected)
            .unwrap();
        assert_eq!(shared.borrow().events, vec![DlEvent::Connected]);
    }

    #[test]
    fn on_recv_dispatches_to_registered_port() {
        let mut t = Transport::new();
        let shared = Rc::new(RefCell::new(Recorded::default()));
        t.port_register(3, None, Box::new(Recorder(shared.clone())), DlEvent::Connected)
            .unwrap();

        let metadata = Metadata {
            seq: Seq::Single,
            port_id: 3,
            port_data: 9,
        }
        .encode();
        let mut sender = CapturingSender::default();
        t.on_recv(&mut sender, metadata, &[1, 2, 3]);
        assert_eq!(
            shared.borrow().recvs,
            vec![(Seq::Single, 9, vec![1, 2, 3])]
        );
    }

    #[test]
    fn on_recv_falls_back_to_default_handler() {
        let mut t = Transport::new();
        let shared = Rc::new(RefCell::new(Recorded::default()));
        t.port_register_default(Box::new(Recorder(shared.clone())));

        let metadata = Metadata {
            seq: Seq::Single,
            port_id: 9,
            port_data: 0,
        }
        .encode();
        let mut sender = CapturingSender::default();
        t.on_recv(&mut sender, metadata, &[7]);
        assert_eq!(shared.borrow().recvs, vec![(Seq::Single, 0, vec![7])]);
    }

    #[test]
    fn invalid_port_id_rejected_on_register_and_send() {
        let mut t = Transport::new();
        let shared = Rc::new(RefCell::new(Recorded::default()));
        assert_eq!(
            t.port_register(32, None, Box::new(Recorder(shared)), DlEvent::Connected),
            Err(crate::error::Error::ParameterInvalid)
        );
        let mut sender = CapturingSender::default();
        assert_eq!(
            t.send(&mut sender, 32, Seq::Single, 0, &[1]),
            Err(crate::error::Error::ParameterInvalid)
        );
    }

    #[test]
    fn event_inject_only_allows_the_two_injectable_events() {
        let mut t = Transport::new();
        let shared = Rc::new(RefCell::new(Recorded::default()));
        t.port_register(0, None, Box::new(Recorder(shared.clone())), DlEvent::Connected)
            .unwrap();
        t.event_inject(DlEvent::TransportConnected);
        t.event_inject(DlEvent::Disconnected); // must be ignored
        assert_eq!(
            shared.borrow().events,
            vec![DlEvent::Connected, DlEvent::TransportConnected]
        );
    }

    #[test]
    fn meta_get_returns_stored_json() {
        let mut t = Transport::new();
        let shared = Rc::new(RefCell::new(Recorded::default()));
        t.port_register(
            1,
            Some("{\"dtype\":\"u32\"}".to_string()),
            Box::new(Recorder(shared)),
            DlEvent::Connected,
        )
        .unwrap();
        assert_eq!(t.meta_get(1), Some("{\"dtype\":\"u32\"}"));
        assert_eq!(t.meta_get(2), None);
    }
}
