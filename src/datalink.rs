// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Selective-Repeat ARQ data link layer (spec.md §4.2).
//!
//! Owns frame-id assignment, the TX ring of full constructed frames, the
//! RX reorder window, ACK/NACK generation, the connection FSM, and
//! window-size negotiation (the negotiated value itself is driven by
//! [`crate::port0`]). No heap: `TX_RING` and `RX_WINDOW` are const
//! generics sizing fixed arrays on the struct, continuing the
//! no-allocation style of [`crate::framer::Framer`] this was grounded
//! on, generalized from the teacher's single fixed-topology
//! `HeartbeatTx`/writer retransmit split into a generic selective-repeat
//! window.
//!
//! Retransmission is driven by an explicit [`DataLink::service`] call
//! rather than a timer callback registered with an [`crate::event_manager::EventManager`]:
//! routing a scheduled callback back into a `&mut DataLink` that also
//! owns the TX ring it would need to mutate has no clean answer without
//! `Rc<RefCell<_>>` aliasing, so the host calls `service(now)` from its
//! own I/O-thread loop (spec.md §5) instead, optionally itself woken by
//! a recurring `EventManager` entry.

use crate::framer::{frame_id_subtract, Crc32Variant, FrameSink, FrameType, Framer, FRAME_ID_MAX};
use crate::ll_driver::LlDriver;
use crate::time::Timestamp;

/// Maximum constructed DATA frame size the TX ring must hold (13 bytes
/// of overhead plus a 256-byte payload).
const TX_FRAME_BUF: usize = 13 + crate::framer::MAX_DATA_SIZE;

/// Link-layer connection events delivered upward (spec.md §4.2 FSM).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The peer requested (or we requested) a reset.
    ResetRequest,
    /// The FSM reached `CONNECTED`.
    Connected,
    /// The FSM fell back to `DISCONNECTED` (retry threshold exceeded).
    Disconnected,
    /// Injected once Port0 negotiation completes.
    TransportConnected,
    /// Injected once the application layer above transport is ready.
    AppConnected,
}

/// Upper-layer collaborator registered via [`DataLink::register_upper_layer`].
pub trait UpperLayer {
    /// A link event fired.
    fn on_event(&mut self, event: Event);
    /// A DATA frame was delivered, in order.
    fn on_recv(&mut self, metadata: u16, payload: &[u8]);
}

/// Connection finite state machine (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No reset handshake in progress or completed.
    Disconnected,
    /// RESET has been transmitted; waiting for the peer's RESET.
    ConnectingSendReset,
    /// Our own RESET was observed; waiting for confirmation traffic.
    ConnectingWaitReset,
    /// Handshake complete; frames flow normally.
    Connected,
}

/// Tunable knobs for one [`DataLink`] instance.
#[derive(Debug, Clone, Copy)]
pub struct DataLinkConfig {
    /// Milliseconds before an unacked SENT slot is retransmitted.
    pub tx_timeout_ms: u32,
    /// Consecutive retransmissions of the same slot before `Disconnected`.
    pub retry_threshold: u32,
    /// Ceiling `tx_window_set` may raise the effective window to.
    pub tx_window_max: u16,
    /// Length-byte CRC-8 polynomial (spec.md §9 Open Questions: 0xD7 or 0xEB).
    pub length_crc_poly: u8,
    /// Frame-body CRC-32 variant.
    pub crc32: Crc32Variant,
}

impl Default for DataLinkConfig {
    fn default() -> Self {
        Self {
            tx_timeout_ms: 200,
            retry_threshold: 8,
            tx_window_max: 16,
            length_crc_poly: crate::crc::CRC8_POLY_0XD7,
            crc32: Crc32Variant::Ccitt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxSlotState {
    Empty,
    Queued,
    Sent,
    Acked,
}

#[derive(Clone, Copy)]
struct TxSlot {
    state: TxSlotState,
    frame_id: u16,
    send_time: Timestamp,
    retry_count: u32,
    len: usize,
    buf: [u8; TX_FRAME_BUF],
}

impl Default for TxSlot {
    fn default() -> Self {
        Self {
            state: TxSlotState::Empty,
            frame_id: 0,
            send_time: Timestamp::ZERO,
            retry_count: 0,
            len: 0,
            buf: [0u8; TX_FRAME_BUF],
        }
    }
}

#[derive(Clone, Copy)]
struct RxSlot {
    occupied: bool,
    metadata: u16,
    len: usize,
    buf: [u8; crate::framer::MAX_DATA_SIZE],
}

impl Default for RxSlot {
    fn default() -> Self {
        Self {
            occupied: false,
            metadata: 0,
            len: 0,
            buf: [0u8; crate::framer::MAX_DATA_SIZE],
        }
    }
}

/// Byte/frame counters exposed to Port0's `STATUS` response (spec.md §3a).
#[derive(Debug, Clone, Copy, Default)]
pub struct DlStatus {
    /// DATA payload bytes sent.
    pub tx_bytes: u64,
    /// DATA frames sent (including retransmissions).
    pub tx_frames: u64,
    /// DATA payload bytes delivered upward.
    pub rx_bytes: u64,
    /// DATA frames delivered upward (in order, de-duplicated).
    pub rx_frames: u64,
    /// Retransmissions performed.
    pub retransmissions: u64,
    /// Current effective TX window.
    pub tx_window: u16,
}

/// Outcome of an outgoing frames flush attempt against the underlying LL.
fn wrapping_add_11bit(id: u16, delta: u16) -> u16 {
    (id.wrapping_add(delta)) & FRAME_ID_MAX
}

/// Selective-repeat ARQ data link over an `LlDriver`. `TX_RING` bounds
/// the number of frames that may be outstanding at once; `RX_WINDOW`
/// bounds how far out of order the peer may send before being NACKed.
pub struct DataLink<LL: LlDriver, const TX_RING: usize, const RX_WINDOW: usize> {
    ll: LL,
    framer: Framer,
    config: DataLinkConfig,

    tx_ring: [TxSlot; TX_RING],
    tx_window: u16,
    tx_frame_next: u16,
    tx_frame_last_acked: u16,

    rx_window: [RxSlot; RX_WINDOW],
    rx_frame_next: u16,
    rx_nacked: [bool; RX_WINDOW],

    conn_state: ConnState,
    upper: Option<Box<dyn UpperLayer>>,
    status: DlStatus,
    last_now: Timestamp,
}

impl<LL: LlDriver, const TX_RING: usize, const RX_WINDOW: usize> DataLink<LL, TX_RING, RX_WINDOW> {
    /// Create a new data link over `ll` using `config`.
    pub fn new(ll: LL, config: DataLinkConfig) -> Self {
        let length_crc_poly = config.length_crc_poly;
        let crc32 = config.crc32;
        Self {
            ll,
            framer: Framer::with_crc(length_crc_poly, crc32),
            config,
            tx_ring: core::array::from_fn(|_| TxSlot::default()),
            tx_window: 1,
            tx_frame_next: 0,
            tx_frame_last_acked: FRAME_ID_MAX, // so the first frame (id 0) is `> last_acked`
            rx_window: core::array::from_fn(|_| RxSlot::default()),
            rx_frame_next: 0,
            rx_nacked: [false; RX_WINDOW],
            conn_state: ConnState::Disconnected,
            upper: None,
            status: DlStatus::default(),
            last_now: Timestamp::ZERO,
        }
    }

    /// Register the upper layer's event/receive callbacks.
    pub fn register_upper_layer(&mut self, upper: Box<dyn UpperLayer>) {
        self.upper = Some(upper);
    }

    /// Current connection FSM state.
    pub fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    /// Snapshot of link counters for Port0's `STATUS` response.
    pub fn status(&self) -> DlStatus {
        let mut s = self.status;
        s.tx_window = self.tx_window;
        s
    }

    /// Framer observability counters (spec.md §4.1).
    pub fn framer_counters(&self) -> (u64, u64, u64) {
        (
            self.framer.total_bytes,
            self.framer.ignored_bytes,
            self.framer.resync,
        )
    }

    /// Raise the effective TX window. Cannot be decreased before a reset.
    pub fn tx_window_set(&mut self, n: u16) -> crate::error::Result<()> {
        if n == 0 || n > self.config.tx_window_max {
            return Err(crate::error::Error::ParameterInvalid);
        }
        if n < self.tx_window {
            return Err(crate::error::Error::ParameterInvalid);
        }
        self.tx_window = n;
        Ok(())
    }

    fn unacked_count(&self) -> usize {
        self.tx_ring
            .iter()
            .filter(|s| s.state != TxSlotState::Empty)
            .count()
    }

    /// Slots currently transmitted and awaiting ACK — the count
    /// `tx_window` actually bounds (spec.md §4.2 step 3), as opposed to
    /// [`Self::unacked_count`]'s ring occupancy.
    fn sent_count(&self) -> usize {
        self.tx_ring
            .iter()
            .filter(|s| s.state == TxSlotState::Sent)
            .count()
    }

    /// Walk the ring in frame-id order from the oldest unacked frame and
    /// transmit every `QUEUED` slot the window still has room for,
    /// skipping any the LL driver can't accept yet (it stays `QUEUED`
    /// and is retried on the next call, e.g. from [`Self::service`] or
    /// after the next `AckAll`).
    fn flush_queued(&mut self, now: Timestamp) {
        let mut id = wrapping_add_11bit(self.tx_frame_last_acked, 1);
        for _ in 0..TX_RING {
            if self.sent_count() >= self.tx_window as usize {
                break;
            }
            let idx = (id as usize) % TX_RING;
            if self.tx_ring[idx].frame_id == id && self.tx_ring[idx].state == TxSlotState::Queued {
                self.try_send_slot(idx, now);
            }
            id = wrapping_add_11bit(id, 1);
        }
    }

    /// Queue `msg` for transmission. Non-blocking: this hosted
    /// implementation treats every `timeout_ms` value as zero (see the
    /// module doc comment on `service`); true blocking would need a
    /// condvar-style collaborator the external interfaces (spec.md §6)
    /// never define.
    pub fn send(&mut self, metadata: u16, msg: &[u8], now: Timestamp) -> crate::error::Result<()> {
        if msg.is_empty() || msg.len() > crate::framer::MAX_DATA_SIZE {
            return Err(crate::error::Error::TooBig);
        }
        // Ring exhaustion is the only reason to reject here; the window
        // only gates which `QUEUED` slots `flush_queued` actually
        // transmits (spec.md §4.2 step 3).
        if self.unacked_count() >= TX_RING {
            return Err(crate::error::Error::Full);
        }
        self.last_now = now;

        let frame_id = self.tx_frame_next;
        self.tx_frame_next = wrapping_add_11bit(frame_id, 1);
        let idx = (frame_id as usize) % TX_RING;

        let len = self.framer.construct_data(
            &mut self.tx_ring[idx].buf,
            frame_id,
            metadata,
            msg,
        )?;
        {
            let slot = &mut self.tx_ring[idx];
            slot.len = len;
            slot.frame_id = frame_id;
            slot.state = TxSlotState::Queued;
            slot.retry_count = 0;
        }

        self.flush_queued(now);
        Ok(())
    }

    fn try_send_slot(&mut self, idx: usize, now: Timestamp) {
        let (len, bytes_ok) = {
            let slot = &self.tx_ring[idx];
            (slot.len, self.ll.send_available() >= slot.len)
        };
        if !bytes_ok {
            return;
        }
        let sent = self.ll.send(&self.tx_ring[idx].buf[..len]);
        if sent {
            let slot = &mut self.tx_ring[idx];
            slot.state = TxSlotState::Sent;
            slot.send_time = now;
            self.status.tx_frames += 1;
            self.status.tx_bytes += len as u64;
        }
    }

    /// Drive the framer with any newly received bytes from the LL driver.
    pub fn ll_recv(&mut self, now: Timestamp) {
        self.last_now = now;
        let bytes = self.ll.recv();
        if bytes.is_empty() {
            return;
        }
        let mut framer = core::mem::take(&mut self.framer);
        framer.recv(&bytes, self);
        self.framer = framer;
    }

    /// Scan the TX ring for expired retransmit timers and act on them.
    /// The host calls this periodically (spec.md §4.2 "Retransmit timer").
    pub fn service(&mut self, now: Timestamp) {
        // Retry any `QUEUED` slot still stranded by a transient LL-full
        // condition or a window that has since opened up.
        self.flush_queued(now);
        for idx in 0..TX_RING {
            if self.tx_ring[idx].state != TxSlotState::Sent {
                continue;
            }
            let elapsed_ms = {
                let slot = &self.tx_ring[idx];
                let elapsed_ticks = now.sub(slot.send_time);
                (elapsed_ticks.max(0) as u64 * 1000) >> crate::time::TIME_Q
            };
            if elapsed_ms < self.config.tx_timeout_ms as u64 {
                continue;
            }
            if self.tx_ring[idx].retry_count >= self.config.retry_threshold {
                self.transition(ConnState::Disconnected);
                self.emit(Event::Disconnected);
                continue;
            }
            self.tx_ring[idx].retry_count += 1;
            self.status.retransmissions += 1;
            self.try_send_slot(idx, now);
        }
    }

    fn emit(&mut self, event: Event) {
        if let Some(upper) = self.upper.as_mut() {
            upper.on_event(event);
        }
    }

    fn transition(&mut self, next: ConnState) {
        self.conn_state = next;
    }

    /// Inject an upward-only event (spec.md §4.2 "injectable
    /// TRANSPORT_CONNECTED and APP_CONNECTED").
    pub fn event_inject(&mut self, event: Event) {
        if matches!(event, Event::TransportConnected | Event::AppConnected) {
            self.emit(event);
        }
    }

    /// Transmit RESET and reinitialize link state (connect or explicit reset).
    pub fn reset(&mut self) {
        self.tx_ring = core::array::from_fn(|_| TxSlot::default());
        self.rx_window = core::array::from_fn(|_| RxSlot::default());
        self.rx_nacked = [false; RX_WINDOW];
        self.tx_frame_next = 0;
        self.tx_frame_last_acked = FRAME_ID_MAX;
        self.rx_frame_next = 0;
        self.tx_window = 1;
        self.status = DlStatus::default();
        self.framer.reset();

        let mut buf = [0u8; 9];
        if let Ok(len) = self.framer.construct_link(&mut buf, FrameType::Reset, 0) {
            self.ll.send(&buf[..len]);
        }
        self.transition(ConnState::ConnectingSendReset);
    }

    fn send_link(&mut self, frame_type: FrameType, frame_id: u16) {
        let mut buf = [0u8; 9];
        if let Ok(len) = self.framer.construct_link(&mut buf, frame_type, frame_id) {
            self.ll.send(&buf[..len]);
        }
    }

    fn deliver_and_advance(&mut self, first_metadata: u16, first_payload: &[u8]) {
        self.status.rx_frames += 1;
        self.status.rx_bytes += first_payload.len() as u64;
        if let Some(upper) = self.upper.as_mut() {
            upper.on_recv(first_metadata, first_payload);
        }
        self.rx_frame_next = wrapping_add_11bit(self.rx_frame_next, 1);

        loop {
            let idx = (self.rx_frame_next as usize) % RX_WINDOW;
            if !self.rx_window[idx].occupied {
                break;
            }
            let (metadata, len) = (self.rx_window[idx].metadata, self.rx_window[idx].len);
            let payload: Vec<u8> = self.rx_window[idx].buf[..len].to_vec();
            self.rx_window[idx].occupied = false;
            self.rx_nacked[idx] = false;
            self.status.rx_frames += 1;
            self.status.rx_bytes += payload.len() as u64;
            if let Some(upper) = self.upper.as_mut() {
                upper.on_recv(metadata, &payload);
            }
            self.rx_frame_next = wrapping_add_11bit(self.rx_frame_next, 1);
        }

        let last_delivered = wrapping_add_11bit(self.rx_frame_next, FRAME_ID_MAX); // next - 1
        self.send_link(FrameType::AckAll, last_delivered);
    }

    fn handle_data(&mut self, frame_id: u16, metadata: u16, payload: &[u8]) {
        let d = frame_id_subtract(frame_id, self.rx_frame_next);
        if d < 0 {
            // Duplicate / already-delivered frame.
            let last_delivered = wrapping_add_11bit(self.rx_frame_next, FRAME_ID_MAX);
            self.send_link(FrameType::AckAll, last_delivered);
            return;
        }
        if d as usize >= RX_WINDOW {
            self.send_link(FrameType::NackFrameId, self.rx_frame_next);
            return;
        }
        if d == 0 {
            self.deliver_and_advance(metadata, payload);
            return;
        }

        let idx = (frame_id as usize) % RX_WINDOW;
        self.rx_window[idx] = RxSlot {
            occupied: true,
            metadata,
            len: payload.len(),
            buf: {
                let mut b = [0u8; crate::framer::MAX_DATA_SIZE];
                b[..payload.len()].copy_from_slice(payload);
                b
            },
        };
        self.send_link(FrameType::AckOne, frame_id);

        let mut missing = self.rx_frame_next;
        while frame_id_subtract(frame_id, missing) > 0 {
            let midx = (missing as usize) % RX_WINDOW;
            if !self.rx_nacked[midx] {
                self.send_link(FrameType::NackFrameId, missing);
                self.rx_nacked[midx] = true;
            }
            missing = wrapping_add_11bit(missing, 1);
        }
    }

    fn handle_link(&mut self, frame_type: FrameType, frame_id: u16) {
        match frame_type {
            FrameType::AckAll => {
                let mut id = wrapping_add_11bit(self.tx_frame_last_acked, 1);
                while frame_id_subtract(frame_id, id) >= 0 {
                    let idx = (id as usize) % TX_RING;
                    if self.tx_ring[idx].frame_id == id
                        && self.tx_ring[idx].state != TxSlotState::Empty
                    {
                        self.tx_ring[idx] = TxSlot::default();
                    }
                    id = wrapping_add_11bit(id, 1);
                }
                self.tx_frame_last_acked = frame_id;
                self.flush_queued(self.last_now);
            }
            FrameType::AckOne => {
                let idx = (frame_id as usize) % TX_RING;
                if self.tx_ring[idx].frame_id == frame_id {
                    self.tx_ring[idx].state = TxSlotState::Acked;
                }
            }
            FrameType::NackFrameId => {
                let idx = (frame_id as usize) % TX_RING;
                if self.tx_ring[idx].frame_id == frame_id
                    && self.tx_ring[idx].state == TxSlotState::Sent
                {
                    self.tx_ring[idx].retry_count += 1;
                    self.status.retransmissions += 1;
                    self.try_send_slot(idx, self.last_now);
                }
            }
            FrameType::NackFramingError => {
                for idx in 0..TX_RING {
                    if self.tx_ring[idx].state == TxSlotState::Sent
                        && frame_id_subtract(self.tx_ring[idx].frame_id, frame_id) > 0
                    {
                        self.tx_ring[idx].retry_count += 1;
                        self.status.retransmissions += 1;
                        self.try_send_slot(idx, self.last_now);
                    }
                }
            }
            FrameType::Reset => {
                self.tx_ring = core::array::from_fn(|_| TxSlot::default());
                self.rx_window = core::array::from_fn(|_| RxSlot::default());
                self.rx_nacked = [false; RX_WINDOW];
                self.rx_frame_next = 0;
                self.tx_frame_last_acked = FRAME_ID_MAX;
                self.transition(ConnState::Connected);
                self.emit(Event::ResetRequest);
                self.emit(Event::Connected);
            }
            FrameType::Data => unreachable!("link frames never carry FrameType::Data"),
        }
    }
}

impl<LL: LlDriver, const TX_RING: usize, const RX_WINDOW: usize> FrameSink
    for DataLink<LL, TX_RING, RX_WINDOW>
{
    fn on_data(&mut self, frame_id: u16, metadata: u16, payload: &[u8]) {
        self.handle_data(frame_id, metadata, payload);
    }

    fn on_link(&mut self, frame_type: FrameType, frame_id: u16) {
        self.handle_link(frame_type, frame_id);
    }

    fn on_framing_error(&mut self) {
        let last_delivered = wrapping_add_11bit(self.rx_frame_next, FRAME_ID_MAX);
        self.send_link(FrameType::NackFramingError, last_delivered);
    }
}

impl<LL: LlDriver, const TX_RING: usize, const RX_WINDOW: usize> crate::transport::FrameSender
    for DataLink<LL, TX_RING, RX_WINDOW>
{
    /// Forwards to [`DataLink::send`] using the timestamp of the most
    /// recent `send`/`ll_recv`/`service` call as `now` — `FrameSender`
    /// has no `now` parameter of its own since `Transport` and the
    /// ports above it are meant to stay timestamp-agnostic.
    fn send_frame(&mut self, metadata: u16, msg: &[u8]) -> crate::error::Result<()> {
        let now = self.last_now;
        self.send(metadata, msg, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll_driver::LoopbackLl;

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
        received: Vec<(u16, Vec<u8>)>,
    }
    impl UpperLayer for Recorder {
        fn on_event(&mut self, event: Event) {
            self.events.push(event);
        }
        fn on_recv(&mut self, metadata: u16, payload: &[u8]) {
            self.received.push((metadata, payload.to_vec()));
        }
    }

    /// Shares a [`Recorder`] between the `DataLink` (which needs a
    /// `Box<dyn UpperLayer>`) and the test (which needs to inspect it
    /// afterwards).
    #[derive(Clone, Default)]
    struct SharedRecorder(std::rc::Rc<std::cell::RefCell<Recorder>>);
    impl UpperLayer for SharedRecorder {
        fn on_event(&mut self, event: Event) {
            self.0.borrow_mut().events.push(event);
        }
        fn on_recv(&mut self, metadata: u16, payload: &[u8]) {
            self.0.borrow_mut().received.push((metadata, payload.to_vec()));
        }
    }

    type Dl = DataLink<LoopbackLl, 8, 8>;

    #[test]
    fn send_then_ll_recv_delivers_in_order() {
        let (a_ll, b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(a_ll, DataLinkConfig::default());
        let mut b = Dl::new(b_ll, DataLinkConfig::default());
        a.tx_window = 8;

        a.send(7, &[1, 2, 3], Timestamp::ZERO).unwrap();
        b.ll_recv(Timestamp::ZERO);

        // ACK_ALL travels back to `a`.
        a.ll_recv(Timestamp::ZERO);
        assert_eq!(a.unacked_count(), 0);
    }

    #[test]
    fn out_of_order_frames_are_reordered_before_delivery() {
        // Scenario 2 (spec.md §8): rx_window=4, feed frames 0,2,3,1 — the
        // upper layer must see them delivered in order 0,1,2,3.
        let (a_ll, _unused) = LoopbackLl::pair(4096);
        let mut dl = Dl::new(a_ll, DataLinkConfig::default());
        let shared = SharedRecorder::default();
        dl.register_upper_layer(Box::new(shared.clone()));

        dl.on_data(0, 0, &[0]);
        dl.on_data(2, 0, &[2]);
        dl.on_data(3, 0, &[3]);
        dl.on_data(1, 0, &[1]);

        assert_eq!(
            shared.0.borrow().received,
            vec![(0, vec![0u8]), (1, vec![1u8]), (2, vec![2u8]), (3, vec![3u8])]
        );
    }

    #[test]
    fn ack_one_then_ack_all_frees_tx_ring_slot() {
        let (a_ll, b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(a_ll, DataLinkConfig::default());
        let mut b = Dl::new(b_ll, DataLinkConfig::default());
        a.tx_window = 4;

        a.send(0, &[9], Timestamp::ZERO).unwrap();
        b.ll_recv(Timestamp::ZERO);
        a.ll_recv(Timestamp::ZERO);
        assert_eq!(a.unacked_count(), 0);
    }

    #[test]
    fn second_send_is_queued_not_rejected_when_window_is_one() {
        // A window of 1 bounds how many frames may be in flight at once
        // (spec.md §4.2 step 3), not how many may be queued into the
        // ring — only ring exhaustion returns `FULL`.
        let (a_ll, _b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(a_ll, DataLinkConfig::default());
        a.tx_window = 1;
        a.send(0, &[1], Timestamp::ZERO).unwrap();
        assert!(a.send(0, &[2], Timestamp::ZERO).is_ok());
        assert_eq!(a.unacked_count(), 2);
        assert_eq!(a.sent_count(), 1);
    }

    #[test]
    fn send_fails_full_once_ring_exhausted() {
        let (a_ll, _b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(a_ll, DataLinkConfig::default());
        a.tx_window = 8;
        for i in 0..8u8 {
            a.send(0, &[i], Timestamp::ZERO).unwrap();
        }
        assert_eq!(a.unacked_count(), 8);
        assert_eq!(
            a.send(0, &[9], Timestamp::ZERO),
            Err(crate::error::Error::Full)
        );
    }

    #[test]
    fn window_opening_via_ack_all_flushes_stranded_queued_slot() {
        // The slot held back by a window of 1 must transmit once an
        // AckAll frees window space, without a fresh `send`/`service`
        // call having to happen first (review: AckAll must flush).
        let (a_ll, b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(a_ll, DataLinkConfig::default());
        let mut b = Dl::new(b_ll, DataLinkConfig::default());
        a.tx_window = 1;
        a.send(0, &[1], Timestamp::ZERO).unwrap();
        a.send(0, &[2], Timestamp::ZERO).unwrap();
        assert_eq!(a.sent_count(), 1);

        b.ll_recv(Timestamp::ZERO); // delivers frame 0, replies AckAll(0)
        a.ll_recv(Timestamp::ZERO); // consumes AckAll, frees slot 0

        assert_eq!(a.sent_count(), 1, "the second frame must now be SENT");
        assert_eq!(a.unacked_count(), 1);
    }

    #[test]
    fn reset_reinitializes_counters() {
        let (a_ll, _b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(a_ll, DataLinkConfig::default());
        a.tx_window = 4;
        a.send(0, &[1], Timestamp::ZERO).unwrap();
        a.reset();
        assert_eq!(a.tx_frame_next, 0);
        assert_eq!(a.unacked_count(), 0);
        assert_eq!(a.conn_state(), ConnState::ConnectingSendReset);
    }

    #[test]
    fn retransmit_on_service_timeout_increments_counter() {
        let (a_ll, _b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(
            a_ll,
            DataLinkConfig {
                tx_timeout_ms: 10,
                ..DataLinkConfig::default()
            },
        );
        a.tx_window = 4;
        a.send(0, &[1], Timestamp::ZERO).unwrap();
        a.service(Timestamp::ZERO.add_millis(20));
        assert_eq!(a.status().retransmissions, 1);
    }

    #[test]
    fn disconnect_emitted_after_retry_threshold() {
        let (a_ll, _b_ll) = LoopbackLl::pair(4096);
        let mut a = Dl::new(
            a_ll,
            DataLinkConfig {
                tx_timeout_ms: 1,
                retry_threshold: 2,
                ..DataLinkConfig::default()
            },
        );
        a.tx_window = 4;
        a.register_upper_layer(Box::new(Recorder::default()));
        a.send(0, &[1], Timestamp::ZERO).unwrap();

        let mut now = Timestamp::ZERO;
        for _ in 0..3 {
            now = now.add_millis(5);
            a.service(now);
        }
        assert_eq!(a.conn_state(), ConnState::Disconnected);
    }
}
