// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Fitterbap - Reliable Multiplexed Pub-Sub Over a Raw Byte Stream
//!
//! A host-to-microcontroller communication stack: framing with
//! resynchronizing CRC protection, a selective-repeat ARQ data link, port
//! multiplexing, and a distributed publish-subscribe topic space, all
//! running over a single UART-like byte stream.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------+
//! |  Application (User Code)                |
//! +-----------------------------------------+
//!           v                    ^
//! +-----------------------------------------+
//! |  PubSub / PubSubPort / Port0             |
//! +-----------------------------------------+
//!           v                    ^
//! +-----------------------------------------+
//! |  Transport (port multiplexing)          |
//! +-----------------------------------------+
//!           v                    ^
//! +-----------------------------------------+
//! |  Data Link (selective-repeat ARQ)       |
//! +-----------------------------------------+
//!           v                    ^
//! +-----------------------------------------+
//! |  Framer (SOF/EOF, CRC-8 length, CRC-32) |
//! +-----------------------------------------+
//!           v                    ^
//! +-----------------------------------------+
//! |  LL driver (UART bytes)                 |
//! +-----------------------------------------+
//! ```
//!
//! This crate is not `no_std`: the PubSub layer leans on `std` collections
//! (`HashMap`, `Vec`, `String`) the way the original system does, and the
//! default [`mutex::StdMutex`]/[`time::StdTimeSource`] collaborators wrap
//! `std::sync`/`std::time`. The link/transport layers below PubSub stay
//! allocation-free aside from `Vec<u8>` payload copies in and out of the
//! fixed-size ring/window slots.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// CRC-8 (length field) and CRC-32 (frame body) implementations.
pub mod crc;

/// Error taxonomy shared by every layer.
pub mod error;

/// Timer scheduling collaborator (`schedule`/`cancel`/`process`).
pub mod event_manager;

/// Byte-stream framing: SOF/EOF delimiters, CRC-8 length, CRC-32 body.
pub mod framer;

/// Lower-layer driver trait plus a loopback test implementation.
pub mod ll_driver;

/// Selective-repeat ARQ data link.
pub mod datalink;

/// Port multiplexing over one data link.
pub mod transport;

/// Distributed publish-subscribe topic space.
pub mod pubsub;

/// Bridges two `PubSub` instances across a transport port.
pub mod pubsub_port;

/// Port 0: status, echo, time sync, metadata, window negotiation.
pub mod port0;

/// Mutex abstraction (`PlatformMutex`) plus a `std::sync::Mutex` backend.
pub mod mutex;

/// 34Q30 fixed-point timestamps and the `TimeSource` collaborator.
pub mod time;

pub use crate::error::{Error, Result};

/// Crate version, exposed for diagnostics (e.g. Port0's `STATUS` op).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
