// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # sACN - Streaming ACN (ANSI E1.31-2018)
//!
//! A pure Rust implementation of the E1.31 lighting-control protocol:
//! DMX512-A levels over UDP multicast, with per-address priorities, source
//! discovery, and receiver-side HTP/priority merging.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sacn::{Cid, Source, SourceConfig, UniverseData};
//!
//! let source = Source::new(SourceConfig {
//!     cid: Cid::from_bytes([0x42; 16]),
//!     name: "Console".into(),
//!     ..Default::default()
//! })?;
//! source.add_universe(UniverseData {
//!     universe: 1,
//!     levels: vec![255; 512],
//!     ..Default::default()
//! })?;
//! source.start()?;
//! # Ok::<(), sacn::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                            Public API                              |
//! |   Source | RawReceiver | Receiver | ReceiverGroup | Discovery      |
//! +--------------------------------------------------------------------+
//! |                        Protocol runtime                            |
//! |   44 Hz transmit engine | per-source FSMs | HTP/priority merge     |
//! +--------------------------------------------------------------------+
//! |                             Codec                                  |
//! |   Root / Data Framing / DMP / Universe Discovery PDUs              |
//! +--------------------------------------------------------------------+
//! |                           Transport                                |
//! |   UDP multicast per universe, port 5568, reuse-port receivers      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Source`] | Transmits one or more universes at the mandated cadence |
//! | [`Receiver`] | Receives one universe and merges all of its sources |
//! | [`RawReceiver`] | Receives one universe without merging |
//! | [`ReceiverGroup`] | Uniformly configured receivers for many universes |
//! | [`DiscoveryReceiver`] | Tracks which sources announce which universes |
//! | [`Merger`] | Standalone HTP-within-highest-priority merge |
//!
//! Delegates are plain trait objects with empty default methods; the library
//! stores weak references, so dropping your delegate simply unsubscribes it.
//! Universe synchronization (the extended sync framing) is not implemented.

/// Component identifier (CID) type.
pub mod cid;
/// Universe discovery receiver.
pub mod discovery;
/// Public error type.
pub mod error;
/// Per-slot HTP/priority merging.
pub mod merge;
/// E1.31 packet codec.
pub mod protocol;
/// Receive side: raw, merged, and grouped receivers.
pub mod receiver;
/// Transmit side: the 44 Hz source engine.
pub mod source;
/// Monotonic expiry timer.
pub mod time;
/// UDP multicast transport.
pub mod transport;

pub use cid::Cid;
pub use discovery::{DiscoveryConfig, DiscoveryDelegate, DiscoveryReceiver};
pub use error::{Error, Result};
pub use merge::{Merger, MergerSource};
pub use protocol::{
    sequence_acceptable, universe_in_range, DataPacket, DiscoveryPacket, Packet, PacketOptions,
    ParseError,
};
pub use receiver::{
    DataKind, MergedData, RawReceiver, RawReceiverDelegate, Receiver, ReceiverConfig,
    ReceiverDelegate, ReceiverGroup, ReceiverMetrics, SourceData,
};
pub use source::{Source, SourceConfig, SourceDelegate, SourceMetrics, UniverseData};
pub use transport::{IpFamily, IpMode};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
