// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Errors returned by the public API.
//!
//! Wire-format errors live in [`crate::protocol::ParseError`]; they never
//! escape a receiver (malformed datagrams are logged and dropped). Everything
//! the embedder can observe synchronously is here.

use crate::cid::Cid;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by source, receiver, and merger operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle / validation
    // ========================================================================
    /// `start()` called on an instance that is already running.
    AlreadyStarted,
    /// Operation requires a running instance.
    NotStarted,
    /// `start()` called while a termination burst is still in flight.
    Terminating,
    /// Universe already registered on this source.
    UniverseExists(u16),
    /// Universe not registered on this source.
    UniverseNotFound(u16),
    /// Universe is mid-termination and cannot be mutated or re-added yet.
    UniverseTerminating(u16),
    /// Universe number outside 1..=63999.
    InvalidUniverse(u16),
    /// Source not known to the merger.
    SourceNotFound(Cid),
    /// Level buffer empty or longer than 512 slots.
    InvalidLevelCount(usize),
    /// Priority buffer empty or longer than 512 slots.
    InvalidPriorityCount(usize),
    /// Priority outside 0..=200.
    InvalidPriority(u8),
    /// Slot index outside 0..=511.
    InvalidSlot(usize),
    /// IPv6 operation requested with no named interfaces configured.
    NoInterfaces,
    /// Named interface not present on this host.
    UnknownInterface(String),

    // ========================================================================
    // Sockets
    // ========================================================================
    /// Could not enable port reuse on the receive socket.
    PortReuse(io::Error),
    /// Could not bind the UDP socket; the string names the bind address.
    Bind(String, io::Error),
    /// Could not join a multicast group; the string names the group.
    MulticastJoin(String, io::Error),
    /// Could not leave a multicast group; the string names the group.
    MulticastLeave(String, io::Error),
    /// Could not assign the outbound multicast interface.
    MulticastInterface(String, io::Error),
    /// Could not start receiving on a bound socket.
    Receive(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Lifecycle / validation
            Error::AlreadyStarted => write!(f, "Already started"),
            Error::NotStarted => write!(f, "Not started"),
            Error::Terminating => write!(f, "Termination burst in progress"),
            Error::UniverseExists(u) => write!(f, "Universe {} already exists", u),
            Error::UniverseNotFound(u) => write!(f, "Universe {} does not exist", u),
            Error::UniverseTerminating(u) => write!(f, "Universe {} is terminating", u),
            Error::InvalidUniverse(u) => {
                write!(f, "Invalid universe number: {} (must be 1-63999)", u)
            }
            Error::SourceNotFound(cid) => write!(f, "Source {} does not exist", cid),
            Error::InvalidLevelCount(n) => {
                write!(f, "Incorrect level count: {} (must be 1-512)", n)
            }
            Error::InvalidPriorityCount(n) => {
                write!(f, "Incorrect priority count: {} (must be 1-512)", n)
            }
            Error::InvalidPriority(p) => write!(f, "Invalid priority: {} (must be 0-200)", p),
            Error::InvalidSlot(s) => write!(f, "Invalid slot number: {} (must be 0-511)", s),
            Error::NoInterfaces => {
                write!(f, "IPv6 requires at least one named interface")
            }
            Error::UnknownInterface(name) => write!(f, "Unknown interface: {}", name),
            // Sockets
            Error::PortReuse(e) => write!(f, "Could not enable port reuse: {}", e),
            Error::Bind(addr, e) => write!(f, "Could not bind {}: {}", addr, e),
            Error::MulticastJoin(group, e) => write!(f, "Could not join {}: {}", group, e),
            Error::MulticastLeave(group, e) => write!(f, "Could not leave {}: {}", group, e),
            Error::MulticastInterface(ctx, e) => {
                write!(f, "Could not assign multicast interface {}: {}", ctx, e)
            }
            Error::Receive(e) => write!(f, "Could not receive: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::PortReuse(e)
            | Error::Bind(_, e)
            | Error::MulticastJoin(_, e)
            | Error::MulticastLeave(_, e)
            | Error::MulticastInterface(_, e)
            | Error::Receive(e) => Some(e),
            _ => None,
        }
    }
}
