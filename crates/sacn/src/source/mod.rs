// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sACN source: per-universe transmit engine.
//!
//! A [`Source`] owns a set of universes and a 44 Hz worker thread that emits
//! level frames (with keep-alive compression), optional per-address-priority
//! frames, periodic universe discovery, and graceful terminated bursts when
//! universes or the whole source stop.
//!
//! ```no_run
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

mod engine;
mod universe;

pub(crate) use universe::SourceUniverse;

use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::protocol::{PRIORITY_DEFAULT, PRIORITY_MAX, SLOT_COUNT};
use crate::time::Timer;
use crate::transport::multicast::{resolve_interface, IpFamily, IpMode};
use crate::transport::SacnSocket;
use crate::universe_in_range;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Source configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Stable 16-byte identifier for this source.
    pub cid: Cid,
    /// Human-readable source name, serialized into every frame.
    pub name: String,
    pub ip_mode: IpMode,
    /// Named interfaces to transmit on. Empty means the wildcard interface,
    /// which is IPv4-only.
    pub interfaces: Vec<String>,
    /// Default universe priority; clamped to 0..=200.
    pub priority: u8,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cid: Cid::zero(),
            name: "sACN Source".to_string(),
            ip_mode: IpMode::default(),
            interfaces: Vec::new(),
            priority: PRIORITY_DEFAULT,
        }
    }
}

/// Snapshot describing a universe to transmit.
#[derive(Debug, Clone, Default)]
pub struct UniverseData {
    pub universe: u16,
    /// Per-universe priority override; `None` follows the source default.
    pub priority: Option<u8>,
    /// Slot levels; padded with 0 to 512, truncated past 512.
    pub levels: Vec<u8>,
    /// Optional per-address priorities (0 = slot unsourced). Padded with 0;
    /// values above 200 are replaced with the default priority.
    pub priorities: Option<Vec<u8>>,
    /// Transmit with the Preview_Data option bit set.
    pub preview: bool,
}

/// Source lifecycle notifications.
///
/// Called from the source's worker thread; implementations hop to their own
/// executor if they need one.
pub trait SourceDelegate: Send + Sync {
    fn transmission_started(&self) {}
    fn transmission_ended(&self) {}
    fn socket_closed(&self, _interface: Option<String>, _error: Option<io::Error>) {}
}

/// Transmit counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl SourceMetrics {
    /// (packets_sent, bytes_sent)
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.packets_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }
}

pub(crate) enum SourceEvent {
    Ended,
    SocketClosed(Option<String>, Option<io::Error>),
}

pub(crate) struct SenderSocket {
    pub(crate) socket: SacnSocket,
    pub(crate) interface: Option<String>,
    pub(crate) failed: bool,
}

pub(crate) struct RetiringSocket {
    pub(crate) socket: SacnSocket,
    pub(crate) remaining: u8,
}

pub(crate) struct SourceState {
    pub(crate) name: String,
    pub(crate) priority: u8,
    pub(crate) interfaces: Vec<String>,
    pub(crate) output_enabled: bool,
    pub(crate) running: bool,
    pub(crate) stopping: bool,
    pub(crate) universes: BTreeMap<u16, SourceUniverse>,
    pub(crate) sockets: Vec<SenderSocket>,
    pub(crate) retiring: Vec<RetiringSocket>,
    pub(crate) discovery_timer: Timer,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct SourceShared {
    pub(crate) cid: Cid,
    pub(crate) ip_mode: IpMode,
    pub(crate) state: Mutex<SourceState>,
    pub(crate) metrics: SourceMetrics,
    delegate: Mutex<Option<Weak<dyn SourceDelegate>>>,
}

impl SourceShared {
    pub(crate) fn dispatch(&self, event: SourceEvent) {
        let delegate = self
            .delegate
            .lock()
            .as_ref()
            .and_then(std::sync::Weak::upgrade);
        let Some(delegate) = delegate else { return };
        match event {
            SourceEvent::Ended => delegate.transmission_ended(),
            SourceEvent::SocketClosed(interface, error) => {
                delegate.socket_closed(interface, error);
            }
        }
    }

    fn notify_started(&self) {
        if let Some(d) = self
            .delegate
            .lock()
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
        {
            d.transmission_started();
        }
    }
}

/// An sACN source transmitting one or more universes.
pub struct Source {
    shared: Arc<SourceShared>,
}

impl Source {
    /// Create a source. Universes are added separately; nothing is
    /// transmitted until [`Source::start`].
    pub fn new(config: SourceConfig) -> Result<Self> {
        if config.ip_mode.includes_v6() && config.interfaces.is_empty() {
            return Err(Error::NoInterfaces);
        }
        let state = SourceState {
            name: config.name,
            priority: config.priority.min(PRIORITY_MAX),
            interfaces: config.interfaces,
            output_enabled: true,
            running: false,
            stopping: false,
            universes: BTreeMap::new(),
            sockets: Vec::new(),
            retiring: Vec::new(),
            discovery_timer: Timer::expired(Instant::now()),
            shutdown_tx: None,
            handle: None,
        };
        Ok(Self {
            shared: Arc::new(SourceShared {
                cid: config.cid,
                ip_mode: config.ip_mode,
                state: Mutex::new(state),
                metrics: SourceMetrics::default(),
                delegate: Mutex::new(None),
            }),
        })
    }

    /// Install the delegate. The source keeps a weak handle only.
    pub fn set_delegate(&self, delegate: &Arc<dyn SourceDelegate>) {
        *self.shared.delegate.lock() = Some(Arc::downgrade(delegate));
    }

    /// Transmit counters.
    pub fn metrics(&self) -> &SourceMetrics {
        &self.shared.metrics
    }

    /// Begin transmitting: binds sockets and starts the 44 Hz worker.
    pub fn start(&self) -> Result<()> {
        self.start_inner(true)
    }

    /// Start the worker with output muted; universes tick but nothing is
    /// sent until [`Source::set_output`] enables it.
    pub fn start_muted(&self) -> Result<()> {
        self.start_inner(false)
    }

    fn start_inner(&self, output: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(if state.stopping {
                Error::Terminating
            } else {
                Error::AlreadyStarted
            });
        }
        // Reap a worker from a previous run.
        state.shutdown_tx = None;
        if let Some(handle) = state.handle.take() {
            drop(state);
            let _ = handle.join();
            state = self.shared.state.lock();
        }

        state.sockets = open_sockets(self.shared.ip_mode, &state.interfaces)?;
        for universe in state.universes.values_mut() {
            universe.reactivate();
        }
        state.discovery_timer = Timer::expired(Instant::now());
        state.output_enabled = output;
        state.running = true;
        state.stopping = false;

        let (tx, handle) = match engine::spawn(Arc::clone(&self.shared)) {
            Ok(spawned) => spawned,
            Err(e) => {
                state.running = false;
                state.sockets.clear();
                return Err(Error::Receive(e));
            }
        };
        state.shutdown_tx = Some(tx);
        state.handle = Some(handle);
        drop(state);

        log::debug!("[SRC] transmission started (output={})", output);
        self.shared.notify_started();
        Ok(())
    }

    /// Stop transmitting. Every universe sends three terminated frames; the
    /// sockets close and `transmission_ended` fires once the bursts finish
    /// (bounded by ~3 ticks).
    pub fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(Error::NotStarted);
        }
        if state.stopping {
            return Err(Error::Terminating);
        }
        state.stopping = true;
        for universe in state.universes.values_mut() {
            if !universe.is_terminating() {
                universe.terminate(false);
            }
        }
        log::debug!("[SRC] stopping; termination bursts queued");
        Ok(())
    }

    /// Mute or unmute output without tearing the worker down.
    pub fn set_output(&self, enabled: bool) {
        self.shared.state.lock().output_enabled = enabled;
    }

    /// Universes currently registered (terminating ones included).
    pub fn universes(&self) -> Vec<u16> {
        self.shared.state.lock().universes.keys().copied().collect()
    }

    /// Register a universe for transmission.
    pub fn add_universe(&self, data: UniverseData) -> Result<()> {
        if !universe_in_range(data.universe) {
            return Err(Error::InvalidUniverse(data.universe));
        }
        if data.levels.is_empty() || data.levels.len() > SLOT_COUNT {
            return Err(Error::InvalidLevelCount(data.levels.len()));
        }
        if let Some(priorities) = &data.priorities {
            if priorities.is_empty() || priorities.len() > SLOT_COUNT {
                return Err(Error::InvalidPriorityCount(priorities.len()));
            }
        }

        let mut state = self.shared.state.lock();
        if let Some(existing) = state.universes.get(&data.universe) {
            return Err(if existing.is_terminating() {
                Error::UniverseTerminating(data.universe)
            } else {
                Error::UniverseExists(data.universe)
            });
        }
        let priority = data
            .priority
            .map_or(state.priority, |p| p.min(PRIORITY_MAX));
        let universe = SourceUniverse::new(
            &self.shared.cid,
            &state.name,
            data.universe,
            priority,
            data.priority.is_some(),
            &data.levels,
            data.priorities.as_deref(),
            data.preview,
        );
        state.universes.insert(data.universe, universe);
        log::debug!("[SRC] universe {} added", data.universe);
        Ok(())
    }

    /// Stop transmitting a universe. While running this begins the
    /// three-frame terminated burst; the universe disappears afterwards.
    pub fn remove_universe(&self, universe: u16) -> Result<()> {
        let mut state = self.shared.state.lock();
        let running = state.running;
        let entry = state
            .universes
            .get_mut(&universe)
            .ok_or(Error::UniverseNotFound(universe))?;
        if entry.is_terminating() && !entry.finished() {
            return Err(Error::UniverseTerminating(universe));
        }
        if running && !entry.finished() {
            entry.terminate(true);
            log::debug!("[SRC] universe {} terminating", universe);
        } else {
            state.universes.remove(&universe);
            log::debug!("[SRC] universe {} removed", universe);
        }
        Ok(())
    }

    /// Replace a universe's levels (padded with 0 to 512 slots).
    pub fn update_levels(&self, universe: u16, levels: &[u8]) -> Result<()> {
        if levels.is_empty() || levels.len() > SLOT_COUNT {
            return Err(Error::InvalidLevelCount(levels.len()));
        }
        self.with_universe(universe, |u, _| u.set_levels(levels))
    }

    /// Replace or remove a universe's per-address priorities.
    pub fn update_priorities(&self, universe: u16, priorities: Option<&[u8]>) -> Result<()> {
        if let Some(p) = priorities {
            if p.is_empty() || p.len() > SLOT_COUNT {
                return Err(Error::InvalidPriorityCount(p.len()));
            }
        }
        let cid = self.shared.cid;
        self.with_universe(universe, |u, name| u.set_priorities(&cid, name, priorities))
    }

    /// Update one slot's level and, when a priority stream is active, its
    /// per-address priority.
    pub fn update_slot(
        &self,
        universe: u16,
        slot: usize,
        level: u8,
        priority: Option<u8>,
    ) -> Result<()> {
        if slot >= SLOT_COUNT {
            return Err(Error::InvalidSlot(slot));
        }
        self.with_universe(universe, |u, _| u.set_slot(slot, level, priority))
    }

    /// Change the source-wide default priority. Universes with an explicit
    /// override keep it.
    pub fn update_priority(&self, priority: u8) -> Result<()> {
        if priority > PRIORITY_MAX {
            return Err(Error::InvalidPriority(priority));
        }
        let mut state = self.shared.state.lock();
        state.priority = priority;
        for universe in state.universes.values_mut() {
            if universe.is_terminating() {
                continue;
            }
            if universe.uses_default_priority() {
                universe.set_universe_priority(priority, false);
            }
        }
        Ok(())
    }

    /// Rename the source; rewritten into every universe's frames.
    pub fn update_name(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.name = name.to_string();
        for universe in state.universes.values_mut() {
            if universe.is_terminating() {
                continue;
            }
            universe.set_name(name);
        }
        Ok(())
    }

    /// Replace the interface set. New interfaces get fresh sockets; removed
    /// ones send terminated frames for three ticks and then close, without
    /// terminating the universes themselves.
    pub fn update_interfaces(&self, interfaces: Vec<String>) -> Result<()> {
        if self.shared.ip_mode.includes_v6() && interfaces.is_empty() {
            return Err(Error::NoInterfaces);
        }
        let mut state = self.shared.state.lock();
        if !state.running {
            state.interfaces = interfaces;
            return Ok(());
        }

        let added: Vec<String> = interfaces
            .iter()
            .filter(|name| !state.interfaces.contains(name))
            .cloned()
            .collect();
        let new_sockets = open_sockets_named(self.shared.ip_mode, &added)?;

        let keep: Vec<Option<String>> = if interfaces.is_empty() {
            vec![None]
        } else {
            interfaces.iter().cloned().map(Some).collect()
        };
        let mut idx = 0;
        while idx < state.sockets.len() {
            if keep.contains(&state.sockets[idx].interface) {
                idx += 1;
            } else {
                let retired = state.sockets.remove(idx);
                log::debug!(
                    "[SRC] retiring socket on {}",
                    retired.interface.as_deref().unwrap_or("default")
                );
                state.retiring.push(RetiringSocket {
                    socket: retired.socket,
                    remaining: 3,
                });
            }
        }
        state.sockets.extend(new_sockets);
        state.interfaces = interfaces;
        Ok(())
    }

    fn with_universe<F>(&self, universe: u16, f: F) -> Result<()>
    where
        F: FnOnce(&mut SourceUniverse, &str),
    {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let entry = state
            .universes
            .get_mut(&universe)
            .ok_or(Error::UniverseNotFound(universe))?;
        if entry.is_terminating() {
            return Err(Error::UniverseTerminating(universe));
        }
        f(entry, &state.name);
        Ok(())
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        // Drop is abrupt: no terminated burst, just stop the worker.
        let mut state = self.shared.state.lock();
        state.shutdown_tx = None;
        let handle = state.handle.take();
        drop(state);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Open sender sockets for the configured interface set (wildcard when the
/// set is empty, which is valid for IPv4 only).
fn open_sockets(ip_mode: IpMode, interfaces: &[String]) -> Result<Vec<SenderSocket>> {
    if interfaces.is_empty() {
        let socket = SacnSocket::bind_sender(IpFamily::V4, None)?;
        return Ok(vec![SenderSocket {
            socket,
            interface: None,
            failed: false,
        }]);
    }
    open_sockets_named(ip_mode, interfaces)
}

fn open_sockets_named(ip_mode: IpMode, interfaces: &[String]) -> Result<Vec<SenderSocket>> {
    let mut sockets = Vec::new();
    for name in interfaces {
        let resolved = resolve_interface(name)?;
        for &family in ip_mode.families() {
            if family == IpFamily::V4 && resolved.v4.is_none() {
                log::debug!("[SRC] interface {} has no IPv4 address, skipping", name);
                continue;
            }
            let socket = SacnSocket::bind_sender(family, Some(&resolved))?;
            sockets.push(SenderSocket {
                socket,
                interface: Some(name.clone()),
                failed: false,
            });
        }
    }
    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_source() -> Source {
        Source::new(SourceConfig {
            cid: Cid::from_bytes([7; 16]),
            name: "Test".into(),
            ..Default::default()
        })
        .expect("source creation should succeed")
    }

    fn levels_universe(n: u16) -> UniverseData {
        UniverseData {
            universe: n,
            levels: vec![0; 512],
            ..Default::default()
        }
    }

    #[test]
    fn test_ipv6_requires_interfaces() {
        let result = Source::new(SourceConfig {
            ip_mode: IpMode::Ipv4And6,
            interfaces: vec![],
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::NoInterfaces)));
    }

    #[test]
    fn test_add_universe_validation() {
        let source = test_source();
        assert!(matches!(
            source.add_universe(levels_universe(0)),
            Err(Error::InvalidUniverse(0))
        ));
        assert!(matches!(
            source.add_universe(levels_universe(64000)),
            Err(Error::InvalidUniverse(64000))
        ));
        assert!(matches!(
            source.add_universe(UniverseData {
                universe: 1,
                levels: vec![],
                ..Default::default()
            }),
            Err(Error::InvalidLevelCount(0))
        ));

        source.add_universe(levels_universe(1)).expect("add");
        assert!(matches!(
            source.add_universe(levels_universe(1)),
            Err(Error::UniverseExists(1))
        ));
        assert_eq!(source.universes(), vec![1]);
    }

    #[test]
    fn test_mutations_require_known_universe() {
        let source = test_source();
        assert!(matches!(
            source.update_levels(5, &[0]),
            Err(Error::UniverseNotFound(5))
        ));
        assert!(matches!(
            source.update_slot(5, 600, 0, None),
            Err(Error::InvalidSlot(600))
        ));
        assert!(matches!(
            source.remove_universe(5),
            Err(Error::UniverseNotFound(5))
        ));
    }

    #[test]
    fn test_remove_before_start_is_immediate() {
        let source = test_source();
        source.add_universe(levels_universe(7)).expect("add");
        source.remove_universe(7).expect("remove");
        assert!(source.universes().is_empty());
    }

    #[test]
    fn test_stop_requires_running() {
        let source = test_source();
        assert!(matches!(source.stop(), Err(Error::NotStarted)));
    }

    #[test]
    fn test_update_priority_clamps_and_skips_overrides() {
        let source = test_source();
        source.add_universe(levels_universe(1)).expect("add");
        source
            .add_universe(UniverseData {
                universe: 2,
                priority: Some(180),
                levels: vec![0; 512],
                ..Default::default()
            })
            .expect("add");
        assert!(matches!(
            source.update_priority(240),
            Err(Error::InvalidPriority(240))
        ));
        source.update_priority(50).expect("update");
        // No panic and both universes still registered; frame-level checks
        // live in the universe tests.
        assert_eq!(source.universes(), vec![1, 2]);
    }

    #[test]
    fn test_start_stop_cycle() {
        let source = test_source();
        source.add_universe(levels_universe(3)).expect("add");
        source.start().expect("start");
        assert!(matches!(source.start(), Err(Error::AlreadyStarted)));

        source.stop().expect("stop");
        // A second stop while the burst drains reports the terminating state.
        assert!(matches!(
            source.stop(),
            Err(Error::Terminating) | Err(Error::NotStarted)
        ));

        // The burst takes ~3 ticks; wait for the worker to wind down.
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if !source.shared.state.lock().running {
                break;
            }
            assert!(Instant::now() < deadline, "worker should stop");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let (packets, bytes) = source.metrics().snapshot();
        assert!(packets > 0);
        assert!(bytes > 0);
    }
}
