// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Universe discovery receiver.
//!
//! Sources announce their sorted universe list every 10 seconds, paged at 512
//! numbers per packet. This receiver reassembles the pages per source and
//! surfaces a complete list whenever it changes; sources that miss two
//! announce intervals are evicted.

use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::protocol::constants::{DISCOVERY_EXPIRY, LOSS_HEARTBEAT};
use crate::protocol::{DiscoveryPacket, Packet};
use crate::time::Timer;
use crate::transport::multicast::{
    discovery_addr, resolve_interface, IpFamily, IpMode,
};
use crate::transport::SacnSocket;
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Discovery receiver configuration.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    pub ip_mode: IpMode,
    /// Named interfaces to listen on. Empty means the wildcard interface,
    /// which is IPv4-only.
    pub interfaces: Vec<String>,
}

/// Discovery notifications.
///
/// Called from the receiver's socket and heartbeat threads; implementations
/// hop to their own executor if they need one.
pub trait DiscoveryDelegate: Send + Sync {
    /// A source's complete universe list arrived or changed.
    fn source_discovered(&self, _cid: Cid, _name: &str, _universes: &[u16]) {}
    /// Coalesced list of sources that stopped announcing.
    fn lost_sources(&self, _cids: Vec<Cid>) {}
    fn socket_closed(&self, _interface: Option<String>, _error: Option<io::Error>) {}
}

/// Paged list assembly for one announcing source.
struct DiscoverySource {
    name: String,
    universes: Vec<u16>,
    next_page: u8,
    next_index: usize,
    dirty: bool,
    expiry: Timer,
}

impl DiscoverySource {
    fn new(name: String, now: Instant) -> Self {
        Self {
            name,
            universes: Vec::new(),
            next_page: 0,
            next_index: 0,
            dirty: true,
            expiry: Timer::expiring_in(now, DISCOVERY_EXPIRY),
        }
    }

    /// Fold one page in. Returns the completed list when a final page closes
    /// out a changed, well-ordered list.
    fn handle_page(&mut self, packet: &DiscoveryPacket) -> Option<Vec<u16>> {
        if packet.page > 0 && packet.page != self.next_page {
            // Mid-sequence of a cycle we did not see from the start.
            self.next_page = 0;
            self.next_index = 0;
            return None;
        }
        if packet.page == 0 {
            self.next_page = 0;
            self.next_index = 0;
        }

        let incoming = &packet.universes;
        let remaining = self.universes.len().saturating_sub(self.next_index);
        let existing_end = (self.next_index + incoming.len()).min(self.universes.len());
        let existing = &self.universes[self.next_index.min(self.universes.len())..existing_end];

        let truncated_final = packet.page == packet.last_page && incoming.len() < remaining;
        if incoming.len() > remaining || truncated_final || existing != incoming.as_slice() {
            self.dirty = true;
            self.universes.truncate(self.next_index);
            self.universes.extend_from_slice(incoming);
        }

        if packet.page < packet.last_page {
            self.next_index += incoming.len();
            self.next_page += 1;
            return None;
        }

        // Final page.
        self.next_page = 0;
        self.next_index = 0;
        if !self.dirty {
            return None;
        }
        let ascending = self.universes.windows(2).all(|pair| pair[0] <= pair[1]);
        if !ascending {
            log::debug!("[DISC] discarding non-ascending universe list");
            return None;
        }
        self.dirty = false;
        Some(self.universes.clone())
    }
}

enum DiscoveryEvent {
    SourceInfo(Cid, String, Vec<u16>),
    Lost(Vec<Cid>),
    SocketClosed(Option<String>, Option<io::Error>),
}

struct DiscoveryState {
    running: bool,
    sources: HashMap<Cid, DiscoverySource>,
    sockets: Vec<DiscoverySocket>,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

struct DiscoverySocket {
    socket: SacnSocket,
    interface: Option<String>,
}

struct DiscoveryShared {
    config: DiscoveryConfig,
    state: Mutex<DiscoveryState>,
    delegate: Mutex<Option<Weak<dyn DiscoveryDelegate>>>,
    metrics: crate::receiver::ReceiverMetrics,
}

impl DiscoveryShared {
    fn dispatch(&self, events: Vec<DiscoveryEvent>) {
        if events.is_empty() {
            return;
        }
        let delegate = self
            .delegate
            .lock()
            .as_ref()
            .and_then(std::sync::Weak::upgrade);
        let Some(delegate) = delegate else { return };
        for event in events {
            match event {
                DiscoveryEvent::SourceInfo(cid, name, universes) => {
                    delegate.source_discovered(cid, &name, &universes);
                }
                DiscoveryEvent::Lost(cids) => delegate.lost_sources(cids),
                DiscoveryEvent::SocketClosed(interface, error) => {
                    delegate.socket_closed(interface, error);
                }
            }
        }
    }
}

/// Listens for universe discovery announcements and tracks per-source lists.
pub struct DiscoveryReceiver {
    shared: Arc<DiscoveryShared>,
}

impl DiscoveryReceiver {
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        if config.ip_mode.includes_v6() && config.interfaces.is_empty() {
            return Err(Error::NoInterfaces);
        }
        Ok(Self {
            shared: Arc::new(DiscoveryShared {
                config,
                state: Mutex::new(DiscoveryState {
                    running: false,
                    sources: HashMap::new(),
                    sockets: Vec::new(),
                    shutdown_tx: None,
                    handle: None,
                }),
                delegate: Mutex::new(None),
                metrics: crate::receiver::ReceiverMetrics::default(),
            }),
        })
    }

    /// Install the delegate. The receiver keeps a weak handle only.
    pub fn set_delegate(&self, delegate: &Arc<dyn DiscoveryDelegate>) {
        *self.shared.delegate.lock() = Some(Arc::downgrade(delegate));
    }

    pub fn metrics(&self) -> &crate::receiver::ReceiverMetrics {
        &self.shared.metrics
    }

    /// Bind sockets, join the discovery groups, and start the expiry sweep.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Err(Error::AlreadyStarted);
            }
            if let Some(handle) = state.handle.take() {
                drop(state);
                let _ = handle.join();
            }
        }

        // Socket setup happens without the state lock: tearing down a
        // half-started socket joins its receive thread, and that thread may
        // be waiting on the lock.
        let mut sockets = open_sockets(self.shared.config.ip_mode, &self.shared.config.interfaces)?;
        for socket in &mut sockets {
            begin_socket(&self.shared, socket)?;
        }

        let mut state = self.shared.state.lock();
        if state.running {
            drop(state);
            return Err(Error::AlreadyStarted);
        }
        state.sockets = sockets;
        state.running = true;

        let (tx, rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("sacn-disc-beat".to_string())
            .spawn(move || {
                while let Err(crossbeam::channel::RecvTimeoutError::Timeout) =
                    rx.recv_timeout(LOSS_HEARTBEAT)
                {
                    sweep_expired(&shared, Instant::now());
                }
            })
            .map_err(Error::Receive)?;
        state.shutdown_tx = Some(tx);
        state.handle = Some(handle);
        log::debug!("[DISC] discovery receiver started");
        Ok(())
    }

    /// Stop the sweep and close sockets synchronously.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(Error::NotStarted);
        }
        state.running = false;
        state.sources.clear();
        state.shutdown_tx = None;
        let mut sockets = std::mem::take(&mut state.sockets);
        let handle = state.handle.take();
        drop(state);

        for socket in &mut sockets {
            socket.socket.close();
        }
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        log::debug!("[DISC] discovery receiver stopped");
        Ok(())
    }

    /// Replace the listen interface set.
    pub fn update_interfaces(&self, interfaces: Vec<String>) -> Result<()> {
        if self.shared.config.ip_mode.includes_v6() && interfaces.is_empty() {
            return Err(Error::NoInterfaces);
        }
        let current: Vec<Option<String>> = {
            let state = self.shared.state.lock();
            if !state.running {
                return Ok(());
            }
            state.sockets.iter().map(|s| s.interface.clone()).collect()
        };
        let added: Vec<String> = interfaces
            .iter()
            .filter(|name| !current.contains(&Some((*name).clone())))
            .cloned()
            .collect();

        // Socket setup without the state lock, as in start().
        let mut new_sockets = open_sockets(self.shared.config.ip_mode, &added)?;
        for socket in &mut new_sockets {
            begin_socket(&self.shared, socket)?;
        }

        let mut state = self.shared.state.lock();
        if !state.running {
            return Ok(());
        }
        let keep: Vec<Option<String>> = if interfaces.is_empty() {
            vec![None]
        } else {
            interfaces.iter().cloned().map(Some).collect()
        };
        let mut removed = Vec::new();
        let mut idx = 0;
        while idx < state.sockets.len() {
            if keep.contains(&state.sockets[idx].interface) {
                idx += 1;
            } else {
                removed.push(state.sockets.remove(idx));
            }
        }
        state.sockets.extend(new_sockets);
        drop(state);
        for mut socket in removed {
            socket.socket.close();
        }
        Ok(())
    }
}

impl Drop for DiscoveryReceiver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn open_sockets(ip_mode: IpMode, interfaces: &[String]) -> Result<Vec<DiscoverySocket>> {
    let mut sockets = Vec::new();
    if interfaces.is_empty() {
        let mut socket = SacnSocket::bind_receiver(IpFamily::V4, None)?;
        socket.join_multicast(discovery_addr(IpFamily::V4).ip())?;
        sockets.push(DiscoverySocket {
            socket,
            interface: None,
        });
        return Ok(sockets);
    }
    for name in interfaces {
        let resolved = resolve_interface(name)?;
        for &family in ip_mode.families() {
            if family == IpFamily::V4 && resolved.v4.is_none() {
                continue;
            }
            let mut socket = SacnSocket::bind_receiver(family, Some(&resolved))?;
            socket.join_multicast(discovery_addr(family).ip())?;
            sockets.push(DiscoverySocket {
                socket,
                interface: Some(name.clone()),
            });
        }
    }
    Ok(sockets)
}

fn begin_socket(shared: &Arc<DiscoveryShared>, socket: &mut DiscoverySocket) -> Result<()> {
    let weak = Arc::downgrade(shared);
    let on_datagram: crate::transport::DatagramHandler = Arc::new(move |bytes, _src, _family| {
        if let Some(shared) = weak.upgrade() {
            process_datagram(&shared, bytes, Instant::now());
        }
    });
    let weak = Arc::downgrade(shared);
    let interface = socket.interface.clone();
    let on_closed: crate::transport::ClosedHandler = Arc::new(move |error| {
        if let Some(shared) = weak.upgrade() {
            shared.dispatch(vec![DiscoveryEvent::SocketClosed(interface.clone(), error)]);
        }
    });
    socket.socket.begin_receiving(on_datagram, on_closed)
}

fn process_datagram(shared: &Arc<DiscoveryShared>, bytes: &[u8], now: Instant) {
    shared
        .metrics
        .packets_received
        .fetch_add(1, Ordering::Relaxed);
    shared
        .metrics
        .bytes_received
        .fetch_add(bytes.len() as u64, Ordering::Relaxed);

    let packet = match Packet::decode(bytes) {
        Ok(Packet::Discovery(packet)) => packet,
        Ok(Packet::Data(_)) => return,
        Err(e) => {
            shared.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            log::debug!("[DISC] dropped datagram: {}", e);
            return;
        }
    };

    let mut events = Vec::new();
    {
        let mut state = shared.state.lock();
        if !state.running {
            return;
        }
        let source = state
            .sources
            .entry(packet.cid)
            .or_insert_with(|| {
                log::debug!("[DISC] new source {}", packet.cid);
                DiscoverySource::new(packet.source_name.clone(), now)
            });
        source.expiry.reset(now, DISCOVERY_EXPIRY);
        source.name = packet.source_name.clone();
        if let Some(universes) = source.handle_page(&packet) {
            events.push(DiscoveryEvent::SourceInfo(
                packet.cid,
                source.name.clone(),
                universes,
            ));
        }
    }
    shared.dispatch(events);
}

fn sweep_expired(shared: &Arc<DiscoveryShared>, now: Instant) {
    let mut events = Vec::new();
    {
        let mut state = shared.state.lock();
        if !state.running {
            return;
        }
        let expired: Vec<Cid> = state
            .sources
            .iter()
            .filter(|(_, s)| s.expiry.is_expired(now))
            .map(|(cid, _)| *cid)
            .collect();
        if !expired.is_empty() {
            for cid in &expired {
                state.sources.remove(cid);
            }
            log::debug!("[DISC] {} source(s) expired", expired.len());
            events.push(DiscoveryEvent::Lost(expired));
        }
    }
    shared.dispatch(events);
}
