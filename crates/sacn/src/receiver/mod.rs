// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sACN receive side.
//!
//! [`RawReceiver`] demultiplexes one universe's datagrams into per-source
//! state machines and surfaces validated frames; [`Receiver`] layers the
//! priority merge on top and emits merged frames; [`ReceiverGroup`] manages a
//! set of merged receivers with uniform configuration.

mod group;
mod merged;
mod source_state;

pub use group::ReceiverGroup;
pub use merged::{MergedData, Receiver, ReceiverDelegate};

use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::protocol::constants::{DEFAULT_SOURCE_LIMIT, LOSS_HEARTBEAT, SAMPLING_PERIOD};
use crate::protocol::{Packet, ParseError};
use crate::time::Timer;
use crate::transport::multicast::{group_addr, resolve_interface, IpFamily, IpMode};
use crate::transport::SacnSocket;
use crate::universe_in_range;
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use source_state::TrackedSource;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Receiver configuration, shared by raw and merged receivers.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub ip_mode: IpMode,
    /// Named interfaces to listen on. Empty means the wildcard interface,
    /// which is IPv4-only.
    pub interfaces: Vec<String>,
    /// Cap on concurrently tracked sources; `None` is unlimited.
    pub source_limit: Option<usize>,
    /// Drop frames carrying the Preview_Data option bit.
    pub filter_preview: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            ip_mode: IpMode::default(),
            interfaces: Vec::new(),
            source_limit: Some(DEFAULT_SOURCE_LIMIT),
            filter_preview: true,
        }
    }
}

/// Which stream a validated frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Levels,
    PerAddressPriority,
}

/// A validated frame from one source, as surfaced by [`RawReceiver`].
#[derive(Debug, Clone)]
pub struct SourceData {
    pub cid: Cid,
    pub name: String,
    pub universe: u16,
    /// Universe priority from the framing layer.
    pub priority: u8,
    pub preview: bool,
    /// The source is still inside the receiver's sampling window.
    pub is_sampling: bool,
    pub kind: DataKind,
    pub values: Vec<u8>,
}

/// Raw receiver notifications.
///
/// Called from the receiver's socket and heartbeat threads; implementations
/// hop to their own executor if they need one.
pub trait RawReceiverDelegate: Send + Sync {
    /// A validated levels or per-address-priority frame.
    fn universe_data(&self, _data: &SourceData) {}
    /// A source's 0xDD stream went silent; its levels remain live.
    fn lost_pap(&self, _universe: u16, _cid: Cid) {}
    /// Coalesced list of sources that timed out or terminated.
    fn lost_sources(&self, _universe: u16, _cids: Vec<Cid>) {}
    fn started_sampling(&self, _universe: u16) {}
    fn ended_sampling(&self, _universe: u16) {}
    /// The source-limit was hit; reported once per receiver run.
    fn exceeded_sources(&self, _universe: u16) {}
    fn socket_closed(&self, _universe: u16, _interface: Option<String>, _error: Option<io::Error>) {
    }
}

/// Receive counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub parse_errors: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ReceiverMetrics {
    /// (packets_received, packets_dropped, parse_errors, bytes_received)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.packets_received.load(Ordering::Relaxed),
            self.packets_dropped.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }
}

pub(crate) enum RawEvent {
    Data(SourceData),
    PapLost(Cid),
    Lost(Vec<Cid>),
    StartedSampling,
    EndedSampling,
    Exceeded,
    SocketClosed(Option<String>, Option<io::Error>),
}

struct ReceiverSocket {
    socket: SacnSocket,
    interface: Option<String>,
    /// Still needs a sampling window.
    sampling: bool,
    /// Covered by the currently running window.
    in_window: bool,
}

pub(crate) struct RawState {
    running: bool,
    sources: HashMap<Cid, TrackedSource>,
    sockets: Vec<ReceiverSocket>,
    sampling_active: bool,
    sampling_timer: Timer,
    notified_exceeded: bool,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct RawShared {
    universe: u16,
    config: ReceiverConfig,
    pub(crate) state: Mutex<RawState>,
    delegate: Mutex<Option<Weak<dyn RawReceiverDelegate>>>,
    pub(crate) metrics: ReceiverMetrics,
}

impl RawShared {
    fn dispatch(&self, events: Vec<RawEvent>) {
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
                RawEvent::Data(data) => delegate.universe_data(&data),
                RawEvent::PapLost(cid) => delegate.lost_pap(self.universe, cid),
                RawEvent::Lost(cids) => delegate.lost_sources(self.universe, cids),
                RawEvent::StartedSampling => delegate.started_sampling(self.universe),
                RawEvent::EndedSampling => delegate.ended_sampling(self.universe),
                RawEvent::Exceeded => delegate.exceeded_sources(self.universe),
                RawEvent::SocketClosed(interface, error) => {
                    delegate.socket_closed(self.universe, interface, error);
                }
            }
        }
    }
}

/// Per-universe receiver without merging: validated frames per source.
pub struct RawReceiver {
    shared: Arc<RawShared>,
}

impl RawReceiver {
    /// Create a receiver for one universe. Nothing is bound until
    /// [`RawReceiver::start`].
    pub fn new(config: ReceiverConfig, universe: u16) -> Result<Self> {
        if !universe_in_range(universe) {
            return Err(Error::InvalidUniverse(universe));
        }
        if config.ip_mode.includes_v6() && config.interfaces.is_empty() {
            return Err(Error::NoInterfaces);
        }
        Ok(Self {
            shared: Arc::new(RawShared {
                universe,
                config,
                state: Mutex::new(RawState {
                    running: false,
                    sources: HashMap::new(),
                    sockets: Vec::new(),
                    sampling_active: false,
                    sampling_timer: Timer::expired(Instant::now()),
                    notified_exceeded: false,
                    shutdown_tx: None,
                    handle: None,
                }),
                delegate: Mutex::new(None),
                metrics: ReceiverMetrics::default(),
            }),
        })
    }

    pub fn universe(&self) -> u16 {
        self.shared.universe
    }

    /// Install the delegate. The receiver keeps a weak handle only.
    pub fn set_delegate(&self, delegate: &Arc<dyn RawReceiverDelegate>) {
        *self.shared.delegate.lock() = Some(Arc::downgrade(delegate));
    }

    pub fn metrics(&self) -> &ReceiverMetrics {
        &self.shared.metrics
    }

    /// Bind sockets, join the universe's groups, and start the sampling
    /// window and loss heartbeat.
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
        let mut sockets = open_sockets(
            self.shared.universe,
            self.shared.config.ip_mode,
            &self.shared.config.interfaces,
        )?;
        for socket in &mut sockets {
            begin_socket(&self.shared, socket)?;
        }

        let mut state = self.shared.state.lock();
        if state.running {
            drop(state);
            return Err(Error::AlreadyStarted);
        }
        let now = Instant::now();
        state.sockets = sockets;
        state.sampling_active = true;
        state.sampling_timer = Timer::expiring_in(now, SAMPLING_PERIOD);
        for socket in &mut state.sockets {
            socket.in_window = true;
        }
        state.notified_exceeded = false;
        state.running = true;

        let (tx, rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("sacn-recv-beat".to_string())
            .spawn(move || heartbeat_loop(&shared, &rx))
            .map_err(Error::Receive)?;
        state.shutdown_tx = Some(tx);
        state.handle = Some(handle);
        drop(state);

        log::debug!("[RECV] universe {} started, sampling", self.shared.universe);
        self.shared.dispatch(vec![RawEvent::StartedSampling]);
        Ok(())
    }

    /// Stop heartbeats and close sockets synchronously. Tracked sources are
    /// forgotten without loss notifications.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(Error::NotStarted);
        }
        state.running = false;
        state.sampling_active = false;
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
        log::debug!("[RECV] universe {} stopped", self.shared.universe);
        Ok(())
    }

    /// Replace the listen interface set. Added interfaces enter a sampling
    /// window; removed ones close immediately.
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
        let mut new_sockets = open_sockets(self.shared.universe, self.shared.config.ip_mode, &added)?;
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

        let mut events = Vec::new();
        if !new_sockets.is_empty() && !state.sampling_active {
            state.sampling_active = true;
            state.sampling_timer = Timer::expiring_in(Instant::now(), SAMPLING_PERIOD);
            for socket in &mut new_sockets {
                socket.in_window = true;
            }
            events.push(RawEvent::StartedSampling);
        }
        state.sockets.extend(new_sockets);
        drop(state);

        for mut socket in removed {
            socket.socket.close();
        }
        self.shared.dispatch(events);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<RawShared> {
        &self.shared
    }
}

impl Drop for RawReceiver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn open_sockets(
    universe: u16,
    ip_mode: IpMode,
    interfaces: &[String],
) -> Result<Vec<ReceiverSocket>> {
    let mut sockets = Vec::new();
    if interfaces.is_empty() {
        let mut socket = SacnSocket::bind_receiver(IpFamily::V4, None)?;
        socket.join_multicast(group_addr(universe, IpFamily::V4).ip())?;
        sockets.push(ReceiverSocket {
            socket,
            interface: None,
            sampling: true,
            in_window: false,
        });
        return Ok(sockets);
    }
    for name in interfaces {
        let resolved = resolve_interface(name)?;
        for &family in ip_mode.families() {
            if family == IpFamily::V4 && resolved.v4.is_none() {
                log::debug!("[RECV] interface {} has no IPv4 address, skipping", name);
                continue;
            }
            let mut socket = SacnSocket::bind_receiver(family, Some(&resolved))?;
            socket.join_multicast(group_addr(universe, family).ip())?;
            sockets.push(ReceiverSocket {
                socket,
                interface: Some(name.clone()),
                sampling: true,
                in_window: false,
            });
        }
    }
    Ok(sockets)
}

fn begin_socket(shared: &Arc<RawShared>, socket: &mut ReceiverSocket) -> Result<()> {
    let weak = Arc::downgrade(shared);
    let on_datagram: crate::transport::DatagramHandler =
        Arc::new(move |bytes, src, family| {
            if let Some(shared) = weak.upgrade() {
                process_datagram(&shared, bytes, src, family, Instant::now());
            }
        });
    let weak = Arc::downgrade(shared);
    let interface = socket.interface.clone();
    let on_closed: crate::transport::ClosedHandler = Arc::new(move |error| {
        if let Some(shared) = weak.upgrade() {
            shared.dispatch(vec![RawEvent::SocketClosed(interface.clone(), error)]);
        }
    });
    socket.socket.begin_receiving(on_datagram, on_closed)
}

/// Demux one datagram into the per-source state machines.
pub(crate) fn process_datagram(
    shared: &Arc<RawShared>,
    bytes: &[u8],
    src: SocketAddr,
    family: IpFamily,
    now: Instant,
) {
    let metrics = &shared.metrics;
    metrics.packets_received.fetch_add(1, Ordering::Relaxed);
    metrics
        .bytes_received
        .fetch_add(bytes.len() as u64, Ordering::Relaxed);

    let data = match Packet::decode(bytes) {
        Ok(Packet::Data(data)) => data,
        Ok(Packet::Discovery(_)) => return,
        Err(e) => {
            // Parse errors stop here; the stream as a whole keeps flowing.
            note_parse_error(shared, &e);
            return;
        }
    };
    if data.universe != shared.universe {
        return;
    }
    if shared.config.filter_preview && data.options.preview {
        metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let mut events = Vec::new();
    {
        let mut state = shared.state.lock();
        if !state.running {
            return;
        }

        match state.sources.get_mut(&data.cid) {
            Some(source) => {
                if !source.matches_origin(src.ip(), family) {
                    log::debug!(
                        "[RECV] cid {} from unexpected origin {}, dropped",
                        data.cid,
                        src
                    );
                    metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if source.terminated {
                    metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if !source.accept_sequence(data.sequence) {
                    metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                source.note_data(now);
                source.name = data.source_name.clone();
                if data.options.terminated {
                    log::debug!("[RECV] source {} terminated universe {}", data.cid, data.universe);
                    source.mark_terminated(now);
                    return;
                }
                if data.is_priority_frame() {
                    if source.handle_pap(now) {
                        events.push(RawEvent::Data(source_data(&data, source.sampling, DataKind::PerAddressPriority)));
                    }
                } else {
                    if source.check_pap_expiry(now) {
                        events.push(RawEvent::PapLost(data.cid));
                    }
                    if source.handle_levels(now) {
                        events.push(RawEvent::Data(source_data(&data, source.sampling, DataKind::Levels)));
                    }
                }
            }
            None => {
                if data.options.terminated {
                    return;
                }
                let limit = shared.config.source_limit.unwrap_or(usize::MAX);
                if state.sources.len() >= limit {
                    if !state.notified_exceeded {
                        state.notified_exceeded = true;
                        events.push(RawEvent::Exceeded);
                        log::debug!("[RECV] universe {} source limit reached", shared.universe);
                    }
                    metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    let sampling = state.sampling_active;
                    let mut source = TrackedSource::new(
                        data.cid,
                        src.ip(),
                        family,
                        data.source_name.clone(),
                        data.sequence,
                        sampling,
                        now,
                    );
                    log::debug!(
                        "[RECV] new source {} on universe {} (sampling={})",
                        data.cid,
                        shared.universe,
                        sampling
                    );
                    let notify = if data.is_priority_frame() {
                        source.handle_pap(now).then(|| DataKind::PerAddressPriority)
                    } else {
                        source.handle_levels(now).then(|| DataKind::Levels)
                    };
                    if let Some(kind) = notify {
                        events.push(RawEvent::Data(source_data(&data, sampling, kind)));
                    }
                    state.sources.insert(data.cid, source);
                }
            }
        }
    }
    shared.dispatch(events);
}

fn source_data(data: &crate::protocol::DataPacket, is_sampling: bool, kind: DataKind) -> SourceData {
    SourceData {
        cid: data.cid,
        name: data.source_name.clone(),
        universe: data.universe,
        priority: data.priority,
        preview: data.options.preview,
        is_sampling,
        kind,
        values: data.values.clone(),
    }
}

fn note_parse_error(shared: &Arc<RawShared>, error: &ParseError) {
    shared.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
    log::debug!("[RECV] universe {} dropped datagram: {}", shared.universe, error);
}

/// Sampling window bookkeeping; runs from the heartbeat thread.
pub(crate) fn check_sampling(shared: &Arc<RawShared>, now: Instant) {
    let mut events = Vec::new();
    {
        let mut state = shared.state.lock();
        if !state.running || !state.sampling_active || !state.sampling_timer.is_expired(now) {
            return;
        }
        for socket in &mut state.sockets {
            if socket.in_window {
                socket.sampling = false;
                socket.in_window = false;
            }
        }
        let stragglers = state.sockets.iter().any(|s| s.sampling);
        if stragglers {
            // Sockets arrived mid-window; give them a full window of their own.
            state.sampling_timer = Timer::expiring_in(now, SAMPLING_PERIOD);
            for socket in &mut state.sockets {
                if socket.sampling {
                    socket.in_window = true;
                }
            }
        } else {
            state.sampling_active = false;
            for source in state.sources.values_mut() {
                source.sampling = false;
            }
            events.push(RawEvent::EndedSampling);
            log::debug!("[RECV] universe {} sampling ended", shared.universe);
        }
    }
    shared.dispatch(events);
}

/// Source-loss sweep; runs every 500 ms from the heartbeat thread.
pub(crate) fn sweep_losses(shared: &Arc<RawShared>, now: Instant) {
    let mut events = Vec::new();
    {
        let mut state = shared.state.lock();
        if !state.running {
            return;
        }
        let mut lost = Vec::new();
        let mut evict_silently = Vec::new();
        for (cid, source) in state.sources.iter_mut() {
            if source.check_pap_expiry(now) {
                events.push(RawEvent::PapLost(*cid));
            }
            if source.check_lost(now) {
                if source.has_levels() {
                    lost.push(*cid);
                } else {
                    // Never surfaced; no notification owed.
                    evict_silently.push(*cid);
                }
            }
        }
        for cid in &evict_silently {
            state.sources.remove(cid);
        }
        if !lost.is_empty() {
            for cid in &lost {
                state.sources.remove(cid);
            }
            log::debug!(
                "[RECV] universe {} lost {} source(s)",
                shared.universe,
                lost.len()
            );
            events.push(RawEvent::Lost(lost));
        }
    }
    shared.dispatch(events);
}

fn heartbeat_loop(shared: &Arc<RawShared>, shutdown: &crossbeam::channel::Receiver<()>) {
    let mut next_beat = Instant::now() + LOSS_HEARTBEAT;
    loop {
        let now = Instant::now();
        let mut deadline = next_beat;
        {
            let state = shared.state.lock();
            if state.sampling_active {
                deadline = deadline.min(state.sampling_timer.deadline());
            }
        }
        match shutdown.recv_timeout(deadline.saturating_duration_since(now)) {
            Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
        }
        let now = Instant::now();
        check_sampling(shared, now);
        if now >= next_beat {
            sweep_losses(shared, now);
            next_beat += LOSS_HEARTBEAT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataPacket, PacketOptions, STARTCODE_LEVELS, STARTCODE_PRIORITY};
    use parking_lot::Mutex as PlMutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    /// Records every event for assertions.
    #[derive(Default)]
    struct Recorder {
        data: PlMutex<Vec<SourceData>>,
        pap_lost: PlMutex<Vec<Cid>>,
        lost: PlMutex<Vec<Vec<Cid>>>,
        exceeded: PlMutex<u32>,
        ended_sampling: PlMutex<u32>,
    }

    impl RawReceiverDelegate for Recorder {
        fn universe_data(&self, data: &SourceData) {
            self.data.lock().push(data.clone());
        }
        fn lost_pap(&self, _universe: u16, cid: Cid) {
            self.pap_lost.lock().push(cid);
        }
        fn lost_sources(&self, _universe: u16, cids: Vec<Cid>) {
            self.lost.lock().push(cids);
        }
        fn ended_sampling(&self, _universe: u16) {
            *self.ended_sampling.lock() += 1;
        }
        fn exceeded_sources(&self, _universe: u16) {
            *self.exceeded.lock() += 1;
        }
    }

    struct Harness {
        _receiver: RawReceiver,
        shared: Arc<RawShared>,
        recorder: Arc<Recorder>,
        _delegate: Arc<dyn RawReceiverDelegate>,
    }

    /// Wires a recorder delegate to a receiver whose state is driven by hand
    /// (no sockets, fabricated clock).
    fn harness(config: ReceiverConfig) -> Harness {
        let receiver = RawReceiver::new(config, 1).expect("receiver");
        let shared = Arc::clone(receiver.shared());
        shared.state.lock().running = true;
        let recorder = Arc::new(Recorder::default());
        let delegate: Arc<dyn RawReceiverDelegate> = recorder.clone();
        *shared.delegate.lock() = Some(Arc::downgrade(&delegate));
        Harness {
            _receiver: receiver,
            shared,
            recorder,
            _delegate: delegate,
        }
    }

    fn frame(cid: u8, sequence: u8, start_code: u8, values: &[u8]) -> Vec<u8> {
        DataPacket {
            cid: Cid::from_bytes([cid; 16]),
            source_name: "src".into(),
            priority: 100,
            sync_address: 0,
            sequence,
            options: PacketOptions::default(),
            universe: 1,
            start_code,
            values: values.to_vec(),
        }
        .encode()
    }

    fn origin() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 5568)
    }

    fn feed(shared: &Arc<RawShared>, bytes: &[u8], now: Instant) {
        process_datagram(shared, bytes, origin(), IpFamily::V4, now);
    }

    #[test]
    fn test_sampling_source_notifies_immediately() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let now = Instant::now();

        feed(&shared, &frame(1, 0, STARTCODE_LEVELS, &[255; 16]), now);
        let data = recorder.data.lock();
        assert_eq!(data.len(), 1);
        assert!(data[0].is_sampling);
        assert_eq!(data[0].kind, DataKind::Levels);
        assert_eq!(data[0].values[0], 255);
    }

    #[test]
    fn test_non_sampling_source_waits_for_pap_window() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        let start = Instant::now();

        feed(&shared, &frame(1, 0, STARTCODE_LEVELS, &[1; 16]), start);
        assert!(recorder.data.lock().is_empty(), "first frame held back");

        // After the wait expires levels flow.
        let later = start + Duration::from_millis(1600);
        feed(&shared, &frame(1, 1, STARTCODE_LEVELS, &[2; 16]), later);
        let data = recorder.data.lock();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].values[0], 2);
    }

    #[test]
    fn test_sequence_regression_scenario() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let now = Instant::now();

        for (sequence, value) in [(5u8, 10u8), (4, 20), (240, 30), (241, 40)] {
            feed(&shared, &frame(1, sequence, STARTCODE_LEVELS, &[value; 4]), now);
        }
        let data = recorder.data.lock();
        let seen: Vec<u8> = data.iter().map(|d| d.values[0]).collect();
        // seq 5 accepted, 4 dropped (-1), 240 accepted (-21), 241 accepted.
        assert_eq!(seen, vec![10, 30, 40]);
        assert_eq!(shared.metrics.packets_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_origin_change_ignored() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let now = Instant::now();

        feed(&shared, &frame(1, 0, STARTCODE_LEVELS, &[1; 4]), now);
        let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)), 5568);
        process_datagram(
            &shared,
            &frame(1, 1, STARTCODE_LEVELS, &[2; 4]),
            other,
            IpFamily::V4,
            now,
        );
        assert_eq!(recorder.data.lock().len(), 1, "split-brain packet dropped");
    }

    #[test]
    fn test_terminated_marks_and_drops_follow_ups() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let now = Instant::now();

        feed(&shared, &frame(1, 0, STARTCODE_LEVELS, &[1; 4]), now);
        let mut terminated = DataPacket {
            cid: Cid::from_bytes([1; 16]),
            source_name: "src".into(),
            priority: 100,
            sync_address: 0,
            sequence: 1,
            options: PacketOptions {
                terminated: true,
                ..Default::default()
            },
            universe: 1,
            start_code: STARTCODE_LEVELS,
            values: vec![0; 4],
        };
        feed(&shared, &terminated.encode(), now);
        // Follow-up data from the same CID is dropped.
        terminated.options.terminated = false;
        terminated.sequence = 2;
        feed(&shared, &terminated.encode(), now);
        assert_eq!(recorder.data.lock().len(), 1);

        // The sweep evicts it with a loss notification.
        sweep_losses(&shared, now + Duration::from_millis(600));
        assert_eq!(recorder.lost.lock().len(), 1);
        assert!(shared.state.lock().sources.is_empty());
    }

    #[test]
    fn test_loss_coalescing() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let start = Instant::now();

        for cid in 1..=3u8 {
            feed(&shared, &frame(cid, 0, STARTCODE_LEVELS, &[cid; 4]), start);
        }
        // One sweep clears the received-flags, the silence does the rest.
        sweep_losses(&shared, start + Duration::from_millis(500));
        assert!(recorder.lost.lock().is_empty());

        sweep_losses(&shared, start + Duration::from_millis(3200));
        let lost = recorder.lost.lock();
        assert_eq!(lost.len(), 1, "a single coalesced notification");
        assert_eq!(lost[0].len(), 3);
    }

    #[test]
    fn test_source_limit_enforced_once() {
        let h = harness(ReceiverConfig {
            source_limit: Some(2),
            ..Default::default()
        });
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let now = Instant::now();

        for cid in 1..=4u8 {
            feed(&shared, &frame(cid, 0, STARTCODE_LEVELS, &[0; 4]), now);
        }
        assert_eq!(shared.state.lock().sources.len(), 2);
        assert_eq!(*recorder.exceeded.lock(), 1, "reported exactly once");
    }

    #[test]
    fn test_preview_filtered_by_default() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let now = Instant::now();

        let preview = DataPacket {
            cid: Cid::from_bytes([1; 16]),
            source_name: "src".into(),
            priority: 100,
            sync_address: 0,
            sequence: 0,
            options: PacketOptions {
                preview: true,
                ..Default::default()
            },
            universe: 1,
            start_code: STARTCODE_LEVELS,
            values: vec![0; 4],
        };
        feed(&shared, &preview.encode(), now);
        assert!(recorder.data.lock().is_empty());
        assert!(shared.state.lock().sources.is_empty());
    }

    #[test]
    fn test_other_universe_ignored() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let mut packet = DataPacket {
            cid: Cid::from_bytes([1; 16]),
            source_name: "src".into(),
            priority: 100,
            sync_address: 0,
            sequence: 0,
            options: PacketOptions::default(),
            universe: 2,
            start_code: STARTCODE_LEVELS,
            values: vec![0; 4],
        };
        feed(&shared, &packet.encode(), Instant::now());
        assert!(recorder.data.lock().is_empty());

        packet.universe = 1;
        feed(&shared, &packet.encode(), Instant::now());
        assert_eq!(recorder.data.lock().len(), 1);
    }

    #[test]
    fn test_parse_errors_counted_not_fatal() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        feed(&shared, &[0u8; 20], Instant::now());
        assert_eq!(shared.metrics.parse_errors.load(Ordering::Relaxed), 1);
        feed(&shared, &frame(1, 0, STARTCODE_LEVELS, &[1; 4]), Instant::now());
        assert_eq!(recorder.data.lock().len(), 1);
    }

    #[test]
    fn test_pap_loss_reported_from_sweep() {
        let h = harness(ReceiverConfig::default());
        let (shared, recorder) = (h.shared.clone(), h.recorder.clone());
        shared.state.lock().sampling_active = true;
        let start = Instant::now();

        feed(&shared, &frame(1, 0, STARTCODE_LEVELS, &[1; 4]), start);
        feed(&shared, &frame(1, 1, STARTCODE_PRIORITY, &[100; 4]), start);

        // Levels keep flowing, the 0xDD stream stops.
        let t1 = start + Duration::from_millis(2600);
        feed(&shared, &frame(1, 2, STARTCODE_LEVELS, &[1; 4]), t1);
        assert_eq!(recorder.pap_lost.lock().as_slice(), &[Cid::from_bytes([1; 16])]);

        // Source itself is still live.
        assert!(recorder.lost.lock().is_empty());
    }

    #[test]
    fn test_invalid_universe_rejected() {
        assert!(matches!(
            RawReceiver::new(ReceiverConfig::default(), 0),
            Err(Error::InvalidUniverse(0))
        ));
        assert!(matches!(
            RawReceiver::new(
                ReceiverConfig {
                    ip_mode: IpMode::Ipv6Only,
                    ..Default::default()
                },
                1
            ),
            Err(Error::NoInterfaces)
        ));
    }
}
