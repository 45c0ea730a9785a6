// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Merged receiver: raw receiver + dual mergers.
//!
//! Frames from sources still inside the sampling window accumulate in a
//! sampling merger so a freshly started receiver does not flicker through
//! partial states; everything else lands in the live merger. When sampling
//! ends, the sampling sources are migrated into the live merger in one step
//! and merged frames start flowing.

use super::{
    DataKind, RawReceiver, RawReceiverDelegate, ReceiverConfig, ReceiverMetrics, SourceData,
};
use crate::cid::Cid;
use crate::error::Result;
use crate::merge::Merger;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Weak};

/// One merged frame: the outputs of the live merge.
#[derive(Debug, Clone)]
pub struct MergedData {
    /// Merged levels, 512 slots.
    pub levels: Vec<u8>,
    /// Winning source per slot; `None` where no source owns the slot.
    pub winners: Vec<Option<Cid>>,
    /// Sources contributing to the live merge.
    pub active_sources: Vec<Cid>,
}

/// Merged receiver notifications.
///
/// Called from the receiver's socket and heartbeat threads; implementations
/// hop to their own executor if they need one.
pub trait ReceiverDelegate: Send + Sync {
    fn merged_data(&self, _universe: u16, _data: &MergedData) {}
    fn started_sampling(&self, _universe: u16) {}
    fn ended_sampling(&self, _universe: u16) {}
    fn lost_sources(&self, _universe: u16, _cids: Vec<Cid>) {}
    fn exceeded_sources(&self, _universe: u16) {}
    fn socket_closed(&self, _universe: u16, _interface: Option<String>, _error: Option<io::Error>) {
    }
}

struct MergedState {
    sampling_merger: Merger,
    live_merger: Merger,
    /// Sources whose first frame was 0xDD; no levels yet, so merged output
    /// would misrepresent them. Notifications hold until they clear.
    pending: HashSet<Cid>,
    sampling_active: bool,
}

struct MergedCore {
    universe: u16,
    state: Mutex<MergedState>,
    delegate: Mutex<Option<Weak<dyn ReceiverDelegate>>>,
}

enum MergedEvent {
    Merged(MergedData),
    StartedSampling,
    EndedSampling,
    Lost(Vec<Cid>),
    Exceeded,
    SocketClosed(Option<String>, Option<io::Error>),
}

impl MergedCore {
    fn dispatch(&self, events: Vec<MergedEvent>) {
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
                MergedEvent::Merged(data) => delegate.merged_data(self.universe, &data),
                MergedEvent::StartedSampling => delegate.started_sampling(self.universe),
                MergedEvent::EndedSampling => delegate.ended_sampling(self.universe),
                MergedEvent::Lost(cids) => delegate.lost_sources(self.universe, cids),
                MergedEvent::Exceeded => delegate.exceeded_sources(self.universe),
                MergedEvent::SocketClosed(interface, error) => {
                    delegate.socket_closed(self.universe, interface, error);
                }
            }
        }
    }

    /// Merged frames flow only with sampling over, live sources present, and
    /// no source still pending its first levels.
    fn snapshot_if_ready(state: &MergedState) -> Option<MergedData> {
        if state.sampling_active
            || !state.live_merger.has_sources()
            || !state.pending.is_empty()
        {
            return None;
        }
        Some(MergedData {
            levels: state.live_merger.levels().to_vec(),
            winners: state.live_merger.winners().to_vec(),
            active_sources: state.live_merger.source_ids(),
        })
    }
}

/// Routes raw-receiver output into the mergers.
struct MergeAdapter {
    core: Arc<MergedCore>,
}

impl RawReceiverDelegate for MergeAdapter {
    fn universe_data(&self, data: &SourceData) {
        let mut events = Vec::new();
        {
            let mut state = self.core.state.lock();
            let state = &mut *state;
            let merger = if data.is_sampling && state.sampling_active {
                &mut state.sampling_merger
            } else {
                &mut state.live_merger
            };
            merger.add_source(data.cid);
            // Both frame kinds carry the universe priority byte.
            let _ = merger.update_universe_priority(&data.cid, data.priority);
            match data.kind {
                DataKind::Levels => {
                    state.pending.remove(&data.cid);
                    if merger.update_levels(&data.cid, &data.values).is_err() {
                        return;
                    }
                }
                DataKind::PerAddressPriority => {
                    let known_levels = merger
                        .source(&data.cid)
                        .is_some_and(|s| !s.levels().is_empty());
                    if !known_levels {
                        state.pending.insert(data.cid);
                    }
                    if merger.update_pap(&data.cid, &data.values).is_err() {
                        return;
                    }
                }
            }
            if let Some(snapshot) = MergedCore::snapshot_if_ready(state) {
                events.push(MergedEvent::Merged(snapshot));
            }
        }
        self.core.dispatch(events);
    }

    fn lost_pap(&self, _universe: u16, cid: Cid) {
        let mut events = Vec::new();
        {
            let mut state = self.core.state.lock();
            let state = &mut *state;
            let _ = state.sampling_merger.remove_pap(&cid);
            let _ = state.live_merger.remove_pap(&cid);
            if let Some(snapshot) = MergedCore::snapshot_if_ready(state) {
                events.push(MergedEvent::Merged(snapshot));
            }
        }
        self.core.dispatch(events);
    }

    fn lost_sources(&self, _universe: u16, cids: Vec<Cid>) {
        let mut events = Vec::new();
        {
            let mut state = self.core.state.lock();
            let state = &mut *state;
            for cid in &cids {
                let _ = state.sampling_merger.remove_source(cid);
                let _ = state.live_merger.remove_source(cid);
                state.pending.remove(cid);
            }
            events.push(MergedEvent::Lost(cids));
            if let Some(snapshot) = MergedCore::snapshot_if_ready(state) {
                events.push(MergedEvent::Merged(snapshot));
            }
        }
        self.core.dispatch(events);
    }

    fn started_sampling(&self, _universe: u16) {
        {
            let mut state = self.core.state.lock();
            state.sampling_active = true;
        }
        self.core.dispatch(vec![MergedEvent::StartedSampling]);
    }

    fn ended_sampling(&self, _universe: u16) {
        let mut events = vec![MergedEvent::EndedSampling];
        {
            let mut state = self.core.state.lock();
            let state = &mut *state;
            // Migrate each sampled source into the live merge atomically.
            for cid in state.sampling_merger.source_ids() {
                if !state.live_merger.contains_source(&cid) {
                    if let Some(source) = state.sampling_merger.source(&cid) {
                        let levels = source.levels().to_vec();
                        let priority = source.universe_priority();
                        let pap = source.pap().map(<[u8]>::to_vec);
                        state.live_merger.add_source(cid);
                        let _ = state.live_merger.update_universe_priority(&cid, priority);
                        if !levels.is_empty() {
                            let _ = state.live_merger.update_levels(&cid, &levels);
                        }
                        if let Some(pap) = pap {
                            let _ = state.live_merger.update_pap(&cid, &pap);
                        }
                    }
                }
                let _ = state.sampling_merger.remove_source(&cid);
            }
            state.sampling_active = false;
            if let Some(snapshot) = MergedCore::snapshot_if_ready(state) {
                events.push(MergedEvent::Merged(snapshot));
            }
        }
        self.core.dispatch(events);
    }

    fn exceeded_sources(&self, _universe: u16) {
        self.core.dispatch(vec![MergedEvent::Exceeded]);
    }

    fn socket_closed(&self, _universe: u16, interface: Option<String>, error: Option<io::Error>) {
        self.core
            .dispatch(vec![MergedEvent::SocketClosed(interface, error)]);
    }
}

/// Per-universe receiver with HTP/priority merging.
pub struct Receiver {
    raw: RawReceiver,
    core: Arc<MergedCore>,
    /// Keeps the adapter alive; the raw receiver only holds a weak handle.
    _adapter: Arc<dyn RawReceiverDelegate>,
}

impl Receiver {
    /// Create a merged receiver for one universe.
    pub fn new(config: ReceiverConfig, universe: u16) -> Result<Self> {
        let raw = RawReceiver::new(config, universe)?;
        let core = Arc::new(MergedCore {
            universe,
            state: Mutex::new(MergedState {
                sampling_merger: Merger::new(),
                live_merger: Merger::new(),
                pending: HashSet::new(),
                sampling_active: false,
            }),
            delegate: Mutex::new(None),
        });
        let adapter: Arc<dyn RawReceiverDelegate> = Arc::new(MergeAdapter {
            core: Arc::clone(&core),
        });
        raw.set_delegate(&adapter);
        Ok(Self {
            raw,
            core,
            _adapter: adapter,
        })
    }

    pub fn universe(&self) -> u16 {
        self.raw.universe()
    }

    pub fn metrics(&self) -> &ReceiverMetrics {
        self.raw.metrics()
    }

    /// Install the delegate. The receiver keeps a weak handle only.
    pub fn set_delegate(&self, delegate: &Arc<dyn ReceiverDelegate>) {
        *self.core.delegate.lock() = Some(Arc::downgrade(delegate));
    }

    pub fn start(&self) -> Result<()> {
        self.raw.start()
    }

    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.core.state.lock();
            state.sampling_merger = Merger::new();
            state.live_merger = Merger::new();
            state.pending.clear();
            state.sampling_active = false;
        }
        self.raw.stop()
    }

    pub fn update_interfaces(&self, interfaces: Vec<String>) -> Result<()> {
        self.raw.update_interfaces(interfaces)
    }

    /// Poll the current merged frame (zeroed when no live sources).
    pub fn merged_data(&self) -> MergedData {
        let state = self.core.state.lock();
        MergedData {
            levels: state.live_merger.levels().to_vec(),
            winners: state.live_merger.winners().to_vec(),
            active_sources: state.live_merger.source_ids(),
        }
    }

    /// CIDs currently contributing to the live merge.
    pub fn active_sources(&self) -> Vec<Cid> {
        self.core.state.lock().live_merger.source_ids()
    }

    #[cfg(test)]
    pub(crate) fn adapter_for_test(&self) -> Arc<dyn RawReceiverDelegate> {
        Arc::clone(&self._adapter)
    }
}
