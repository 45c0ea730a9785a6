// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 44 Hz transmit worker.
//!
//! One thread per source owns the tick cadence: every 22.73 ms it walks the
//! universe table, emits whatever each universe's plan calls for, runs the
//! 10-second discovery schedule, and drives retiring sockets through their
//! terminated bursts. The thread exits on a shutdown signal or once a
//! stopping source has finished every termination burst.

use super::{SenderSocket, SourceEvent, SourceShared};
use crate::protocol::constants::{DISCOVERY_INTERVAL, TICK_PERIOD};
use crate::protocol::paginate;
use crate::transport::multicast::{discovery_addr, group_addr};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

pub(super) fn spawn(shared: Arc<SourceShared>) -> std::io::Result<(Sender<()>, JoinHandle<()>)> {
    let (tx, rx) = bounded(1);
    let handle = std::thread::Builder::new()
        .name("sacn-source-tick".to_string())
        .spawn(move || run(&shared, &rx))?;
    Ok((tx, handle))
}

fn run(shared: &Arc<SourceShared>, shutdown: &Receiver<()>) {
    let mut next_tick = Instant::now();
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match shutdown.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        next_tick += TICK_PERIOD;
        if tick(shared) {
            break;
        }
    }
}

/// One transmit tick. Returns true when the source has fully wound down.
pub(super) fn tick(shared: &Arc<SourceShared>) -> bool {
    let mut events: Vec<SourceEvent> = Vec::new();
    let mut done = false;
    {
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        let now = Instant::now();
        let output = state.output_enabled;

        // Discovery schedule: immediately on start, then every 10 s.
        if output && state.discovery_timer.is_expired(now) {
            state.discovery_timer.reset(now, DISCOVERY_INTERVAL);
            let announced: Vec<u16> = state
                .universes
                .values()
                .filter(|u| !u.is_terminating())
                .map(|u| u.number())
                .collect();
            let name = state.name.clone();
            for (page, last_page, chunk) in paginate(&announced) {
                let bytes =
                    crate::protocol::DiscoveryPacket {
                        cid: shared.cid,
                        source_name: name.clone(),
                        page,
                        last_page,
                        universes: chunk.to_vec(),
                    }
                    .encode();
                for socket in state.sockets.iter_mut() {
                    let dest = discovery_addr(socket.socket.family());
                    send_one(socket, &bytes, dest, shared, &mut events);
                }
                state.sockets.retain(|s| !s.failed);
            }
        }

        let mut finished: Vec<u16> = Vec::new();
        for universe in state.universes.values_mut() {
            if universe.finished() {
                continue;
            }
            let plan = universe.plan_tick();
            if output && plan.send_levels {
                let number = universe.number();
                let bytes = universe.stamp_levels();
                for socket in state.sockets.iter_mut() {
                    let dest = group_addr(number, socket.socket.family());
                    send_one(socket, bytes, dest, shared, &mut events);
                }
            }
            if output && plan.send_priority {
                let number = universe.number();
                let bytes = universe.stamp_priorities();
                for socket in state.sockets.iter_mut() {
                    let dest = group_addr(number, socket.socket.family());
                    send_one(socket, bytes, dest, shared, &mut events);
                }
            }
            universe.finish_tick(plan);
            if universe.finished() {
                log::debug!("[SRC] universe {} termination burst done", universe.number());
                if universe.remove_when_done() {
                    finished.push(universe.number());
                }
            }
        }
        state.sockets.retain(|s| !s.failed);
        for number in finished {
            state.universes.remove(&number);
            log::debug!("[SRC] universe {} removed", number);
        }

        // Sockets being retired after an interface change: three ticks of
        // terminated frames for every universe, then close.
        for retiring in state.retiring.iter_mut() {
            for universe in state.universes.values_mut() {
                if universe.finished() {
                    continue;
                }
                let bytes = universe.stamp_retirement();
                let dest = group_addr(universe.number(), retiring.socket.family());
                if let Err(e) = retiring.socket.send(&bytes, dest) {
                    log::debug!("[SRC] retiring send failed: {}", e);
                }
            }
            retiring.remaining -= 1;
        }
        state
            .retiring
            .retain(|r| r.remaining > 0);

        // A stopping source winds down once every universe finished its burst.
        if state.stopping && state.universes.values().all(|u| u.finished()) {
            state.sockets.clear();
            state.retiring.clear();
            state.running = false;
            state.stopping = false;
            events.push(SourceEvent::Ended);
            done = true;
            log::debug!("[SRC] transmission ended");
        }
    }

    for event in events {
        shared.dispatch(event);
    }
    done
}

fn send_one(
    socket: &mut SenderSocket,
    bytes: &[u8],
    dest: std::net::SocketAddr,
    shared: &Arc<SourceShared>,
    events: &mut Vec<SourceEvent>,
) {
    if socket.failed {
        return;
    }
    match socket.socket.send(bytes, dest) {
        Ok(sent) => {
            shared.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
            shared
                .metrics
                .bytes_sent
                .fetch_add(sent as u64, Ordering::Relaxed);
        }
        Err(e) => {
            log::warn!(
                "[SRC] send to {} failed on {}: {}",
                dest,
                socket.interface.as_deref().unwrap_or("default"),
                e
            );
            socket.failed = true;
            events.push(SourceEvent::SocketClosed(socket.interface.clone(), Some(e)));
        }
    }
}
