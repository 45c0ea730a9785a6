// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-source tracking state within one receiver universe.
//!
//! A source moves through four states:
//!
//! ```text
//! WaitingLevels --levels (sampling)--> HasLevelsAndPap
//! WaitingLevels --levels-------------> WaitingPap --pap--> HasLevelsAndPap
//!                                      WaitingPap --wait expired--> HasLevels
//! HasLevels --pap--> HasLevelsAndPap --pap silent 2.5 s--> HasLevels
//! ```
//!
//! Outside the sampling window a source's first level frames are held back
//! for the PAP wait so a 0xDD stream that is already on the wire cannot lose
//! a race against plain levels. During sampling the source is adopted
//! immediately.

use crate::cid::Cid;
use crate::protocol::constants::{PAP_WAIT, SOURCE_LOSS_TIMEOUT};
use crate::protocol::sequence_acceptable;
use crate::time::Timer;
use crate::transport::IpFamily;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackedState {
    WaitingLevels,
    WaitingPap,
    HasLevels,
    HasLevelsAndPap,
}

/// One source seen on one universe.
pub(crate) struct TrackedSource {
    pub(crate) cid: Cid,
    /// First-seen origin; packets from the same CID at a different address or
    /// family are dropped (multi-homed devices must not split-brain a source).
    pub(crate) host: IpAddr,
    pub(crate) family: IpFamily,
    pub(crate) name: String,
    pub(crate) last_sequence: u8,
    pub(crate) terminated: bool,
    pub(crate) state: TrackedState,
    pub(crate) packet_timer: Timer,
    pub(crate) pap_timer: Timer,
    /// Any accepted data frame since the last loss sweep.
    pub(crate) dmx_received: bool,
    /// Source was adopted during the sampling window and sampling has not
    /// ended yet.
    pub(crate) sampling: bool,
}

impl TrackedSource {
    pub(crate) fn new(
        cid: Cid,
        host: IpAddr,
        family: IpFamily,
        name: String,
        first_sequence: u8,
        sampling: bool,
        now: Instant,
    ) -> Self {
        Self {
            cid,
            host,
            family,
            name,
            last_sequence: first_sequence,
            terminated: false,
            state: TrackedState::WaitingLevels,
            packet_timer: Timer::expiring_in(now, SOURCE_LOSS_TIMEOUT),
            pap_timer: Timer::expiring_in(now, PAP_WAIT),
            dmx_received: true,
            sampling,
        }
    }

    /// Identity check for a follow-up packet.
    pub(crate) fn matches_origin(&self, host: IpAddr, family: IpFamily) -> bool {
        self.host == host && self.family == family
    }

    /// Apply sequence validation; accepted packets advance the window.
    pub(crate) fn accept_sequence(&mut self, sequence: u8) -> bool {
        if sequence_acceptable(self.last_sequence, sequence) {
            self.last_sequence = sequence;
            true
        } else {
            false
        }
    }

    /// Any accepted data frame feeds the loss timer.
    pub(crate) fn note_data(&mut self, now: Instant) {
        self.packet_timer.reset(now, SOURCE_LOSS_TIMEOUT);
        self.dmx_received = true;
    }

    /// Terminated option bit seen: the loss sweep evicts on its next pass.
    pub(crate) fn mark_terminated(&mut self, now: Instant) {
        self.terminated = true;
        self.packet_timer.expire(now);
    }

    pub(crate) fn has_levels(&self) -> bool {
        matches!(
            self.state,
            TrackedState::HasLevels | TrackedState::HasLevelsAndPap
        )
    }

    /// A levels frame arrived. Returns whether it should be surfaced.
    pub(crate) fn handle_levels(&mut self, now: Instant) -> bool {
        match self.state {
            TrackedState::WaitingLevels => {
                if self.sampling {
                    self.state = TrackedState::HasLevelsAndPap;
                    self.pap_timer.reset(now, SOURCE_LOSS_TIMEOUT);
                    true
                } else {
                    self.state = TrackedState::WaitingPap;
                    self.pap_timer.reset(now, PAP_WAIT);
                    false
                }
            }
            TrackedState::WaitingPap => {
                if self.pap_timer.is_expired(now) {
                    // No 0xDD stream showed up; this source runs on levels.
                    self.state = TrackedState::HasLevels;
                    self.pap_timer.reset(now, SOURCE_LOSS_TIMEOUT);
                    true
                } else {
                    false
                }
            }
            TrackedState::HasLevels | TrackedState::HasLevelsAndPap => true,
        }
    }

    /// A per-address-priority frame arrived. Returns whether to surface it.
    pub(crate) fn handle_pap(&mut self, now: Instant) -> bool {
        match self.state {
            TrackedState::WaitingLevels => {
                // Still waiting for the first levels frame.
                self.pap_timer.reset(now, PAP_WAIT);
                true
            }
            TrackedState::WaitingPap
            | TrackedState::HasLevels
            | TrackedState::HasLevelsAndPap => {
                self.state = TrackedState::HasLevelsAndPap;
                self.pap_timer.reset(now, SOURCE_LOSS_TIMEOUT);
                true
            }
        }
    }

    /// Returns true once when the 0xDD stream goes silent.
    pub(crate) fn check_pap_expiry(&mut self, now: Instant) -> bool {
        if self.state == TrackedState::HasLevelsAndPap && self.pap_timer.is_expired(now) {
            self.state = TrackedState::HasLevels;
            return true;
        }
        false
    }

    /// Loss sweep predicate; `dmx_received` is consumed.
    pub(crate) fn check_lost(&mut self, now: Instant) -> bool {
        let received = std::mem::take(&mut self.dmx_received);
        self.terminated || (!received && self.packet_timer.is_expired(now))
    }
}
