// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-universe transmit state.
//!
//! Each universe owns two pre-serialized packets (levels, and per-address
//! priorities when configured) that are mutated in place: a tick stamps the
//! sequence and options bytes and hands the buffer to the sockets. The
//! counters implement keep-alive compression: unchanged levels go out only on
//! ticks 0/11/22/33 of the 44-tick cycle (≈every 250 ms), while any mutation
//! forces three consecutive refresh frames so a single lost packet cannot
//! hide a change.

use crate::cid::Cid;
use crate::protocol::constants::TICKS_PER_CYCLE;
use crate::protocol::{
    DataTemplate, PacketOptions, PRIORITY_DEFAULT, PRIORITY_MAX, SLOT_COUNT, STARTCODE_LEVELS,
    STARTCODE_PRIORITY,
};

/// What a tick should emit for one universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TickPlan {
    pub send_levels: bool,
    pub send_priority: bool,
}

/// Transmit state machine for a single universe.
pub(crate) struct SourceUniverse {
    number: u16,
    universe_priority: u8,
    /// Explicit per-universe priority; `None` follows the source default.
    priority_override: bool,
    preview: bool,
    levels: DataTemplate,
    priorities: Option<DataTemplate>,
    sequence: u8,
    transmit_counter: u8,
    dirty_counter: u8,
    dirty_priority: bool,
    should_terminate: bool,
    remove_after_terminate: bool,
}

fn pad_levels(values: &[u8]) -> [u8; SLOT_COUNT] {
    let mut out = [0u8; SLOT_COUNT];
    let n = values.len().min(SLOT_COUNT);
    out[..n].copy_from_slice(&values[..n]);
    out
}

/// Per-slot priorities padded to 512. Out-of-range values are replaced with
/// the default priority; the tail pads with 0 (unsourced).
fn pad_priorities(values: &[u8]) -> [u8; SLOT_COUNT] {
    let mut out = [0u8; SLOT_COUNT];
    let n = values.len().min(SLOT_COUNT);
    for (slot, &p) in values[..n].iter().enumerate() {
        out[slot] = if p > PRIORITY_MAX { PRIORITY_DEFAULT } else { p };
    }
    out
}

impl SourceUniverse {
    pub(crate) fn new(
        cid: &Cid,
        name: &str,
        number: u16,
        priority: u8,
        priority_override: bool,
        levels: &[u8],
        priorities: Option<&[u8]>,
        preview: bool,
    ) -> Self {
        let mut levels_template =
            DataTemplate::full(cid, name, number, priority, STARTCODE_LEVELS);
        levels_template.set_values(&pad_levels(levels));

        let priorities_template = priorities.map(|values| {
            let mut t = DataTemplate::full(cid, name, number, priority, STARTCODE_PRIORITY);
            t.set_values(&pad_priorities(values));
            t
        });

        Self {
            number,
            universe_priority: priority,
            priority_override,
            preview,
            levels: levels_template,
            priorities: priorities_template,
            sequence: 0,
            transmit_counter: 0,
            dirty_counter: 3,
            dirty_priority: priorities.is_some(),
            should_terminate: false,
            remove_after_terminate: false,
        }
    }

    pub(crate) fn number(&self) -> u16 {
        self.number
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.should_terminate
    }

    /// Terminated burst done; the universe can be dropped.
    pub(crate) fn finished(&self) -> bool {
        self.should_terminate && self.dirty_counter == 0
    }

    pub(crate) fn remove_when_done(&self) -> bool {
        self.remove_after_terminate
    }

    pub(crate) fn uses_default_priority(&self) -> bool {
        !self.priority_override
    }

    // ========================================================================
    // Mutations (all force a refresh burst)
    // ========================================================================

    fn mark_dirty(&mut self) {
        self.dirty_counter = 3;
    }

    pub(crate) fn set_levels(&mut self, values: &[u8]) {
        self.levels.set_values(&pad_levels(values));
        self.mark_dirty();
    }

    pub(crate) fn set_priorities(&mut self, cid: &Cid, name: &str, values: Option<&[u8]>) {
        match (values, self.priorities.as_mut()) {
            (Some(values), Some(template)) => template.set_values(&pad_priorities(values)),
            (Some(values), None) => {
                let mut template = DataTemplate::full(
                    cid,
                    name,
                    self.number,
                    self.universe_priority,
                    STARTCODE_PRIORITY,
                );
                template.set_values(&pad_priorities(values));
                self.priorities = Some(template);
            }
            (None, _) => self.priorities = None,
        }
        self.dirty_priority = self.priorities.is_some();
        self.mark_dirty();
    }

    pub(crate) fn set_slot(&mut self, slot: usize, level: u8, priority: Option<u8>) {
        self.levels.set_value(slot, level);
        if let (Some(p), Some(template)) = (priority, self.priorities.as_mut()) {
            let p = if p > PRIORITY_MAX { PRIORITY_DEFAULT } else { p };
            template.set_value(slot, p);
            self.dirty_priority = true;
        }
        self.mark_dirty();
    }

    pub(crate) fn set_universe_priority(&mut self, priority: u8, is_override: bool) {
        self.universe_priority = priority;
        self.priority_override = is_override;
        self.levels.set_priority(priority);
        if let Some(template) = self.priorities.as_mut() {
            template.set_priority(priority);
        }
        self.mark_dirty();
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.levels.set_name(name);
        if let Some(template) = self.priorities.as_mut() {
            template.set_name(name);
        }
        self.mark_dirty();
    }

    pub(crate) fn terminate(&mut self, remove: bool) {
        self.should_terminate = true;
        self.remove_after_terminate = remove;
        self.mark_dirty();
    }

    /// Bring a universe that survived a stop back into service.
    pub(crate) fn reactivate(&mut self) {
        self.should_terminate = false;
        self.remove_after_terminate = false;
        self.transmit_counter = 0;
        self.dirty_priority = self.priorities.is_some();
        self.mark_dirty();
    }

    // ========================================================================
    // Tick cycle
    // ========================================================================

    pub(crate) fn plan_tick(&self) -> TickPlan {
        let keep_alive = matches!(self.transmit_counter, 0 | 11 | 22 | 33);
        TickPlan {
            send_levels: keep_alive || self.dirty_counter > 0,
            send_priority: self.priorities.is_some()
                && !self.should_terminate
                && (self.dirty_priority || self.transmit_counter == 0),
        }
    }

    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    fn options(&self) -> PacketOptions {
        PacketOptions {
            preview: self.preview,
            terminated: self.should_terminate,
            force_sync: false,
        }
    }

    /// Stamp sequence + options onto the levels packet and return its bytes.
    pub(crate) fn stamp_levels(&mut self) -> &[u8] {
        let sequence = self.next_sequence();
        let options = self.options();
        self.levels.set_sequence(sequence);
        self.levels.set_options(options);
        self.levels.as_bytes()
    }

    /// Stamp sequence + options onto the priority packet and return its bytes.
    /// Only valid when the plan asked for a priority send.
    pub(crate) fn stamp_priorities(&mut self) -> &[u8] {
        let sequence = self.next_sequence();
        let options = self.options();
        let template = self
            .priorities
            .as_mut()
            .expect("priority send planned without a priority stream");
        template.set_sequence(sequence);
        template.set_options(options);
        template.as_bytes()
    }

    /// A levels packet with the Terminated bit forced, for sockets being
    /// retired while the universe itself lives on.
    pub(crate) fn stamp_retirement(&mut self) -> Vec<u8> {
        let sequence = self.next_sequence();
        let mut options = self.options();
        options.terminated = true;
        let mut copy = self.levels.clone();
        copy.set_sequence(sequence);
        copy.set_options(options);
        copy.into_bytes()
    }

    /// Advance counters after a tick. `plan` is what the tick emitted (or
    /// would have emitted when the source is muted; the counters advance the
    /// same way so termination stays bounded).
    pub(crate) fn finish_tick(&mut self, plan: TickPlan) {
        self.transmit_counter = (self.transmit_counter + 1) % TICKS_PER_CYCLE;
        if plan.send_levels {
            self.dirty_counter = self.dirty_counter.saturating_sub(1);
        }
        if plan.send_priority {
            self.dirty_priority = false;
        }
    }
}
