// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-slot HTP/priority merge across the sources of one universe.
//!
//! The merger keeps three 512-wide output arrays (merged levels, winning
//! per-address priorities, winner identities) and updates them
//! incrementally: every mutation touches only the slots it can have changed,
//! and the single-source case bypasses the merge loop entirely.
//!
//! Merge rule per slot: a strictly higher priority takes the slot
//! unconditionally; among sources at the winning priority the highest level
//! wins (HTP). Priority 0 means "not sourced": such slots never win, and a
//! slot whose winning priority is 0 has level 0 and no owner.

use crate::cid::Cid;
use crate::error::{Error, Result};
use crate::protocol::{PRIORITY_MAX, SLOT_COUNT};
use std::collections::BTreeMap;

/// Per-source merge state.
///
/// `address_priorities` is always materialized: when the source has no
/// per-address-priority stream its universe priority is broadcast to every
/// sourced slot as `max(1, universe_priority)` (a universe priority of 0
/// still sources the slot; per-slot 0 would mean unsourced). Slots beyond
/// the active count stay 0.
#[derive(Debug, Clone)]
pub struct MergerSource {
    levels: [u8; SLOT_COUNT],
    level_count: usize,
    universe_priority: u8,
    address_priorities: [u8; SLOT_COUNT],
    pap_count: usize,
    using_universe_priority: bool,
    universe_priority_initialized: bool,
}

impl MergerSource {
    fn new() -> Self {
        Self {
            levels: [0; SLOT_COUNT],
            level_count: 0,
            universe_priority: 0,
            address_priorities: [0; SLOT_COUNT],
            pap_count: 0,
            using_universe_priority: true,
            universe_priority_initialized: false,
        }
    }

    /// Slot priority broadcast from the universe priority.
    fn broadcast_priority(&self) -> u8 {
        self.universe_priority.max(1)
    }

    /// Refill `address_priorities` for universe-priority mode.
    fn rebroadcast(&mut self) {
        let p = self.broadcast_priority();
        self.address_priorities[..self.level_count].fill(p);
        self.address_priorities[self.level_count..].fill(0);
    }

    /// Number of slots this source currently asserts a priority on.
    fn active_count(&self) -> usize {
        if self.using_universe_priority {
            self.level_count
        } else {
            self.pap_count
        }
    }

    /// Levels as received (active slots only).
    pub fn levels(&self) -> &[u8] {
        &self.levels[..self.level_count]
    }

    /// Universe priority as received.
    pub fn universe_priority(&self) -> u8 {
        self.universe_priority
    }

    /// Active per-address priorities, if a 0xDD stream is in effect.
    pub fn pap(&self) -> Option<&[u8]> {
        if self.using_universe_priority {
            None
        } else {
            Some(&self.address_priorities[..self.pap_count])
        }
    }
}

/// Incremental HTP-within-highest-priority merger for one universe.
#[derive(Debug)]
pub struct Merger {
    levels: [u8; SLOT_COUNT],
    winning_priorities: [u8; SLOT_COUNT],
    winners: [Option<Cid>; SLOT_COUNT],
    sources: BTreeMap<Cid, MergerSource>,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

impl Merger {
    pub fn new() -> Self {
        Self {
            levels: [0; SLOT_COUNT],
            winning_priorities: [0; SLOT_COUNT],
            winners: [None; SLOT_COUNT],
            sources: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    /// Merged levels, one byte per slot.
    pub fn levels(&self) -> &[u8; SLOT_COUNT] {
        &self.levels
    }

    /// Winning per-address priority per slot; 0 means unsourced.
    pub fn winning_priorities(&self) -> &[u8; SLOT_COUNT] {
        &self.winning_priorities
    }

    /// Winning source per slot; `None` exactly where the priority is 0.
    pub fn winners(&self) -> &[Option<Cid>; SLOT_COUNT] {
        &self.winners
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn source_ids(&self) -> Vec<Cid> {
        self.sources.keys().copied().collect()
    }

    pub fn contains_source(&self, cid: &Cid) -> bool {
        self.sources.contains_key(cid)
    }

    pub(crate) fn source(&self, cid: &Cid) -> Option<&MergerSource> {
        self.sources.get(cid)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Register a source. No-op if already present.
    pub fn add_source(&mut self, cid: Cid) {
        self.sources.entry(cid).or_insert_with(MergerSource::new);
    }

    /// Drop a source and re-resolve every slot it owned.
    pub fn remove_source(&mut self, cid: &Cid) -> Result<()> {
        if self.sources.remove(cid).is_none() {
            return Err(Error::SourceNotFound(*cid));
        }
        if self.sources.is_empty() {
            self.levels.fill(0);
            self.winning_priorities.fill(0);
            self.winners.fill(None);
            return Ok(());
        }
        for slot in 0..SLOT_COUNT {
            if self.winners[slot] == Some(*cid) {
                self.resolve_slot(slot);
            }
        }
        Ok(())
    }

    /// Replace a source's levels. Slots past `levels.len()` become unsourced.
    pub fn update_levels(&mut self, cid: &Cid, levels: &[u8]) -> Result<()> {
        if levels.is_empty() || levels.len() > SLOT_COUNT {
            return Err(Error::InvalidLevelCount(levels.len()));
        }
        let source = self
            .sources
            .get_mut(cid)
            .ok_or(Error::SourceNotFound(*cid))?;

        let old_active = source.active_count();
        let old_count = source.level_count;
        source.levels[..levels.len()].copy_from_slice(levels);
        source.levels[levels.len()..].fill(0);
        source.level_count = levels.len();
        if source.using_universe_priority && old_count != levels.len() {
            source.rebroadcast();
        }

        let span = old_active.max(source.active_count()).max(levels.len().max(old_count));
        self.merge_span(cid, span);
        Ok(())
    }

    /// Change a source's universe priority.
    ///
    /// Only affects the merge while the source has no 0xDD stream; otherwise
    /// the new value is stored for a later [`Merger::remove_pap`].
    pub fn update_universe_priority(&mut self, cid: &Cid, priority: u8) -> Result<()> {
        if priority > PRIORITY_MAX {
            return Err(Error::InvalidPriority(priority));
        }
        let source = self
            .sources
            .get_mut(cid)
            .ok_or(Error::SourceNotFound(*cid))?;

        if source.universe_priority_initialized && source.universe_priority == priority {
            return Ok(());
        }
        source.universe_priority = priority;
        source.universe_priority_initialized = true;

        if source.using_universe_priority {
            source.rebroadcast();
            let span = source.level_count;
            self.merge_span(cid, span);
        }
        Ok(())
    }

    /// Install a per-address-priority stream, replacing the universe-priority
    /// broadcast. Values above 200 are treated as 200.
    pub fn update_pap(&mut self, cid: &Cid, priorities: &[u8]) -> Result<()> {
        if priorities.is_empty() || priorities.len() > SLOT_COUNT {
            return Err(Error::InvalidPriorityCount(priorities.len()));
        }
        let source = self
            .sources
            .get_mut(cid)
            .ok_or(Error::SourceNotFound(*cid))?;

        let old_active = source.active_count();
        for (slot, &p) in priorities.iter().enumerate() {
            source.address_priorities[slot] = p.min(PRIORITY_MAX);
        }
        source.address_priorities[priorities.len()..].fill(0);
        source.pap_count = priorities.len();
        source.using_universe_priority = false;

        let span = old_active.max(priorities.len());
        self.merge_span(cid, span);
        Ok(())
    }

    /// Drop a source's per-address-priority stream, falling back to the
    /// universe-priority broadcast. No-op when no stream was active.
    pub fn remove_pap(&mut self, cid: &Cid) -> Result<()> {
        let source = self
            .sources
            .get_mut(cid)
            .ok_or(Error::SourceNotFound(*cid))?;
        if source.using_universe_priority {
            return Ok(());
        }

        let old_active = source.pap_count;
        source.using_universe_priority = true;
        source.pap_count = 0;
        source.rebroadcast();

        let span = old_active.max(source.level_count);
        self.merge_span(cid, span);
        Ok(())
    }

    // ========================================================================
    // Merge core
    // ========================================================================

    /// Re-merge slots `0..span` for `cid`, with a fast path when it is the
    /// only source.
    fn merge_span(&mut self, cid: &Cid, span: usize) {
        let span = span.min(SLOT_COUNT);
        if self.sources.len() == 1 {
            let source = &self.sources[cid];
            for slot in 0..span {
                let priority = source.address_priorities[slot];
                if priority > 0 {
                    self.winning_priorities[slot] = priority;
                    self.levels[slot] = source.levels[slot];
                    self.winners[slot] = Some(*cid);
                } else {
                    self.winning_priorities[slot] = 0;
                    self.levels[slot] = 0;
                    self.winners[slot] = None;
                }
            }
            return;
        }
        for slot in 0..span {
            self.merge_slot(cid, slot);
        }
    }

    fn merge_slot(&mut self, cid: &Cid, slot: usize) {
        let source = &self.sources[cid];
        let priority = source.address_priorities[slot];
        let level = source.levels[slot];

        let winning = self.winning_priorities[slot];
        let owner = self.winners[slot];

        if priority > winning {
            self.winning_priorities[slot] = priority;
            self.levels[slot] = level;
            self.winners[slot] = Some(*cid);
        } else if owner == Some(*cid) {
            if priority < winning {
                // Owner backed off; somebody else may hold the slot now.
                self.resolve_slot(slot);
            } else if level >= self.levels[slot] {
                self.levels[slot] = level;
            } else {
                // Owner lowered its level; re-run HTP at this priority.
                self.resolve_slot(slot);
            }
        } else if priority == winning && priority > 0 && level > self.levels[slot] {
            self.levels[slot] = level;
            self.winners[slot] = Some(*cid);
        }
    }

    /// Full scan of one slot across all sources.
    fn resolve_slot(&mut self, slot: usize) {
        let mut best: Option<(u8, u8, Cid)> = None;
        for (cid, source) in &self.sources {
            let priority = source.address_priorities[slot];
            if priority == 0 {
                continue;
            }
            let level = source.levels[slot];
            let better = match best {
                None => true,
                Some((bp, bl, _)) => priority > bp || (priority == bp && level > bl),
            };
            if better {
                best = Some((priority, level, *cid));
            }
        }
        match best {
            Some((priority, level, cid)) => {
                self.winning_priorities[slot] = priority;
                self.levels[slot] = level;
                self.winners[slot] = Some(cid);
            }
            None => {
                self.winning_priorities[slot] = 0;
                self.levels[slot] = 0;
                self.winners[slot] = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u8) -> Cid {
        Cid::from_bytes([n; 16])
    }

    fn merger_with(sources: &[Cid]) -> Merger {
        let mut merger = Merger::new();
        for &s in sources {
            merger.add_source(s);
        }
        merger
    }

    /// Winner is present exactly where the winning priority is non-zero, and
    /// unsourced slots read level 0.
    fn assert_consistent(merger: &Merger) {
        for slot in 0..SLOT_COUNT {
            assert_eq!(
                merger.winners()[slot].is_some(),
                merger.winning_priorities()[slot] > 0,
                "slot {}",
                slot
            );
            if merger.winning_priorities()[slot] == 0 {
                assert_eq!(merger.levels()[slot], 0, "slot {}", slot);
            }
        }
    }

    #[test]
    fn test_single_source_passthrough() {
        let a = cid(1);
        let mut merger = merger_with(&[a]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_levels(&a, &[255, 0, 7]).unwrap();

        assert_eq!(&merger.levels()[..4], &[255, 0, 7, 0]);
        assert_eq!(&merger.winning_priorities()[..4], &[100, 100, 100, 0]);
        assert_eq!(merger.winners()[0], Some(a));
        assert_eq!(merger.winners()[3], None);
        assert_consistent(&merger);
    }

    #[test]
    fn test_htp_at_equal_priority() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_universe_priority(&b, 100).unwrap();
        merger.update_levels(&a, &[10, 200, 0]).unwrap();
        merger.update_levels(&b, &[50, 100, 0]).unwrap();

        assert_eq!(&merger.levels()[..3], &[50, 200, 0]);
        assert_eq!(merger.winners()[0], Some(b));
        assert_eq!(merger.winners()[1], Some(a));
        assert_consistent(&merger);
    }

    #[test]
    fn test_higher_priority_takes_regardless_of_level() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_levels(&a, &[255]).unwrap();
        merger.update_universe_priority(&b, 150).unwrap();
        merger.update_levels(&b, &[1]).unwrap();

        assert_eq!(merger.levels()[0], 1);
        assert_eq!(merger.winning_priorities()[0], 150);
        assert_eq!(merger.winners()[0], Some(b));
    }

    #[test]
    fn test_pap_beats_universe_priority() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 200).unwrap();
        merger.update_levels(&a, &[100, 100, 100]).unwrap();
        merger.update_universe_priority(&b, 100).unwrap();
        merger.update_levels(&b, &[50, 50, 50]).unwrap();
        merger.update_pap(&b, &[255, 0, 0]).unwrap();

        // Slot 0: B's PAP 255 beats A's universe priority 200.
        assert_eq!(merger.winners()[0], Some(b));
        assert_eq!(merger.levels()[0], 50);
        // Slot 1: B's PAP 0 means unsourced there; A wins.
        assert_eq!(merger.winners()[1], Some(a));
        assert_eq!(merger.levels()[1], 100);
        assert_consistent(&merger);
    }

    #[test]
    fn test_universe_priority_zero_becomes_slot_priority_one() {
        let a = cid(1);
        let mut merger = merger_with(&[a]);
        merger.update_universe_priority(&a, 0).unwrap();
        merger.update_levels(&a, &[9]).unwrap();

        assert_eq!(merger.winning_priorities()[0], 1);
        assert_eq!(merger.winners()[0], Some(a));
        assert_eq!(merger.levels()[0], 9);
    }

    #[test]
    fn test_idempotent_update() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 120).unwrap();
        merger.update_levels(&a, &[10, 20, 30]).unwrap();
        merger.update_universe_priority(&b, 120).unwrap();
        merger.update_levels(&b, &[30, 20, 10]).unwrap();

        let levels = *merger.levels();
        let priorities = *merger.winning_priorities();
        let winners = *merger.winners();

        merger.update_levels(&a, &[10, 20, 30]).unwrap();
        merger.update_universe_priority(&a, 120).unwrap();
        merger.update_levels(&b, &[30, 20, 10]).unwrap();

        assert_eq!(levels, *merger.levels());
        assert_eq!(priorities, *merger.winning_priorities());
        assert_eq!(winners, *merger.winners());
    }

    #[test]
    fn test_owner_level_decrease_yields_slot() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_universe_priority(&b, 100).unwrap();
        merger.update_levels(&a, &[200]).unwrap();
        merger.update_levels(&b, &[150]).unwrap();
        assert_eq!(merger.winners()[0], Some(a));

        merger.update_levels(&a, &[100]).unwrap();
        assert_eq!(merger.winners()[0], Some(b));
        assert_eq!(merger.levels()[0], 150);
    }

    #[test]
    fn test_owner_priority_decrease_yields_slot() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 150).unwrap();
        merger.update_universe_priority(&b, 100).unwrap();
        merger.update_levels(&a, &[5]).unwrap();
        merger.update_levels(&b, &[90]).unwrap();
        assert_eq!(merger.winners()[0], Some(a));

        merger.update_universe_priority(&a, 50).unwrap();
        assert_eq!(merger.winners()[0], Some(b));
        assert_eq!(merger.winning_priorities()[0], 100);
        assert_eq!(merger.levels()[0], 90);
    }

    #[test]
    fn test_remove_pap_falls_back_to_universe_priority() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_levels(&a, &[10]).unwrap();
        merger.update_universe_priority(&b, 100).unwrap();
        merger.update_levels(&b, &[5]).unwrap();
        merger.update_pap(&b, &[200]).unwrap();
        assert_eq!(merger.winners()[0], Some(b));

        merger.remove_pap(&b).unwrap();
        // Back to HTP at equal priority 100: A's 10 beats B's 5.
        assert_eq!(merger.winners()[0], Some(a));
        assert_eq!(merger.levels()[0], 10);
        assert_consistent(&merger);
    }

    #[test]
    fn test_remove_pap_without_pap_is_noop() {
        let a = cid(1);
        let mut merger = merger_with(&[a]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_levels(&a, &[10]).unwrap();
        merger.remove_pap(&a).unwrap();
        assert_eq!(merger.levels()[0], 10);
    }

    #[test]
    fn test_remove_source_releases_slots() {
        let (a, b) = (cid(1), cid(2));
        let mut merger = merger_with(&[a, b]);
        merger.update_universe_priority(&a, 150).unwrap();
        merger.update_levels(&a, &[9, 9]).unwrap();
        merger.update_universe_priority(&b, 100).unwrap();
        merger.update_levels(&b, &[4]).unwrap();

        merger.remove_source(&a).unwrap();
        assert_eq!(merger.winners()[0], Some(b));
        assert_eq!(merger.levels()[0], 4);
        assert_eq!(merger.winners()[1], None);
        assert_eq!(merger.levels()[1], 0);
        assert_consistent(&merger);
    }

    #[test]
    fn test_remove_last_source_zeroes_outputs() {
        let a = cid(1);
        let mut merger = merger_with(&[a]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_levels(&a, &[255; 512]).unwrap();

        merger.remove_source(&a).unwrap();
        assert!(merger.levels().iter().all(|&l| l == 0));
        assert!(merger.winning_priorities().iter().all(|&p| p == 0));
        assert!(merger.winners().iter().all(|w| w.is_none()));
    }

    #[test]
    fn test_shrinking_level_count_releases_tail() {
        let a = cid(1);
        let mut merger = merger_with(&[a]);
        merger.update_universe_priority(&a, 100).unwrap();
        merger.update_levels(&a, &[1, 2, 3, 4]).unwrap();
        merger.update_levels(&a, &[1, 2]).unwrap();

        assert_eq!(merger.winners()[2], None);
        assert_eq!(merger.winning_priorities()[3], 0);
        assert_consistent(&merger);
    }

    #[test]
    fn test_unknown_source_errors() {
        let mut merger = Merger::new();
        assert!(matches!(
            merger.update_levels(&cid(9), &[0]),
            Err(Error::SourceNotFound(_))
        ));
        assert!(matches!(
            merger.remove_source(&cid(9)),
            Err(Error::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_input_validation() {
        let a = cid(1);
        let mut merger = merger_with(&[a]);
        assert!(matches!(
            merger.update_levels(&a, &[]),
            Err(Error::InvalidLevelCount(0))
        ));
        assert!(matches!(
            merger.update_levels(&a, &[0; 513]),
            Err(Error::InvalidLevelCount(513))
        ));
        assert!(matches!(
            merger.update_universe_priority(&a, 201),
            Err(Error::InvalidPriority(201))
        ));
        assert!(matches!(
            merger.update_pap(&a, &[0; 600]),
            Err(Error::InvalidPriorityCount(600))
        ));
    }

    #[test]
    fn test_htp_max_of_many_sources() {
        let sources: Vec<Cid> = (1..=4).map(cid).collect();
        let mut merger = merger_with(&sources);
        let level_sets = [[40u8, 1], [10, 90], [30, 30], [20, 2]];
        for (source, levels) in sources.iter().zip(level_sets.iter()) {
            merger.update_universe_priority(source, 100).unwrap();
            merger.update_levels(source, levels).unwrap();
        }
        assert_eq!(merger.levels()[0], 40);
        assert_eq!(merger.winners()[0], Some(sources[0]));
        assert_eq!(merger.levels()[1], 90);
        assert_eq!(merger.winners()[1], Some(sources[1]));
    }

    #[test]
    fn test_randomized_matches_full_rescan() {
        // Incremental merge must agree with a from-scratch resolution.
        fastrand::seed(0x5ac4);
        let sources: Vec<Cid> = (1..=3).map(cid).collect();
        let mut merger = merger_with(&sources);

        for _ in 0..200 {
            let source = sources[fastrand::usize(..sources.len())];
            match fastrand::u8(..4) {
                0 => {
                    let n = fastrand::usize(1..=16);
                    let levels: Vec<u8> = (0..n).map(|_| fastrand::u8(..)).collect();
                    merger.update_levels(&source, &levels).unwrap();
                }
                1 => {
                    merger
                        .update_universe_priority(&source, fastrand::u8(..=200))
                        .unwrap();
                }
                2 => {
                    let n = fastrand::usize(1..=16);
                    let pap: Vec<u8> = (0..n).map(|_| fastrand::u8(..=200)).collect();
                    merger.update_pap(&source, &pap).unwrap();
                }
                _ => {
                    merger.remove_pap(&source).unwrap();
                }
            }

            // Reference: resolve every slot from scratch.
            let mut reference = merger.clone_outputs_for_test();
            for slot in 0..32 {
                let mut best: Option<(u8, u8, Cid)> = None;
                for s in &sources {
                    let src = merger.source(s).unwrap();
                    let p = src.address_priorities[slot];
                    if p == 0 {
                        continue;
                    }
                    let l = src.levels[slot];
                    let better = match best {
                        None => true,
                        Some((bp, bl, _)) => p > bp || (p == bp && l > bl),
                    };
                    if better {
                        best = Some((p, l, *s));
                    }
                }
                reference.0[slot] = best.map_or(0, |(_, l, _)| l);
                reference.1[slot] = best.map_or(0, |(p, _, _)| p);
            }
            assert_eq!(&merger.levels()[..32], &reference.0[..32]);
            assert_eq!(&merger.winning_priorities()[..32], &reference.1[..32]);
            assert_consistent(&merger);
        }
    }

    impl Merger {
        fn clone_outputs_for_test(&self) -> ([u8; SLOT_COUNT], [u8; SLOT_COUNT]) {
            (self.levels, self.winning_priorities)
        }
    }
}
