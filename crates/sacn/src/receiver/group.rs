// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A set of merged receivers with uniform configuration.

use super::{Receiver, ReceiverConfig, ReceiverDelegate};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Manages one [`Receiver`] per universe, all sharing a configuration and a
/// delegate. Delegate callbacks carry the universe, so one subscriber serves
/// the whole group.
pub struct ReceiverGroup {
    config: ReceiverConfig,
    receivers: Mutex<BTreeMap<u16, Receiver>>,
    delegate: Mutex<Option<Arc<dyn ReceiverDelegate>>>,
}

impl ReceiverGroup {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            receivers: Mutex::new(BTreeMap::new()),
            delegate: Mutex::new(None),
        }
    }

    /// Install the delegate for current and future receivers.
    ///
    /// The group keeps a strong handle (it outlives the per-receiver weak
    /// references); drop the group to release it.
    pub fn set_delegate(&self, delegate: Arc<dyn ReceiverDelegate>) {
        for receiver in self.receivers.lock().values() {
            receiver.set_delegate(&delegate);
        }
        *self.delegate.lock() = Some(delegate);
    }

    /// Create and start a receiver for `universe`.
    pub fn add_universe(&self, universe: u16) -> Result<()> {
        let mut receivers = self.receivers.lock();
        if receivers.contains_key(&universe) {
            return Err(Error::UniverseExists(universe));
        }
        let receiver = Receiver::new(self.config.clone(), universe)?;
        if let Some(delegate) = self.delegate.lock().as_ref() {
            receiver.set_delegate(delegate);
        }
        receiver.start()?;
        receivers.insert(universe, receiver);
        log::debug!("[RECV] group listening on universe {}", universe);
        Ok(())
    }

    /// Stop and drop the receiver for `universe`.
    pub fn remove_universe(&self, universe: u16) -> Result<()> {
        let receiver = self
            .receivers
            .lock()
            .remove(&universe)
            .ok_or(Error::UniverseNotFound(universe))?;
        receiver.stop()
    }

    /// Replace the interface set on every receiver in the group.
    pub fn update_interfaces(&self, interfaces: Vec<String>) -> Result<()> {
        if self.config.ip_mode.includes_v6() && interfaces.is_empty() {
            return Err(Error::NoInterfaces);
        }
        for receiver in self.receivers.lock().values() {
            receiver.update_interfaces(interfaces.clone())?;
        }
        Ok(())
    }

    pub fn universes(&self) -> Vec<u16> {
        self.receivers.lock().keys().copied().collect()
    }

    /// Stop every receiver, keeping the group reusable.
    pub fn stop(&self) {
        let mut receivers = self.receivers.lock();
        for (universe, receiver) in std::mem::take(&mut *receivers) {
            if let Err(e) = receiver.stop() {
                log::debug!("[RECV] group stop universe {}: {}", universe, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_tracks_universes() {
        let group = ReceiverGroup::new(ReceiverConfig::default());
        group.add_universe(1).expect("add 1");
        group.add_universe(2).expect("add 2");
        assert_eq!(group.universes(), vec![1, 2]);

        assert!(matches!(
            group.add_universe(1),
            Err(Error::UniverseExists(1))
        ));

        group.remove_universe(1).expect("remove");
        assert_eq!(group.universes(), vec![2]);
        assert!(matches!(
            group.remove_universe(9),
            Err(Error::UniverseNotFound(9))
        ));
        group.stop();
        assert!(group.universes().is_empty());
    }

    #[test]
    fn test_group_rejects_invalid_universe() {
        let group = ReceiverGroup::new(ReceiverConfig::default());
        assert!(matches!(
            group.add_universe(0),
            Err(Error::InvalidUniverse(0))
        ));
    }
}
