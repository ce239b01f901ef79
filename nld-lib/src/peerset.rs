//! Tracks the per-cluster set of hypervisor peer addresses and rebuilds the
//! global firewall trust rules whenever any of them changes. Grounded on
//! `server.py::PeerSetManager`, with the REDESIGN FLAG fix: the firewall
//! rebuild uses the concatenation of *every* registered set, not whichever
//! set happened to be last in iteration order.

use std::collections::HashMap;

use crate::firewall::{self, IptablesOps};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer set {0:?} was never registered")]
    UnknownSet(String),
    #[error("peer set {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error(transparent)]
    Firewall(#[from] firewall::Error),
}

#[derive(Default)]
pub struct PeerSetManager {
    sets: HashMap<String, Option<Vec<String>>>,
}

impl PeerSetManager {
    pub fn new() -> Self {
        PeerSetManager::default()
    }

    /// Declares a named peer set with no known members yet. Registering the
    /// same name twice is a programmer error: clusters are registered once,
    /// at startup.
    pub fn register(&mut self, name: impl Into<String>) -> Result<(), Error> {
        let name = name.into();
        if self.sets.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name));
        }
        self.sets.insert(name, None);
        Ok(())
    }

    /// Replaces the membership of `name` and, if that changes anything,
    /// rebuilds the firewall's global trust list from the union of every
    /// registered set's current members. Unregistered or not-yet-populated
    /// sets contribute nothing. A no-op update (same sorted membership as
    /// last time) never touches the firewall.
    pub fn update(
        &mut self,
        name: &str,
        members: Vec<String>,
        firewall_ops: &dyn IptablesOps,
    ) -> Result<(), Error> {
        let mut members = members;
        members.sort();

        let entry = self.sets.get_mut(name).ok_or_else(|| Error::UnknownSet(name.to_string()))?;
        if entry.as_ref() == Some(&members) {
            return Ok(());
        }
        *entry = Some(members);

        let mut global_peer_list: Vec<String> = Vec::new();
        for set in self.sets.values() {
            if let Some(members) = set {
                global_peer_list.extend(members.iter().cloned());
            }
        }
        global_peer_list.sort();
        global_peer_list.dedup();

        firewall::update_trust_rules(firewall_ops, &global_peer_list)?;
        Ok(())
    }

    pub fn members(&self, name: &str) -> Option<&[String]> {
        self.sets.get(name).and_then(|m| m.as_deref())
    }
}
