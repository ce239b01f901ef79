use std::collections::HashMap;
use std::sync::Mutex;

use super::{Error, IptablesOps};

/// In-memory double for [`IptablesOps`], grounded on
/// `gnosis_vpn-root/src/routing/mocks.rs`'s stateful mock pattern.
#[derive(Default)]
pub struct MockIptablesOps {
    chains: Mutex<HashMap<(String, String), Vec<String>>>,
    new_chain_calls: Mutex<usize>,
}

impl MockIptablesOps {
    pub fn new() -> Self {
        MockIptablesOps::default()
    }

    fn key(table: &str, chain: &str) -> (String, String) {
        (table.to_string(), chain.to_string())
    }

    /// Number of chains created so far — one per firewall rebuild, since
    /// `update_trust_rules` creates exactly one new chain per call.
    pub fn build_count(&self) -> usize {
        *self.new_chain_calls.lock().unwrap()
    }
}

impl IptablesOps for MockIptablesOps {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, Error> {
        Ok(self.chains.lock().unwrap().contains_key(&Self::key(table, chain)))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        *self.new_chain_calls.lock().unwrap() += 1;
        self.chains.lock().unwrap().insert(Self::key(table, chain), Vec::new());
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        if let Some(rules) = self.chains.lock().unwrap().get_mut(&Self::key(table, chain)) {
            rules.clear();
        }
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.chains.lock().unwrap().remove(&Self::key(table, chain));
        Ok(())
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.chains
            .lock()
            .unwrap()
            .entry(Self::key(table, chain))
            .or_default()
            .push(rule.to_string());
        Ok(())
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<(), Error> {
        let mut chains = self.chains.lock().unwrap();
        let rules = chains.entry(Self::key(table, chain)).or_default();
        let index = ((position - 1).max(0) as usize).min(rules.len());
        rules.insert(index, rule.to_string());
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        if let Some(rules) = self.chains.lock().unwrap().get_mut(&Self::key(table, chain)) {
            rules.retain(|r| r != rule);
        }
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        Ok(self
            .chains
            .lock()
            .unwrap()
            .get(&Self::key(table, chain))
            .map(|rules| rules.iter().any(|r| r == rule))
            .unwrap_or(false))
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, Error> {
        Ok(self.chains.lock().unwrap().get(&Self::key(table, chain)).cloned().unwrap_or_default())
    }
}
