//! IP trust firewall effector: maintains the `GNT_TRUST` netfilter chain,
//! grounded on `iptables.py`.

mod real;
#[cfg(test)]
pub mod mocks;

pub use real::RealIptablesOps;

use rand::Rng;

/// Name of the pre-existing chain `nld` maintains the single live jump in.
/// Provisioned once outside this daemon, with its own jump from `INPUT`.
pub const TRUST_CHAIN: &str = "GNT_TRUST";
/// Maximum iptables chain name length (`IFNAMSIZ`-derived kernel limit).
const CHAIN_NAME_LEN: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("iptables operation failed: {0}")]
    Command(String),
}

/// Mirrors the subset of the `iptables` crate's API this daemon needs,
/// grounded on `gnosis_vpn-root/src/routing/iptables_ops.rs::IptablesOps`.
pub trait IptablesOps: Send + Sync {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, Error>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    /// Inserts `rule` at `position` (1-based, matching `iptables -I`).
    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<(), Error>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error>;
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, Error>;
}

fn random_chain_name() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    const PREFIX: &str = "GNT_TRUST_IPS_";
    let suffix_len = CHAIN_NAME_LEN - PREFIX.len();
    let mut rng = rand::rng();
    let suffix: String = (0..suffix_len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{PREFIX}{suffix}")
}

/// A well-formed rule in `GNT_TRUST` is exactly `-j <chain>`; anything else
/// (extra match options, multiple targets) fails `CheckIptablesChain`.
fn jump_target(rule: &str) -> Option<&str> {
    let rest = rule.trim().strip_prefix("-j ")?;
    let mut words = rest.split_whitespace();
    let target = words.next()?;
    if words.next().is_some() {
        None
    } else {
        Some(target)
    }
}

/// Rebuilds the trust chain so that exactly `trusted_ips` are accepted,
/// atomically from the packet path's point of view: builds a fresh
/// `GNT_TRUST_IPS_<rand>` chain, prepends a jump to it at the head of the
/// pre-existing `GNT_TRUST` chain, then tears down whichever jump(s) were
/// there before. `GNT_TRUST` itself is never created or removed here — it is
/// provisioned once, outside this daemon, with its own jump from `INPUT`.
/// Grounded on `iptables.py::UpdateIptablesRules`.
pub fn update_trust_rules(ops: &dyn IptablesOps, trusted_ips: &[String]) -> Result<(), Error> {
    const TABLE: &str = "filter";

    if !check_trust_chain(ops)? {
        return Err(Error::Command(format!("{TRUST_CHAIN} contains a non-jump rule")));
    }
    let old_rules = ops.list(TABLE, TRUST_CHAIN)?;

    let new_chain = random_chain_name();
    let build = (|| -> Result<(), Error> {
        ops.new_chain(TABLE, &new_chain)?;
        for ip in trusted_ips {
            ops.append(TABLE, &new_chain, &format!("-s {ip} -j ACCEPT"))?;
        }
        ops.insert(TABLE, TRUST_CHAIN, &format!("-j {new_chain}"), 1)
    })();
    if let Err(err) = build {
        ops.flush_chain(TABLE, &new_chain).ok();
        ops.delete_chain(TABLE, &new_chain).ok();
        return Err(err);
    }

    for rule in old_rules {
        if let Some(old_chain) = jump_target(&rule) {
            ops.delete(TABLE, TRUST_CHAIN, &rule)?;
            ops.flush_chain(TABLE, old_chain)?;
            ops.delete_chain(TABLE, old_chain)?;
        }
    }

    Ok(())
}

/// Verifies that `GNT_TRUST` contains only well-formed `-j <chain>` rules,
/// grounded on `iptables.py::CheckIptablesChain`.
pub fn check_trust_chain(ops: &dyn IptablesOps) -> Result<bool, Error> {
    let rules = ops.list("filter", TRUST_CHAIN)?;
    Ok(rules.iter().all(|rule| jump_target(rule).is_some()))
}
