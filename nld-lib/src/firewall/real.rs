use super::{Error, IptablesOps};

/// Production [`IptablesOps`] backed by the `iptables` crate, grounded on
/// `gnosis_vpn-root/src/routing/iptables_ops.rs::RealIptablesOps`.
#[cfg(target_os = "linux")]
pub struct RealIptablesOps {
    inner: iptables::IPTables,
}

#[cfg(target_os = "linux")]
impl RealIptablesOps {
    pub fn new() -> Result<Self, Error> {
        let inner = iptables::new(false).map_err(|e| Error::Command(e.to_string()))?;
        Ok(RealIptablesOps { inner })
    }
}

#[cfg(target_os = "linux")]
impl IptablesOps for RealIptablesOps {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, Error> {
        self.inner.chain_exists(table, chain).map_err(|e| Error::Command(e.to_string()))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.inner.new_chain(table, chain).map_err(|e| Error::Command(e.to_string()))
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.inner.flush_chain(table, chain).map_err(|e| Error::Command(e.to_string()))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.inner.delete_chain(table, chain).map_err(|e| Error::Command(e.to_string()))
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.inner.append(table, chain, rule).map_err(|e| Error::Command(e.to_string()))
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<(), Error> {
        self.inner.insert(table, chain, rule, position).map_err(|e| Error::Command(e.to_string()))
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        self.inner.delete(table, chain, rule).map_err(|e| Error::Command(e.to_string()))
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        self.inner.exists(table, chain, rule).map_err(|e| Error::Command(e.to_string()))
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, Error> {
        self.inner.list(table, chain).map_err(|e| Error::Command(e.to_string()))
    }
}

#[cfg(not(target_os = "linux"))]
pub struct RealIptablesOps;

#[cfg(not(target_os = "linux"))]
impl RealIptablesOps {
    pub fn new() -> Result<Self, Error> {
        Err(Error::Command("iptables support is only available on linux".to_string()))
    }
}
