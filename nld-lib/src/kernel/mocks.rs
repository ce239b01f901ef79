use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Context, Error, NetworkTableOps};

/// Stateful in-memory double for [`NetworkTableOps`], grounded on
/// `gnosis_vpn-root/src/routing/mocks.rs::MockNetlinkOps`.
#[derive(Default)]
pub struct MockNetworkTableOps {
    tables: Mutex<HashMap<(u8, String), Vec<(String, String)>>>,
    fail_on: Mutex<Option<String>>,
    update_entry_calls: Mutex<usize>,
}

impl MockNetworkTableOps {
    pub fn new() -> Self {
        MockNetworkTableOps::default()
    }

    pub fn update_entry_calls(&self) -> usize {
        *self.update_entry_calls.lock().unwrap()
    }

    /// Forces every subsequent call whose `command` substring matches
    /// `needle` to return a [`Error::CommandFailed`].
    pub fn fail_on(&self, needle: impl Into<String>) {
        *self.fail_on.lock().unwrap() = Some(needle.into());
    }

    pub fn seed(&self, ctx: Context, iface: &str, destination: &str, nexthop: &str) {
        self.tables
            .lock()
            .unwrap()
            .entry(key(ctx, iface))
            .or_default()
            .push((destination.to_string(), nexthop.to_string()));
    }

    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(needle) = self.fail_on.lock().unwrap().as_ref() {
            if op.contains(needle.as_str()) {
                return Err(Error::CommandFailed {
                    command: op.to_string(),
                    status: 1,
                    stderr: "forced failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn key(ctx: Context, iface: &str) -> (u8, String) {
    (if ctx == Context::Neighbour { 0 } else { 1 }, iface.to_string())
}

#[async_trait]
impl NetworkTableOps for MockNetworkTableOps {
    async fn list_table(&self, ctx: Context, iface: &str) -> Result<Vec<(String, String)>, Error> {
        self.check_fail("list")?;
        Ok(self.tables.lock().unwrap().get(&key(ctx, iface)).cloned().unwrap_or_default())
    }

    async fn update_entry(
        &self,
        ctx: Context,
        iface: &str,
        destination: &str,
        nexthop: &str,
    ) -> Result<(), Error> {
        self.check_fail("update")?;
        *self.update_entry_calls.lock().unwrap() += 1;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(key(ctx, iface)).or_default();
        rows.retain(|(d, _)| d != destination);
        rows.push((destination.to_string(), nexthop.to_string()));
        Ok(())
    }

    async fn remove_entry(&self, ctx: Context, iface: &str, destination: &str) -> Result<(), Error> {
        self.check_fail("remove")?;
        if let Some(rows) = self.tables.lock().unwrap().get_mut(&key(ctx, iface)) {
            rows.retain(|(d, _)| d != destination);
        }
        Ok(())
    }
}
