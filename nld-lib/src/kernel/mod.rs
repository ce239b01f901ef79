//! Kernel neighbour/route table effectors, grounded on `networktables.py`.

mod shell;
#[cfg(test)]
pub mod mocks;

pub use shell::ShellNetworkTableOps;

use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed { command: String, status: i32, stderr: String },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn { command: String, #[source] source: std::io::Error },
    #[error("failed to parse `ip {context} show` output: {0}")]
    Parse(String),
}

/// Which kernel table an operation targets, mirroring `NEIGHBOUR_CONTEXT`
/// and `ROUTING_CONTEXT` from `networktables.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Neighbour,
    Routing,
}

impl Context {
    fn as_str(self) -> &'static str {
        match self {
            Context::Neighbour => "neigh",
            Context::Routing => "route",
        }
    }
}

/// Effector over a single kernel table (neighbour or routing) on a single
/// interface. Production implementation shells out to `ip`; tests use a
/// stateful mock.
#[async_trait]
pub trait NetworkTableOps: Send + Sync {
    /// Lists the current `(destination, nexthop)` rows for `iface`.
    async fn list_table(&self, ctx: Context, iface: &str) -> Result<Vec<(String, String)>, Error>;

    /// Adds or replaces a single row.
    async fn update_entry(
        &self,
        ctx: Context,
        iface: &str,
        destination: &str,
        nexthop: &str,
    ) -> Result<(), Error>;

    /// Removes a single row; tolerates "already absent" as success, matching
    /// the original's acceptance of exit codes 0 and 2 from `ip ... del`.
    async fn remove_entry(&self, ctx: Context, iface: &str, destination: &str) -> Result<(), Error>;

    /// Reconciles `iface`'s table against `desired` (`destination ->
    /// nexthop`): every entry in `desired` that is missing, or present with
    /// a different nexthop, is written. Rows already present in the table
    /// but absent from `desired` are left alone — this mirrors
    /// `networktables.py::UpdateNetworkTable`, which only ever adds or
    /// replaces entries named in its input map and never deletes anything
    /// else it finds in the table.
    async fn update_table(
        &self,
        ctx: Context,
        iface: &str,
        desired: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let current = self.list_table(ctx, iface).await?;
        for (destination, nexthop) in desired {
            let already_correct =
                current.iter().any(|(d, n)| d == destination && n == nexthop);
            if !already_correct {
                self.update_entry(ctx, iface, destination, nexthop).await?;
            }
        }
        Ok(())
    }
}
