use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Context, Error, NetworkTableOps};

/// Shells out to `ip neigh|route` to maintain kernel tables, grounded on
/// `gnosis_vpn-root/src/routing/shell_ops.rs`'s `RealShellOps` and
/// `shell_command_ext.rs`'s stderr-aware logging helpers.
#[derive(Debug, Default)]
pub struct ShellNetworkTableOps;

impl ShellNetworkTableOps {
    pub fn new() -> Self {
        ShellNetworkTableOps
    }

    async fn run(&self, args: &[&str]) -> Result<String, Error> {
        let command_str = format!("ip {}", args.join(" "));
        debug!(command = %command_str, "running kernel table command");
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|source| Error::Spawn { command: command_str.clone(), source })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command = %command_str, status = ?output.status.code(), %stderr, "kernel table command failed");
            return Err(Error::CommandFailed {
                command: command_str,
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Like [`Self::run`] but tolerates exit codes 0 and 2, matching the
    /// original's treatment of "already absent" as success on removal.
    async fn run_tolerating_absence(&self, args: &[&str]) -> Result<(), Error> {
        let command_str = format!("ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|source| Error::Spawn { command: command_str.clone(), source })?;
        match output.status.code() {
            Some(0) | Some(2) => Ok(()),
            other => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(Error::CommandFailed { command: command_str, status: other.unwrap_or(-1), stderr })
            }
        }
    }
}

#[async_trait]
impl NetworkTableOps for ShellNetworkTableOps {
    async fn list_table(&self, ctx: Context, iface: &str) -> Result<Vec<(String, String)>, Error> {
        let out = self.run(&[ctx.as_str(), "show", "dev", iface]).await?;
        let mut rows = Vec::new();
        for line in out.lines() {
            let mut fields = line.split_whitespace();
            let destination = match fields.next() {
                Some(d) => d,
                None => continue,
            };
            // `10.0.0.2 lladdr 02:... dev gtun0 ...` (neigh) or
            // `10.0.0.0/24 via 192.0.2.1 dev gtun0 ...` (route).
            let marker = match ctx {
                Context::Neighbour => "lladdr",
                Context::Routing => "via",
            };
            let nexthop = fields
                .skip_while(|tok| *tok != marker)
                .nth(1)
                .map(str::to_string);
            if let Some(nexthop) = nexthop {
                rows.push((destination.to_string(), nexthop));
            }
        }
        Ok(rows)
    }

    async fn update_entry(
        &self,
        ctx: Context,
        iface: &str,
        destination: &str,
        nexthop: &str,
    ) -> Result<(), Error> {
        match ctx {
            Context::Neighbour => {
                self.run(&[
                    "neigh", "replace", destination, "lladdr", nexthop, "nud", "permanent", "dev",
                    iface,
                ])
                .await?;
            }
            Context::Routing => {
                self.run(&["route", "replace", destination, "via", nexthop, "dev", iface]).await?;
            }
        }
        Ok(())
    }

    async fn remove_entry(&self, ctx: Context, iface: &str, destination: &str) -> Result<(), Error> {
        self.run_tolerating_absence(&[ctx.as_str(), "del", destination, "dev", iface]).await
    }
}
