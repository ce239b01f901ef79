//! Production [`OracleClient`], backed by an external query helper process.
//!
//! The real Ganeti confd wire protocol (its own HMAC-signed UDP RPC,
//! `ganeti.confd.client`) is out of scope for this daemon (spec.md §1): the
//! oracle is "modelled as an opaque RPC client". This adapter treats that
//! opaque client as a single configured external command invoked once per
//! query, printing one line of JSON to stdout, grounded on the teacher's
//! subprocess conventions (`shell_command_ext.rs`,
//! `kernel::shell::ShellNetworkTableOps`).

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Error, InstanceMapping, MasterInfo, OracleClient};

/// Invokes `binary <subcommand> --cluster <cluster> [...]` and expects a
/// single line of JSON on stdout per query, matching whatever wraps the
/// real confd client on this node.
#[derive(Debug, Clone)]
pub struct ProcessOracleClient {
    binary: PathBuf,
}

impl ProcessOracleClient {
    pub fn new(binary: PathBuf) -> Self {
        ProcessOracleClient { binary }
    }

    async fn run(&self, args: &[&str]) -> Result<String, Error> {
        let command_str = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(command = %command_str, "querying configuration oracle");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| Error::Query(format!("failed to spawn {command_str}: {source}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                command = %command_str,
                status = ?output.status.code(),
                %stderr,
                "oracle query failed",
            );
            return Err(Error::Query(format!(
                "{command_str} exited with {:?}: {stderr}",
                output.status.code()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn parse<T: for<'de> Deserialize<'de>>(command_str: &str, stdout: &str) -> Result<T, Error> {
        serde_json::from_str(stdout)
            .map_err(|err| Error::Query(format!("malformed reply from {command_str}: {err}")))
    }
}

/// `(status, node_pip)` pair, mirroring the original confd answer shape for
/// `CONFD_REQ_NODE_PIP_BY_INSTANCE_IP`: `status == 0` is OK, anything else
/// is an oracle-side error for that one instance.
#[derive(Debug, Deserialize)]
struct RawInstanceReply(i64, Option<String>);

const CONFD_REPL_STATUS_OK: i64 = 0;

#[async_trait]
impl OracleClient for ProcessOracleClient {
    async fn node_pip_list(&self, cluster: &str) -> Result<Vec<String>, Error> {
        let args = ["node-pip-list", "--cluster", cluster];
        let stdout = self.run(&args).await?;
        Self::parse(&args.join(" "), &stdout)
    }

    async fn mc_pip_list(&self, cluster: &str) -> Result<Vec<String>, Error> {
        let args = ["mc-pip-list", "--cluster", cluster];
        let stdout = self.run(&args).await?;
        Self::parse(&args.join(" "), &stdout)
    }

    async fn instances_ips_list(&self, cluster: &str, link: &str) -> Result<Vec<String>, Error> {
        let args = ["instances-ips-list", "--cluster", cluster, "--link", link];
        let stdout = self.run(&args).await?;
        Self::parse(&args.join(" "), &stdout)
    }

    async fn node_pip_by_instance_ip(
        &self,
        cluster: &str,
        link: &str,
        instance_ips: &[String],
    ) -> Result<Vec<InstanceMapping>, Error> {
        let iplist = instance_ips.join(",");
        let args =
            ["node-pip-by-instance-ip", "--cluster", cluster, "--link", link, "--ips", &iplist];
        let stdout = self.run(&args).await?;
        let raw: Vec<RawInstanceReply> = Self::parse(&args.join(" "), &stdout)?;
        Ok(instance_ips
            .iter()
            .zip(raw)
            .map(|(instance_ip, RawInstanceReply(status, node_pip))| {
                match (status, node_pip) {
                    (s, Some(node_pip)) if s == CONFD_REPL_STATUS_OK => {
                        InstanceMapping::Found { instance_ip: instance_ip.clone(), node_pip }
                    }
                    (s, None) if s == CONFD_REPL_STATUS_OK => {
                        InstanceMapping::NotFound { instance_ip: instance_ip.clone() }
                    }
                    _ => InstanceMapping::Error { instance_ip: instance_ip.clone() },
                }
            })
            .collect())
    }

    async fn cluster_master(&self, cluster: &str) -> Result<MasterInfo, Error> {
        let args = ["cluster-master", "--cluster", cluster];
        let stdout = self.run(&args).await?;
        Self::parse(&args.join(" "), &stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_a_query_error_when_the_helper_binary_is_missing() {
        let client = ProcessOracleClient::new(PathBuf::from("/nonexistent/oracle-helper"));
        let err = client.node_pip_list("prod").await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn reports_a_query_error_on_nonzero_exit() {
        let client = ProcessOracleClient::new(PathBuf::from("/bin/false"));
        let err = client.mc_pip_list("prod").await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn parses_a_well_formed_node_list_reply() {
        // `/bin/echo` stands in for the real helper: it just prints its
        // arguments, so we feed it a JSON array directly as one argument.
        let client = ProcessOracleClient::new(PathBuf::from("/bin/echo"));
        let args = ["[\"10.0.0.1\",\"10.0.0.2\"]"];
        let stdout = client.run(&args).await.unwrap();
        let parsed: Vec<String> = ProcessOracleClient::parse("echo", &stdout).unwrap();
        assert_eq!(parsed, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    }
}
