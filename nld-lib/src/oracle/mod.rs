//! Adapter to the external configuration oracle ("confd") and the periodic
//! reconciliation timers that poll it. Grounded on `nld_confd.py`.

pub mod process;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::firewall::IptablesOps;
use crate::kernel::{Context, NetworkTableOps};
use crate::peerset::PeerSetManager;

/// How often each timer fires, matching `nld_confd.py`'s constants.
pub const NODES_INTERVAL: Duration = Duration::from_secs(30);
pub const MC_INTERVAL: Duration = Duration::from_secs(120);
pub const INSTANCES_INTERVAL: Duration = Duration::from_secs(5);
pub const MASTER_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("oracle query failed: {0}")]
    Query(String),
    #[error(transparent)]
    Kernel(#[from] crate::kernel::Error),
    #[error(transparent)]
    Peerset(#[from] crate::peerset::Error),
    #[error("failed to write mc list file {path}: {source}")]
    WriteMcList { path: String, #[source] source: std::io::Error },
}

/// Outcome of mapping a single instance IP back to the node that hosts it.
#[derive(Debug, Clone)]
pub enum InstanceMapping {
    Found { instance_ip: String, node_pip: String },
    NotFound { instance_ip: String },
    Error { instance_ip: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MasterInfo {
    /// The cluster master's service IP (`master_ip` in spec.md).
    pub master_ip: String,
    /// The hypervisor node IP currently hosting the master
    /// (`master_node_ip` in spec.md) — the neighbour-table nexthop.
    pub master_node_ip: String,
}

/// The five typed queries this daemon issues against the external oracle,
/// grounded on `nld_confd.py::NLDConfdCallback`'s dispatch table.
#[async_trait]
pub trait OracleClient: Send + Sync {
    async fn node_pip_list(&self, cluster: &str) -> Result<Vec<String>, Error>;
    async fn mc_pip_list(&self, cluster: &str) -> Result<Vec<String>, Error>;
    async fn instances_ips_list(&self, cluster: &str, link: &str) -> Result<Vec<String>, Error>;
    async fn node_pip_by_instance_ip(
        &self,
        cluster: &str,
        link: &str,
        instance_ips: &[String],
    ) -> Result<Vec<InstanceMapping>, Error>;
    async fn cluster_master(&self, cluster: &str) -> Result<MasterInfo, Error>;
}

/// The four independent timers this daemon drives per cluster, plus the
/// cached state needed to detect a master-IP change.
pub struct PeriodicUpdater {
    cluster: String,
    master_nbma_interface: String,
    /// `(table_id, tunnel_interface)` pairs this cluster routes instance
    /// traffic over.
    links: Vec<(String, String)>,
    mc_list_file: Option<std::path::PathBuf>,

    next_nodes: Instant,
    next_mc: Instant,
    next_instances: Instant,
    next_master: Instant,

    last_master: Option<MasterInfo>,
    /// Last master-candidate answer, sorted; `None` before the first MC
    /// reply arrives.
    mc_list_cached: Option<Vec<String>>,
}

impl PeriodicUpdater {
    pub fn new(
        cluster: impl Into<String>,
        master_nbma_interface: impl Into<String>,
        links: Vec<(String, String)>,
        mc_list_file: Option<std::path::PathBuf>,
        now: Instant,
    ) -> Self {
        PeriodicUpdater {
            cluster: cluster.into(),
            master_nbma_interface: master_nbma_interface.into(),
            links,
            mc_list_file,
            next_nodes: now,
            next_mc: now,
            next_instances: now,
            next_master: now,
            last_master: None,
            mc_list_cached: None,
        }
    }

    /// The peer-set manager registration name for this cluster's trusted
    /// hypervisor peers, fed by the node list (§4.G: "Node list → forward
    /// to peer-set manager").
    pub fn peer_set_name(&self) -> &str {
        &self.cluster
    }

    /// Earliest of the four deadlines; the main loop sleeps until this.
    pub fn next_wakeup(&self) -> Instant {
        [self.next_nodes, self.next_mc, self.next_instances, self.next_master]
            .into_iter()
            .min()
            .expect("four fixed fields")
    }

    /// Fires whichever of the four timers are due, re-arming each before
    /// awaiting its query (per spec: re-arm happens before the send, so a
    /// slow oracle response never delays the next tick).
    pub async fn poll_due(
        &mut self,
        now: Instant,
        oracle: &dyn OracleClient,
        kernel: &dyn NetworkTableOps,
        peerset: &mut PeerSetManager,
        firewall: &dyn IptablesOps,
    ) -> Result<(), Error> {
        if now >= self.next_nodes {
            self.next_nodes = now + NODES_INTERVAL;
            self.update_nodes(oracle, peerset, firewall).await?;
        }
        if now >= self.next_mc {
            self.next_mc = now + MC_INTERVAL;
            self.update_mc(oracle).await?;
        }
        if now >= self.next_instances {
            self.next_instances = now + INSTANCES_INTERVAL;
            self.update_instances(oracle, kernel).await?;
        }
        if now >= self.next_master {
            self.next_master = now + MASTER_INTERVAL;
            self.update_master(oracle, kernel).await?;
        }
        Ok(())
    }

    /// Forces an immediate instance-table refresh, bypassing the timer.
    /// Driven by an inbound `ROUTE_INVALIDATE` request.
    pub async fn force_refresh_instances(
        &mut self,
        oracle: &dyn OracleClient,
        kernel: &dyn NetworkTableOps,
    ) -> Result<(), Error> {
        self.update_instances(oracle, kernel).await
    }

    /// The node list drives trust, not the kernel table: it is every
    /// hypervisor peer this node should accept traffic from, forwarded
    /// straight to the peer-set manager (§4.B).
    async fn update_nodes(
        &self,
        oracle: &dyn OracleClient,
        peerset: &mut PeerSetManager,
        firewall: &dyn IptablesOps,
    ) -> Result<(), Error> {
        let nodes = oracle.node_pip_list(&self.cluster).await?;
        peerset.update(&self.cluster, nodes, firewall)?;
        Ok(())
    }

    /// The MC (master-candidate) list is the oracle's own peer set, not a
    /// firewall input: on change we only refresh our cache and, when
    /// configured, mirror it to `mc_list_file` for other consumers on the
    /// node to read.
    async fn update_mc(&mut self, oracle: &dyn OracleClient) -> Result<(), Error> {
        let mut members = oracle.mc_pip_list(&self.cluster).await?;
        members.sort();
        if self.mc_list_cached.as_ref() == Some(&members) {
            return Ok(());
        }
        if let Some(path) = &self.mc_list_file {
            let contents = members.join("\n") + "\n";
            std::fs::write(path, contents)
                .map_err(|source| Error::WriteMcList { path: path.display().to_string(), source })?;
        }
        self.mc_list_cached = Some(members);
        Ok(())
    }

    /// Fixes the REDESIGN FLAG bug in the original `UpdateInstances`: the
    /// per-cluster request must be issued once per `link`, from inside this
    /// loop, not once after the loop has already discarded all but the
    /// last link's data.
    async fn update_instances(
        &self,
        oracle: &dyn OracleClient,
        kernel: &dyn NetworkTableOps,
    ) -> Result<(), Error> {
        for (_table, iface) in &self.links {
            let instance_ips = oracle.instances_ips_list(&self.cluster, iface).await?;
            if instance_ips.is_empty() {
                continue;
            }
            let mappings =
                oracle.node_pip_by_instance_ip(&self.cluster, iface, &instance_ips).await?;
            let desired: HashMap<String, String> = mappings
                .into_iter()
                .filter_map(|m| match m {
                    InstanceMapping::Found { instance_ip, node_pip } => {
                        Some((instance_ip, node_pip))
                    }
                    // Instances with no resolvable node, or an error status
                    // from the oracle, are skipped rather than routed.
                    InstanceMapping::NotFound { .. } | InstanceMapping::Error { .. } => None,
                })
                .collect();
            // The per-instance reachability fix is a neighbour entry
            // (instance IP -> hosting node IP on this NBMA link), not a
            // route, matching `update_master`'s analogous use below.
            kernel.update_table(Context::Neighbour, iface, &desired).await?;
        }
        Ok(())
    }

    async fn update_master(
        &mut self,
        oracle: &dyn OracleClient,
        kernel: &dyn NetworkTableOps,
    ) -> Result<(), Error> {
        let master = oracle.cluster_master(&self.cluster).await?;
        let changed = match &self.last_master {
            None => {
                info!(
                    cluster = %self.cluster,
                    master_ip = %master.master_ip,
                    master_node_ip = %master.master_node_ip,
                    "observed initial cluster master",
                );
                true
            }
            Some(previous) => {
                if previous.master_ip != master.master_ip {
                    warn!(
                        cluster = %self.cluster,
                        old_ip = %previous.master_ip,
                        new_ip = %master.master_ip,
                        "cluster master IP changed",
                    );
                }
                previous != &master
            }
        };

        if changed {
            let mut desired = HashMap::new();
            desired.insert(master.master_ip.clone(), master.master_node_ip.clone());
            kernel
                .update_table(Context::Neighbour, &self.master_nbma_interface, &desired)
                .await?;
        }

        self.last_master = Some(master);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::mocks::MockIptablesOps;
    use crate::kernel::mocks::MockNetworkTableOps;
    use std::sync::Mutex;

    struct StubOracle {
        nodes: Vec<String>,
        mc: Vec<String>,
        instances_by_link: HashMap<String, Vec<String>>,
        mappings_by_link: HashMap<String, Vec<InstanceMapping>>,
        master: Mutex<MasterInfo>,
        instance_queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OracleClient for StubOracle {
        async fn node_pip_list(&self, _cluster: &str) -> Result<Vec<String>, Error> {
            Ok(self.nodes.clone())
        }

        async fn mc_pip_list(&self, _cluster: &str) -> Result<Vec<String>, Error> {
            Ok(self.mc.clone())
        }

        async fn instances_ips_list(&self, _cluster: &str, link: &str) -> Result<Vec<String>, Error> {
            self.instance_queries.lock().unwrap().push(link.to_string());
            Ok(self.instances_by_link.get(link).cloned().unwrap_or_default())
        }

        async fn node_pip_by_instance_ip(
            &self,
            _cluster: &str,
            link: &str,
            _instance_ips: &[String],
        ) -> Result<Vec<InstanceMapping>, Error> {
            Ok(self.mappings_by_link.get(link).cloned().unwrap_or_default())
        }

        async fn cluster_master(&self, _cluster: &str) -> Result<MasterInfo, Error> {
            Ok(self.master.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn update_instances_sends_one_query_per_link() {
        let mut instances_by_link = HashMap::new();
        instances_by_link.insert("gtun0".to_string(), vec!["10.1.0.5".to_string()]);
        instances_by_link.insert("gtun1".to_string(), vec!["10.2.0.5".to_string()]);
        let mut mappings_by_link = HashMap::new();
        mappings_by_link.insert(
            "gtun0".to_string(),
            vec![InstanceMapping::Found { instance_ip: "10.1.0.5".to_string(), node_pip: "192.0.2.1".to_string() }],
        );
        mappings_by_link.insert(
            "gtun1".to_string(),
            vec![InstanceMapping::Found { instance_ip: "10.2.0.5".to_string(), node_pip: "192.0.2.2".to_string() }],
        );
        let oracle = StubOracle {
            nodes: vec![],
            mc: vec![],
            instances_by_link,
            mappings_by_link,
            master: Mutex::new(MasterInfo { master_ip: "192.0.2.9".to_string(), master_node_ip: "10.0.0.9".to_string() }),
            instance_queries: Mutex::new(Vec::new()),
        };
        let kernel = MockNetworkTableOps::new();
        let updater = PeriodicUpdater::new(
            "prod",
            "nbma0",
            vec![("100".to_string(), "gtun0".to_string()), ("101".to_string(), "gtun1".to_string())],
            None,
            Instant::now(),
        );

        updater.update_instances(&oracle, &kernel).await.unwrap();

        assert_eq!(*oracle.instance_queries.lock().unwrap(), vec!["gtun0", "gtun1"]);
        let gtun0_rows = kernel.list_table(Context::Neighbour, "gtun0").await.unwrap();
        assert_eq!(gtun0_rows, vec![("10.1.0.5".to_string(), "192.0.2.1".to_string())]);
        let gtun1_rows = kernel.list_table(Context::Neighbour, "gtun1").await.unwrap();
        assert_eq!(gtun1_rows, vec![("10.2.0.5".to_string(), "192.0.2.2".to_string())]);
    }

    #[tokio::test]
    async fn update_instances_skips_unresolved_and_errored_mappings() {
        let mut instances_by_link = HashMap::new();
        instances_by_link.insert(
            "gtun0".to_string(),
            vec!["10.1.0.5".to_string(), "10.1.0.6".to_string(), "10.1.0.7".to_string()],
        );
        let mut mappings_by_link = HashMap::new();
        mappings_by_link.insert(
            "gtun0".to_string(),
            vec![
                InstanceMapping::Found { instance_ip: "10.1.0.5".to_string(), node_pip: "192.0.2.1".to_string() },
                InstanceMapping::NotFound { instance_ip: "10.1.0.6".to_string() },
                InstanceMapping::Error { instance_ip: "10.1.0.7".to_string() },
            ],
        );
        let oracle = StubOracle {
            nodes: vec![],
            mc: vec![],
            instances_by_link,
            mappings_by_link,
            master: Mutex::new(MasterInfo { master_ip: "192.0.2.9".to_string(), master_node_ip: "10.0.0.9".to_string() }),
            instance_queries: Mutex::new(Vec::new()),
        };
        let kernel = MockNetworkTableOps::new();
        let updater = PeriodicUpdater::new(
            "prod",
            "nbma0",
            vec![("100".to_string(), "gtun0".to_string())],
            None,
            Instant::now(),
        );

        updater.update_instances(&oracle, &kernel).await.unwrap();
        let rows = kernel.list_table(Context::Neighbour, "gtun0").await.unwrap();
        assert_eq!(rows, vec![("10.1.0.5".to_string(), "192.0.2.1".to_string())]);
    }

    #[tokio::test]
    async fn update_nodes_forwards_node_list_to_peer_set_manager() {
        let oracle = StubOracle {
            nodes: vec!["192.0.2.2".to_string(), "192.0.2.1".to_string()],
            mc: vec![],
            instances_by_link: HashMap::new(),
            mappings_by_link: HashMap::new(),
            master: Mutex::new(MasterInfo { master_ip: "192.0.2.9".to_string(), master_node_ip: "10.0.0.9".to_string() }),
            instance_queries: Mutex::new(Vec::new()),
        };
        let mut peerset = PeerSetManager::new();
        let updater = PeriodicUpdater::new("prod", "nbma0", vec![], None, Instant::now());
        peerset.register(updater.peer_set_name()).unwrap();
        let firewall = MockIptablesOps::new();

        updater.update_nodes(&oracle, &mut peerset, &firewall).await.unwrap();

        assert_eq!(
            peerset.members(updater.peer_set_name()),
            Some(["192.0.2.1".to_string(), "192.0.2.2".to_string()].as_slice())
        );
    }

    #[tokio::test]
    async fn update_mc_caches_the_answer_and_writes_the_list_file_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mc_list");
        let oracle = StubOracle {
            nodes: vec![],
            mc: vec!["192.0.2.2".to_string(), "192.0.2.1".to_string()],
            instances_by_link: HashMap::new(),
            mappings_by_link: HashMap::new(),
            master: Mutex::new(MasterInfo { master_ip: "192.0.2.9".to_string(), master_node_ip: "10.0.0.9".to_string() }),
            instance_queries: Mutex::new(Vec::new()),
        };
        let mut updater =
            PeriodicUpdater::new("prod", "nbma0", vec![], Some(path.clone()), Instant::now());

        updater.update_mc(&oracle).await.unwrap();

        assert_eq!(
            updater.mc_list_cached,
            Some(vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()])
        );
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "192.0.2.1\n192.0.2.2\n");
    }

    #[tokio::test]
    async fn update_mc_is_idempotent_for_an_unchanged_answer() {
        let oracle = StubOracle {
            nodes: vec![],
            mc: vec!["192.0.2.1".to_string()],
            instances_by_link: HashMap::new(),
            mappings_by_link: HashMap::new(),
            master: Mutex::new(MasterInfo { master_ip: "192.0.2.9".to_string(), master_node_ip: "10.0.0.9".to_string() }),
            instance_queries: Mutex::new(Vec::new()),
        };
        let mut updater = PeriodicUpdater::new("prod", "nbma0", vec![], None, Instant::now());

        updater.update_mc(&oracle).await.unwrap();
        let cached_after_first = updater.mc_list_cached.clone();
        updater.update_mc(&oracle).await.unwrap();

        assert_eq!(updater.mc_list_cached, cached_after_first);
    }

    #[tokio::test]
    async fn update_master_records_new_ip_and_warns_on_change() {
        let master = Mutex::new(MasterInfo { master_ip: "192.0.2.1".to_string(), master_node_ip: "10.0.0.1".to_string() });
        let oracle = StubOracle {
            nodes: vec![],
            mc: vec![],
            instances_by_link: HashMap::new(),
            mappings_by_link: HashMap::new(),
            master,
            instance_queries: Mutex::new(Vec::new()),
        };
        let kernel = MockNetworkTableOps::new();
        let mut updater = PeriodicUpdater::new("prod", "nbma0", vec![], None, Instant::now());

        updater.update_master(&oracle, &kernel).await.unwrap();
        assert_eq!(updater.last_master.as_ref().unwrap().master_ip, "192.0.2.1");
        let rows = kernel.list_table(Context::Neighbour, "nbma0").await.unwrap();
        assert_eq!(rows, vec![("192.0.2.1".to_string(), "10.0.0.1".to_string())]);

        *oracle.master.lock().unwrap() = MasterInfo { master_ip: "192.0.2.42".to_string(), master_node_ip: "10.0.0.42".to_string() };
        updater.update_master(&oracle, &kernel).await.unwrap();
        assert_eq!(updater.last_master.as_ref().unwrap().master_ip, "192.0.2.42");
        let rows = kernel.list_table(Context::Neighbour, "nbma0").await.unwrap();
        assert_eq!(rows, vec![("192.0.2.42".to_string(), "10.0.0.42".to_string())]);
    }

    #[tokio::test]
    async fn update_master_is_idempotent_for_unchanged_answers() {
        let master = Mutex::new(MasterInfo {
            master_ip: "192.0.2.1".to_string(),
            master_node_ip: "10.0.0.1".to_string(),
        });
        let oracle = StubOracle {
            nodes: vec![],
            mc: vec![],
            instances_by_link: HashMap::new(),
            mappings_by_link: HashMap::new(),
            master,
            instance_queries: Mutex::new(Vec::new()),
        };
        let kernel = MockNetworkTableOps::new();
        let mut updater = PeriodicUpdater::new("prod", "nbma0", vec![], None, Instant::now());

        updater.update_master(&oracle, &kernel).await.unwrap();
        updater.update_master(&oracle, &kernel).await.unwrap();
        kernel.fail_on("update");
        // A third identical answer must not attempt another kernel write;
        // if it did, this call would return a forced failure.
        updater.update_master(&oracle, &kernel).await.unwrap();
    }
}
