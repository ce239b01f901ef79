//! Owns every piece of daemon state and drives the single-threaded,
//! cooperative main loop described in spec.md §4.I / §5: one `tokio::select!`
//! over the control-protocol socket, the reconciler's timers, and the
//! tracker's expiry deadline. Grounded on the teacher's
//! `gnosis_vpn-worker/src/main.rs` daemon-loop shape, simplified to this
//! daemon's single-process, no-subprocess-worker design.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::time;
use tracing::{debug, error, info, warn};

use nld_lib::codec::{self, Unpacked};
use nld_lib::config::Config;
use nld_lib::firewall::{IptablesOps, RealIptablesOps};
use nld_lib::kernel::{NetworkTableOps, ShellNetworkTableOps};
use nld_lib::oracle::process::ProcessOracleClient;
use nld_lib::oracle::{OracleClient, PeriodicUpdater};
use nld_lib::peerset::PeerSetManager;
use nld_lib::protocol::{Discriminator, Reply, Request};
use nld_lib::reconciler::{InvalidationSender, Reconciler};
use nld_lib::request::RequestProcessor;
use nld_lib::tracker::{Tracker, Upcall};
use nld_lib::transport::{Transport, MAX_DATAGRAM_SIZE};

use crate::cli::Cli;

pub struct Daemon {
    transport: Transport,
    cluster_keys: HashMap<String, Vec<u8>>,
    known_clusters: Vec<String>,
    reconciler: Reconciler,
    invalidation: InvalidationSender,
    tracker: Tracker,
    peerset: PeerSetManager,
    kernel: Box<dyn NetworkTableOps>,
    firewall: Box<dyn IptablesOps>,
    oracle: Box<dyn OracleClient>,
}

impl Daemon {
    /// Loads configuration, reads every cluster's HMAC key, registers each
    /// cluster's peer set and periodic oracle timers, and binds the
    /// control-protocol socket. Fails fast (matching spec.md §7's
    /// "configuration errors terminate the process") on anything in
    /// [`nld_lib::config::Error`] or a missing/unreadable HMAC key file.
    pub async fn build(cli: &Cli) -> anyhow::Result<Self> {
        let config = Config::load_from_files(&cli.config_paths)?;

        let mut cluster_keys = HashMap::new();
        let mut known_clusters = Vec::new();
        let (mut reconciler, invalidation) = Reconciler::new();
        let mut peerset = PeerSetManager::new();
        let now = Instant::now();

        let links: Vec<(String, String)> =
            config.tables_tunnels.iter().map(|(table, iface)| (table.to_string(), iface.to_string())).collect();

        for (name, cluster_cfg) in &config.clusters {
            let key = cluster_cfg.load_hmac_key(name)?;
            cluster_keys.insert(name.clone(), key);
            known_clusters.push(name.clone());
            peerset.register(name.clone())?;

            let master_iface = cluster_cfg.master_nbma_interface.clone().unwrap_or_else(|| "gtun0".to_string());
            let mc_list_file =
                if cluster_cfg.mc_list_update { cluster_cfg.mc_list_file.clone() } else { None };
            let updater = PeriodicUpdater::new(name.clone(), master_iface, links.clone(), mc_list_file, now);
            reconciler.register_cluster(name.clone(), updater);
        }
        info!(clusters = ?known_clusters, endpoints = ?config.endpoints, "loaded configuration");

        let bind_addr = SocketAddr::new(cli.bind_address, cli.port);
        let transport = Transport::bind(bind_addr).await?;
        info!(addr = %bind_addr, "bound control-protocol UDP socket");

        let tracker = Tracker::new(
            cluster_keys.clone(),
            Box::new(|upcall| match upcall {
                Upcall::Reply { cluster, rsalt, answer } => {
                    debug!(cluster = %cluster, rsalt = %rsalt, ?answer, "received reply to outbound request");
                }
                Upcall::Expired { cluster, rsalt } => {
                    warn!(cluster = %cluster, rsalt = %rsalt, "outbound request expired without a reply");
                }
            }),
        );

        let kernel: Box<dyn NetworkTableOps> = Box::new(ShellNetworkTableOps::new());
        let firewall: Box<dyn IptablesOps> = Box::new(RealIptablesOps::new()?);
        let oracle: Box<dyn OracleClient> = Box::new(ProcessOracleClient::new(cli.oracle_binary.clone()));

        Ok(Daemon {
            transport,
            cluster_keys,
            known_clusters,
            reconciler,
            invalidation,
            tracker,
            peerset,
            kernel,
            firewall,
            oracle,
        })
    }

    /// Runs until `shutdown` resolves. A clean shutdown drains nothing
    /// further: all daemon state is in-memory only (spec.md §1 non-goals).
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let next_timer = [self.reconciler.next_wakeup(), self.tracker.next_deadline()]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(1));

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, exiting main loop");
                    return Ok(());
                }
                res = self.transport.recv(&mut buf) => {
                    match res {
                        Ok((n, src)) => self.handle_datagram(&buf[..n], src).await,
                        Err(err) => error!(error = %err, "failed receiving datagram"),
                    }
                }
                _ = time::sleep_until(time::Instant::from_std(next_timer)) => {
                    let now = Instant::now();
                    if let Err(err) = self
                        .reconciler
                        .poll_due(now, &*self.oracle, &*self.kernel, &mut self.peerset, &*self.firewall)
                        .await
                    {
                        error!(error = %err, "periodic oracle reconciliation failed");
                    }
                    self.tracker.expire_due(now);
                }
                cluster = self.reconciler.wait_for_invalidation() => {
                    if let Err(err) = self.reconciler.drain_invalidations(&*self.oracle, &*self.kernel).await {
                        error!(error = %err, cluster = %cluster, "forced instance refresh failed");
                    }
                }
            }

            if let Err(err) = self.transport.flush().await {
                error!(error = %err, "failed flushing outbound datagram queue");
            }
        }
    }

    async fn handle_datagram(&mut self, payload: &[u8], src: SocketAddr) {
        let unpacked = {
            let keys = &self.cluster_keys;
            codec::unpack(payload, |cluster| keys.get(cluster).map(|k| k.as_slice()))
        };
        let unpacked = match unpacked {
            Ok(u) => u,
            Err(err) => {
                debug!(%src, error = %err, "dropping undecodable datagram");
                return;
            }
        };

        let discriminator: Discriminator = match serde_json::from_str(&unpacked.msg) {
            Ok(d) => d,
            Err(err) => {
                error!(%src, error = %err, "inbound message is not a well-formed request or reply");
                return;
            }
        };

        match discriminator.is_request {
            Some(true) => self.handle_request(&unpacked.msg, &unpacked.salt, src),
            Some(false) => self.handle_reply(&unpacked),
            None => error!(%src, "inbound message missing is_request field, dropping"),
        }
    }

    /// Validates and answers an inbound request. A datagram that fails to
    /// parse, or that parses but fails validation (bad protocol version,
    /// unknown request type, clock skew, unknown cluster), is dropped
    /// silently with an info log — never answered — matching spec.md §4.E
    /// and §7's `NLDRequestError` handling.
    fn handle_request(&mut self, msg: &str, outer_salt: &str, src: SocketAddr) {
        let request: Request = match serde_json::from_str(msg) {
            Ok(r) => r,
            Err(err) => {
                info!(%src, error = %err, "dropping malformed request");
                return;
            }
        };

        let reply = {
            let processor = RequestProcessor::new(&self.known_clusters, &self.invalidation);
            match processor.process(&request, outer_salt) {
                Ok(reply) => reply,
                Err(err) => {
                    info!(%src, error = %err, cluster = %request.cluster, "ignoring broken query");
                    return;
                }
            }
        };

        let Some(key) = self.cluster_keys.get(&request.cluster) else {
            debug!(%src, cluster = %request.cluster, "dropping request for a cluster we hold no signing key for");
            return;
        };
        let mut reply = reply;
        reply.cluster = Some(request.cluster.clone());
        let bytes = codec::pack(&reply, key, &request.rsalt);
        if let Err(err) = self.transport.enqueue_send(src, bytes) {
            warn!(%src, error = %err, "failed to enqueue reply datagram");
        }
    }

    /// Matches an inbound reply against the client tracker's pending table
    /// by the echoed salt (spec.md §4.F); unmatched replies are dropped
    /// inside [`nld_lib::tracker::Tracker::handle_reply`] itself.
    fn handle_reply(&mut self, unpacked: &Unpacked) {
        let reply: Reply = match serde_json::from_str(&unpacked.msg) {
            Ok(r) => r,
            Err(err) => {
                debug!(error = %err, "dropping malformed reply");
                return;
            }
        };
        self.tracker.handle_reply(&unpacked.salt, reply);
    }
}
