//! Configuration loader: turns a set of bash-fragment config files into a
//! validated [`Config`]. Grounded on `config.py::NLDConfig.FromConfigFiles`,
//! expanded to also cover the per-cluster and routing-table keys this
//! daemon's wider data model needs (spec.md §6).

pub mod bashfrag;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default routing table id used when a file declares no `routing_table`.
const DEFAULT_TABLE_ID: &str = "100";
/// Default tunnel interface bound to [`DEFAULT_TABLE_ID`] when nothing else
/// claims it.
const DEFAULT_TUNNEL_IFACE: &str = "gtun0";
/// Cluster name synthesized when no file declares `cluster_name`.
const DEFAULT_CLUSTER_NAME: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("duplicate endpoint_external_ip {0:?}")]
    DuplicateEndpoint(String),
    #[error("routing table {table} already bound to interface {existing:?}, file {path} wants {requested:?}")]
    TableConflict { table: String, existing: String, requested: String, path: PathBuf },
    #[error("no endpoint_external_ip declared in any config file")]
    NoEndpoints,
    #[error("cluster {0:?} has no hmac_key_file configured")]
    MissingHmacKeyFile(String),
    #[error("failed to read hmac key file {path}: {source}")]
    ReadHmacKey { path: PathBuf, #[source] source: std::io::Error },
}

/// Per-cluster settings: where to find the master-candidate list, whether we
/// maintain it ourselves, the HMAC key file, and the interface carrying
/// traffic to the cluster's master.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub mc_list_file: Option<PathBuf>,
    pub mc_list_update: bool,
    pub hmac_key_file: Option<PathBuf>,
    pub master_nbma_interface: Option<String>,
}

impl ClusterConfig {
    pub fn load_hmac_key(&self, cluster: &str) -> Result<Vec<u8>, Error> {
        let path = self
            .hmac_key_file
            .as_ref()
            .ok_or_else(|| Error::MissingHmacKeyFile(cluster.to_string()))?;
        std::fs::read(path).map_err(|source| Error::ReadHmacKey { path: path.clone(), source })
    }
}

/// Mapping from routing table id to the tunnel interface that owns it.
#[derive(Debug, Clone, Default)]
pub struct RoutingBindings(HashMap<String, String>);

impl RoutingBindings {
    fn bind(&mut self, table: String, iface: String, path: &Path) -> Result<(), Error> {
        match self.0.get(&table) {
            Some(existing) if existing != &iface => Err(Error::TableConflict {
                table,
                existing: existing.clone(),
                requested: iface,
                path: path.to_path_buf(),
            }),
            _ => {
                self.0.insert(table, iface);
                Ok(())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn interface_for(&self, table: &str) -> Option<&str> {
        self.0.get(table).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub endpoints: Vec<String>,
    pub tables_tunnels: RoutingBindings,
    pub clusters: HashMap<String, ClusterConfig>,
}

impl Config {
    pub fn load_from_files(paths: &[PathBuf]) -> Result<Config, Error> {
        let mut endpoints = Vec::new();
        let mut tables_tunnels = RoutingBindings::default();
        let mut clusters: HashMap<String, ClusterConfig> = HashMap::new();
        let mut unnamed = ClusterConfig::default();
        let mut saw_named_cluster = false;

        for path in paths {
            let content = std::fs::read_to_string(path)
                .map_err(|source| Error::Read { path: path.clone(), source })?;
            let kv = bashfrag::parse(&content);
            let mut lookup: HashMap<&str, &str> = HashMap::new();
            for (k, v) in &kv {
                lookup.insert(k.as_str(), v.as_str());
            }

            if let Some(ip) = lookup.get("endpoint_external_ip") {
                if endpoints.iter().any(|e: &String| e == ip) {
                    return Err(Error::DuplicateEndpoint((*ip).to_string()));
                }
                endpoints.push((*ip).to_string());
            }

            if let Some(iface) = lookup.get("gre_interface") {
                let table = lookup
                    .get("routing_table")
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| DEFAULT_TABLE_ID.to_string());
                tables_tunnels.bind(table, (*iface).to_string(), path)?;
            }

            let target: &mut ClusterConfig = if let Some(name) = lookup.get("cluster_name") {
                saw_named_cluster = true;
                clusters.entry((*name).to_string()).or_default()
            } else {
                &mut unnamed
            };
            if let Some(f) = lookup.get("mc_list_file") {
                target.mc_list_file = Some(PathBuf::from(f));
            }
            if let Some(f) = lookup.get("mc_list_update") {
                target.mc_list_update = matches!(*f, "1" | "true" | "yes");
            }
            if let Some(f) = lookup.get("hmac_key_file") {
                target.hmac_key_file = Some(PathBuf::from(f));
            }
            if let Some(f) = lookup.get("master_nbma_interface") {
                target.master_nbma_interface = Some((*f).to_string());
            }
        }

        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        if !saw_named_cluster {
            clusters.insert(DEFAULT_CLUSTER_NAME.to_string(), unnamed);
        }
        if tables_tunnels.is_empty() {
            tables_tunnels.bind(
                DEFAULT_TABLE_ID.to_string(),
                DEFAULT_TUNNEL_IFACE.to_string(),
                Path::new("<default>"),
            )?;
        }

        Ok(Config { endpoints, tables_tunnels, clusters })
    }
}
