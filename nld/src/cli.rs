use clap::Parser;

use std::net::IpAddr;
use std::path::PathBuf;

use nld_lib::protocol::NLD_DEFAULT_PORT;

/// ganeti-nld - per-node NBMA link daemon: kernel reachability and IP trust
/// firewall maintenance for a Ganeti NBMA-overlay cluster.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Bash-fragment configuration file to load; repeatable. At least one
    /// is required.
    #[arg(short, long = "config", required = true)]
    pub config_paths: Vec<PathBuf>,

    /// Local address to bind the control-protocol UDP socket to.
    #[arg(long, env = "NLD_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// UDP port to bind the control-protocol socket to.
    #[arg(long, env = "NLD_PORT", default_value_t = NLD_DEFAULT_PORT)]
    pub port: u16,

    /// External helper binary used to query the configuration oracle
    /// (confd); invoked once per query as `<binary> <subcommand> ...`.
    #[arg(long, env = "NLD_ORACLE_BINARY")]
    pub oracle_binary: PathBuf,

    /// Log filter, falls back to `RUST_LOG` and then to `info`.
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
