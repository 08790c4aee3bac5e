//
use anyhow::{bail, Result};

pub mod broadcast;
pub mod protocol;
pub mod safekeeper;
pub mod sock;
pub mod wal_queue;
pub mod walreceiver;

use protocol::MAX_SAFEKEEPERS;

pub mod defaults {
    pub const DEFAULT_PG_HOST: &str = "127.0.0.1";
    pub const DEFAULT_PG_PORT: u16 = 5432;
}

/// Everything the proxy needs to know to start up, resolved from the
/// command line and the environment by the binary.
#[derive(Debug, Clone)]
pub struct SafekeeperProxyConf {
    /// safekeeper endpoints, in the order given on the command line
    pub safekeepers: Vec<(String, u16)>,
    /// number of acknowledgements required to commit
    pub quorum: usize,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

/// Parse the `-s` argument: a comma separated list of `host:port` pairs.
pub fn parse_safekeepers_list(list: &str) -> Result<Vec<(String, u16)>> {
    let mut safekeepers = Vec::new();
    for endpoint in list.split(',') {
        let mut parts = endpoint.splitn(2, ':');
        let host = parts.next().unwrap();
        let port = match parts.next() {
            Some(port) => port,
            None => bail!("port is not specified in safekeeper address '{}'", endpoint),
        };
        if host.is_empty() {
            bail!("host is not specified in safekeeper address '{}'", endpoint);
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port number \"{}\"", port))?;
        safekeepers.push((host.to_owned(), port));
    }
    if safekeepers.is_empty() {
        bail!("safekeepers addresses are not specified");
    }
    if safekeepers.len() > MAX_SAFEKEEPERS {
        bail!(
            "too many safekeepers: {}, max is {}",
            safekeepers.len(),
            MAX_SAFEKEEPERS
        );
    }
    Ok(safekeepers)
}

/// Apply the default quorum (majority) and check the requested one is
/// neither too small to be safe nor larger than the node count.
pub fn validate_quorum(n_safekeepers: usize, quorum: Option<usize>) -> Result<usize> {
    let majority = n_safekeepers / 2 + 1;
    match quorum {
        None => Ok(majority),
        Some(q) if q >= majority && q <= n_safekeepers => Ok(q),
        Some(q) => bail!(
            "invalid quorum value: {}, should be {}..{}",
            q,
            majority,
            n_safekeepers
        ),
    }
}
