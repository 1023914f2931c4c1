//! Runtime configuration of a replica.

use std::path::PathBuf;

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;

/// Default heartbeat period in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default nominal round-trip estimate in milliseconds.
pub const DEFAULT_NET_RTT: u64 = 50;
/// Upper bound of the random jitter added to the election timeout.
pub const DEFAULT_ELECTION_JITTER: u64 = 100;
/// Default proxy backoff after a `NotALeader` response, in milliseconds.
pub const DEFAULT_PROXY_RETRY_BACKOFF: u64 = 50;

/// The runtime configuration of a cluster.
///
/// Build via `Config::build(..)` and finish with `validate()`:
///
/// ```ignore
/// let config = Config::build("cluster".into())
///     .store_dir("/var/lib/rsm/log".into())
///     .db_path("/var/lib/rsm/meta.db".into())
///     .validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// The application-specific name of the cluster.
    pub cluster_name: String,
    /// Directory holding the durable log (`rsm.store.dir`).
    pub store_dir: PathBuf,
    /// Path of the metadata key/value file (`db.path`).
    pub db_path: PathBuf,
    /// Name under which the proxy discovers replicas (`rsm.pool.name`).
    pub pool_name: String,
    /// Port the replica's RPC endpoint binds to (`rpc.port`).
    pub rpc_port: u16,
    /// Nominal round-trip estimate in milliseconds (`net.rtt`); the election
    /// timeout scales with it.
    pub net_rtt: u64,
    /// Heartbeat period in milliseconds. Must stay well below the election
    /// timeout so that a healthy leader never lets followers time out.
    pub heartbeat_interval: u64,
    /// Upper bound of the uniform random jitter added to each sampled
    /// election timeout, in milliseconds.
    pub election_jitter: u64,
    /// How long the proxy sleeps after a `NotALeader` response before
    /// retrying against another replica, in milliseconds.
    pub proxy_retry_backoff: u64,
}

impl Config {
    /// Start the builder process.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            store_dir: None,
            db_path: None,
            pool_name: None,
            rpc_port: None,
            net_rtt: None,
            heartbeat_interval: None,
            election_jitter: None,
            proxy_retry_backoff: None,
        }
    }

    /// The minimum election timeout, in milliseconds.
    pub fn election_timeout_min(&self) -> u64 {
        6 * self.net_rtt
    }

    /// Sample a new election timeout: `6 * net.rtt` plus uniform random
    /// jitter. Re-sampled on every wait.
    pub fn new_rand_election_timeout(&self) -> u64 {
        let jitter = thread_rng().gen_range(0..=self.election_jitter);
        self.election_timeout_min() + jitter
    }
}

/// A builder for `Config`.
#[derive(Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    store_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    pool_name: Option<String>,
    rpc_port: Option<u16>,
    net_rtt: Option<u64>,
    heartbeat_interval: Option<u64>,
    election_jitter: Option<u64>,
    proxy_retry_backoff: Option<u64>,
}

impl ConfigBuilder {
    /// Set the directory for durable log storage.
    pub fn store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = Some(dir);
        self
    }

    /// Set the path of the metadata store file.
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Set the pool name used for replica discovery.
    pub fn pool_name(mut self, name: String) -> Self {
        self.pool_name = Some(name);
        self
    }

    /// Set the RPC port.
    pub fn rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = Some(port);
        self
    }

    /// Set the nominal round-trip estimate in milliseconds.
    pub fn net_rtt(mut self, rtt: u64) -> Self {
        self.net_rtt = Some(rtt);
        self
    }

    /// Set the heartbeat period in milliseconds.
    pub fn heartbeat_interval(mut self, interval: u64) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Set the election timeout jitter bound in milliseconds.
    pub fn election_jitter(mut self, jitter: u64) -> Self {
        self.election_jitter = Some(jitter);
        self
    }

    /// Set the proxy retry backoff in milliseconds.
    pub fn proxy_retry_backoff(mut self, backoff: u64) -> Self {
        self.proxy_retry_backoff = Some(backoff);
        self
    }

    /// Validate the state of this builder, returning a config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let net_rtt = self.net_rtt.unwrap_or(DEFAULT_NET_RTT);
        if net_rtt == 0 {
            return Err(ConfigError::InvalidRtt);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval * 3 > 6 * net_rtt {
            return Err(ConfigError::HeartbeatTooSlow);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            store_dir: self.store_dir.unwrap_or_else(|| PathBuf::from("rsm-store")),
            db_path: self.db_path.unwrap_or_else(|| PathBuf::from("rsm-meta.db")),
            pool_name: self.pool_name.unwrap_or_else(|| "rsm".to_string()),
            rpc_port: self.rpc_port.unwrap_or(42),
            net_rtt,
            heartbeat_interval,
            election_jitter: self.election_jitter.unwrap_or(DEFAULT_ELECTION_JITTER),
            proxy_retry_backoff: self.proxy_retry_backoff.unwrap_or(DEFAULT_PROXY_RETRY_BACKOFF),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.net_rtt, DEFAULT_NET_RTT);
    }

    #[test]
    fn election_timeout_scales_with_rtt() {
        let config = Config::build("test".into()).net_rtt(100).validate().unwrap();
        for _ in 0..32 {
            let t = config.new_rand_election_timeout();
            assert!(t >= 600);
            assert!(t <= 600 + config.election_jitter);
        }
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let res = Config::build("test".into()).net_rtt(10).heartbeat_interval(500).validate();
        assert_eq!(res.unwrap_err(), ConfigError::HeartbeatTooSlow);
    }

    #[test]
    fn rejects_zero_rtt() {
        let res = Config::build("test".into()).net_rtt(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidRtt);
    }
}
