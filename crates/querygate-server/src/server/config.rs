use anyhow::bail;
use clap::{Parser, ValueEnum};

/// How the frontend learns about scheduler addresses.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Use the statically configured scheduler address, resolved via DNS.
    #[default]
    Dns,
    /// Addresses are supplied dynamically by a hash-ring watcher; the static
    /// scheduler address must stay empty.
    Ring,
}

/// Runtime configuration for the `querygate-server` binary.
///
/// All values are parsed from CLI arguments or environment variables, with
/// defaults suitable for a single-scheduler deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "querygate-server",
    version,
    about = "Query-frontend dispatcher fanning calls out to schedulers over persistent gRPC streams"
)]
pub struct CliArgs {
    /// Static scheduler endpoint (host:port). Leave empty when service
    /// discovery supplies addresses at runtime.
    ///
    /// Environment variable: `SCHEDULER_ADDRESS`
    #[arg(long, env = "SCHEDULER_ADDRESS", default_value_t = String::new())]
    pub scheduler_address: String,

    /// Number of concurrent streams kept open per scheduler address. Also
    /// the ceiling on how often an enqueue is retried while schedulers
    /// report they are draining.
    ///
    /// Environment variable: `WORKER_CONCURRENCY`
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 5)]
    pub worker_concurrency: usize,

    /// Externally reachable host of this frontend, advertised to schedulers
    /// so worker processes know where to push results.
    ///
    /// Environment variable: `FRONTEND_ADDR`
    #[arg(long, env = "FRONTEND_ADDR", default_value_t = String::from("127.0.0.1"))]
    pub addr: String,

    /// Externally reachable port of this frontend.
    ///
    /// Environment variable: `FRONTEND_PORT`
    #[arg(long, env = "FRONTEND_PORT", default_value_t = 9095)]
    pub port: u16,

    /// Address the gRPC server binds to.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("0.0.0.0:9095"))]
    pub listen_addr: String,

    /// Address the Prometheus /metrics endpoint binds to.
    ///
    /// Environment variable: `METRICS_ADDR`
    #[arg(long, env = "METRICS_ADDR", default_value_t = String::from("0.0.0.0:9090"))]
    pub metrics_addr: String,

    /// Scheduler service discovery mode.
    ///
    /// Environment variable: `SCHEDULER_DISCOVERY_MODE`
    #[arg(
        long,
        env = "SCHEDULER_DISCOVERY_MODE",
        value_enum,
        default_value_t = DiscoveryMode::Dns
    )]
    pub scheduler_discovery_mode: DiscoveryMode,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub scheduler_address: String,
    pub worker_concurrency: usize,
    pub addr: String,
    pub port: u16,
    pub listen_addr: String,
    pub metrics_addr: String,
    pub discovery_mode: DiscoveryMode,
}

impl ServerConfig {
    /// Address advertised in INIT and ENQUEUE frames.
    pub fn frontend_address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Checks cross-field coherence. Ring discovery supplies scheduler
    /// addresses dynamically, so a static address cannot be set alongside
    /// it.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be greater than 0");
        }
        if self.discovery_mode == DiscoveryMode::Ring && !self.scheduler_address.is_empty() {
            bail!(
                "scheduler address cannot be specified when query-scheduler service discovery mode is set to 'ring'"
            );
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheduler_address: String::new(),
            worker_concurrency: 5,
            addr: "127.0.0.1".to_owned(),
            port: 9095,
            listen_addr: "0.0.0.0:9095".to_owned(),
            metrics_addr: "0.0.0.0:9090".to_owned(),
            discovery_mode: DiscoveryMode::Dns,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let config = Self {
            scheduler_address: args.scheduler_address,
            worker_concurrency: args.worker_concurrency,
            addr: args.addr,
            port: args.port,
            listen_addr: args.listen_addr,
            metrics_addr: args.metrics_addr,
            discovery_mode: args.scheduler_discovery_mode,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ServerConfig::default().validate().expect("defaults must pass");
    }

    #[test]
    fn static_address_with_dns_discovery_is_valid() {
        let config = ServerConfig {
            scheduler_address: "localhost:9095".to_owned(),
            ..Default::default()
        };
        config.validate().expect("dns discovery allows a static address");
    }

    #[test]
    fn static_address_with_ring_discovery_is_rejected() {
        let config = ServerConfig {
            scheduler_address: "localhost:9095".to_owned(),
            discovery_mode: DiscoveryMode::Ring,
            ..Default::default()
        };
        let err = config.validate().expect_err("ring discovery forbids a static address");
        assert!(err.to_string().contains(
            "scheduler address cannot be specified when query-scheduler service discovery mode is set to 'ring'"
        ));
    }

    #[test]
    fn ring_discovery_without_static_address_is_valid() {
        let config = ServerConfig {
            discovery_mode: DiscoveryMode::Ring,
            ..Default::default()
        };
        config.validate().expect("ring discovery with empty address must pass");
    }

    #[test]
    fn zero_worker_concurrency_is_rejected() {
        let config = ServerConfig { worker_concurrency: 0, ..Default::default() };
        let err = config.validate().expect_err("zero concurrency must fail");
        assert!(err.to_string().contains("WORKER_CONCURRENCY"));
    }
}
