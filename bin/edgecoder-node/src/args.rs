//! Command-line arguments.

use std::path::PathBuf;

use argh::FromArgs;
use edgecoder_config::{ConfigError, NodeConfig};

/// The EdgeCoder unified agent node.
#[derive(Debug, FromArgs)]
pub(crate) struct Args {
    /// path to a TOML config file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// runtime mode: full, coordinator, or worker
    #[argh(option, default = "NodeMode::Full")]
    pub mode: NodeMode,

    /// rpc listen address override
    #[argh(option)]
    pub listen: Option<String>,

    /// comma-separated bootstrap coordinator urls
    #[argh(option)]
    pub bootstrap: Option<String>,

    /// data directory override (sled store)
    #[argh(option)]
    pub datadir: Option<String>,

    /// coordinator url to serve (worker mode only)
    #[argh(option)]
    pub coordinator_url: Option<String>,
}

/// Which components this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeMode {
    /// Coordinator + local worker + inference facade.
    Full,
    /// Coordinator only; relies on remote workers.
    Coordinator,
    /// Worker + inference facade against a remote coordinator.
    Worker,
}

impl std::str::FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "coordinator" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown mode `{other}` (full|coordinator|worker)")),
        }
    }
}

impl Args {
    /// Resolves the layered configuration: defaults, TOML file,
    /// environment, then CLI overrides.
    pub(crate) fn resolve_config(&self) -> Result<NodeConfig, ConfigError> {
        let mut config = NodeConfig::load(self.config.as_deref())?;
        if let Some(listen) = &self.listen {
            config.rpc.listen_addr = listen.clone();
        }
        if let Some(bootstrap) = &self.bootstrap {
            config.gossip.bootstrap_urls = bootstrap
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(datadir) = &self.datadir {
            config.datadir = Some(datadir.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses() {
        assert_eq!("full".parse::<NodeMode>().unwrap(), NodeMode::Full);
        assert_eq!("worker".parse::<NodeMode>().unwrap(), NodeMode::Worker);
        assert!("turbo".parse::<NodeMode>().is_err());
    }

    #[test]
    fn cli_overrides_win() {
        let args = Args {
            config: None,
            mode: NodeMode::Full,
            listen: Some("0.0.0.0:9999".into()),
            bootstrap: Some("http://a, http://b".into()),
            datadir: None,
            coordinator_url: None,
        };
        let config = args.resolve_config().unwrap();
        assert_eq!(config.rpc.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.gossip.bootstrap_urls.len(), 2);
    }
}
