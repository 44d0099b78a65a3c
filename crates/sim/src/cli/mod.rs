pub mod config;
pub mod negotiate;
pub mod run;

use clap::{Parser, Subcommand};

use fm_domain::config::Config;

/// FlowMesh session simulator.
#[derive(Debug, Parser)]
#[command(name = "flowmesh-sim", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an initiator and a responder node against each other in-process.
    Run {
        /// Number of sessions the initiator opens.
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
        sessions: u32,
        /// Data messages sent on each session.
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
        messages: u32,
        /// Open sessions that close without waiting for the peer.
        #[arg(long)]
        no_require_close: bool,
        /// Reserve sessions first and send the INIT with the first message.
        #[arg(long)]
        defer_init: bool,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show which responder and version the configured catalog selects.
    Negotiate {
        /// Protocol name offered by the initiator.
        #[arg(long)]
        protocol: String,
        /// Versions the initiator supports, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        versions: Vec<u32>,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `FM_CONFIG` (or
/// `flowmesh.toml`).  A missing file yields the defaults.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("FM_CONFIG").unwrap_or_else(|_| "flowmesh.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        Config::default()
    };

    Ok((config, config_path))
}

const DEMO_CONFIG: &str = r#"
[[protocols.initiators]]
flow = "ChatInitiator"
protocol = "chat"
versions = [1, 2]

[[protocols.responders]]
flow = "ChatResponder"
protocol = "chat"
versions = [1, 2]

[[deployments]]
name = "chat-demo"
bundle_hashes = ["chat-demo-bundle"]
"#;

/// `config` unchanged when it declares protocols, otherwise the same config
/// with the built-in chat protocol table and deployment.
pub fn with_demo_protocols(config: Config) -> anyhow::Result<Config> {
    if !config.protocols.initiators.is_empty() {
        return Ok(config);
    }
    let demo: Config = toml::from_str(DEMO_CONFIG)?;
    tracing::info!("no protocols configured, using the built-in chat table");
    Ok(Config {
        protocols: demo.protocols,
        deployments: demo.deployments,
        ..config
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_table_is_valid() {
        let config = with_demo_protocols(Config::default()).unwrap();
        assert!(config.validate().is_empty());
        assert_eq!(config.protocols.initiators[0].flow, "ChatInitiator");
    }

    #[test]
    fn parses_negotiate_versions() {
        let cli = Cli::try_parse_from([
            "flowmesh-sim",
            "negotiate",
            "--protocol",
            "chat",
            "--versions",
            "1,2,3",
        ])
        .unwrap();
        match cli.command {
            Command::Negotiate { protocol, versions } => {
                assert_eq!(protocol, "chat");
                assert_eq!(versions, vec![1, 2, 3]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_sessions() {
        assert!(Cli::try_parse_from(["flowmesh-sim", "run", "--sessions", "0"]).is_err());
    }
}
