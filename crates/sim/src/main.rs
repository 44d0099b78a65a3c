use clap::Parser;
use tracing_subscriber::EnvFilter;

use fm_domain::config::{LogFormat, ObservabilityConfig};
use fm_sim::cli::run::RunOptions;
use fm_sim::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            sessions,
            messages,
            no_require_close,
            defer_init,
            json,
        } => {
            let (config, _) = fm_sim::cli::load_config()?;
            init_tracing(&config.observability);
            let config = fm_sim::cli::with_demo_protocols(config)?;
            let opts = RunOptions {
                sessions,
                messages,
                require_close: config.sessions.default_require_close && !no_require_close,
                send_init_immediately: config.sessions.send_init_immediately && !defer_init,
            };
            let summary = fm_sim::cli::run::run(config, opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                fm_sim::cli::run::print_summary(&summary);
            }
            Ok(())
        }
        Command::Negotiate { protocol, versions } => {
            init_cli_tracing();
            let (config, _) = fm_sim::cli::load_config()?;
            let config = fm_sim::cli::with_demo_protocols(config)?;
            fm_sim::cli::negotiate::run(&config, &protocol, &versions)
        }
        Command::Config(ConfigCommand::Validate) => {
            let (config, config_path) = fm_sim::cli::load_config()?;
            if !fm_sim::cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            let (config, _) = fm_sim::cli::load_config()?;
            fm_sim::cli::config::show(&config)
        }
    }
}

/// Tracing for `run`, shaped by `[observability]`.  `RUST_LOG` overrides
/// the configured filter.
fn init_tracing(obs: &ObservabilityConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&obs.default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match obs.log_format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Compact stderr-only tracing for one-shot commands, `warn` by default.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
