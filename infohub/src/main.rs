mod config;

use clap::{Parser, Subcommand};
use config::{Config, LogFormat, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

#[derive(Parser)]
#[command(name = "infohub", version, about = "News aggregation service")]
struct Cli {
    /// Path to the YAML config file
    #[arg(
        long,
        short,
        global = true,
        env = "CONFIG_PATH",
        default_value = "configs/config.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
enum CliCommand {
    /// Collect, aggregate and serve news until interrupted
    Run,
    /// Load and validate the config file, then exit
    ValidateConfig,
}

#[derive(thiserror::Error, Debug)]
enum MetricsInitError {
    #[error("could not build statsd exporter: {0}")]
    Exporter(String),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        CliCommand::ValidateConfig => {
            println!(
                "{}: ok ({} sources)",
                cli.config.display(),
                config.news.sources.len()
            );
            ExitCode::SUCCESS
        }
        CliCommand::Run => run(config),
    }
}

fn run(config: Config) -> ExitCode {
    // Must outlive the runtime so that queued events are flushed on exit.
    let _sentry = init_logging(config.common.logging.as_ref());

    if let Some(statsd) = &config.common.metrics {
        match init_metrics(statsd) {
            Ok(()) => tracing::info!(
                host = %statsd.statsd_host,
                port = statsd.statsd_port,
                "statsd metrics enabled"
            ),
            Err(e) => tracing::error!(error = %e, "metrics disabled"),
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(sources = config.news.sources.len(), "starting infohub");
    match runtime.block_on(aggregator::run(config.news)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "infohub failed");
            ExitCode::FAILURE
        }
    }
}

/// The filter comes from `RUST_LOG`, then `LOG_LEVEL`, then the config file.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|level| !level.is_empty())
        .or_else(|| logging.and_then(|l| l.level.clone()))
        .unwrap_or_else(|| "info".into());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = match logging.map(|l| l.format).unwrap_or_default() {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    let dsn = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .and_then(|dsn| match dsn.parse::<sentry::types::Dsn>() {
            Ok(dsn) => Some(dsn),
            Err(e) => {
                eprintln!("ignoring invalid sentry dsn: {e}");
                None
            }
        });
    let sentry_guard = dsn.map(|dsn| {
        sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            ..Default::default()
        })
    });
    let sentry_layer = sentry_guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(sentry_layer)
        .init();

    sentry_guard
}

fn init_metrics(statsd: &MetricsConfig) -> Result<(), MetricsInitError> {
    let recorder = StatsdBuilder::from(statsd.statsd_host.as_str(), statsd.statsd_port)
        .build(Some(statsd.prefix.as_str()))
        .map_err(|e| MetricsInitError::Exporter(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|_| MetricsInitError::RecorderInstalled)?;

    shared::metrics_defs::describe_all(aggregator::metrics_defs::ALL_METRICS);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_commands() {
        let cli = Cli::try_parse_from(["infohub", "--config", "/etc/infohub.yaml", "run"])
            .expect("parse run");
        assert_eq!(cli.command, CliCommand::Run);
        assert_eq!(cli.config, PathBuf::from("/etc/infohub.yaml"));

        let cli = Cli::try_parse_from(["infohub", "validate-config", "-c", "other.yaml"])
            .expect("parse validate-config");
        assert_eq!(cli.command, CliCommand::ValidateConfig);
        assert_eq!(cli.config, PathBuf::from("other.yaml"));

        assert!(Cli::try_parse_from(["infohub"]).is_err());
    }
}
