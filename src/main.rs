use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use pulse_server::{FanOut, ServerConfig};
use pulse_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

/// Event-stream broadcast server.
#[derive(Debug, Parser)]
#[command(name = "pulse", version, about)]
struct Cli {
    /// JSON config file, deep-merged over the defaults.
    #[arg(short, long, env = "PULSE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Fan-out mode: sequential or concurrent.
    #[arg(long)]
    fan_out: Option<FanOut>,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Per-module level, e.g. `pulse_server=debug`. Repeatable.
    #[arg(long = "log-module", value_parser = parse_module_level)]
    log_modules: Vec<(String, Level)>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(fan_out) = self.fan_out {
            config.fan_out = fan_out;
        }
    }
}

fn parse_module_level(raw: &str) -> Result<(String, Level), String> {
    let (module, level) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected MODULE=LEVEL, got {raw:?}"))?;
    if module.is_empty() {
        return Err(format!("missing module in {raw:?}"));
    }
    let level = level
        .parse::<Level>()
        .map_err(|e| format!("bad level in {raw:?}: {e}"))?;
    Ok((module.to_string(), level))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        module_levels: cli.log_modules.clone(),
        json: !cli.pretty,
    });

    let mut config = ServerConfig::load(cli.config.as_deref()).context("loading config")?;
    cli.apply(&mut config);
    config.validate().context("validating config")?;

    let handle = pulse_server::start(config, telemetry.metrics())
        .await
        .context("starting server")?;

    tracing::info!(port = handle.port, "Pulse server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_levels_from_flags() {
        let cli = Cli::parse_from([
            "pulse",
            "--log-module",
            "pulse_server=debug",
            "--log-module",
            "tower_http=trace",
        ]);
        assert_eq!(
            cli.log_modules,
            vec![
                ("pulse_server".to_string(), Level::DEBUG),
                ("tower_http".to_string(), Level::TRACE),
            ]
        );
    }

    #[test]
    fn malformed_module_level_is_rejected() {
        assert!(parse_module_level("pulse_server").is_err());
        assert!(parse_module_level("=debug").is_err());
        assert!(parse_module_level("pulse_server=loud").is_err());
        assert!(Cli::try_parse_from(["pulse", "--log-module", "nope"]).is_err());
    }

    #[test]
    fn cli_overrides_config() {
        let cli = Cli::parse_from(["pulse", "--port", "9000", "--fan-out", "concurrent"]);
        let mut config = ServerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.port, 9000);
        assert_eq!(config.fan_out, FanOut::Concurrent);
        assert_eq!(config.host, "127.0.0.1");
    }
}
