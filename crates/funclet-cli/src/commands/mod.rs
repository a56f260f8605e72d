//! CLI command definitions and dispatch.

pub mod plan;
pub mod serve;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use funclet_common::config::FuncletConfig;

/// funclet: node agent for pooled function containers.
#[derive(Parser, Debug)]
#[command(name = "funclet", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file; defaults apply when omitted.
    #[arg(long, global = true, env = "FUNCLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Overrides the pod name from the configuration.
    #[arg(long, global = true, env = "FUNCLET_POD_NAME")]
    pub pod_name: Option<String>,

    /// Overrides the number of container slots.
    #[arg(long, global = true, env = "FUNCLET_CONTAINER_NUM")]
    pub container_num: Option<usize>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the agent and run until interrupted.
    Serve(serve::ServeArgs),
    /// Print the node capacity plan and check that the pool fits.
    Plan(plan::PlanArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the command fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Serve(args) => serve::execute(config, args).await,
        Command::Plan(args) => plan::execute(&config, &args),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<FuncletConfig> {
    let mut config = match &cli.config {
        Some(path) => FuncletConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => FuncletConfig::default(),
    };
    if let Some(pod) = &cli.pod_name {
        config.pod_name.clone_from(pod);
    }
    if let Some(n) = cli.container_num {
        config.container_num = n;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from(["funclet", "plan", "--pod-name", "pod-7", "--container-num", "2"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.pod_name, "pod-7");
        assert_eq!(config.container_num, 2);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn zero_slots_rejected() {
        let cli = Cli::parse_from(["funclet", "serve", "--container-num", "0"]);
        assert!(load_config(&cli).is_err());
    }
}
