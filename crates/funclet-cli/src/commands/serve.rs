//! `funclet serve`: run the agent until Ctrl-C.

use anyhow::Context;
use clap::Args;
use funclet_common::config::FuncletConfig;
use funclet_runtime::engine::{Collaborators, Funclet};

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Shut down right after startup instead of waiting for Ctrl-C.
    #[arg(long)]
    pub once: bool,
}

/// Executes the `serve` command.
///
/// Builds the host collaborators, starts every container slot, then waits
/// for Ctrl-C and shuts the background loops down.
///
/// # Errors
///
/// Returns an error if the runtime binary is missing or startup fails.
pub async fn execute(config: FuncletConfig, args: ServeArgs) -> anyhow::Result<()> {
    let collaborators = Collaborators::host(&config).context("resolving host collaborators")?;
    let funclet = Funclet::new(config, collaborators)?;
    funclet.start().await.context("starting funclet")?;

    if !args.once {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        tracing::info!("interrupt received, shutting down");
    }
    funclet.shutdown().await;
    Ok(())
}
