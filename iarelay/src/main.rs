use std::process::ExitCode;

use clap::Parser;
use iarelay::cli::Cli;
use iarelay::config::Config;
use iarelay::{logging, runner};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?.with_cli_overrides(&cli);
    if let Some(path) = logging::init(config.log_dir.as_deref())? {
        tracing::info!(path = %path.display(), "logging to file");
    }
    tracing::debug!(?cli, ?config, "starting");

    let status = runner::run(cli, config).await?;
    tracing::info!(?status, "finished");
    Ok(status.exit_code())
}
