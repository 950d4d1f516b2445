use std::process::ExitCode;

use anyhow::Context;
use iarelay_core::{ArchiveClient, FileFilter};
use tracing::{error, info};

use crate::cli::{Cli, Commands, TransferArgs};
use crate::config::Config;
use crate::engine::backoff::Backoff;
use crate::engine::batch::{BatchPolicy, read_identifiers, run_batch};
use crate::engine::ledger::Ledger;
use crate::engine::orchestrator::{AbortReason, ItemJob, Orchestrator, TransferOptions};
use crate::engine::relay::{RcloneRelay, Relay, RelayOptions};

/// How a command ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Aborted(AbortReason),
    /// A batch where at least one item did not complete.
    Incomplete,
    /// A listing that produced no data.
    NoData,
}

impl RunStatus {
    pub fn exit_code(self) -> ExitCode {
        match self {
            RunStatus::Success => ExitCode::SUCCESS,
            RunStatus::Aborted(AbortReason::Disk) => ExitCode::from(3),
            RunStatus::Aborted(AbortReason::Retries) => ExitCode::from(4),
            RunStatus::Aborted(AbortReason::Relay) => ExitCode::from(5),
            RunStatus::Aborted(AbortReason::Other) | RunStatus::Incomplete | RunStatus::NoData => {
                ExitCode::FAILURE
            }
        }
    }
}

pub async fn run(cli: Cli, config: Config) -> anyhow::Result<RunStatus> {
    match cli.command {
        Commands::Item {
            identifier,
            local_path,
            remote_path,
            transfer,
        } => {
            let orchestrator = build_orchestrator(&config, &transfer)?;
            let job = ItemJob::new(identifier, local_path, remote_path);
            match orchestrator.transfer_item(&job).await {
                Ok(summary) => {
                    info!(?summary, "item finished");
                    Ok(RunStatus::Success)
                }
                Err(err) => {
                    error!(identifier = %job.identifier, error = %err, "item aborted");
                    Ok(RunStatus::Aborted(err.abort_reason()))
                }
            }
        }
        Commands::Batch {
            list_path,
            local_path,
            remote_path,
            transfer,
            keep_going,
        } => {
            let identifiers = read_identifiers(&list_path).await?;
            info!(list = %list_path.display(), count = identifiers.len(), "processing list file");
            let orchestrator = build_orchestrator(&config, &transfer)?;
            let policy = if keep_going {
                BatchPolicy::Continue
            } else {
                BatchPolicy::AbortOnError
            };
            let summary =
                run_batch(&orchestrator, &identifiers, &local_path, &remote_path, policy).await?;
            if summary.is_success() {
                Ok(RunStatus::Success)
            } else {
                for (identifier, reason) in &summary.failed {
                    error!(identifier = %identifier, %reason, "item did not complete");
                }
                Ok(RunStatus::Incomplete)
            }
        }
        Commands::Ls {
            remote_path,
            max_depth,
            rc_logfile,
        } => {
            let relay = build_relay(
                &config,
                RelayOptions {
                    log_file: rc_logfile,
                    ..RelayOptions::default()
                },
            );
            match relay.list_children(&remote_path, max_depth).await {
                Some(children) => {
                    for child in children {
                        println!("{child}");
                    }
                    Ok(RunStatus::Success)
                }
                None => {
                    error!(remote = %remote_path, "could not list remote");
                    Ok(RunStatus::NoData)
                }
            }
        }
    }
}

pub fn build_orchestrator(
    config: &Config,
    args: &TransferArgs,
) -> anyhow::Result<Orchestrator<ArchiveClient, RcloneRelay>> {
    let client = ArchiveClient::with_base_url(&config.archive_url)
        .with_context(|| format!("invalid archive url {:?}", config.archive_url))?;
    let relay = build_relay(config, relay_options(args));
    let ledger = Ledger::new(&config.state_dir);
    Ok(Orchestrator::new(
        client,
        relay,
        ledger,
        transfer_options(config, args)?,
    ))
}

pub fn transfer_options(config: &Config, args: &TransferArgs) -> anyhow::Result<TransferOptions> {
    let file_filter = args
        .file_glob
        .as_deref()
        .map(FileFilter::new)
        .transpose()
        .context("invalid --file-glob pattern")?;
    Ok(TransferOptions {
        upload_every: args.upload_every,
        resume: !args.no_resume,
        max_attempts: args.max_attempts.unwrap_or(config.max_attempts),
        archive_dry_run: args.ia_dry_run,
        file_filter,
        backoff: Backoff::default(),
    })
}

pub fn relay_options(args: &TransferArgs) -> RelayOptions {
    RelayOptions {
        bwlimit: args.rc_bwlimit.clone(),
        log_file: args.rc_logfile.clone(),
        dry_run: args.rc_dry_run,
    }
}

fn build_relay(config: &Config, options: RelayOptions) -> RcloneRelay {
    RcloneRelay::new(&config.rclone_bin, &config.debug_dir).with_options(options)
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
