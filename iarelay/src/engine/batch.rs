use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use super::disk::FreeSpace;
use super::ledger::{LedgerError, parse_entries};
use super::orchestrator::{AbortReason, ItemJob, Orchestrator};
use super::paths::item_work_dir;
use super::relay::Relay;
use super::retry::{ArchiveSource, Sleeper};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to read identifier list {}: {source}", path.display())]
    ListFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// What to do with the rest of the list once an item aborts.
///
/// Under `Continue` each item works in `<local_path>/<identifier>`, so files
/// left behind by an aborted item are never relayed under a later item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchPolicy {
    #[default]
    AbortOnError,
    Continue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: Vec<String>,
    /// Already in the completed-items ledger.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, AbortReason)>,
    /// Identifiers never started because the batch stopped early.
    pub not_attempted: Vec<String>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.not_attempted.is_empty()
    }
}

pub async fn read_identifiers(path: &Path) -> Result<Vec<String>, BatchError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BatchError::ListFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse_entries(&text))
}

/// Runs one item after another through the orchestrator.
pub async fn run_batch<A, R, S, F>(
    orchestrator: &Orchestrator<A, R, S, F>,
    identifiers: &[String],
    local_path: &Path,
    remote_path: &str,
    policy: BatchPolicy,
) -> Result<BatchSummary, BatchError>
where
    A: ArchiveSource,
    R: Relay,
    S: Sleeper,
    F: FreeSpace,
{
    let done = if orchestrator.options().resume {
        orchestrator.ledger().completed_items().await?
    } else {
        Default::default()
    };
    let mut summary = BatchSummary::default();

    for (index, identifier) in identifiers.iter().enumerate() {
        info!(
            identifier = %identifier,
            position = index + 1,
            total = identifiers.len(),
            "processing list entry"
        );
        if done.contains(identifier) {
            info!(identifier = %identifier, "skipping already completed item");
            summary.skipped.push(identifier.clone());
            continue;
        }

        let work_dir = match policy {
            BatchPolicy::AbortOnError => local_path.to_path_buf(),
            BatchPolicy::Continue => match item_work_dir(local_path, identifier) {
                Ok(dir) => dir,
                Err(err) => {
                    error!(identifier = %identifier, error = %err, "unusable identifier");
                    summary.failed.push((identifier.clone(), AbortReason::Other));
                    continue;
                }
            },
        };
        let job = ItemJob::new(identifier.as_str(), work_dir, remote_path);
        match orchestrator.transfer_item(&job).await {
            Ok(_) => summary.completed.push(identifier.clone()),
            Err(err) => {
                let reason = err.abort_reason();
                error!(identifier = %identifier, %reason, error = %err, "item failed");
                summary.failed.push((identifier.clone(), reason));
                if policy == BatchPolicy::AbortOnError {
                    summary.not_attempted = identifiers[index + 1..].to_vec();
                    break;
                }
            }
        }
    }

    info!(
        completed = summary.completed.len(),
        skipped = summary.skipped.len(),
        failed = summary.failed.len(),
        not_attempted = summary.not_attempted.len(),
        "finished saving items from list"
    );
    Ok(summary)
}
