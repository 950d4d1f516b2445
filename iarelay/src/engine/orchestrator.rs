use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use iarelay_core::{ArchiveError, FileFilter};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::disk::{DiskError, DiskGuard, FreeSpace, VolumeFreeSpace};
use super::ledger::{ItemLedger, Ledger, LedgerError};
use super::paths::remote_item_path;
use super::relay::{Relay, RelayError};
use super::retry::{ArchiveSource, Delivered, RetryEngine, Sleeper, TokioSleeper, TransferError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("disk guard: {0}")]
    Disk(#[from] DiskError),
    #[error("too many download failures for {file} after {attempts} attempts")]
    RetriesExhausted { file: String, attempts: u32 },
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<TransferError> for OrchestratorError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::RetriesExhausted { file, attempts } => {
                OrchestratorError::RetriesExhausted { file, attempts }
            }
            TransferError::Archive(err) => OrchestratorError::Archive(err),
            TransferError::Checksum { path, source } => OrchestratorError::Io { path, source },
            TransferError::Ledger(err) => OrchestratorError::Ledger(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Disk,
    Retries,
    Relay,
    Other,
}

impl OrchestratorError {
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            OrchestratorError::Disk(_) => AbortReason::Disk,
            OrchestratorError::RetriesExhausted { .. } => AbortReason::Retries,
            OrchestratorError::Relay(_) => AbortReason::Relay,
            _ => AbortReason::Other,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AbortReason::Disk => "aborted_disk",
            AbortReason::Retries => "aborted_retries",
            AbortReason::Relay => "aborted_relay",
            AbortReason::Other => "aborted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Start,
    Preparing,
    Transferring { index: usize, total: usize },
    Relaying,
    Completed,
    Aborted(AbortReason),
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Start => f.write_str("start"),
            ItemState::Preparing => f.write_str("preparing"),
            ItemState::Transferring { index, total } => {
                write!(f, "transferring({index} of {total})")
            }
            ItemState::Relaying => f.write_str("relaying"),
            ItemState::Completed => f.write_str("completed"),
            ItemState::Aborted(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemJob {
    pub identifier: String,
    /// Local working directory; files land directly under it.
    pub local_path: PathBuf,
    /// Remote root; the item goes to `<remote_path>/<identifier>`.
    pub remote_path: String,
}

impl ItemJob {
    pub fn new(
        identifier: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }

    pub fn remote_item_path(&self) -> String {
        remote_item_path(&self.remote_path, &self.identifier)
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Relay after every N completed files. `None` or `Some(0)` disables
    /// interim relays; the final relay always runs.
    pub upload_every: Option<u32>,
    /// Skip files already in the item ledger.
    pub resume: bool,
    pub max_attempts: u32,
    /// List and log files without guarding, downloading or ledgering.
    pub archive_dry_run: bool,
    pub file_filter: Option<FileFilter>,
    pub backoff: Backoff,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            upload_every: None,
            resume: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            archive_dry_run: false,
            file_filter: None,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemSummary {
    pub identifier: String,
    pub total_files: usize,
    /// Downloaded and verified in this run.
    pub transferred: usize,
    /// Found valid on disk by the client.
    pub already_present: usize,
    /// Skipped because the ledger already had them.
    pub skipped: usize,
    /// Only listed (archive dry run).
    pub listed: usize,
    pub relays: usize,
    pub completed: bool,
}

impl ItemSummary {
    fn completed_files(&self) -> usize {
        self.transferred + self.already_present
    }
}

pub struct Orchestrator<A, R, S = TokioSleeper, F = VolumeFreeSpace> {
    archive: A,
    relay: R,
    ledger: Ledger,
    sleeper: S,
    guard: DiskGuard<F>,
    options: TransferOptions,
}

impl<A: ArchiveSource, R: Relay> Orchestrator<A, R> {
    pub fn new(archive: A, relay: R, ledger: Ledger, options: TransferOptions) -> Self {
        Self {
            archive,
            relay,
            ledger,
            sleeper: TokioSleeper,
            guard: DiskGuard::new(VolumeFreeSpace),
            options,
        }
    }
}

impl<A, R, S, F> Orchestrator<A, R, S, F> {
    pub fn with_sleeper<S2>(self, sleeper: S2) -> Orchestrator<A, R, S2, F> {
        Orchestrator {
            archive: self.archive,
            relay: self.relay,
            ledger: self.ledger,
            sleeper,
            guard: self.guard,
            options: self.options,
        }
    }

    pub fn with_free_space<F2: FreeSpace>(self, probe: F2) -> Orchestrator<A, R, S, F2> {
        Orchestrator {
            archive: self.archive,
            relay: self.relay,
            ledger: self.ledger,
            sleeper: self.sleeper,
            guard: DiskGuard::new(probe),
            options: self.options,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }
}

impl<A, R, S, F> Orchestrator<A, R, S, F>
where
    A: ArchiveSource,
    R: Relay,
    S: Sleeper,
    F: FreeSpace,
{
    /// Downloads, verifies and relays every file of one item.
    ///
    /// Any error leaves the ledger with the files finished so far, so a
    /// later run resumes where this one stopped.
    pub async fn transfer_item(&self, job: &ItemJob) -> Result<ItemSummary, OrchestratorError> {
        let mut summary = ItemSummary {
            identifier: job.identifier.clone(),
            ..ItemSummary::default()
        };
        enter(&job.identifier, ItemState::Start);
        match self.run(job, &mut summary).await {
            Ok(()) => Ok(summary),
            Err(err) => {
                enter(&job.identifier, ItemState::Aborted(err.abort_reason()));
                warn!(
                    identifier = %job.identifier,
                    transferred = summary.transferred,
                    error = %err,
                    "item aborted"
                );
                Err(err)
            }
        }
    }

    async fn run(&self, job: &ItemJob, summary: &mut ItemSummary) -> Result<(), OrchestratorError> {
        let identifier = job.identifier.as_str();
        let local = job.local_path.as_path();

        enter(identifier, ItemState::Preparing);
        let remote = job.remote_item_path();
        debug!(identifier, remote = %remote, local = %local.display(), "item paths");
        tokio::fs::create_dir_all(local)
            .await
            .map_err(|source| OrchestratorError::Io {
                path: local.to_path_buf(),
                source,
            })?;
        let done: ItemLedger = self.ledger.load(identifier).await?;
        debug!(identifier, ledgered = done.len(), "loaded item ledger");

        let item = self
            .archive
            .list_files(identifier, self.options.file_filter.as_ref())
            .await?;
        summary.total_files = item.files.len();
        info!(
            identifier,
            files = item.files.len(),
            files_count = item.files_count,
            "enumerated item files"
        );

        let engine = RetryEngine::new(
            &self.archive,
            &self.sleeper,
            &self.ledger,
            self.options.backoff,
        );
        let upload_every = self.options.upload_every.filter(|n| *n > 0);

        for (index, file) in item.files.iter().enumerate() {
            enter(
                identifier,
                ItemState::Transferring {
                    index: index + 1,
                    total: summary.total_files,
                },
            );
            if self.options.resume && done.contains(&file.name) {
                info!(identifier, file = %file.name, "skipping already downloaded file");
                summary.skipped += 1;
                continue;
            }
            if self.options.archive_dry_run {
                info!(identifier, file = %file.name, size = file.size, "dry run: would download");
                summary.listed += 1;
                continue;
            }

            self.guard.ensure_room_for(file.size, local)?;
            let report = engine
                .download_with_retry(identifier, file, local, self.options.max_attempts)
                .await?;
            self.ledger.mark_file(identifier, &file.name).await?;
            match report.outcome {
                Delivered::Downloaded => summary.transferred += 1,
                Delivered::AlreadyPresent => summary.already_present += 1,
            }

            if let Some(every) = upload_every
                && summary.completed_files() % every as usize == 0
            {
                self.relay_to(local, &remote, summary).await?;
            }
        }
        debug!(identifier, "finished all downloading");

        if self.options.archive_dry_run {
            info!(identifier, listed = summary.listed, "dry run finished, item left unmarked");
            return Ok(());
        }

        enter(identifier, ItemState::Relaying);
        self.relay_to(local, &remote, summary).await?;
        self.ledger.mark_item(identifier).await?;
        summary.completed = true;
        enter(identifier, ItemState::Completed);
        info!(
            identifier,
            transferred = summary.transferred,
            already_present = summary.already_present,
            skipped = summary.skipped,
            relays = summary.relays,
            "finished work for item"
        );
        Ok(())
    }

    async fn relay_to(
        &self,
        local: &Path,
        remote: &str,
        summary: &mut ItemSummary,
    ) -> Result<(), OrchestratorError> {
        self.relay.relay(local, remote).await?;
        summary.relays += 1;
        Ok(())
    }
}

fn enter(identifier: &str, state: ItemState) {
    debug!(identifier, state = %state, "item state");
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
