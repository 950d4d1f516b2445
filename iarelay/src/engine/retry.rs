use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use iarelay_core::{
    ArchiveClient, ArchiveError, ArchiveFile, DownloadOutcome, FileFilter, Item, local_md5,
    local_path_for,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::ledger::{Ledger, LedgerError};

/// The archive as seen by the transfer engine.
#[allow(async_fn_in_trait)]
pub trait ArchiveSource {
    async fn list_files(
        &self,
        identifier: &str,
        filter: Option<&FileFilter>,
    ) -> Result<Item, ArchiveError>;

    async fn download_file(
        &self,
        identifier: &str,
        file: &ArchiveFile,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, ArchiveError>;
}

impl ArchiveSource for ArchiveClient {
    async fn list_files(
        &self,
        identifier: &str,
        filter: Option<&FileFilter>,
    ) -> Result<Item, ArchiveError> {
        ArchiveClient::list_files(self, identifier, filter).await
    }

    async fn download_file(
        &self,
        identifier: &str,
        file: &ArchiveFile,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, ArchiveError> {
        ArchiveClient::download_file(self, identifier, file, dest_dir).await
    }
}

#[allow(async_fn_in_trait)]
pub trait Sleeper {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("too many download failures for {file} after {attempts} attempts")]
    RetriesExhausted { file: String, attempts: u32 },
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("failed to hash {}: {source}", path.display())]
    Checksum {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    /// Fetched in this call and verified.
    Downloaded,
    /// The client found a matching copy on disk and transferred nothing.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub attempts: u32,
    pub outcome: Delivered,
}

enum Verdict {
    Verified,
    Mismatch { actual: Option<String> },
}

pub struct RetryEngine<'a, A, S> {
    archive: &'a A,
    sleeper: &'a S,
    ledger: &'a Ledger,
    backoff: Backoff,
}

impl<'a, A: ArchiveSource, S: Sleeper> RetryEngine<'a, A, S> {
    pub fn new(archive: &'a A, sleeper: &'a S, ledger: &'a Ledger, backoff: Backoff) -> Self {
        Self {
            archive,
            sleeper,
            ledger,
            backoff,
        }
    }

    /// Materializes `file` under `dest_dir` in at most `max_attempts` attempts.
    ///
    /// Failed attempts, checksum mismatches and transient transport errors
    /// consume one attempt each. Non-transient archive errors end the loop
    /// immediately. A verified download is appended to the download audit
    /// list; marking the file done is left to the caller.
    pub async fn download_with_retry(
        &self,
        identifier: &str,
        file: &ArchiveFile,
        dest_dir: &Path,
        max_attempts: u32,
    ) -> Result<TransferReport, TransferError> {
        info!(identifier, file = %file.name, size = file.size, "attempting download");
        let local = local_path_for(dest_dir, &file.name)?;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.backoff.delay(attempt);
                info!(
                    identifier,
                    file = %file.name,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "download failure, waiting"
                );
                self.sleeper.sleep(delay).await;
            }
            debug!(attempt, max_attempts, file = %file.name, "download attempt");

            let outcome = match self.archive.download_file(identifier, file, dest_dir).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_transient() => {
                    error!(identifier, file = %file.name, attempt, error = %err, "connection error");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match outcome {
                DownloadOutcome::Failed => {
                    warn!(identifier, file = %file.name, attempt, "archive reported a failed download");
                }
                DownloadOutcome::Skipped => {
                    info!(identifier, file = %file.name, "no download needed, file already present");
                    return Ok(TransferReport {
                        attempts: attempt,
                        outcome: Delivered::AlreadyPresent,
                    });
                }
                DownloadOutcome::Downloaded => match self.verify(file, &local).await? {
                    Verdict::Verified => {
                        self.ledger.log_download(identifier, &file.name).await?;
                        return Ok(TransferReport {
                            attempts: attempt,
                            outcome: Delivered::Downloaded,
                        });
                    }
                    Verdict::Mismatch { actual } => {
                        error!(
                            path = %local.display(),
                            expected = file.md5.as_deref().unwrap_or("<none>"),
                            actual = actual.as_deref().unwrap_or("<unhashed>"),
                            "hash mismatch on downloaded file"
                        );
                    }
                },
            }
        }

        error!(identifier, file = %file.name, max_attempts, "too many download failures");
        Err(TransferError::RetriesExhausted {
            file: file.name.clone(),
            attempts: max_attempts,
        })
    }

    async fn verify(&self, file: &ArchiveFile, local: &Path) -> Result<Verdict, TransferError> {
        if file.is_metadata_exempt() {
            info!(file = %file.name, "skipping hash check for item metadata file");
            return Ok(Verdict::Verified);
        }
        let Some(expected) = file.md5.as_deref() else {
            return Ok(Verdict::Mismatch { actual: None });
        };
        let actual = local_md5(local)
            .await
            .map_err(|source| TransferError::Checksum {
                path: local.to_path_buf(),
                source,
            })?;
        if actual.eq_ignore_ascii_case(expected) {
            debug!(path = %local.display(), "hash correct on downloaded file");
            Ok(Verdict::Verified)
        } else {
            Ok(Verdict::Mismatch {
                actual: Some(actual),
            })
        }
    }
}
