use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::checksum::local_md5;
use crate::fetch::{FetchOptions, FetchPolicy};
use crate::filter::FileFilter;

const DEFAULT_BASE_URL: &str = "https://archive.org";
const USER_AGENT: &str = concat!("iarelay/", env!("CARGO_PKG_VERSION"));

/// Per-call network timeout (connect and per-read).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Format tag of the item's self-describing files list. Its recorded
/// checksum can never match its own contents.
pub const METADATA_FORMAT: &str = "Metadata";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid metadata: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("unexpected status {status} from {url}")]
    Status { status: StatusCode, url: String },
    #[error("response from {url} too small: {size} < {minimum} bytes")]
    TooSmall {
        url: String,
        size: usize,
        minimum: usize,
    },
    #[error("giving up on {url} after {attempts} attempts")]
    GaveUp {
        url: String,
        attempts: u32,
        /// Failure of the final try, if any try ran.
        #[source]
        last: Option<Box<ArchiveError>>,
    },
    #[error("file name is not a safe relative path: {0}")]
    UnsafeName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

impl ArchiveError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            ArchiveError::Request(err) if !err.is_builder() => ErrorClass::Transient,
            ArchiveError::TooSmall { .. } => ErrorClass::Transient,
            ArchiveError::NotFound { .. } => ErrorClass::NotFound,
            ArchiveError::Status { status, .. } => classify_status(*status),
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.classification(),
            ErrorClass::RateLimit | ErrorClass::Transient
        )
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if status == StatusCode::NOT_FOUND {
        ErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArchiveFile {
    pub name: String,
    #[serde(default, deserialize_with = "size_from_text_or_number")]
    pub size: u64,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl ArchiveFile {
    pub fn is_metadata_exempt(&self) -> bool {
        self.format.as_deref() == Some(METADATA_FORMAT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub identifier: String,
    pub files_count: u64,
    pub files: Vec<ArchiveFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    /// Already on disk with the expected checksum; nothing transferred.
    Skipped,
    Failed,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    #[serde(default)]
    files: Option<Vec<ArchiveFile>>,
    #[serde(default)]
    files_count: Option<u64>,
}

#[derive(Clone)]
pub struct ArchiveClient {
    pub(crate) http: Client,
    base_url: Url,
    pub(crate) policy: FetchPolicy,
}

impl ArchiveClient {
    pub fn new() -> Result<Self, ArchiveError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ArchiveError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(REQUEST_TIMEOUT)
            .read_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            policy: FetchPolicy::default(),
        })
    }

    pub fn with_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get_item(&self, identifier: &str) -> Result<Item, ArchiveError> {
        let url = self.endpoint(["metadata", identifier])?;
        let body = self.fetch(url.clone(), &FetchOptions::default()).await?;
        let payload: MetadataResponse = serde_json::from_slice(&body)?;
        // Unknown identifiers come back as `{}` with a 200.
        let files = payload.files.ok_or_else(|| ArchiveError::NotFound {
            url: url.to_string(),
        })?;
        let files_count = payload.files_count.unwrap_or(files.len() as u64);
        Ok(Item {
            identifier: identifier.to_string(),
            files_count,
            files,
        })
    }

    pub async fn list_files(
        &self,
        identifier: &str,
        filter: Option<&FileFilter>,
    ) -> Result<Item, ArchiveError> {
        let mut item = self.get_item(identifier).await?;
        if let Some(filter) = filter {
            item.files.retain(|file| filter.matches(&file.name));
            debug!(
                identifier,
                pattern = filter.as_str(),
                kept = item.files.len(),
                "applied file filter"
            );
        }
        Ok(item)
    }

    pub fn download_url(&self, identifier: &str, file_name: &str) -> Result<Url, ArchiveError> {
        self.endpoint(["download", identifier].into_iter().chain(file_name.split('/')))
    }

    pub async fn download_file(
        &self,
        identifier: &str,
        file: &ArchiveFile,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, ArchiveError> {
        let target = local_path_for(dest_dir, &file.name)?;
        if self.is_present(file, &target).await? {
            debug!(identifier, file = %file.name, "checksum matches local copy, skipping");
            return Ok(DownloadOutcome::Skipped);
        }

        let url = self.download_url(identifier, &file.name)?;
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ArchiveError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            warn!(%url, %status, "download rejected");
            return Ok(DownloadOutcome::Failed);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        if let Err(err) = write_partial(response, &partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        debug!(identifier, file = %file.name, path = %target.display(), "download complete");
        Ok(DownloadOutcome::Downloaded)
    }

    async fn is_present(&self, file: &ArchiveFile, target: &Path) -> Result<bool, ArchiveError> {
        let meta = match tokio::fs::metadata(target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if !meta.is_file() || file.is_metadata_exempt() {
            return Ok(false);
        }
        match file.md5.as_deref() {
            Some(expected) => Ok(local_md5(target).await? == expected.to_ascii_lowercase()),
            None => Ok(false),
        }
    }

    fn endpoint<'a, I>(&self, segments: I) -> Result<Url, ArchiveError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Streams the body into `partial`, syncs it and renames it over `target`.
/// The caller removes `partial` when this fails.
async fn write_partial(
    response: reqwest::Response,
    partial: &Path,
    target: &Path,
) -> Result<(), ArchiveError> {
    let mut out = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);
    tokio::fs::rename(partial, target).await?;
    Ok(())
}

/// Maps an item file name (which may contain `/`) under `dest_dir`.
pub fn local_path_for(dest_dir: &Path, file_name: &str) -> Result<PathBuf, ArchiveError> {
    if file_name.is_empty() {
        return Err(ArchiveError::UnsafeName(file_name.to_string()));
    }
    let mut out = dest_dir.to_path_buf();
    for component in Path::new(file_name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafeName(file_name.to_string()));
            }
        }
    }
    Ok(out)
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn size_from_text_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Raw::Number(value)) => Ok(value),
        Some(Raw::Text(value)) => value.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_nested_file_name_under_dest() {
        let mapped = local_path_for(Path::new("/work"), "scans/page1.jp2").unwrap();
        assert_eq!(mapped, PathBuf::from("/work/scans/page1.jp2"));
    }

    #[test]
    fn rejects_parent_dir_in_file_name() {
        assert!(matches!(
            local_path_for(Path::new("/work"), "../escape"),
            Err(ArchiveError::UnsafeName(_))
        ));
        assert!(matches!(
            local_path_for(Path::new("/work"), "/etc/passwd"),
            Err(ArchiveError::UnsafeName(_))
        ));
    }

    #[test]
    fn partial_path_keeps_extension() {
        assert_eq!(
            partial_path(Path::new("/work/a.pdf")),
            PathBuf::from("/work/a.pdf.partial")
        );
        assert_eq!(
            partial_path(Path::new("/work/README")),
            PathBuf::from("/work/README.partial")
        );
    }

    #[test]
    fn decodes_size_from_string_or_number() {
        let file: ArchiveFile =
            serde_json::from_str(r#"{"name":"a.txt","size":"1024","md5":"x"}"#).unwrap();
        assert_eq!(file.size, 1024);
        let file: ArchiveFile = serde_json::from_str(r#"{"name":"b.txt","size":7}"#).unwrap();
        assert_eq!(file.size, 7);
        let file: ArchiveFile = serde_json::from_str(r#"{"name":"c.txt"}"#).unwrap();
        assert_eq!(file.size, 0);
        assert!(file.md5.is_none());
    }

    #[test]
    fn metadata_format_is_exempt() {
        let file = ArchiveFile {
            name: "item_files.xml".into(),
            size: 10,
            md5: None,
            format: Some(METADATA_FORMAT.into()),
            source: Some("original".into()),
        };
        assert!(file.is_metadata_exempt());
    }

    #[test]
    fn classifies_statuses() {
        let err = |status| ArchiveError::Status {
            status,
            url: "u".into(),
        };
        assert!(err(StatusCode::BAD_GATEWAY).is_transient());
        assert!(err(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!err(StatusCode::FORBIDDEN).is_transient());
        assert!(
            !ArchiveError::NotFound { url: "u".into() }.is_transient(),
            "not-found must never be retried"
        );
        assert_eq!(
            ArchiveError::NotFound { url: "u".into() }.classification(),
            ErrorClass::NotFound
        );
    }
}
