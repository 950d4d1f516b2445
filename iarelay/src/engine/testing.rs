//! In-memory stand-ins for the engine's collaborators.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use iarelay_core::{
    ArchiveError, ArchiveFile, DownloadOutcome, FileFilter, Item, local_path_for,
};

use super::disk::FreeSpace;
use super::relay::{Relay, RelayError};
use super::retry::{ArchiveSource, Sleeper};

/// Bytes a healthy download of `name` produces.
pub fn payload(name: &str) -> Vec<u8> {
    format!("payload of {name}").into_bytes()
}

/// A regular file whose recorded checksum matches [`payload`].
pub fn archive_file(name: &str) -> ArchiveFile {
    let data = payload(name);
    ArchiveFile {
        name: name.to_string(),
        size: data.len() as u64,
        md5: Some(format!("{:x}", md5::compute(&data))),
        format: Some("Text PDF".into()),
        source: Some("original".into()),
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    /// Writes the healthy payload and reports success.
    WriteExpected,
    /// Writes these bytes and reports success.
    Write(Vec<u8>),
    Skip,
    Fail,
    ConnectionRefused,
    NotFound,
}

pub struct FakeArchive {
    files: Option<Vec<ArchiveFile>>,
    items: HashMap<String, Vec<ArchiveFile>>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    downloads: Mutex<Vec<String>>,
}

impl FakeArchive {
    pub fn new(files: Vec<ArchiveFile>) -> Self {
        Self {
            files: Some(files),
            items: HashMap::new(),
            scripts: Mutex::new(HashMap::new()),
            downloads: Mutex::new(Vec::new()),
        }
    }

    /// An archive that does not know the requested item.
    pub fn missing() -> Self {
        Self {
            files: None,
            items: HashMap::new(),
            scripts: Mutex::new(HashMap::new()),
            downloads: Mutex::new(Vec::new()),
        }
    }

    /// Lists `files` for `identifier` instead of the shared file list.
    pub fn with_item(mut self, identifier: &str, files: Vec<ArchiveFile>) -> Self {
        self.items.insert(identifier.to_string(), files);
        self
    }

    /// Queues per-attempt behavior for `name`. Unscripted attempts write the
    /// healthy payload.
    pub fn script(&self, name: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(name.to_string(), steps.into());
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn download_calls(&self, name: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .iter()
            .filter(|called| called.as_str() == name)
            .count()
    }

    fn next_step(&self, name: &str) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::WriteExpected)
    }
}

impl ArchiveSource for FakeArchive {
    async fn list_files(
        &self,
        identifier: &str,
        filter: Option<&FileFilter>,
    ) -> Result<Item, ArchiveError> {
        let Some(files) = self.items.get(identifier).or(self.files.as_ref()) else {
            return Err(ArchiveError::NotFound {
                url: format!("fake://metadata/{identifier}"),
            });
        };
        let files_count = files.len() as u64;
        let files = files
            .iter()
            .filter(|file| filter.is_none_or(|filter| filter.matches(&file.name)))
            .cloned()
            .collect();
        Ok(Item {
            identifier: identifier.to_string(),
            files_count,
            files,
        })
    }

    async fn download_file(
        &self,
        identifier: &str,
        file: &ArchiveFile,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, ArchiveError> {
        self.downloads.lock().unwrap().push(file.name.clone());
        let bytes = match self.next_step(&file.name) {
            Step::WriteExpected => payload(&file.name),
            Step::Write(bytes) => bytes,
            Step::Skip => return Ok(DownloadOutcome::Skipped),
            Step::Fail => return Ok(DownloadOutcome::Failed),
            Step::ConnectionRefused => return Err(connection_refused().await),
            Step::NotFound => {
                return Err(ArchiveError::NotFound {
                    url: format!("fake://download/{identifier}/{}", file.name),
                });
            }
        };
        let target = local_path_for(dest_dir, &file.name)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, bytes)?;
        Ok(DownloadOutcome::Downloaded)
    }
}

/// A genuine transport error: nothing listens on the discard port.
async fn connection_refused() -> ArchiveError {
    match reqwest::get("http://127.0.0.1:9/").await {
        Err(err) => ArchiveError::Request(err),
        Ok(response) => ArchiveError::Status {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            url: response.url().to_string(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCall {
    pub local: PathBuf,
    pub remote: String,
    /// Files found (and removed) under `local` at call time, sorted.
    pub moved: Vec<String>,
}

/// Emulates move semantics by deleting whatever it relays.
#[derive(Default)]
pub struct FakeRelay {
    calls: Mutex<Vec<RelayCall>>,
    fail_on_call: Option<usize>,
}

impl FakeRelay {
    /// Fails the `n`th relay call (1-based) with exit status 1.
    pub fn failing_on(n: usize) -> Self {
        Self {
            fail_on_call: Some(n),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<RelayCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Relay for FakeRelay {
    async fn relay(&self, local: &Path, remote: &str) -> Result<(), RelayError> {
        let call_number = self.calls.lock().unwrap().len() + 1;
        if self.fail_on_call == Some(call_number) {
            self.calls.lock().unwrap().push(RelayCall {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                moved: Vec::new(),
            });
            return Err(RelayError::ExitStatus { code: Some(1) });
        }
        let mut moved = Vec::new();
        drain_files(local, local, &mut moved).map_err(|source| RelayError::Capture {
            path: local.to_path_buf(),
            source,
        })?;
        moved.sort();
        self.calls.lock().unwrap().push(RelayCall {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            moved,
        });
        Ok(())
    }

    async fn list_children(&self, _remote: &str, _max_depth: u32) -> Option<Vec<String>> {
        Some(self.calls().into_iter().flat_map(|call| call.moved).collect())
    }
}

fn drain_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            drain_files(root, &path, out)?;
        } else {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedFreeSpace(pub u64);

impl FreeSpace for FixedFreeSpace {
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}
