use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::paths::{PathError, item_ledger_path};

const DONE_ITEMS_FILE: &str = "done_identifiers.txt";
const DOWNLOADS_FILE: &str = "downloads.txt";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] PathError),
    #[error("ledger entries cannot contain line breaks: {0:?}")]
    InvalidEntry(String),
}

/// Completed file names of one item. Duplicated lines are counted, not
/// rejected; presence of a key is what matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemLedger {
    counts: HashMap<String, u32>,
}

impl ItemLedger {
    pub fn contains(&self, name: &str) -> bool {
        self.counts.contains_key(name)
    }

    pub fn insert(&mut self, name: &str) {
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> u32 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }
}

/// Append-only flat-file record of finished work under a state directory.
#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn item_path(&self, identifier: &str) -> Result<PathBuf, LedgerError> {
        Ok(item_ledger_path(&self.root, identifier)?)
    }

    pub fn done_items_path(&self) -> PathBuf {
        self.root.join(DONE_ITEMS_FILE)
    }

    pub fn downloads_path(&self) -> PathBuf {
        self.root.join(DOWNLOADS_FILE)
    }

    pub async fn load(&self, identifier: &str) -> Result<ItemLedger, LedgerError> {
        let path = self.item_path(identifier)?;
        let mut ledger = ItemLedger::default();
        for entry in read_entries(&path).await? {
            ledger.insert(&entry);
        }
        Ok(ledger)
    }

    pub async fn has_file(&self, identifier: &str, name: &str) -> Result<bool, LedgerError> {
        Ok(self.load(identifier).await?.contains(name))
    }

    pub async fn mark_file(&self, identifier: &str, name: &str) -> Result<(), LedgerError> {
        let path = self.item_path(identifier)?;
        let header = format!("# completed files of {identifier}");
        append_entry(&path, &header, name).await?;
        debug!(identifier, file = name, "ledgered file");
        Ok(())
    }

    pub async fn completed_items(&self) -> Result<HashSet<String>, LedgerError> {
        Ok(read_entries(&self.done_items_path())
            .await?
            .into_iter()
            .collect())
    }

    pub async fn has_item(&self, identifier: &str) -> Result<bool, LedgerError> {
        Ok(self.completed_items().await?.contains(identifier))
    }

    pub async fn mark_item(&self, identifier: &str) -> Result<(), LedgerError> {
        append_entry(&self.done_items_path(), "# completed items", identifier).await?;
        debug!(identifier, "ledgered item");
        Ok(())
    }

    /// Audit trail of every verified download, as `identifier/name` lines.
    pub async fn log_download(&self, identifier: &str, name: &str) -> Result<(), LedgerError> {
        let entry = format!("{identifier}/{name}");
        append_entry(&self.downloads_path(), "# verified downloads", &entry).await
    }
}

/// Non-blank, non-comment lines of a list file, trimmed, in file order.
pub fn parse_entries(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Reads a list file; a missing file is an empty list.
pub async fn read_entries(path: &Path) -> Result<Vec<String>, LedgerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(parse_entries(&text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn append_entry(path: &Path, header: &str, entry: &str) -> Result<(), LedgerError> {
    if entry.contains(['\n', '\r']) {
        return Err(LedgerError::InvalidEntry(entry.to_string()));
    }
    let io_err = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let existed = tokio::fs::try_exists(path).await.map_err(io_err)?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;

    let mut buf = String::new();
    if !existed {
        buf.push_str(header);
        buf.push('\n');
    }
    buf.push_str(entry);
    buf.push('\n');
    file.write_all(buf.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}
