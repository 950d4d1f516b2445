use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Per-item ledger file: `<root>/done_files/<identifier>.txt`.
pub fn item_ledger_path(root: &Path, identifier: &str) -> Result<PathBuf, PathError> {
    check_identifier(identifier)?;
    Ok(root.join("done_files").join(format!("{identifier}.txt")))
}

/// Private working directory for one item: `<root>/<identifier>`.
pub fn item_work_dir(root: &Path, identifier: &str) -> Result<PathBuf, PathError> {
    check_identifier(identifier)?;
    Ok(root.join(identifier))
}

/// Remote destination for an item. Identifiers are assumed filesystem safe.
pub fn remote_item_path(remote_root: &str, identifier: &str) -> String {
    if remote_root.is_empty() {
        identifier.to_string()
    } else if remote_root.ends_with('/') || remote_root.ends_with(':') {
        format!("{remote_root}{identifier}")
    } else {
        format!("{remote_root}/{identifier}")
    }
}

fn check_identifier(identifier: &str) -> Result<(), PathError> {
    if identifier.is_empty() {
        return Err(PathError::Empty);
    }
    if identifier.contains(['/', '\\']) {
        return Err(PathError::UnsupportedComponent(identifier.to_string()));
    }
    match Path::new(identifier).components().next() {
        Some(Component::Normal(_)) => Ok(()),
        _ => Err(PathError::UnsupportedComponent(identifier.to_string())),
    }
}
