mod checksum;
mod client;
mod fetch;
mod filter;

pub use checksum::local_md5;
pub use client::{
    ArchiveClient, ArchiveError, ArchiveFile, DownloadOutcome, ErrorClass, Item, METADATA_FORMAT,
    REQUEST_TIMEOUT, local_path_for,
};
pub use fetch::{FetchOptions, FetchPolicy};
pub use filter::FileFilter;
