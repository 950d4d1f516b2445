use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber: stderr always, plus a plain-text file
/// under `log_dir` when given. Returns the log file path, if any.
pub fn init(log_dir: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir at {dir:?}"))?;
            let path = dir.join(log_file_name(OffsetDateTime::now_utc())?);
            let file = std::fs::File::create(&path)
                .with_context(|| format!("failed to create log file at {path:?}"))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(log_path)
}

pub fn log_file_name(now: OffsetDateTime) -> anyhow::Result<String> {
    let stamp = now
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .context("failed to format log timestamp")?;
    Ok(format!("iarelay.{stamp}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn log_file_name_uses_compact_utc_stamp() {
        let name = log_file_name(datetime!(2024-03-09 07:05:01 UTC)).unwrap();
        assert_eq!(name, "iarelay.20240309T070501Z.log");
    }
}
