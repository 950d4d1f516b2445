use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::cli::Cli;
use crate::engine::orchestrator::DEFAULT_MAX_ATTEMPTS;

const DEFAULT_ARCHIVE_URL: &str = "https://archive.org";
const DEFAULT_RCLONE_BIN: &str = "rclone";
const DEFAULT_DEBUG_DIR: &str = "debug";
const APP_DIR_NAME: &str = "iarelay";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Root of the resume ledgers.
    pub state_dir: PathBuf,
    /// Where relay stdout/stderr captures go.
    pub debug_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub max_attempts: u32,
    pub archive_url: String,
    pub rclone_bin: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(|name| std::env::var(name).ok(), &home))
    }

    pub fn from_lookup<L>(lookup: L, home: &Path) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let path_var = |name: &str| lookup(name).map(|value| expand_with_home(&value, home));
        Self {
            state_dir: path_var("IARELAY_STATE_DIR").unwrap_or_else(default_state_dir),
            debug_dir: path_var("IARELAY_DEBUG_DIR")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DEBUG_DIR)),
            log_dir: path_var("IARELAY_LOG_DIR"),
            max_attempts: read_u32(lookup("IARELAY_MAX_ATTEMPTS"), DEFAULT_MAX_ATTEMPTS),
            archive_url: lookup("IARELAY_ARCHIVE_URL")
                .unwrap_or_else(|| DEFAULT_ARCHIVE_URL.to_string()),
            rclone_bin: lookup("IARELAY_RCLONE_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RCLONE_BIN)),
        }
    }

    /// Command-line directories win over the environment.
    pub fn with_cli_overrides(mut self, cli: &Cli) -> Self {
        if let Some(dir) = &cli.state_dir {
            self.state_dir = dir.clone();
        }
        if let Some(dir) = &cli.debug_dir {
            self.debug_dir = dir.clone();
        }
        if let Some(dir) = &cli.log_dir {
            self.log_dir = Some(dir.clone());
        }
        self
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u32(value: Option<String>, default: u32) -> u32 {
    value
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned(), Path::new("/home/user"))
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config.debug_dir, PathBuf::from("debug"));
        assert_eq!(config.max_attempts, 100);
        assert_eq!(config.archive_url, "https://archive.org");
        assert_eq!(config.rclone_bin, PathBuf::from("rclone"));
        assert!(config.log_dir.is_none());
        assert!(config.state_dir.ends_with("iarelay"));
    }

    #[test]
    fn reads_values_and_expands_tilde() {
        let config = config_from(&[
            ("IARELAY_STATE_DIR", "~/ia/state"),
            ("IARELAY_LOG_DIR", "~"),
            ("IARELAY_MAX_ATTEMPTS", "7"),
            ("IARELAY_RCLONE_BIN", "/opt/rclone"),
        ]);
        assert_eq!(config.state_dir, PathBuf::from("/home/user/ia/state"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/home/user")));
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.rclone_bin, PathBuf::from("/opt/rclone"));
    }

    #[test]
    fn invalid_or_zero_attempts_fall_back() {
        assert_eq!(config_from(&[("IARELAY_MAX_ATTEMPTS", "0")]).max_attempts, 100);
        assert_eq!(config_from(&[("IARELAY_MAX_ATTEMPTS", "lots")]).max_attempts, 100);
    }

    #[test]
    fn cli_directories_override_environment() {
        let cli = Cli::try_parse_from([
            "iarelay",
            "--state-dir",
            "/srv/state",
            "ls",
            "remote:",
        ])
        .unwrap();
        let config = config_from(&[("IARELAY_STATE_DIR", "/env/state")]).with_cli_overrides(&cli);
        assert_eq!(config.state_dir, PathBuf::from("/srv/state"));
        assert_eq!(config.debug_dir, PathBuf::from("debug"));
    }
}
