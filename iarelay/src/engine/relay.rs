use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write relay output to {}: {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("relay tool exited with status {code:?}")]
    ExitStatus { code: Option<i32> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayOptions {
    pub bwlimit: Option<String>,
    pub log_file: Option<PathBuf>,
    pub dry_run: bool,
}

/// Moves finished local content to durable remote storage.
#[allow(async_fn_in_trait)]
pub trait Relay {
    /// Moves everything under `local` into `remote`. Only a zero exit
    /// status counts as success.
    async fn relay(&self, local: &Path, remote: &str) -> Result<(), RelayError>;

    /// Relative paths below `remote`, or `None` when nothing could be
    /// obtained. An empty remote directory is `Some(vec![])`.
    async fn list_children(&self, remote: &str, max_depth: u32) -> Option<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(rename = "Path")]
    path: String,
}

#[derive(Debug, Clone)]
pub struct RcloneRelay {
    program: PathBuf,
    debug_dir: PathBuf,
    options: RelayOptions,
}

impl RcloneRelay {
    pub fn new(program: impl Into<PathBuf>, debug_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            debug_dir: debug_dir.into(),
            options: RelayOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    fn move_args(&self, local: &Path, remote: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["move".into(), local.into(), remote.into()];
        if let Some(limit) = &self.options.bwlimit {
            args.push("--bwlimit".into());
            args.push(limit.into());
        }
        self.push_log_args(&mut args);
        if self.options.dry_run {
            args.push("--dry-run".into());
        }
        args
    }

    fn list_args(&self, remote: &str, max_depth: u32) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "lsjson".into(),
            remote.into(),
            "-R".into(),
            "--max-depth".into(),
            max_depth.to_string().into(),
        ];
        self.push_log_args(&mut args);
        args
    }

    fn push_log_args(&self, args: &mut Vec<OsString>) {
        if let Some(log_file) = &self.options.log_file {
            args.push("--log-file".into());
            args.push(log_file.into());
            args.push("--log-level".into());
            args.push("DEBUG".into());
        }
    }

    async fn run(&self, label: &str, args: Vec<OsString>) -> Result<Output, RelayError> {
        debug!(program = %self.program.display(), ?args, "running relay tool");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|source| RelayError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        self.capture(label, &output).await?;
        Ok(output)
    }

    async fn capture(&self, label: &str, output: &Output) -> Result<(), RelayError> {
        tokio::fs::create_dir_all(&self.debug_dir)
            .await
            .map_err(|source| RelayError::Capture {
                path: self.debug_dir.clone(),
                source,
            })?;
        for (stream, bytes) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
            let path = self.debug_dir.join(format!("relay.{label}.{stream}.txt"));
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|source| RelayError::Capture { path, source })?;
        }
        Ok(())
    }
}

impl Relay for RcloneRelay {
    async fn relay(&self, local: &Path, remote: &str) -> Result<(), RelayError> {
        info!(local = %local.display(), remote, dry_run = self.options.dry_run, "relaying");
        let output = self.run("move", self.move_args(local, remote)).await?;
        if !output.status.success() {
            warn!(code = ?output.status.code(), remote, "relay tool failed");
            return Err(RelayError::ExitStatus {
                code: output.status.code(),
            });
        }
        Ok(())
    }

    async fn list_children(&self, remote: &str, max_depth: u32) -> Option<Vec<String>> {
        let output = match self.run("lsjson", self.list_args(remote, max_depth)).await {
            Ok(output) => output,
            Err(err) => {
                warn!(remote, error = %err, "listing failed");
                return None;
            }
        };
        if !output.status.success() {
            warn!(code = ?output.status.code(), remote, "listing exited with failure");
            return None;
        }
        match serde_json::from_slice::<Vec<ListEntry>>(&output.stdout) {
            Ok(entries) => Some(entries.into_iter().map(|entry| entry.path).collect()),
            Err(err) => {
                warn!(remote, error = %err, "listing output is not valid JSON");
                None
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{TempDir, tempdir};

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-rclone");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn relay_passes_flags_and_captures_output() {
        let dir = tempdir().unwrap();
        let args_out = dir.path().join("args.txt");
        let program = script(
            &dir,
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\necho moved\necho warn >&2",
                args_out.display()
            ),
        );
        let debug_dir = dir.path().join("debug");
        let relay = RcloneRelay::new(&program, &debug_dir).with_options(RelayOptions {
            bwlimit: Some("1M".into()),
            log_file: Some(PathBuf::from("/tmp/rc.log")),
            dry_run: true,
        });

        relay.relay(Path::new("/work/item"), "gdrive:item").await.unwrap();

        let args = std::fs::read_to_string(&args_out).unwrap();
        let args: Vec<_> = args.lines().collect();
        assert_eq!(
            args,
            vec![
                "move",
                "/work/item",
                "gdrive:item",
                "--bwlimit",
                "1M",
                "--log-file",
                "/tmp/rc.log",
                "--log-level",
                "DEBUG",
                "--dry-run"
            ]
        );
        assert_eq!(
            std::fs::read_to_string(debug_dir.join("relay.move.stdout.txt")).unwrap(),
            "moved\n"
        );
        assert_eq!(
            std::fs::read_to_string(debug_dir.join("relay.move.stderr.txt")).unwrap(),
            "warn\n"
        );
    }

    #[tokio::test]
    async fn relay_nonzero_exit_is_error() {
        let dir = tempdir().unwrap();
        let program = script(&dir, "exit 3");
        let relay = RcloneRelay::new(&program, dir.path().join("debug"));

        let err = relay.relay(Path::new("/work"), "remote:").await.unwrap_err();
        assert!(matches!(err, RelayError::ExitStatus { code: Some(3) }));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let relay = RcloneRelay::new(dir.path().join("absent"), dir.path().join("debug"));

        let err = relay.relay(Path::new("/work"), "remote:").await.unwrap_err();
        assert!(matches!(err, RelayError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_listing_is_empty_not_none() {
        let dir = tempdir().unwrap();
        let program = script(&dir, "echo '[]'");
        let relay = RcloneRelay::new(&program, dir.path().join("debug"));

        assert_eq!(relay.list_children("remote:item", 2).await, Some(vec![]));
    }

    #[tokio::test]
    async fn listing_parses_paths_in_order() {
        let dir = tempdir().unwrap();
        let program = script(
            &dir,
            r#"echo '[{"Path":"a.pdf","Size":1,"IsDir":false},{"Path":"scans/p1.jp2","Size":2,"IsDir":false}]'"#,
        );
        let relay = RcloneRelay::new(&program, dir.path().join("debug"));

        assert_eq!(
            relay.list_children("remote:item", 3).await,
            Some(vec!["a.pdf".to_string(), "scans/p1.jp2".to_string()])
        );
    }

    #[tokio::test]
    async fn listing_failure_yields_none() {
        let dir = tempdir().unwrap();
        let failing = script(&dir, "echo boom >&2\nexit 1");
        let relay = RcloneRelay::new(&failing, dir.path().join("debug"));
        assert_eq!(relay.list_children("remote:item", 1).await, None);

        let missing = RcloneRelay::new(dir.path().join("absent"), dir.path().join("debug"));
        assert_eq!(missing.list_children("remote:item", 1).await, None);
    }

    #[test]
    fn list_args_include_depth() {
        let relay = RcloneRelay::new("rclone", "debug");
        let args: Vec<_> = relay
            .list_args("remote:item", 4)
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["lsjson", "remote:item", "-R", "--max-depth", "4"]);
    }
}
