//! `runc` command-line adapter.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use funclet_common::error::{FuncletError, Result};
use funclet_common::types::ContainerId;
use nix::sys::signal::Signal;
use serde::Deserialize;
use tokio::process::Command;

use super::{ContainerRuntime, RuntimeContainer};

/// JSON shape of `runc state` and of each `runc list --format json` entry.
#[derive(Debug, Deserialize)]
struct RuncState {
    id: String,
    #[serde(default)]
    pid: i32,
    status: String,
    #[serde(default)]
    bundle: String,
    #[serde(default)]
    created: String,
}

impl RuncState {
    fn into_container(self) -> Result<RuntimeContainer> {
        Ok(RuntimeContainer {
            id: ContainerId::new(self.id),
            pid: self.pid,
            status: self.status.parse()?,
            bundle: self.bundle,
            created: self.created,
        })
    }
}

/// Drives the `runc` binary.
#[derive(Debug, Clone)]
pub struct Runc {
    binary: PathBuf,
}

impl Runc {
    /// Resolves `binary` through `PATH`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the binary cannot be located.
    pub fn new(binary: &str) -> Result<Self> {
        let binary = which::which(binary).map_err(|e| FuncletError::NotFound {
            kind: "runtime binary",
            id: format!("{binary}: {e}"),
        })?;
        tracing::info!(binary = %binary.display(), "OCI runtime resolved");
        Ok(Self { binary })
    }

    /// Path of the resolved binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!(args = %args.join(" "), "running runc");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FuncletError::io(&self.binary, e))?;
        if !output.status.success() {
            return Err(FuncletError::Command {
                program: "runc".into(),
                args: args.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for Runc {
    async fn start_container(
        &self,
        id: &ContainerId,
        bundle: &Path,
        pid_file: &Path,
        stdio: Option<&Path>,
    ) -> Result<()> {
        let bundle_arg = bundle.display().to_string();
        let pid_arg = pid_file.display().to_string();
        let args = [
            "run",
            "--detach",
            "--bundle",
            bundle_arg.as_str(),
            "--pid-file",
            pid_arg.as_str(),
            id.as_str(),
        ];
        let Some(log_path) = stdio else {
            let _ = self.run(&args).await?;
            tracing::info!(id = %id, "container started");
            return Ok(());
        };

        // A detached container inherits runc's stdio, so point it at the log.
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| FuncletError::io(log_path, e))?;
        let log_err = log.try_clone().map_err(|e| FuncletError::io(log_path, e))?;
        let status = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await
            .map_err(|e| FuncletError::io(&self.binary, e))?;
        if !status.success() {
            return Err(FuncletError::Command {
                program: "runc".into(),
                args: args.join(" "),
                code: status.code(),
                stderr: format!("see {}", log_path.display()),
            });
        }
        tracing::info!(id = %id, log = %log_path.display(), "container started");
        Ok(())
    }

    async fn kill_container(&self, id: &ContainerId, signal: Signal, all: bool) -> Result<()> {
        let mut args = vec!["kill"];
        if all {
            args.push("--all");
        }
        args.extend([id.as_str(), signal.as_str()]);
        let _ = self.run(&args).await?;
        tracing::debug!(id = %id, signal = signal.as_str(), all, "signal sent");
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()> {
        let mut args = vec!["delete"];
        if force {
            args.push("--force");
        }
        args.push(id.as_str());
        let _ = self.run(&args).await?;
        tracing::debug!(id = %id, force, "container deleted");
        Ok(())
    }

    async fn pause_container(&self, id: &ContainerId) -> Result<()> {
        let _ = self.run(&["pause", id.as_str()]).await?;
        Ok(())
    }

    async fn resume_container(&self, id: &ContainerId) -> Result<()> {
        let _ = self.run(&["resume", id.as_str()]).await?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<RuntimeContainer>> {
        let out = self.run(&["list", "--format", "json"]).await?;
        parse_list(&out)
    }

    async fn container_info(&self, id: &ContainerId) -> Result<RuntimeContainer> {
        match self.run(&["state", id.as_str()]).await {
            Ok(out) => serde_json::from_str::<RuncState>(&out)?.into_container(),
            Err(FuncletError::Command { stderr, .. }) if stderr.contains("does not exist") => {
                Ok(RuntimeContainer::not_exists(id))
            }
            Err(e) => Err(e),
        }
    }
}

/// Parses `runc list --format json`, which prints `null` when empty.
fn parse_list(out: &str) -> Result<Vec<RuntimeContainer>> {
    let states: Option<Vec<RuncState>> = serde_json::from_str(out.trim())?;
    states
        .unwrap_or_default()
        .into_iter()
        .map(RuncState::into_container)
        .collect()
}

#[cfg(test)]
mod tests {
    use funclet_common::types::ContainerStatus;

    use super::*;

    #[test]
    fn parses_state_json() {
        let out = r#"{"ociVersion":"1.0.2","id":"pod-controller-c0","pid":4242,"status":"paused","bundle":"/var/lib/funclet/spec/x","rootfs":"/rootfs","created":"2024-01-01T00:00:00Z","owner":""}"#;
        let c = serde_json::from_str::<RuncState>(out)
            .unwrap()
            .into_container()
            .unwrap();
        assert_eq!(c.pid, 4242);
        assert_eq!(c.status, ContainerStatus::Paused);
        assert_eq!(c.id.as_str(), "pod-controller-c0");
    }

    #[test]
    fn parses_empty_list() {
        assert!(parse_list("null\n").unwrap().is_empty());
        assert!(parse_list("[]").unwrap().is_empty());
    }

    #[test]
    fn parses_list_entries() {
        let out = r#"[{"id":"a","pid":1,"status":"running","bundle":"/b","created":"t"},{"id":"b","pid":0,"status":"stopped","bundle":"/c","created":"t"}]"#;
        let list = parse_list(out).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].status, ContainerStatus::Stopped);
    }

    #[test]
    fn missing_binary_is_not_found() {
        let err = Runc::new("definitely-not-a-runtime-binary").unwrap_err();
        assert!(err.is_not_found());
    }
}
