use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{InstallError, InstalledPackages, PackageInstaller};
use crate::error::bounded;

/// Runs the configured package manager as a child process, appending the
/// distribution names to its arguments.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl CommandInstaller {
    /// `command` is the program followed by its leading arguments.
    pub fn new(command: &[String], timeout: Duration) -> Self {
        let (program, args) = match command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            program,
            args,
            working_dir: None,
            timeout,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    async fn install(&self, distributions: &[String]) -> Result<(), InstallError> {
        if self.program.is_empty() {
            return Err(InstallError::Spawn("no installer command configured".into()));
        }

        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .args(distributions)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| InstallError::Spawn(e.to_string()))?;
            cmd.current_dir(dir);
        }

        debug!("running {} {:?} {:?}", self.program, self.args, distributions);
        let child = cmd.spawn().map_err(|e| InstallError::Spawn(e.to_string()))?;

        // dropping the future on timeout drops the child, which kills it
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| InstallError::Spawn(e.to_string()))?,
            Err(_) => return Err(InstallError::TimedOut(self.timeout)),
        };

        if output.status.success() {
            info!("installed {}", distributions.join(", "));
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(InstallError::Failed {
                code: output.status.code(),
                stderr: bounded(stderr.trim(), 200),
            })
        }
    }
}

/// Treats `<dir>/<name>.rhai` or a `<dir>/<name>/` directory as installed.
#[derive(Debug, Clone)]
pub struct ModuleDirectoryIndex {
    dir: PathBuf,
}

impl ModuleDirectoryIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl InstalledPackages for ModuleDirectoryIndex {
    async fn is_installed(&self, distribution: &str) -> bool {
        let file = self.dir.join(format!("{distribution}.rhai"));
        let dir = self.dir.join(distribution);
        if tokio::fs::try_exists(&file).await.unwrap_or(false) {
            return true;
        }
        tokio::fs::metadata(&dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}
