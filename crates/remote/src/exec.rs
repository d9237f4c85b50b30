use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;
use walkdir::WalkDir;

/// A shell script plus the environment and stdin it runs with.
///
/// Secrets belong in `env`: it is never part of error messages or logs.
#[derive(Clone, Default)]
pub struct ShellCommand {
    pub script: String,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }
}

impl std::fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellCommand")
            .field("script", &self.script)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("stdin_bytes", &self.stdin.as_ref().map(Vec::len))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("`{command}` on {host} exited with {status}: {stderr}")]
    Failed {
        host: String,
        command: String,
        status: String,
        stderr: String,
    },
}

/// Runs commands and moves files on the host a project lives on.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable host name for logs.
    fn host(&self) -> String;

    fn is_local(&self) -> bool;

    /// Fresh scratch location on the host for a file ending in `file_name`.
    /// Every call yields a different path, so concurrent jobs against one
    /// host never share a scratch file.
    fn scratch_path(&self, file_name: &str) -> String;

    /// The same file seen from this process, when the host is this machine.
    fn local_path(&self, host_path: &str) -> Option<PathBuf> {
        let _ = host_path;
        None
    }

    /// Runs `command`; a non-zero exit is reported in the output, not as `Err`.
    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput>;

    async fn fetch_file(&self, host_path: &str, local: &Path) -> Result<()>;

    async fn push_file(&self, local: &Path, host_path: &str) -> Result<()>;

    async fn remove_file(&self, host_path: &str) -> Result<()>;

    /// Copy the regular files under `host_dir` into `local_dir`.
    async fn fetch_tree(&self, host_dir: &str, local_dir: &Path) -> Result<()>;

    /// Copy `local_dir` over `host_dir`, overwriting files that exist.
    async fn push_tree(&self, local_dir: &Path, host_dir: &str) -> Result<()>;

    /// Delete everything below `host_dir`, deepest entries first. The
    /// directory itself is kept (and created if missing).
    async fn clear_tree(&self, host_dir: &str) -> Result<()>;
}

/// `sitevault-{uuid}-{file_name}`, unique per call.
pub fn scratch_name(file_name: &str) -> String {
    format!("sitevault-{}-{file_name}", Uuid::new_v4().simple())
}

/// Runs `command` and turns a non-zero exit into [`ExecError::Failed`].
pub async fn run_checked(exec: &dyn Executor, command: &ShellCommand) -> Result<CommandOutput> {
    let output = exec.run(command).await?;
    if !output.success() {
        return Err(ExecError::Failed {
            host: exec.host(),
            command: command.script.clone(),
            status: output
                .status
                .map_or_else(|| "signal".to_owned(), |code| code.to_string()),
            stderr: output.stderr.trim().to_owned(),
        }
        .into());
    }
    Ok(output)
}

/// Spawns `cmd`, feeds it `stdin` and collects its output.
pub(crate) async fn collect(mut cmd: Command, stdin: Option<&[u8]>) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    let mut child = cmd.spawn().context("spawn process")?;
    if let Some(bytes) = stdin {
        let mut pipe = child.stdin.take().context("child stdin not captured")?;
        pipe.write_all(bytes).await.context("write child stdin")?;
        drop(pipe);
    }
    let out = child.wait_with_output().await.context("wait for process")?;
    Ok(CommandOutput {
        status: out.status.code(),
        stdout: out.stdout,
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// The machine this process runs on.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

#[async_trait::async_trait]
impl Executor for LocalExecutor {
    fn host(&self) -> String {
        "localhost".to_owned()
    }

    fn is_local(&self) -> bool {
        true
    }

    fn scratch_path(&self, file_name: &str) -> String {
        std::env::temp_dir()
            .join(scratch_name(file_name))
            .to_string_lossy()
            .into_owned()
    }

    fn local_path(&self, host_path: &str) -> Option<PathBuf> {
        Some(PathBuf::from(host_path))
    }

    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command.script);
        cmd.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        collect(cmd, command.stdin.as_deref())
            .await
            .with_context(|| format!("run `{}` locally", command.script))
    }

    async fn fetch_file(&self, host_path: &str, local: &Path) -> Result<()> {
        if Path::new(host_path) == local {
            return Ok(());
        }
        tokio::fs::copy(host_path, local)
            .await
            .with_context(|| format!("copy {host_path} to {}", local.display()))?;
        Ok(())
    }

    async fn push_file(&self, local: &Path, host_path: &str) -> Result<()> {
        if Path::new(host_path) == local {
            return Ok(());
        }
        if let Some(parent) = Path::new(host_path).parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::copy(local, host_path)
            .await
            .with_context(|| format!("copy {} to {host_path}", local.display()))?;
        Ok(())
    }

    async fn remove_file(&self, host_path: &str) -> Result<()> {
        match tokio::fs::remove_file(host_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {host_path}")),
        }
    }

    async fn fetch_tree(&self, host_dir: &str, local_dir: &Path) -> Result<()> {
        let (src, dst) = (PathBuf::from(host_dir), local_dir.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst)).await?
    }

    async fn push_tree(&self, local_dir: &Path, host_dir: &str) -> Result<()> {
        let (src, dst) = (local_dir.to_path_buf(), PathBuf::from(host_dir));
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst)).await?
    }

    async fn clear_tree(&self, host_dir: &str) -> Result<()> {
        let dir = PathBuf::from(host_dir);
        tokio::task::spawn_blocking(move || clear_dir(&dir)).await?
    }
}

/// Recursively copies regular files, recreating the directory layout.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} to {}", entry.path().display(), target.display())
            })?;
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(())
}

/// Deletes the contents of `dir` bottom-up: files first, then each directory
/// once it is empty.
pub fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        return Ok(());
    }
    for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_dir() {
            fs::remove_dir(path).with_context(|| format!("remove dir {}", path.display()))?;
        } else {
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_reports_status_and_streams() {
        let exec = LocalExecutor;
        let out = exec
            .run(&ShellCommand::new("cat; echo oops >&2; exit 3").stdin(b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn run_checked_hides_env_values() {
        let exec = LocalExecutor;
        let cmd = ShellCommand::new("test \"$PW\" = s3cret && exit 7").env("PW", "s3cret");
        let err = run_checked(&exec, &cmd).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("exited with 7"), "{msg}");
        assert!(!msg.contains("s3cret"), "{msg}");
    }

    #[tokio::test]
    async fn clear_tree_keeps_root_and_removes_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("site");
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::write(root.join("index.php"), "x").unwrap();
        fs::write(root.join("a/b/c/deep.txt"), "y").unwrap();

        LocalExecutor
            .clear_tree(root.to_str().unwrap())
            .await
            .unwrap();
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn push_tree_overwrites_and_keeps_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("css")).unwrap();
        fs::write(src.join("css/site.css"), "new").unwrap();
        fs::create_dir_all(dst.join("css")).unwrap();
        fs::write(dst.join("css/site.css"), "old").unwrap();

        LocalExecutor
            .push_tree(&src, dst.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(dst.join("css/site.css")).unwrap(), "new");
    }
}
