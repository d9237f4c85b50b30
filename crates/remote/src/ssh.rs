//! Executor that reaches a project host over the system `ssh` client.
//!
//! Trees travel as tar streams over the ssh channel, single files as `cat`.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sitevault_core::SourceLocation;
use tokio::process::Command;

use crate::exec::{
    collect, run_checked, scratch_name, CommandOutput, Executor, LocalExecutor, ShellCommand,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    pub program: String,
    /// Login used when a source does not name one.
    pub user: Option<String>,
    /// Port used when a source does not name one.
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`.
    pub options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".into(),
            user: None,
            port: None,
            identity_file: None,
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(host: impl Into<String>, user: Option<String>, port: Option<u16>, options: SshOptions) -> Self {
        Self {
            host: host.into(),
            user,
            port,
            options,
        }
    }

    fn destination(&self) -> String {
        match self.user.as_ref().or(self.options.user.as_ref()) {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Arguments passed to the ssh program for `remote_script`.
    pub fn ssh_args(&self, remote_script: &str) -> Vec<String> {
        let mut args = vec!["-o".to_owned(), "BatchMode=yes".to_owned()];
        if let Some(port) = self.port.or(self.options.port) {
            args.push("-p".into());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.options.identity_file {
            args.push("-i".into());
            args.push(identity.to_string_lossy().into_owned());
        }
        for option in &self.options.options {
            args.push("-o".into());
            args.push(option.clone());
        }
        args.push(self.destination());
        args.push("--".into());
        args.push(remote_script.to_owned());
        args
    }

    async fn raw(&self, command: &ShellCommand) -> Result<CommandOutput> {
        let (script, secrets) = remote_script(command)?;
        let input = match secrets {
            None => command.stdin.as_deref().map(Cow::Borrowed),
            Some(mut head) => {
                head.extend_from_slice(command.stdin.as_deref().unwrap_or_default());
                Some(Cow::Owned(head))
            }
        };
        let mut cmd = Command::new(&self.options.program);
        cmd.args(self.ssh_args(&script));
        collect(cmd, input.as_deref())
            .await
            .with_context(|| format!("ssh {}", self.destination()))
    }
}

/// Remote command line for `command`, plus the stdin prefix carrying its
/// environment.
///
/// Each value goes down the channel as one line ahead of any payload and is
/// read into an exported variable by the remote shell. Only the variable
/// names appear on the command line, local or remote.
fn remote_script(command: &ShellCommand) -> Result<(String, Option<Vec<u8>>)> {
    if command.env.is_empty() {
        return Ok((command.script.clone(), None));
    }
    let mut script = String::new();
    let mut head = Vec::new();
    for (key, value) in &command.env {
        if value.contains('\n') {
            bail!("value of {key} contains a newline and cannot be sent to the host");
        }
        script.push_str(&format!("IFS= read -r {key} && export {key} && "));
        head.extend_from_slice(value.as_bytes());
        head.push(b'\n');
    }
    script.push_str(&format!("{{ {}; }}", command.script));
    Ok((script, Some(head)))
}

fn quote(path: &str) -> String {
    shell_words::quote(path).into_owned()
}

#[async_trait::async_trait]
impl Executor for SshExecutor {
    fn host(&self) -> String {
        self.destination()
    }

    fn is_local(&self) -> bool {
        false
    }

    fn scratch_path(&self, file_name: &str) -> String {
        format!("/tmp/{}", scratch_name(file_name))
    }

    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput> {
        self.raw(command).await
    }

    async fn fetch_file(&self, host_path: &str, local: &Path) -> Result<()> {
        let out = run_checked(self, &ShellCommand::new(format!("cat {}", quote(host_path)))).await?;
        tokio::fs::write(local, out.stdout)
            .await
            .with_context(|| format!("write {}", local.display()))
    }

    async fn push_file(&self, local: &Path, host_path: &str) -> Result<()> {
        let bytes = tokio::fs::read(local)
            .await
            .with_context(|| format!("read {}", local.display()))?;
        let script = format!("cat > {}", quote(host_path));
        run_checked(self, &ShellCommand::new(script).stdin(bytes)).await?;
        Ok(())
    }

    async fn remove_file(&self, host_path: &str) -> Result<()> {
        run_checked(self, &ShellCommand::new(format!("rm -f {}", quote(host_path)))).await?;
        Ok(())
    }

    async fn fetch_tree(&self, host_dir: &str, local_dir: &Path) -> Result<()> {
        let script = format!("tar -C {} -cf - .", quote(host_dir));
        let out = run_checked(self, &ShellCommand::new(script)).await?;
        let dest = local_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dest)?;
            tar::Archive::new(out.stdout.as_slice())
                .unpack(&dest)
                .with_context(|| format!("unpack tree into {}", dest.display()))
        })
        .await?
    }

    async fn push_tree(&self, local_dir: &Path, host_dir: &str) -> Result<()> {
        let src = local_dir.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.follow_symlinks(false);
            builder
                .append_dir_all(".", &src)
                .with_context(|| format!("pack {}", src.display()))?;
            Ok(builder.into_inner()?)
        })
        .await??;
        let dir = quote(host_dir);
        let script = format!("mkdir -p {dir} && tar -C {dir} -xf -");
        run_checked(self, &ShellCommand::new(script).stdin(bytes)).await?;
        Ok(())
    }

    async fn clear_tree(&self, host_dir: &str) -> Result<()> {
        let dir = quote(host_dir);
        let script = format!("mkdir -p {dir} && find {dir} -mindepth 1 -depth -delete");
        run_checked(self, &ShellCommand::new(script)).await?;
        Ok(())
    }
}

/// Resolves where a project's commands run.
pub trait Connector: Send + Sync {
    fn connect(&self, source: &SourceLocation) -> Arc<dyn Executor>;
}

/// Local paths run through `sh`, remote ones through `ssh`.
#[derive(Debug, Clone, Default)]
pub struct ShellConnector {
    pub ssh: SshOptions,
}

impl ShellConnector {
    pub fn new(ssh: SshOptions) -> Self {
        Self { ssh }
    }
}

impl Connector for ShellConnector {
    fn connect(&self, source: &SourceLocation) -> Arc<dyn Executor> {
        match source {
            SourceLocation::Local { .. } => Arc::new(LocalExecutor),
            SourceLocation::Remote { host, user, port, .. } => Arc::new(SshExecutor::new(
                host.clone(),
                user.clone(),
                *port,
                self.ssh.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use sitevault_core::{DbCredentials, DbEngine};

    use super::*;
    use crate::database::dump_command;

    #[test]
    fn args_prefer_source_login_over_defaults() {
        let options = SshOptions {
            user: Some("deploy".into()),
            port: Some(2200),
            identity_file: Some("/etc/sitevault/id_ed25519".into()),
            options: vec!["StrictHostKeyChecking=accept-new".into()],
            ..SshOptions::default()
        };
        let exec = SshExecutor::new("web1", Some("www".into()), None, options);
        assert_eq!(
            exec.ssh_args("true"),
            [
                "-o",
                "BatchMode=yes",
                "-p",
                "2200",
                "-i",
                "/etc/sitevault/id_ed25519",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "www@web1",
                "--",
                "true",
            ]
        );
    }

    #[test]
    fn env_values_travel_on_stdin_not_argv() {
        let creds = DbCredentials {
            engine: DbEngine::Mysql,
            user: "wp".into(),
            password: "TOPSECRET".into(),
            name: "blog".into(),
            host: None,
            port: None,
        };
        let cmd = dump_command(&creds, "/tmp/dump.sql");
        let (script, head) = remote_script(&cmd).unwrap();
        let exec = SshExecutor::new("web1", None, None, SshOptions::default());
        let args = exec.ssh_args(&script);
        assert!(args.iter().all(|a| !a.contains("TOPSECRET")), "{args:?}");
        assert_eq!(
            script,
            "IFS= read -r MYSQL_PWD && export MYSQL_PWD && \
             { mysqldump --single-transaction -u wp blog > /tmp/dump.sql; }"
        );
        assert_eq!(head.unwrap(), b"TOPSECRET\n");
    }

    #[test]
    fn plain_commands_are_sent_as_is() {
        let (script, head) = remote_script(&ShellCommand::new("rm -f /tmp/x")).unwrap();
        assert_eq!(script, "rm -f /tmp/x");
        assert!(head.is_none());
    }

    #[test]
    fn multi_line_env_values_are_refused() {
        let cmd = ShellCommand::new("true").env("MYSQL_PWD", "a\nb");
        let err = remote_script(&cmd).unwrap_err();
        assert!(!format!("{err:#}").contains("a\nb"));
    }

    #[tokio::test]
    async fn secrets_are_read_back_by_the_shell() {
        // the local shell stands in for the remote login shell
        let cmd = ShellCommand::new("printf '%s|' \"$MYSQL_PWD\"; cat")
            .env("MYSQL_PWD", "it's $ecret")
            .stdin(b"payload".to_vec());
        let (script, head) = remote_script(&cmd).unwrap();
        let mut input = head.unwrap();
        input.extend_from_slice(cmd.stdin.as_deref().unwrap());
        let mut sh = Command::new("sh");
        sh.arg("-c").arg(&script);
        let out = collect(sh, Some(&input)).await.unwrap();
        assert!(out.success(), "{}", out.stderr);
        assert_eq!(out.stdout, b"it's $ecret|payload");
    }

    #[test]
    fn scratch_paths_differ_between_jobs_on_one_host() {
        let connector = ShellConnector::default();
        let blog = connector.connect(&"deploy@web1:/srv/blog".parse().unwrap());
        let shop = connector.connect(&"deploy@web1:/srv/shop".parse().unwrap());
        let name = "db_backup_20260101-000000.sql";
        let (a, b) = (blog.scratch_path(name), shop.scratch_path(name));
        assert_ne!(a, b);
        assert_ne!(a, blog.scratch_path(name));
        for path in [&a, &b] {
            assert!(path.starts_with("/tmp/sitevault-"), "{path}");
            assert!(path.ends_with(name), "{path}");
        }
    }

    #[test]
    fn connector_picks_executor_by_location() {
        let connector = ShellConnector::default();
        let local = connector.connect(&"/srv/blog".parse().unwrap());
        assert!(local.is_local());
        let remote = connector.connect(&"deploy@web1#2222:/srv/blog".parse().unwrap());
        assert!(!remote.is_local());
        assert_eq!(remote.host(), "deploy@web1");
    }
}
