use std::path::Path;

use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sitevault_core::{DbCredentials, DbEngine};
use tracing::{debug, warn};

use crate::exec::{run_checked, Executor, ShellCommand};

/// Everything outside the RFC 3986 unreserved set.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Carries the MongoDB connection URI, password included, into the shell.
const MONGO_URI_VAR: &str = "SITEVAULT_DB_URI";

/// Dumps and reloads a project's database on the project's host.
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Writes a full dump of `creds.name` to `local_dest` on this machine.
    async fn dump(&self, exec: &dyn Executor, creds: &DbCredentials, local_dest: &Path) -> Result<()>;

    /// Loads the dump at `local_dump` into `creds.name`.
    async fn restore(&self, exec: &dyn Executor, creds: &DbCredentials, local_dump: &Path) -> Result<()>;

    /// Drops and recreates `creds.name` so a restore starts from nothing.
    async fn recreate(&self, exec: &dyn Executor, creds: &DbCredentials) -> Result<()>;
}

/// Drives the stock client tools: `mysqldump`/`mysql` and
/// `mongodump`/`mongorestore`/`mongosh`.
#[derive(Debug, Clone, Default)]
pub struct CliDatabase;

#[async_trait::async_trait]
impl DatabaseAdapter for CliDatabase {
    async fn dump(&self, exec: &dyn Executor, creds: &DbCredentials, local_dest: &Path) -> Result<()> {
        let file_name = local_dest
            .file_name()
            .context("dump destination has no file name")?
            .to_string_lossy()
            .into_owned();
        let host_path = if exec.is_local() {
            local_dest.to_string_lossy().into_owned()
        } else {
            exec.scratch_path(&file_name)
        };

        debug!(host = %exec.host(), db = %creds.name, engine = ?creds.engine, "dumping database");
        let result: Result<()> = async {
            run_checked(exec, &dump_command(creds, &host_path)).await?;
            if !exec.is_local() {
                exec.fetch_file(&host_path, local_dest).await?;
            }
            Ok(())
        }
        .await;

        if !exec.is_local() {
            if let Err(e) = exec.remove_file(&host_path).await {
                warn!(host = %exec.host(), path = %host_path, error = %e, "failed to remove scratch dump");
            }
        }
        if result.is_err() && local_dest.exists() {
            tokio::fs::remove_file(local_dest).await.ok();
        }
        result.with_context(|| format!("dump database {}", creds.name))
    }

    async fn restore(&self, exec: &dyn Executor, creds: &DbCredentials, local_dump: &Path) -> Result<()> {
        let host_path = if exec.is_local() {
            local_dump.to_string_lossy().into_owned()
        } else {
            let file_name = local_dump
                .file_name()
                .context("dump has no file name")?
                .to_string_lossy()
                .into_owned();
            let host_path = exec.scratch_path(&file_name);
            exec.push_file(local_dump, &host_path).await?;
            host_path
        };

        debug!(host = %exec.host(), db = %creds.name, "loading database dump");
        let result = run_checked(exec, &restore_command(creds, &host_path)).await;
        if !exec.is_local() {
            if let Err(e) = exec.remove_file(&host_path).await {
                warn!(host = %exec.host(), path = %host_path, error = %e, "failed to remove scratch dump");
            }
        }
        result
            .map(drop)
            .with_context(|| format!("restore database {}", creds.name))
    }

    async fn recreate(&self, exec: &dyn Executor, creds: &DbCredentials) -> Result<()> {
        run_checked(exec, &recreate_command(creds))
            .await
            .with_context(|| format!("recreate database {}", creds.name))?;
        Ok(())
    }
}

fn quote(s: &str) -> String {
    shell_words::quote(s).into_owned()
}

/// `-u user [-h host] [-P port]`; the password travels as `MYSQL_PWD`.
fn mysql_client_args(creds: &DbCredentials) -> String {
    let mut args = format!("-u {}", quote(&creds.user));
    if let Some(host) = &creds.host {
        args.push_str(&format!(" -h {}", quote(host)));
    }
    if let Some(port) = creds.port {
        args.push_str(&format!(" -P {port}"));
    }
    args
}

fn with_secret(script: String, creds: &DbCredentials) -> ShellCommand {
    match creds.engine {
        DbEngine::Mysql => ShellCommand::new(script).env("MYSQL_PWD", &creds.password),
        DbEngine::Mongodb => ShellCommand::new(script).env(MONGO_URI_VAR, mongo_uri(creds)),
    }
}

pub(crate) fn dump_command(creds: &DbCredentials, host_path: &str) -> ShellCommand {
    let script = match creds.engine {
        DbEngine::Mysql => format!(
            "mysqldump --single-transaction {} {} > {}",
            mysql_client_args(creds),
            quote(&creds.name),
            quote(host_path)
        ),
        DbEngine::Mongodb => format!(
            "mongodump --uri=\"${MONGO_URI_VAR}\" --archive={}",
            quote(host_path)
        ),
    };
    with_secret(script, creds)
}

pub(crate) fn restore_command(creds: &DbCredentials, host_path: &str) -> ShellCommand {
    let script = match creds.engine {
        DbEngine::Mysql => format!(
            "mysql {} {} < {}",
            mysql_client_args(creds),
            quote(&creds.name),
            quote(host_path)
        ),
        DbEngine::Mongodb => format!(
            "mongorestore --uri=\"${MONGO_URI_VAR}\" --drop --archive={}",
            quote(host_path)
        ),
    };
    with_secret(script, creds)
}

pub(crate) fn recreate_command(creds: &DbCredentials) -> ShellCommand {
    let script = match creds.engine {
        DbEngine::Mysql => {
            let ident = format!("`{}`", creds.name.replace('`', "``"));
            let sql = format!("DROP DATABASE IF EXISTS {ident}; CREATE DATABASE {ident};");
            format!("mysql {} -e {}", mysql_client_args(creds), quote(&sql))
        }
        DbEngine::Mongodb => {
            format!("mongosh \"${MONGO_URI_VAR}\" --quiet --eval 'db.dropDatabase()'")
        }
    };
    with_secret(script, creds)
}

fn mongo_uri(creds: &DbCredentials) -> String {
    let host = creds.host.as_deref().unwrap_or("localhost");
    let port = creds.port.unwrap_or(27017);
    format!(
        "mongodb://{}:{}@{host}:{port}/{}?authSource=admin",
        utf8_percent_encode(&creds.user, URI_COMPONENT),
        utf8_percent_encode(&creds.password, URI_COMPONENT),
        utf8_percent_encode(&creds.name, URI_COMPONENT)
    )
}
