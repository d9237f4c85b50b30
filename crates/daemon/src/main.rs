use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sitevault_core::{
    BackupOutcome, DbCredentials, DbEngine, ErrorKind, OpError, RestoreOutcome, RestoreScope,
};
use sitevault_daemon::config::{self, Config};
use sitevault_daemon::server::ProjectRequest;
use sitevault_daemon::{build_router, AppState, BackupCoordinator, Scheduler, Vault};
use sitevault_remote::{CliDatabase, ShellConnector};
use sitevault_storage::ProjectRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sitevault", version, about = "Backs up and restores site code trees and databases")]
struct Cli {
    /// TOML configuration file; `SITEVAULT_*` variables override it.
    #[arg(long, global = true, env = "SITEVAULT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and the HTTP API (default).
    Serve,
    /// Back up one project now.
    Backup { project: String },
    /// Restore a project from one of its archives.
    Restore {
        project: String,
        archive_key: String,
        /// code, database or both.
        #[arg(long, default_value = "both")]
        scope: String,
    },
    /// List a project's archives, newest first.
    Archives { project: String },
    /// List registered projects and projects only present in storage.
    Projects,
    /// Register or update a project.
    Register {
        name: String,
        /// `/srv/app` or `[user@]host[#port]:/srv/app`.
        source: String,
        #[arg(long)]
        db_name: String,
        #[arg(long)]
        db_user: String,
        #[arg(long, env = "SITEVAULT_DB_PASSWORD", hide_env_values = true)]
        db_password: String,
        #[arg(long, default_value = "mysql")]
        db_engine: String,
        #[arg(long)]
        db_host: Option<String>,
        #[arg(long)]
        db_port: Option<u16>,
        /// Daily backup time, HH:MM.
        #[arg(long)]
        time: Option<String>,
    },
    /// Remove a project and every archive it has.
    Remove { project: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(path)?
        }
        None => Config::default(),
    };
    cfg.apply_env(|var| std::env::var(var).ok())?;
    cfg.validate()?;

    let vault = open_vault(&cfg)?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_service(vault, &cfg).await,
        Command::Backup { project } => {
            let outcome = vault.backup(&project).await;
            print_json(&outcome)?;
            Ok(backup_exit(&outcome))
        }
        Command::Restore {
            project,
            archive_key,
            scope,
        } => {
            let scope: RestoreScope = match scope.parse() {
                Ok(scope) => scope,
                Err(e) => return report(e),
            };
            let outcome = vault.restore(&project, &archive_key, scope).await;
            print_json(&outcome)?;
            Ok(match &outcome {
                RestoreOutcome::Restored { .. } => ExitCode::SUCCESS,
                RestoreOutcome::Failed { error, .. } => error_exit(error.kind()),
            })
        }
        Command::Archives { project } => match vault.archives(&project).await {
            Ok(archives) => {
                print_json(&archives)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => report(e),
        },
        Command::Projects => match vault.projects().await {
            Ok(projects) => {
                print_json(&projects)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => report(e),
        },
        Command::Register {
            name,
            source,
            db_name,
            db_user,
            db_password,
            db_engine,
            db_host,
            db_port,
            time,
        } => {
            let engine: DbEngine = match db_engine.parse() {
                Ok(engine) => engine,
                Err(e) => return report(e),
            };
            let request = ProjectRequest {
                source,
                database: DbCredentials {
                    engine,
                    user: db_user,
                    password: db_password,
                    name: db_name,
                    host: db_host,
                    port: db_port,
                },
                backup_time: time,
            };
            match request
                .into_config(&name)
                .and_then(|config| vault.register(config))
            {
                Ok(summary) => {
                    print_json(&summary)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => report(e),
            }
        }
        Command::Remove { project } => match vault.remove(&project).await {
            Ok(removed) => {
                print_json(&removed)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => report(e),
        },
    }
}

fn open_vault(cfg: &Config) -> Result<Vault> {
    let store = cfg.open_store().context("opening blob store")?;
    let registry = Arc::new(ProjectRegistry::new(cfg.registry_path()));
    let backups = BackupCoordinator::new(
        store,
        registry,
        Arc::new(ShellConnector::new(cfg.ssh_options())),
        Arc::new(CliDatabase),
        cfg.job_settings(),
    );
    Ok(Vault::new(Arc::new(backups), Scheduler::new()))
}

async fn run_service(vault: Vault, cfg: &Config) -> Result<ExitCode> {
    let installed = vault.reinstall_triggers()?;
    info!(projects = installed, "daily backups scheduled");
    tokio::spawn(vault.scheduler().clone().run(cfg.poll_interval()));

    let listen = cfg.listen();
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {listen}"))?;
    let app = build_router(AppState {
        vault,
        api_token: cfg.api_token(),
    });

    info!(%addr, "starting sitevault API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await?;
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report(e: OpError) -> Result<ExitCode> {
    eprintln!("{e}");
    Ok(error_exit(e.kind()))
}

fn error_exit(kind: ErrorKind) -> ExitCode {
    ExitCode::from(match kind {
        ErrorKind::Validation => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Upstream => 4,
        ErrorKind::LockContention => 5,
    })
}

fn backup_exit(outcome: &BackupOutcome) -> ExitCode {
    match outcome {
        BackupOutcome::Success { .. } => ExitCode::SUCCESS,
        BackupOutcome::Partial { .. } => ExitCode::from(6),
        BackupOutcome::Skipped { .. } => ExitCode::from(5),
        BackupOutcome::Failed { error } => error_exit(error.kind()),
    }
}
