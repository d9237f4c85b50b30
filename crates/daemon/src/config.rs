use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sitevault_remote::SshOptions;
use sitevault_storage::{BlobStore, ObjectBlobStore, S3Config};

use crate::backup::JobSettings;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8089";
pub const DEFAULT_MAX_ARCHIVES: usize = 11;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub registry: RegistryConfig,
    pub ssh: SshConfig,
    pub scheduler: SchedulerConfig,
    pub work: WorkConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// `fs` (default) or `s3`.
    pub backend: Option<String>,
    pub root: Option<String>,
    pub prefix: Option<String>,
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_archives: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SshConfig {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WorkConfig {
    pub temp_root: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_token: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

impl Config {
    /// Overlays `SITEVAULT_*` variables from `lookup` on top of the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let set = |slot: &mut Option<String>, var: &str| {
            if let Some(value) = lookup(var) {
                *slot = Some(value);
            }
        };
        set(&mut self.server.listen, "SITEVAULT_LISTEN");
        set(&mut self.storage.backend, "SITEVAULT_STORAGE_BACKEND");
        set(&mut self.storage.root, "SITEVAULT_STORAGE_ROOT");
        set(&mut self.storage.prefix, "SITEVAULT_STORAGE_PREFIX");
        set(&mut self.storage.bucket, "SITEVAULT_S3_BUCKET");
        set(&mut self.storage.endpoint, "SITEVAULT_S3_ENDPOINT");
        set(&mut self.storage.region, "SITEVAULT_S3_REGION");
        set(&mut self.storage.access_key_id, "SITEVAULT_S3_ACCESS_KEY_ID");
        set(&mut self.storage.secret_access_key, "SITEVAULT_S3_SECRET_ACCESS_KEY");
        set(&mut self.registry.path, "SITEVAULT_REGISTRY");
        set(&mut self.ssh.user, "SITEVAULT_SSH_USER");
        set(&mut self.ssh.identity_file, "SITEVAULT_SSH_IDENTITY");
        set(&mut self.work.temp_root, "SITEVAULT_TEMP_ROOT");
        set(&mut self.security.api_token, "SITEVAULT_API_TOKEN");

        if let Some(v) = lookup("SITEVAULT_MAX_ARCHIVES") {
            self.retention.max_archives =
                Some(v.parse().with_context(|| format!("SITEVAULT_MAX_ARCHIVES={v:?}"))?);
        }
        if let Some(v) = lookup("SITEVAULT_SSH_PORT") {
            self.ssh.port = Some(v.parse().with_context(|| format!("SITEVAULT_SSH_PORT={v:?}"))?);
        }
        if let Some(v) = lookup("SITEVAULT_POLL_INTERVAL_SECS") {
            self.scheduler.poll_interval_secs =
                Some(v.parse().with_context(|| format!("SITEVAULT_POLL_INTERVAL_SECS={v:?}"))?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention.max_archives == Some(0) {
            bail!("retention.max_archives must be at least 1");
        }
        if self.scheduler.poll_interval_secs == Some(0) {
            bail!("scheduler.poll_interval_secs must be at least 1");
        }
        match self.backend() {
            "fs" => {}
            "s3" => {
                for (name, value) in [
                    ("storage.bucket", &self.storage.bucket),
                    ("storage.endpoint", &self.storage.endpoint),
                    ("storage.access_key_id", &self.storage.access_key_id),
                    ("storage.secret_access_key", &self.storage.secret_access_key),
                ] {
                    if value.as_deref().unwrap_or_default().is_empty() {
                        bail!("{name} is required for the s3 backend");
                    }
                }
            }
            other => bail!("unknown storage backend {other:?}, expected fs or s3"),
        }
        Ok(())
    }

    pub fn listen(&self) -> &str {
        self.server.listen.as_deref().unwrap_or(DEFAULT_LISTEN)
    }

    pub fn backend(&self) -> &str {
        self.storage.backend.as_deref().unwrap_or("fs")
    }

    pub fn registry_path(&self) -> PathBuf {
        PathBuf::from(self.registry.path.as_deref().unwrap_or("projects.json"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs.unwrap_or(1))
    }

    pub fn api_token(&self) -> Option<String> {
        self.security.api_token.clone().filter(|t| !t.is_empty())
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            prefix: self
                .storage
                .prefix
                .clone()
                .unwrap_or_else(|| "backups".to_owned()),
            max_archives: self.retention.max_archives.unwrap_or(DEFAULT_MAX_ARCHIVES),
            temp_root: self.work.temp_root.as_ref().map(PathBuf::from),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            user: self.ssh.user.clone(),
            port: self.ssh.port,
            identity_file: self.ssh.identity_file.as_ref().map(PathBuf::from),
            options: self.ssh.options.clone(),
            ..SshOptions::default()
        }
    }

    pub fn open_store(&self) -> Result<Arc<dyn BlobStore>> {
        let storage = &self.storage;
        let store: Arc<dyn BlobStore> = match self.backend() {
            "s3" => Arc::new(ObjectBlobStore::s3(&S3Config {
                endpoint: storage.endpoint.clone().unwrap_or_default(),
                bucket: storage.bucket.clone().unwrap_or_default(),
                region: storage
                    .region
                    .clone()
                    .unwrap_or_else(|| "us-east-1".to_owned()),
                access_key_id: storage.access_key_id.clone().unwrap_or_default(),
                secret_access_key: storage.secret_access_key.clone().unwrap_or_default(),
            })?),
            _ => Arc::new(ObjectBlobStore::local(
                storage.root.as_deref().unwrap_or("./data"),
            )?),
        };
        Ok(store)
    }
}
