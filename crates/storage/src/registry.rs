use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use sitevault_core::ProjectConfig;

/// Project configurations persisted as one JSON object keyed by project name.
///
/// The file is small (tens of projects), so every mutation rereads and
/// rewrites it wholesale. Writes go through a temp file and a rename.
#[derive(Debug)]
pub struct ProjectRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProjectRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<BTreeMap<String, ProjectConfig>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read registry {}", self.path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut projects: BTreeMap<String, ProjectConfig> = serde_json::from_str(&raw)
            .with_context(|| format!("parse registry {}", self.path.display()))?;
        for (name, config) in projects.iter_mut() {
            config.name.clone_from(name);
        }
        Ok(projects)
    }

    pub fn get(&self, name: &str) -> Result<Option<ProjectConfig>> {
        Ok(self.load()?.remove(name))
    }

    /// All projects, sorted by name.
    pub fn list(&self) -> Result<Vec<ProjectConfig>> {
        Ok(self.load()?.into_values().collect())
    }

    /// Insert or replace a project, returning the previous configuration.
    pub fn upsert(&self, config: ProjectConfig) -> Result<Option<ProjectConfig>> {
        let _guard = self.lock()?;
        let mut projects = self.load()?;
        let previous = projects.insert(config.name.clone(), config);
        self.save(&projects)?;
        Ok(previous)
    }

    pub fn remove(&self, name: &str) -> Result<Option<ProjectConfig>> {
        let _guard = self.lock()?;
        let mut projects = self.load()?;
        let removed = projects.remove(name);
        if removed.is_some() {
            self.save(&projects)?;
        }
        Ok(removed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("registry lock poisoned"))
    }

    fn save(&self, projects: &BTreeMap<String, ProjectConfig>) -> Result<()> {
        let raw = serde_json::to_string_pretty(projects).context("serialize registry")?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("create registry dir {}", dir.display()))?;
        let mut staged = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("stage registry in {}", dir.display()))?;
        staged
            .write_all(raw.as_bytes())
            .context("write staged registry")?;
        staged
            .persist(&self.path)
            .with_context(|| format!("replace registry {}", self.path.display()))?;
        Ok(())
    }
}
