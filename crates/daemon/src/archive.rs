//! Zip archives holding a project's code tree and one database dump.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use sitevault_core::archive::dump_file_name;
use sitevault_core::{DbCredentials, DbEngine, RestoreScope};
use sitevault_remote::{DatabaseAdapter, Executor};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Which parts of the project go into an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveContents {
    pub files: bool,
    pub database: bool,
}

impl ArchiveContents {
    pub const FULL: Self = Self {
        files: true,
        database: true,
    };

    /// What a safety backup before restoring `scope` has to capture.
    pub fn for_scope(scope: RestoreScope) -> Self {
        Self {
            files: scope.includes_code(),
            database: scope.includes_database(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpStatus {
    /// The dump is in the archive under this entry name.
    Included(String),
    Failed(String),
    NotRequested,
}

#[derive(Debug)]
pub struct BuiltArchive {
    pub path: PathBuf,
    /// Code files written, not counting the dump.
    pub file_entries: usize,
    pub dump: DumpStatus,
}

/// Everything the builder needs from a project, borrowed from the job.
pub struct BuildSource<'a> {
    pub exec: &'a dyn Executor,
    pub database: &'a dyn DatabaseAdapter,
    pub source_path: &'a str,
    pub creds: &'a DbCredentials,
}

/// Dumps the database, then zips the code tree and the dump into `dest`.
///
/// `work_dir` is job scratch space; the caller owns its removal. A failed
/// dump degrades the archive to code only instead of failing the build,
/// unless the dump was all the archive was meant to hold.
pub async fn build(
    src: BuildSource<'_>,
    contents: ArchiveContents,
    at: NaiveDateTime,
    work_dir: &Path,
    dest: &Path,
) -> Result<BuiltArchive> {
    let engine = src.creds.engine;

    let mut dump_file = None;
    let dump = if contents.database {
        let dump_dir = work_dir.join("dump");
        tokio::fs::create_dir_all(&dump_dir)
            .await
            .with_context(|| format!("create {}", dump_dir.display()))?;
        let name = dump_file_name(engine, at);
        let path = dump_dir.join(&name);
        match src.database.dump(src.exec, src.creds, &path).await {
            Ok(()) => {
                dump_file = Some(path);
                DumpStatus::Included(name)
            }
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(db = %src.creds.name, error = %reason, "database dump failed");
                DumpStatus::Failed(reason)
            }
        }
    } else {
        DumpStatus::NotRequested
    };
    if let (false, DumpStatus::Failed(reason)) = (contents.files, &dump) {
        bail!("nothing left to archive, the database dump failed: {reason}");
    }

    let tree = if contents.files {
        Some(match src.exec.local_path(src.source_path) {
            Some(path) => path,
            None => {
                let staging = work_dir.join("source");
                src.exec
                    .fetch_tree(src.source_path, &staging)
                    .await
                    .with_context(|| {
                        format!("fetch {} from {}", src.source_path, src.exec.host())
                    })?;
                staging
            }
        })
    } else {
        None
    };

    let dest_path = dest.to_path_buf();
    let dump_for_zip = dump_file.clone();
    let written = tokio::task::spawn_blocking(move || {
        write_zip(&dest_path, tree.as_deref(), dump_for_zip.as_deref(), engine)
    })
    .await
    .context("archive writer panicked");

    // the scratch dump goes whether or not it made it into the zip
    if let Some(path) = dump_file {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove local dump file");
        }
    }

    let file_entries = written??;
    Ok(BuiltArchive {
        path: dest.to_path_buf(),
        file_entries,
        dump,
    })
}

fn write_zip(dest: &Path, tree: Option<&Path>, dump: Option<&Path>, engine: DbEngine) -> Result<usize> {
    let file = File::create(dest).with_context(|| format!("create archive {}", dest.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut entries = 0;
    if let Some(root) = tree {
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if engine.is_dump_file(&name) {
                debug!(path = %entry.path().display(), "skipping dump-named file in code tree");
                continue;
            }
            let relative = entry.path().strip_prefix(root)?;
            let entry_name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            zip.start_file(entry_name.as_str(), options)
                .with_context(|| format!("start entry {entry_name}"))?;
            let mut reader = File::open(entry.path())
                .with_context(|| format!("open {}", entry.path().display()))?;
            io::copy(&mut reader, &mut zip).with_context(|| format!("write entry {entry_name}"))?;
            entries += 1;
        }
    }

    if let Some(dump) = dump {
        let name = dump
            .file_name()
            .context("dump file has no name")?
            .to_string_lossy()
            .into_owned();
        zip.start_file(name.as_str(), options)
            .with_context(|| format!("start entry {name}"))?;
        let mut reader = File::open(dump).with_context(|| format!("open {}", dump.display()))?;
        io::copy(&mut reader, &mut zip).context("write dump entry")?;
    }

    zip.finish().context("finish archive")?;
    Ok(entries)
}

#[derive(Debug)]
pub struct Extracted {
    /// Extracted code tree, without any dump files.
    pub code_dir: PathBuf,
    pub dump: Option<PathBuf>,
}

/// Unpacks `archive` under `dest`, separating the dump from the code tree.
///
/// Entries that would land outside `dest` are skipped. The top-level dump
/// entry is moved next to the code tree; dump-named files deeper in the
/// tree are dropped.
pub fn extract(archive: &Path, dest: &Path, engine: DbEngine) -> Result<Extracted> {
    let file = File::open(archive).with_context(|| format!("open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(file).with_context(|| format!("read archive {}", archive.display()))?;
    let code_dir = dest.join("code");
    fs::create_dir_all(&code_dir).with_context(|| format!("create {}", code_dir.display()))?;

    let mut dump = None;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping archive entry outside the extraction root");
            continue;
        };
        let out = code_dir.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        let is_dump = relative
            .file_name()
            .is_some_and(|n| engine.is_dump_file(&n.to_string_lossy()));
        if is_dump {
            if relative.components().count() == 1 && dump.is_none() {
                let target = dest.join(&relative);
                let mut writer = File::create(&target)
                    .with_context(|| format!("create {}", target.display()))?;
                io::copy(&mut entry, &mut writer)?;
                dump = Some(target);
            } else {
                debug!(entry = %relative.display(), "dropping extra dump-named entry");
            }
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = File::create(&out).with_context(|| format!("create {}", out.display()))?;
        io::copy(&mut entry, &mut writer).with_context(|| format!("extract {}", relative.display()))?;
    }

    Ok(Extracted { code_dir, dump })
}
