use std::collections::BTreeSet;
use std::path::Path;

use sitevault_core::ArchiveRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object {0} does not exist")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Object storage seen as a flat key/value blob store.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a local file under `key`, replacing any existing object.
    async fn put_file(&self, key: &str, source: &Path) -> Result<(), BlobError>;

    /// Download `key` into `dest`. Fails with [`BlobError::NotFound`] if absent.
    async fn get_file(&self, key: &str, dest: &Path) -> Result<(), BlobError>;

    /// All objects whose key starts with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ArchiveRecord>, BlobError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Prefix every project lives under, `""` or `"{global}/"`.
pub fn listing_prefix(global: &str) -> String {
    let global = global.trim_matches('/');
    if global.is_empty() {
        String::new()
    } else {
        format!("{global}/")
    }
}

/// `{global}/{project}/`
pub fn project_prefix(global: &str, project: &str) -> String {
    format!("{}{project}/", listing_prefix(global))
}

/// `{global}/{project}/{file_name}`
pub fn archive_key(global: &str, project: &str, file_name: &str) -> String {
    format!("{}{file_name}", project_prefix(global, project))
}

/// Project names that own at least one object under the global prefix.
pub fn discover_projects(global: &str, records: &[ArchiveRecord]) -> BTreeSet<String> {
    let prefix = listing_prefix(global);
    records
        .iter()
        .filter_map(|r| r.key.strip_prefix(&prefix))
        .filter_map(|rest| rest.split_once('/'))
        .filter(|(project, file)| !project.is_empty() && !file.is_empty())
        .map(|(project, _)| project.to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn prefixes_normalise_slashes() {
        assert_eq!(project_prefix("backups", "blog"), "backups/blog/");
        assert_eq!(project_prefix("/backups/", "blog"), "backups/blog/");
        assert_eq!(project_prefix("", "blog"), "blog/");
        assert_eq!(
            archive_key("backups", "blog", "blog-backup-20260101-000000.zip"),
            "backups/blog/blog-backup-20260101-000000.zip"
        );
    }

    #[test]
    fn discovers_projects_from_keys() {
        let rec = |key: &str| ArchiveRecord {
            key: key.into(),
            size: 0,
            last_modified: Utc::now(),
        };
        let records = vec![
            rec("backups/blog/a.zip"),
            rec("backups/blog/b.zip"),
            rec("backups/shop/a.zip"),
            rec("backups/stray.zip"),
            rec("other/x/a.zip"),
        ];
        let found: Vec<_> = discover_projects("backups", &records).into_iter().collect();
        assert_eq!(found, ["blog", "shop"]);
    }
}
