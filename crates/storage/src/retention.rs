use sitevault_core::archive::sort_oldest_first;
use tracing::{info, warn};

use crate::blob::{BlobError, BlobStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    /// Keys whose deletion failed, with the storage error.
    pub failed: Vec<(String, String)>,
    pub remaining: usize,
}

/// Delete the oldest archives under `prefix` until at most `max_count` remain.
///
/// Archives go one at a time, oldest first. A failed deletion is logged and
/// the next-oldest archive is tried instead, so the count still converges
/// whenever the store lets it.
pub async fn prune(
    store: &dyn BlobStore,
    prefix: &str,
    max_count: usize,
) -> Result<PruneReport, BlobError> {
    let mut archives: Vec<_> = store
        .list(prefix)
        .await?
        .into_iter()
        .filter(|r| r.is_archive())
        .collect();
    sort_oldest_first(&mut archives);

    let mut report = PruneReport::default();
    let mut count = archives.len();
    for archive in &archives {
        if count <= max_count {
            break;
        }
        match store.delete(&archive.key).await {
            Ok(()) => {
                info!(key = %archive.key, "deleted archive past retention cap");
                report.deleted.push(archive.key.clone());
                count -= 1;
            }
            Err(e) => {
                warn!(key = %archive.key, error = %e, "failed to delete archive past retention cap");
                report.failed.push((archive.key.clone(), e.to_string()));
            }
        }
    }
    report.remaining = count;
    Ok(report)
}
