//! Blob store over the `object_store` crate: a local directory or any
//! S3-compatible bucket behind the same code.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectMeta, ObjectStore};
use serde::Deserialize;
use sitevault_core::ArchiveRecord;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::blob::{BlobError, BlobStore};

const S3_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Objects are files under `root`, key segments mapping onto path segments.
    pub fn local(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("create blob store root {}", root.display()))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .with_context(|| format!("open blob store root {}", root.display()))?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Path-style addressing, so MinIO, R2 and friends work as well as AWS.
    pub fn s3(config: &S3Config) -> anyhow::Result<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&config.endpoint)
            .with_allow_http(config.endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false)
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_client_options(ClientOptions::new().with_timeout(S3_TIMEOUT))
            .build()
            .with_context(|| format!("configure s3 bucket {}", config.bucket))?;
        Ok(Self::new(Arc::new(store)))
    }
}

fn object_path(key: &str) -> Result<ObjectPath, BlobError> {
    if key.is_empty() || key.ends_with('/') {
        return Err(anyhow::anyhow!("invalid object key {key:?}").into());
    }
    ObjectPath::parse(key)
        .with_context(|| format!("invalid object key {key:?}"))
        .map_err(BlobError::from)
}

/// Missing objects become [`BlobError::NotFound`]; anything else is a
/// backend failure with `action` as context.
fn classify(key: &str, action: &str, err: object_store::Error) -> BlobError {
    match err {
        object_store::Error::NotFound { .. } => BlobError::NotFound(key.to_owned()),
        other => BlobError::Backend(anyhow::Error::new(other).context(format!("{action} {key}"))),
    }
}

fn record(meta: ObjectMeta) -> ArchiveRecord {
    ArchiveRecord {
        key: meta.location.to_string(),
        size: meta.size,
        last_modified: meta.last_modified,
    }
}

#[async_trait::async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put_file(&self, key: &str, source: &Path) -> Result<(), BlobError> {
        let location = object_path(key)?;
        let mut reader = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("open upload source {}", source.display()))?;
        // switches to a multipart upload once the payload outgrows one part
        let mut writer = BufWriter::new(Arc::clone(&self.store), location);
        let copied = match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(bytes) => writer.shutdown().await.map(|()| bytes),
            Err(e) => Err(e),
        };
        match copied {
            Ok(bytes) => {
                debug!(key, bytes, "object uploaded");
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(key, error = %abort, "failed to abort upload");
                }
                Err(anyhow::Error::new(e).context(format!("upload {key}")).into())
            }
        }
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<(), BlobError> {
        let location = object_path(key)?;
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| classify(key, "download", e))?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create download target {}", dest.display()))?;
        let mut body = result.into_stream();
        while let Some(chunk) = body.try_next().await.map_err(|e| classify(key, "download", e))? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", dest.display()))?;
        }
        file.flush()
            .await
            .with_context(|| format!("flush {}", dest.display()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArchiveRecord>, BlobError> {
        let location = if prefix.trim_matches('/').is_empty() {
            None
        } else {
            Some(
                ObjectPath::parse(prefix)
                    .with_context(|| format!("invalid listing prefix {prefix:?}"))?,
            )
        };
        let metas: Vec<ObjectMeta> = self
            .store
            .list(location.as_ref())
            .try_collect()
            .await
            .map_err(|e| classify(prefix, "list", e))?;
        Ok(metas
            .into_iter()
            .map(record)
            .filter(|r| r.key.starts_with(prefix))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let location = object_path(key)?;
        match self.store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(classify(key, "delete", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn put_list_get_delete_on_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ObjectBlobStore::local(tmp.path().join("store")).expect("store");
        let src = tmp.path().join("a.zip");
        fs::write(&src, b"archive-bytes").unwrap();

        store.put_file("backups/blog/a.zip", &src).await.unwrap();
        store.put_file("backups/shop/b.zip", &src).await.unwrap();
        assert!(tmp.path().join("store/backups/blog/a.zip").is_file());

        let listed = store.list("backups/blog/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "backups/blog/a.zip");
        assert_eq!(listed[0].size, 13);
        assert_eq!(store.list("").await.unwrap().len(), 2);

        let out = tmp.path().join("out.zip");
        store.get_file("backups/blog/a.zip", &out).await.unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"archive-bytes");

        store.delete("backups/blog/a.zip").await.unwrap();
        store.delete("backups/blog/a.zip").await.unwrap();
        assert!(store.list("backups/blog/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_upload_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ObjectBlobStore::new(Arc::new(InMemory::new()));
        let src = tmp.path().join("big.zip");
        let payload: Vec<u8> = (0..12 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &payload).unwrap();

        store.put_file("backups/blog/big.zip", &src).await.unwrap();
        let out = tmp.path().join("out.zip");
        store.get_file("backups/blog/big.zip", &out).await.unwrap();
        assert_eq!(fs::read(&out).unwrap(), payload);
    }

    #[tokio::test]
    async fn listing_returns_keys_verbatim() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ObjectBlobStore::new(Arc::new(InMemory::new()));
        let src = tmp.path().join("a.zip");
        fs::write(&src, b"x").unwrap();
        let key = "backups/blog/a&amp;b&#13;c.zip";

        store.put_file(key, &src).await.unwrap();
        let listed = store.list("backups/blog/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
        store.delete(&listed[0].key).await.unwrap();
        assert!(store.list("backups/blog/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ObjectBlobStore::local(tmp.path()).expect("store");
        let err = store
            .get_file("backups/blog/nope.zip", &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ObjectBlobStore::local(tmp.path()).expect("store");
        let err = store.delete("backups/../../outside.zip").await.unwrap_err();
        assert!(matches!(err, BlobError::Backend(_)));
        assert!(store.delete("backups/blog/").await.is_err());
    }

    #[test]
    fn only_missing_objects_map_to_not_found() {
        let missing = object_store::Error::NotFound {
            path: "backups/blog/a.zip".into(),
            source: "no such object".into(),
        };
        assert!(matches!(
            classify("backups/blog/a.zip", "download", missing),
            BlobError::NotFound(_)
        ));

        let denied = object_store::Error::Generic {
            store: "LocalFileSystem",
            source: Box::new(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
        };
        let err = classify("backups/blog/a.zip", "download", denied);
        let BlobError::Backend(inner) = err else {
            panic!("expected backend error, got {err:?}");
        };
        assert!(format!("{inner:#}").starts_with("download backups/blog/a.zip"));
    }
}
