use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use ociclient::OciDigest;
use opendal::services::Fs;
use opendal::services::S3;
use opendal::{ErrorKind, Operator};
use tracing::debug;

use crate::config::{StorageBackend, StorageConfig};
use crate::content::{self, ContentStore};
use crate::error::{Error, Result};
use crate::images::{Image, ImageStore};

/// Directory under the fs root where blobs are staged before the rename
pub const STAGING_DIR: &str = ".staging";

/// Local content and image metadata kept in one opendal operator.
///
/// Layout: `blobs/<algorithm>/<hex>` for content, `images/<hex(name)>.json`
/// for image records.
#[derive(Debug, Clone)]
pub struct Storage {
    operator: Operator,
}

impl Storage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let operator = match config.backend {
            StorageBackend::Fs => {
                let root = config.fs_root.clone()
                    .ok_or_else(|| Error::Config("Missing fs_root configuration".to_string()))?;

                // Writes land in the staging dir and are renamed into place,
                // so an interrupted write never leaves a partial blob
                let staging = root.join(STAGING_DIR);
                let mut builder = Fs::default();
                builder.root(&root.to_string_lossy());
                builder.atomic_write_dir(&staging.to_string_lossy());

                Operator::new(builder)?.finish()
            }
            StorageBackend::S3 => {
                let bucket = config.s3_bucket.clone()
                    .ok_or_else(|| Error::Config("Missing s3_bucket configuration".to_string()))?;
                let region = config.s3_region.clone()
                    .ok_or_else(|| Error::Config("Missing s3_region configuration".to_string()))?;

                let mut builder = S3::default();
                builder.bucket(&bucket);
                builder.region(&region);

                if let Some(endpoint) = &config.s3_endpoint {
                    builder.endpoint(endpoint);
                }

                if let Some(access_key) = &config.s3_access_key {
                    builder.access_key_id(access_key);
                }

                if let Some(secret_key) = &config.s3_secret_key {
                    builder.secret_access_key(secret_key);
                }

                Operator::new(builder)?.finish()
            }
        };

        Ok(Self { operator })
    }

    // Blob operations

    fn blob_path(digest: &OciDigest) -> String {
        format!("blobs/{}/{}", digest.algorithm(), digest.hex())
    }

    pub async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        Ok(self.operator.is_exist(&Self::blob_path(digest)).await?)
    }

    pub async fn get_blob_size(&self, digest: &OciDigest) -> Result<u64> {
        let metadata = self.operator.stat(&Self::blob_path(digest))
            .await
            .map_err(|e| not_found_or(e, || format!("blob {}", digest)))?;
        Ok(metadata.content_length())
    }

    pub async fn get_blob(&self, digest: &OciDigest) -> Result<Bytes> {
        let data = self.operator.read(&Self::blob_path(digest))
            .await
            .map_err(|e| not_found_or(e, || format!("blob {}", digest)))?;
        Ok(Bytes::from(data))
    }

    pub async fn put_blob(&self, digest: &OciDigest, content: Bytes) -> Result<()> {
        if self.blob_exists(digest).await? {
            debug!(%digest, "Blob already present, skipping write");
            return Ok(());
        }
        content::verify_digest(digest, &content)?;
        self.operator.write(&Self::blob_path(digest), content).await?;
        debug!(%digest, "Stored blob");
        Ok(())
    }

    // Image record operations

    fn record_path(name: &str) -> String {
        // Names carry '/' and ':', so the key is the hex of the name
        format!("images/{}.json", hex::encode(name.as_bytes()))
    }

    async fn read_record(&self, path: &str, name: &str) -> Result<Image> {
        let data = self.operator.read(path)
            .await
            .map_err(|e| not_found_or(e, || format!("image {}", name)))?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn write_record(&self, image: &Image) -> Result<()> {
        let data = serde_json::to_vec(image)?;
        self.operator.write(&Self::record_path(&image.name), data).await?;
        Ok(())
    }
}

fn not_found_or(err: opendal::Error, what: impl FnOnce() -> String) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotFound(what())
    } else {
        Error::Storage(err)
    }
}

#[async_trait]
impl ContentStore for Storage {
    async fn has(&self, digest: &OciDigest) -> Result<bool> {
        self.blob_exists(digest).await
    }

    async fn read(&self, digest: &OciDigest) -> Result<Bytes> {
        self.get_blob(digest).await
    }

    async fn write(&self, digest: &OciDigest, content: Bytes) -> Result<()> {
        self.put_blob(digest, content).await
    }
}

#[async_trait]
impl ImageStore for Storage {
    async fn get(&self, name: &str) -> Result<Image> {
        self.read_record(&Self::record_path(name), name).await
    }

    async fn list(&self) -> Result<Vec<Image>> {
        let entries = match self.operator.list("images/").await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut images = Vec::new();
        for entry in entries {
            if !entry.metadata().is_file() || !entry.name().ends_with(".json") {
                continue;
            }
            images.push(self.read_record(entry.path(), entry.name()).await?);
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(images)
    }

    async fn create(&self, image: Image) -> Result<Image> {
        if self.operator.is_exist(&Self::record_path(&image.name)).await? {
            return Err(Error::AlreadyExists(format!("image {}", image.name)));
        }
        self.write_record(&image).await?;
        Ok(image)
    }

    async fn update(&self, image: Image) -> Result<Image> {
        let existing = self.get(&image.name).await?;
        let updated = Image {
            created_at: existing.created_at,
            updated_at: Utc::now(),
            ..image
        };
        self.write_record(&updated).await?;
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = Self::record_path(name);
        if !self.operator.is_exist(&path).await? {
            return Err(Error::NotFound(format!("image {}", name)));
        }
        Ok(self.operator.delete(&path).await?)
    }
}
