//! Image metadata records: a name pointing at the root of a content graph.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ociclient::Descriptor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    pub fn new(name: impl Into<String>, target: Descriptor) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            target,
            labels: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Image>;

    async fn list(&self) -> Result<Vec<Image>>;

    /// Fails with `AlreadyExists` when a record with the same name exists.
    async fn create(&self, image: Image) -> Result<Image>;

    /// Replace target and labels of an existing record, keeping its
    /// creation time. Fails with `NotFound` when there is no such record.
    async fn update(&self, image: Image) -> Result<Image>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Point `image.name` at `image.target`, creating the record if needed.
pub async fn upsert(store: &dyn ImageStore, image: Image) -> Result<Image> {
    match store.update(image.clone()).await {
        Ok(updated) => Ok(updated),
        Err(err) if err.is_not_found() => {
            debug!(name = %image.name, "No image record yet, creating");
            match store.create(image.clone()).await {
                Err(err) if err.is_already_exists() => {
                    // Someone else created it in between
                    debug!(name = %image.name, "Image record appeared, updating");
                    store.update(image).await
                }
                created => created,
            }
        }
        Err(err) => Err(err),
    }
}
