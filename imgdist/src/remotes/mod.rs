//! Contracts for talking to remote content, plus the handlers that move
//! blobs between a remote and the local content store.

pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use ociclient::{Descriptor, media_types};
use tracing::debug;

use crate::content::{self, ContentStore};
use crate::error::{Error, Result};
use crate::handlers::{Handled, Handler};

pub use registry::RegistryResolver;

/// Body of remote content as it arrives
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Maps references to remote content and hands out transfer endpoints.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `reference` to its canonical name and root descriptor.
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)>;

    /// Fetcher for content under a resolved name
    async fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>>;

    /// Pusher for uploading content under `reference`
    async fn pusher(&self, reference: &str) -> Result<Arc<dyn Pusher>>;
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream>;
}

#[async_trait]
pub trait Pusher: Send + Sync {
    /// Open a writer for `desc`. Fails with `AlreadyExists` when the remote
    /// already holds the content.
    async fn push(&self, desc: &Descriptor) -> Result<Box<dyn ContentWriter>>;
}

/// Sink for exactly `size` bytes hashing to the descriptor's digest.
#[async_trait]
pub trait ContentWriter: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Finish the upload; fails if the bytes written do not match.
    async fn commit(&mut self) -> Result<()>;
}

/// Copies remote content into the local store.
pub struct FetchHandler {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchHandler {
    pub fn new(store: Arc<dyn ContentStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { store, fetcher }
    }
}

#[async_trait]
impl Handler for FetchHandler {
    async fn handle(&self, desc: &Descriptor) -> Result<Handled> {
        if media_types::is_schema1(&desc.media_type) {
            return Err(Error::UnsupportedFormat(format!(
                "{} is a schema 1 manifest and conversion is not enabled",
                desc.digest
            )));
        }

        if self.store.has(&desc.digest).await? {
            debug!(digest = %desc.digest, "Content already present");
            return Ok(Handled::none());
        }

        debug!(digest = %desc.digest, media_type = %desc.media_type, size = desc.size, "Fetching");
        let stream = self.fetcher.fetch(desc).await?;
        let content = content::read_verified(desc, stream).await?;
        self.store.write(&desc.digest, content).await?;

        Ok(Handled::none())
    }
}

/// Uploads local content through a pusher.
pub struct PushHandler {
    store: Arc<dyn ContentStore>,
    pusher: Arc<dyn Pusher>,
}

impl PushHandler {
    pub fn new(store: Arc<dyn ContentStore>, pusher: Arc<dyn Pusher>) -> Self {
        Self { store, pusher }
    }
}

#[async_trait]
impl Handler for PushHandler {
    async fn handle(&self, desc: &Descriptor) -> Result<Handled> {
        let content = self.store.read(&desc.digest).await?;
        content::verify(desc, &content)?;

        let mut writer = match self.pusher.push(desc).await {
            Ok(writer) => writer,
            Err(err) if err.is_already_exists() => {
                debug!(digest = %desc.digest, "Remote already has content");
                return Ok(Handled::none());
            }
            Err(err) => return Err(err),
        };

        debug!(digest = %desc.digest, media_type = %desc.media_type, size = desc.size, "Uploading");
        writer.write(content).await?;
        writer.commit().await?;

        Ok(Handled::none())
    }
}
