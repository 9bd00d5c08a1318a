//! Per-descriptor units of work run by the dispatcher.
//!
//! A handler performs its effect for one descriptor and reports which
//! descriptors the walk should visit next. Handlers are composed into a
//! [`Handlers`] chain that runs every member, in order, for the same
//! descriptor.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use ociclient::{Descriptor, ImageIndex, ImageManifest, media_types};
use tracing::debug;

use crate::content::ContentStore;
use crate::error::{Error, Result};

/// What a handler decided about the descriptor it was given.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Done; walk these children (possibly none).
    Children(Vec<Descriptor>),
    /// Done; do not run the rest of the chain for this descriptor.
    /// Children reported by earlier members of the chain are still walked.
    Stop,
    /// Done; walk nothing below this descriptor.
    Skip,
}

impl Handled {
    pub fn none() -> Self {
        Handled::Children(Vec::new())
    }

    /// Children the dispatcher should walk after this outcome
    pub fn into_children(self) -> Vec<Descriptor> {
        match self {
            Handled::Children(children) => children,
            Handled::Stop | Handled::Skip => Vec::new(),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, desc: &Descriptor) -> Result<Handled>;
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Descriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Handled>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Descriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Handled>> + Send,
{
    async fn handle(&self, desc: &Descriptor) -> Result<Handled> {
        (self.0)(desc.clone()).await
    }
}

/// Ordered chain of handlers sharing one descriptor.
#[derive(Clone, Default)]
pub struct Handlers {
    members: Vec<Arc<dyn Handler>>,
}

impl Handlers {
    pub fn new(members: Vec<Arc<dyn Handler>>) -> Self {
        Self { members }
    }

    pub fn push(&mut self, handler: Arc<dyn Handler>) {
        self.members.push(handler);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl Handler for Handlers {
    async fn handle(&self, desc: &Descriptor) -> Result<Handled> {
        let mut children = Vec::new();
        for member in &self.members {
            match member.handle(desc).await? {
                Handled::Children(found) => children.extend(found),
                Handled::Stop => break,
                Handled::Skip => return Ok(Handled::Skip),
            }
        }
        Ok(Handled::Children(children))
    }
}

/// Reports the children of manifests and indexes already in the store.
pub struct ChildrenHandler {
    store: Arc<dyn ContentStore>,
}

impl ChildrenHandler {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for ChildrenHandler {
    async fn handle(&self, desc: &Descriptor) -> Result<Handled> {
        children(self.store.as_ref(), desc).await.map(Handled::Children)
    }
}

/// Child descriptors of `desc`, read from `store`.
pub async fn children(store: &dyn ContentStore, desc: &Descriptor) -> Result<Vec<Descriptor>> {
    let media_type = desc.media_type.as_str();

    if media_types::is_manifest(media_type) {
        let content = store.read(&desc.digest).await?;
        let manifest: ImageManifest = serde_json::from_slice(&content)
            .map_err(|e| Error::InvalidContent(format!("manifest {}: {}", desc.digest, e)))?;
        let mut children = Vec::with_capacity(manifest.layers.len() + 1);
        children.push(manifest.config);
        children.extend(manifest.layers);
        return Ok(children);
    }

    if media_types::is_index(media_type) {
        let content = store.read(&desc.digest).await?;
        let index: ImageIndex = serde_json::from_slice(&content)
            .map_err(|e| Error::InvalidContent(format!("index {}: {}", desc.digest, e)))?;
        return Ok(index.manifests);
    }

    if !media_types::is_layer(media_type) && !media_types::is_config(media_type) {
        debug!(
            digest = %desc.digest,
            media_type,
            "Encountered unknown type, children may not be fetched"
        );
    }

    Ok(Vec::new())
}
