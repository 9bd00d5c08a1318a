#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use ociclient::{Descriptor, ImageIndex, ImageManifest, OciDigest, media_types};
use tempfile::TempDir;

use imgdist::config::AppConfig;
use imgdist::content::ContentStore;
use imgdist::error::{Error, Result};
use imgdist::remotes::{ByteStream, ContentWriter, Fetcher, Pusher, Resolver};
use imgdist::storage::Storage;

pub fn storage(dir: &TempDir) -> Arc<Storage> {
    let mut config = AppConfig::default().storage;
    config.fs_root = Some(dir.path().to_path_buf());
    Arc::new(Storage::new(&config).unwrap())
}

#[derive(Default)]
struct RegistryState {
    blobs: HashMap<OciDigest, Bytes>,
    tags: HashMap<String, Descriptor>,
    failing: HashSet<OciDigest>,
    fetched: Vec<OciDigest>,
    uploaded: Vec<Descriptor>,
}

/// In-memory registry that records every fetch and upload.
#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_blob(&self, digest: OciDigest, content: Bytes) {
        self.state.lock().unwrap().blobs.insert(digest, content);
    }

    pub fn tag(&self, reference: &str, desc: &Descriptor) {
        self.state.lock().unwrap().tags.insert(reference.to_string(), desc.clone());
    }

    /// Make every fetch of `digest` fail
    pub fn fail_fetch(&self, digest: &OciDigest) {
        self.state.lock().unwrap().failing.insert(digest.clone());
    }

    pub fn has_blob(&self, digest: &OciDigest) -> bool {
        self.state.lock().unwrap().blobs.contains_key(digest)
    }

    pub fn fetched(&self) -> Vec<OciDigest> {
        self.state.lock().unwrap().fetched.clone()
    }

    pub fn uploaded(&self) -> Vec<Descriptor> {
        self.state.lock().unwrap().uploaded.clone()
    }
}

#[async_trait]
impl Resolver for FakeRegistry {
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let desc = self
            .state
            .lock()
            .unwrap()
            .tags
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::resolve(reference, "unknown reference"))?;
        Ok((reference.to_string(), desc))
    }

    async fn fetcher(&self, _name: &str) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(self.clone()))
    }

    async fn pusher(&self, _reference: &str) -> Result<Arc<dyn Pusher>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Fetcher for FakeRegistry {
    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream> {
        let mut state = self.state.lock().unwrap();
        state.fetched.push(desc.digest.clone());
        if state.failing.contains(&desc.digest) {
            return Err(Error::Fetch(format!("connection reset fetching {}", desc.digest)));
        }
        let content = state
            .blobs
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| Error::Fetch(format!("{} not found", desc.digest)))?;

        // Deliver in two chunks like a real body would
        let mid = content.len() / 2;
        let chunks = vec![Ok(content.slice(..mid)), Ok(content.slice(mid..))];
        Ok(stream::iter(chunks).boxed())
    }
}

#[async_trait]
impl Pusher for FakeRegistry {
    async fn push(&self, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        if self.has_blob(&desc.digest) {
            return Err(Error::AlreadyExists(desc.digest.to_string()));
        }
        Ok(Box::new(FakeWriter {
            registry: self.clone(),
            desc: desc.clone(),
            buf: Vec::new(),
        }))
    }
}

struct FakeWriter {
    registry: FakeRegistry,
    desc: Descriptor,
    buf: Vec<u8>,
}

#[async_trait]
impl ContentWriter for FakeWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let actual = OciDigest::sha256(&self.buf);
        if actual != self.desc.digest || self.buf.len() as u64 != self.desc.size {
            let reason = format!("{} does not match its descriptor", self.desc.digest);
            return Err(Error::Upload(reason));
        }
        let mut state = self.registry.state.lock().unwrap();
        state.blobs.insert(actual, Bytes::from(std::mem::take(&mut self.buf)));
        state.uploaded.push(self.desc.clone());
        Ok(())
    }
}

/// Blobs of a content graph under construction.
#[derive(Default)]
pub struct Graph {
    pub blobs: Vec<(Descriptor, Bytes)>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob(&mut self, media_type: &str, content: impl Into<Bytes>) -> Descriptor {
        let content = content.into();
        let desc = Descriptor::for_content(media_type, &content);
        self.blobs.push((desc.clone(), content));
        desc
    }

    pub fn manifest(&mut self, config: Descriptor, layers: Vec<Descriptor>) -> Descriptor {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::OCI_IMAGE_MANIFEST.to_string()),
            config,
            layers,
            annotations: None,
        };
        self.blob(media_types::OCI_IMAGE_MANIFEST, serde_json::to_vec(&manifest).unwrap())
    }

    pub fn index(&mut self, manifests: Vec<Descriptor>) -> Descriptor {
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(media_types::OCI_IMAGE_INDEX.to_string()),
            manifests,
            annotations: None,
        };
        self.blob(media_types::OCI_IMAGE_INDEX, serde_json::to_vec(&index).unwrap())
    }

    /// Config plus two layers whose content derives from `seed`
    pub fn image(&mut self, seed: &str) -> Descriptor {
        let config = self.blob(
            media_types::OCI_IMAGE_CONFIG,
            format!("{{\"architecture\":\"amd64\",\"os\":\"linux\",\"seed\":\"{}\"}}", seed),
        );
        let l1 = self.blob(media_types::OCI_IMAGE_LAYER_GZIP, format!("{} layer one", seed));
        let l2 = self.blob(media_types::OCI_IMAGE_LAYER_GZIP, format!("{} layer two", seed));
        self.manifest(config, vec![l1, l2])
    }

    pub fn publish(&self, registry: &FakeRegistry) {
        for (desc, content) in &self.blobs {
            registry.add_blob(desc.digest.clone(), content.clone());
        }
    }

    pub async fn store(&self, store: &dyn ContentStore) {
        for (desc, content) in &self.blobs {
            store.write(&desc.digest, content.clone()).await.unwrap();
        }
    }
}
