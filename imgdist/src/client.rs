//! High level entry point: pulls and pushes images between a remote and the
//! local stores, and moves them in and out of archives.

use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use ociclient::{Descriptor, ImageReference, OciDigest, media_types};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::archive::{self, ArchiveFormat};
use crate::config::{AppConfig, PullConfig};
use crate::content::ContentStore;
use crate::dispatch::dispatch;
use crate::error::{Error, Result};
use crate::handlers::{self, ChildrenHandler, Handled, Handler, Handlers, handler_fn};
use crate::images::{self, Image, ImageStore};
use crate::remotes::{FetchHandler, PushHandler, RegistryResolver, Resolver};
use crate::schema1::Converter;
use crate::storage::Storage;

/// Turns a pulled image into a usable filesystem.
#[async_trait]
pub trait Unpacker: Send + Sync {
    async fn unpack(&self, image: &Image, snapshotter: &str) -> Result<()>;
}

/// Per-call settings for [`Client::pull`] and [`Client::push`].
#[derive(Clone)]
pub struct RemoteOptions {
    resolver: Option<Arc<dyn Resolver>>,
    unpack: bool,
    snapshotter: String,
    base_handlers: Vec<Arc<dyn Handler>>,
    convert_schema1: bool,
    cancel: CancellationToken,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self::from_defaults(&AppConfig::default().pull)
    }
}

impl RemoteOptions {
    fn from_defaults(defaults: &PullConfig) -> Self {
        Self {
            resolver: None,
            unpack: defaults.unpack,
            snapshotter: defaults.snapshotter.clone(),
            base_handlers: Vec::new(),
            convert_schema1: defaults.convert_schema1,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `resolver` instead of the client's own
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_unpack(mut self, unpack: bool) -> Self {
        self.unpack = unpack;
        self
    }

    pub fn with_snapshotter(mut self, snapshotter: impl Into<String>) -> Self {
        self.snapshotter = snapshotter.into();
        self
    }

    /// Run `handler` on every descriptor before the built-in handlers
    pub fn with_base_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.base_handlers.push(handler);
        self
    }

    pub fn with_schema1_conversion(mut self, convert: bool) -> Self {
        self.convert_schema1 = convert;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn unpack(&self) -> bool {
        self.unpack
    }

    pub fn snapshotter(&self) -> &str {
        &self.snapshotter
    }

    pub fn convert_schema1(&self) -> bool {
        self.convert_schema1
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub format: ArchiveFormat,
    /// Ref name of the index entry to import; defaults to the reference's tag
    pub ref_object: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub format: ArchiveFormat,
    /// Name recorded in the archive index; defaults to the image's tag
    pub ref_name: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version: String,
    pub revision: String,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.version, self.revision)
    }
}

pub struct Client {
    content: Arc<dyn ContentStore>,
    images: Arc<dyn ImageStore>,
    resolver: Arc<dyn Resolver>,
    unpacker: Option<Arc<dyn Unpacker>>,
    defaults: PullConfig,
}

impl Client {
    pub fn new(
        content: Arc<dyn ContentStore>,
        images: Arc<dyn ImageStore>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            content,
            images,
            resolver,
            unpacker: None,
            defaults: AppConfig::default().pull,
        }
    }

    /// Client over the configured storage, talking to registries.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let storage = Arc::new(Storage::new(&config.storage)?);
        let resolver = Arc::new(RegistryResolver::new(config.registry.clone()));
        info!(
            backend = %config.storage.backend,
            default_host = %config.registry.default_host,
            "Client configured"
        );

        Ok(Self::new(storage.clone(), storage, resolver).with_pull_defaults(config.pull.clone()))
    }

    pub fn with_unpacker(mut self, unpacker: Arc<dyn Unpacker>) -> Self {
        self.unpacker = Some(unpacker);
        self
    }

    pub fn with_pull_defaults(mut self, defaults: PullConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Options seeded with this client's configured defaults
    pub fn remote_options(&self) -> RemoteOptions {
        RemoteOptions::from_defaults(&self.defaults)
    }

    pub fn content_store(&self) -> Arc<dyn ContentStore> {
        self.content.clone()
    }

    pub fn image_store(&self) -> Arc<dyn ImageStore> {
        self.images.clone()
    }

    /// Fetch the image named by `reference` into the content store and
    /// record it. The record only changes once the whole graph is local.
    #[instrument(skip(self, options))]
    pub async fn pull(&self, reference: &str, options: RemoteOptions) -> Result<Image> {
        let resolver = options.resolver.clone().unwrap_or_else(|| self.resolver.clone());
        let (name, root) = resolver.resolve(reference).await?;
        let fetcher = resolver.fetcher(&name).await?;

        let mut handlers = Handlers::new(options.base_handlers.clone());
        let target = if media_types::is_schema1(&root.media_type) {
            if !options.convert_schema1 {
                return Err(Error::UnsupportedFormat(format!(
                    "{} is a schema 1 image, enable conversion to pull it",
                    name
                )));
            }
            let converter = Arc::new(Converter::new(self.content.clone(), fetcher));
            handlers.push(converter.clone());
            dispatch(&options.cancel, Arc::new(handlers), vec![root]).await?;
            converter.convert().await?
        } else {
            handlers.push(Arc::new(FetchHandler::new(self.content.clone(), fetcher)));
            handlers.push(Arc::new(ChildrenHandler::new(self.content.clone())));
            dispatch(&options.cancel, Arc::new(handlers), vec![root.clone()]).await?;
            root
        };

        let image = images::upsert(self.images.as_ref(), Image::new(name, target)).await?;
        info!(name = %image.name, digest = %image.target.digest, "Pulled image");

        if options.unpack {
            let unpacker = self.unpacker.as_ref().ok_or_else(|| {
                Error::Unpack("unpack requested but no unpacker is configured".to_string())
            })?;
            unpacker.unpack(&image, &options.snapshotter).await?;
            debug!(name = %image.name, snapshotter = %options.snapshotter, "Unpacked image");
        }

        Ok(image)
    }

    /// Upload the graph below `desc` to `reference`. Blobs go first, then
    /// manifests, children before the manifests that reference them.
    #[instrument(skip(self, desc, options), fields(digest = %desc.digest))]
    pub async fn push(
        &self,
        reference: &str,
        desc: &Descriptor,
        options: RemoteOptions,
    ) -> Result<()> {
        let resolver = options.resolver.clone().unwrap_or_else(|| self.resolver.clone());
        let pusher = resolver.pusher(reference).await?;

        let manifests = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let filter = {
            let manifests = manifests.clone();
            handler_fn(move |desc: Descriptor| {
                let manifests = manifests.clone();
                async move {
                    if media_types::is_manifest_like(&desc.media_type) {
                        manifests.lock().await.push(desc);
                        return Ok::<_, Error>(Handled::Stop);
                    }
                    Ok(Handled::none())
                }
            })
        };
        let upload = Arc::new(PushHandler::new(self.content.clone(), pusher));

        let mut handlers = Handlers::new(options.base_handlers.clone());
        handlers.push(Arc::new(ChildrenHandler::new(self.content.clone())));
        handlers.push(filter);
        handlers.push(upload.clone());
        dispatch(&options.cancel, Arc::new(handlers), vec![desc.clone()]).await?;

        let held: HashSet<OciDigest> = std::mem::take(&mut *manifests.lock().await)
            .into_iter()
            .map(|manifest| manifest.digest)
            .collect();
        let order = manifest_upload_order(self.content.as_ref(), desc).await?;
        debug!(count = held.len(), "Uploading manifests");
        for manifest in order.iter().filter(|m| held.contains(&m.digest)) {
            if options.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            upload.handle(manifest).await?;
        }

        info!(reference, "Pushed image");
        Ok(())
    }

    pub async fn get_image(&self, name: &str) -> Result<Image> {
        self.images.get(name).await
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        self.images.list().await
    }

    /// Load an archive and record its image under `reference`.
    #[instrument(skip(self, reader, options))]
    pub async fn import<R>(
        &self,
        reference: &str,
        reader: R,
        options: ImportOptions,
    ) -> Result<Image>
    where
        R: Read + Send + 'static,
    {
        archive::import(
            self.content.clone(),
            self.images.clone(),
            reference,
            options.format,
            options.ref_object.as_deref(),
            reader,
        )
        .await
    }

    /// Write the image recorded as `name` to `writer`.
    #[instrument(skip(self, writer, options))]
    pub async fn export<W>(&self, name: &str, writer: W, options: ExportOptions) -> Result<W>
    where
        W: Write + Send + 'static,
    {
        let image = self.images.get(name).await?;
        let ref_name = options.ref_name.clone().or_else(|| {
            name.parse::<ImageReference>()
                .ok()
                .and_then(|parsed| parsed.tag)
        });

        archive::export(
            self.content.clone(),
            &options.cancel,
            &image.target,
            ref_name.as_deref(),
            options.format,
            writer,
        )
        .await
    }

    pub fn version(&self) -> Version {
        Version {
            version: env!("CARGO_PKG_VERSION").to_string(),
            revision: option_env!("IMGDIST_GIT_REVISION").unwrap_or("unknown").to_string(),
        }
    }
}

/// Manifests reachable from `root` through manifests only, each once and
/// after every manifest it references.
async fn manifest_upload_order(
    store: &dyn ContentStore,
    root: &Descriptor,
) -> Result<Vec<Descriptor>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // (descriptor, children already queued)
    let mut stack = vec![(root.clone(), false)];

    while let Some((desc, expanded)) = stack.pop() {
        if expanded {
            order.push(desc);
            continue;
        }
        if !media_types::is_manifest_like(&desc.media_type) {
            continue;
        }
        if !visited.insert(desc.digest.clone()) {
            continue;
        }
        let children = handlers::children(store, &desc).await?;
        stack.push((desc, true));
        for child in children.into_iter().rev() {
            if !visited.contains(&child.digest) {
                stack.push((child, false));
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use tempfile::TempDir;

    fn client(dir: &TempDir) -> Client {
        let mut config = AppConfig::default();
        config.storage.fs_root = Some(dir.path().to_path_buf());
        config.pull = PullConfig {
            snapshotter: "native".to_string(),
            unpack: true,
            convert_schema1: true,
        };
        config.registry = RegistryConfig {
            default_host: "localhost:5000".to_string(),
            plain_http_hosts: Vec::new(),
        };
        Client::from_config(&config).unwrap()
    }

    #[test]
    fn test_remote_options_follow_config() {
        let dir = TempDir::new().unwrap();
        let options = client(&dir).remote_options();
        assert!(options.unpack());
        assert!(options.convert_schema1());
        assert_eq!(options.snapshotter(), "native");

        let options = options.with_unpack(false).with_snapshotter("overlayfs");
        assert!(!options.unpack());
        assert_eq!(options.snapshotter(), "overlayfs");
    }

    #[test]
    fn test_version_reports_crate_version() {
        let dir = TempDir::new().unwrap();
        let version = client(&dir).version();
        assert_eq!(version.version, env!("CARGO_PKG_VERSION"));
        assert!(!version.revision.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_image() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        assert!(client.get_image("localhost:5000/app:v1").await.unwrap_err().is_not_found());
        assert!(client.list_images().await.unwrap().is_empty());
    }
}
