//! Resolver backed by the OCI distribution HTTP API.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use ociclient::{Client, ClientSession, Descriptor, Digester, ImageReference, media_types};
use tracing::{debug, info};

use super::{ByteStream, ContentWriter, Fetcher, Pusher, Resolver};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};

const DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Anonymous resolver for registries speaking the distribution API.
#[derive(Debug, Clone)]
pub struct RegistryResolver {
    config: RegistryConfig,
    http: reqwest::Client,
}

impl RegistryResolver {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Fill in the default registry and the Docker Hub `library/` namespace.
    pub fn normalize(&self, reference: &str) -> Result<ImageReference> {
        let mut parsed: ImageReference = reference
            .parse()
            .map_err(|e| Error::resolve(reference, e))?;

        let host = parsed
            .hostname
            .get_or_insert_with(|| self.config.default_host.clone())
            .clone();
        if DOCKER_HUB_ALIASES.contains(&host.as_str()) && !parsed.name.contains('/') {
            parsed.name = format!("library/{}", parsed.name);
        }

        Ok(parsed)
    }

    fn session(&self, reference: &ImageReference) -> ClientSession {
        let host = reference
            .hostname
            .clone()
            .unwrap_or_else(|| self.config.default_host.clone());
        let api_host = if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
            DOCKER_HUB_API_HOST.to_string()
        } else {
            host
        };
        let scheme = if self.is_plain_http(&api_host) { "http" } else { "https" };

        Client::with_http_client(format!("{}://{}", scheme, api_host), self.http.clone())
            .new_session(reference.name.clone())
    }

    fn is_plain_http(&self, host: &str) -> bool {
        let bare = host.split(':').next().unwrap_or(host);
        bare == "localhost"
            || bare == "127.0.0.1"
            || self.config.plain_http_hosts.iter().any(|h| h == host || h == bare)
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let parsed = self.normalize(reference)?;
        let session = self.session(&parsed);

        let desc = session
            .resolve_manifest(&parsed.object())
            .await
            .map_err(|e| Error::resolve(reference, format!("{:#}", e)))?
            .ok_or_else(|| Error::resolve(reference, "manifest not found"))?;

        info!(reference, digest = %desc.digest, media_type = %desc.media_type, "Resolved");
        Ok((parsed.to_string(), desc))
    }

    async fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>> {
        let parsed = self.normalize(name)?;
        Ok(Arc::new(RegistryFetcher {
            session: self.session(&parsed),
        }))
    }

    async fn pusher(&self, reference: &str) -> Result<Arc<dyn Pusher>> {
        let parsed = self.normalize(reference)?;
        Ok(Arc::new(RegistryPusher {
            session: self.session(&parsed),
            tag: parsed.tag.clone(),
        }))
    }
}

struct RegistryFetcher {
    session: ClientSession,
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream> {
        let media_type = desc.media_type.as_str();
        let is_manifest =
            media_types::is_manifest_like(media_type) || media_types::is_schema1(media_type);
        let stream = if is_manifest {
            self.session.fetch_manifest(&desc.digest, media_type).await
        } else {
            self.session.fetch_blob_stream(&desc.digest).await
        }
        .map_err(|e| Error::Fetch(format!("{:#}", e)))?;

        Ok(stream.map_err(|e| Error::Fetch(format!("{:#}", e))).boxed())
    }
}

struct RegistryPusher {
    session: ClientSession,
    tag: Option<String>,
}

#[async_trait]
impl Pusher for RegistryPusher {
    async fn push(&self, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        let manifest_ref = if media_types::is_manifest_like(&desc.media_type) {
            // Manifests land on the tag; the root goes last so the tag ends on it
            let target = self.tag.clone().unwrap_or_else(|| desc.digest.to_string());
            let current = self
                .session
                .manifest_digest(&target)
                .await
                .map_err(|e| Error::Upload(format!("{:#}", e)))?;
            if current.as_ref() == Some(&desc.digest) {
                return Err(Error::AlreadyExists(format!("manifest {}", desc.digest)));
            }
            Some(target)
        } else {
            let exists = self
                .session
                .blob_exists(&desc.digest)
                .await
                .map_err(|e| Error::Upload(format!("{:#}", e)))?;
            if exists {
                return Err(Error::AlreadyExists(format!("blob {}", desc.digest)));
            }
            None
        };

        Ok(Box::new(RegistryWriter {
            session: self.session.clone(),
            desc: desc.clone(),
            manifest_ref,
            buf: BytesMut::with_capacity(desc.size as usize),
            digester: Digester::new(),
        }))
    }
}

struct RegistryWriter {
    session: ClientSession,
    desc: Descriptor,
    manifest_ref: Option<String>,
    buf: BytesMut,
    digester: Digester,
}

#[async_trait]
impl ContentWriter for RegistryWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.digester.update(&chunk);
        if self.digester.len() > self.desc.size {
            return Err(Error::SizeMismatch {
                digest: self.desc.digest.clone(),
                expected: self.desc.size,
                actual: self.digester.len(),
            });
        }
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let written = self.digester.len();
        if written != self.desc.size {
            return Err(Error::SizeMismatch {
                digest: self.desc.digest.clone(),
                expected: self.desc.size,
                actual: written,
            });
        }
        let actual = std::mem::take(&mut self.digester).finish();
        if actual != self.desc.digest {
            return Err(Error::DigestMismatch {
                expected: self.desc.digest.clone(),
                actual,
            });
        }

        let content = std::mem::take(&mut self.buf).freeze();
        let result = match &self.manifest_ref {
            Some(reference) => {
                debug!(repository = self.session.repository(), reference, "Putting manifest");
                self.session
                    .put_manifest(reference, &self.desc.media_type, content)
                    .await
            }
            None => self.session.upload_blob(&self.desc.digest, content).await,
        };

        result.map_err(|e| Error::Upload(format!("{:#}", e)))
    }
}
