use std::str::FromStr;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client as ReqwestClient, StatusCode, header};
use tracing::debug;

use crate::digest::OciDigest;
use crate::media_types;
use crate::models::Descriptor;

/// Header registries use to report the digest of a manifest or blob
const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Body of a blob or manifest, streamed from the registry
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// A client for interacting with an OCI registry.
#[derive(Debug, Clone)]
pub struct Client {
    registry_url: String,
    client: ReqwestClient,
}

impl Client {
    /// Create a new client for the given registry URL.
    pub fn new(registry_url: String) -> Self {
        Self::with_http_client(registry_url, ReqwestClient::new())
    }

    pub fn with_http_client(registry_url: String, client: ReqwestClient) -> Self {
        Self {
            registry_url: registry_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Create a new session for the given repository.
    pub fn new_session(&self, repository: String) -> ClientSession {
        ClientSession {
            repository,
            registry_url: self.registry_url.clone(),
            client: self.client.clone(),
        }
    }
}

/// A session for interacting with a specific repository in an OCI registry.
#[derive(Debug, Clone)]
pub struct ClientSession {
    repository: String,
    registry_url: String,
    client: ReqwestClient,
}

impl ClientSession {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.registry_url, self.repository, reference)
    }

    fn blob_url(&self, digest: &OciDigest) -> String {
        format!("{}/v2/{}/blobs/{}", self.registry_url, self.repository, digest)
    }

    /// Resolve a tag or digest to the descriptor of the manifest it names.
    ///
    /// Returns `None` when the registry does not know the reference.
    pub async fn resolve_manifest(&self, reference: &str) -> Result<Option<Descriptor>> {
        let url = self.manifest_url(reference);
        let accept = media_types::MANIFEST_ACCEPT.join(", ");

        let response = self
            .client
            .head(&url)
            .header(header::ACCEPT, &accept)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("Failed to resolve manifest {}: {}", reference, response.status()));
        }

        let media_type = content_type(response.headers())
            .ok_or_else(|| anyhow!("Registry did not report a media type for {}", reference))?;
        let size = content_length(response.headers());
        let digest = header_digest(response.headers())
            .or_else(|| OciDigest::from_str(reference).ok());

        if let (Some(digest), Some(size)) = (digest, size) {
            debug!(repository = %self.repository, reference, %digest, "Resolved manifest");
            return Ok(Some(Descriptor::new(media_type, digest, size)));
        }

        // Some registries omit the digest on HEAD; fall back to hashing the body
        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, &accept)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status() != StatusCode::OK {
            return Err(anyhow!("Failed to fetch manifest {}: {}", reference, response.status()));
        }
        let body = response.bytes().await?;
        debug!(repository = %self.repository, reference, "Resolved manifest by content");
        Ok(Some(Descriptor::for_content(media_type, &body)))
    }

    /// Report the digest a manifest reference currently points to, if any.
    pub async fn manifest_digest(&self, reference: &str) -> Result<Option<OciDigest>> {
        let url = self.manifest_url(reference);
        let response = self
            .client
            .head(&url)
            .header(header::ACCEPT, media_types::MANIFEST_ACCEPT.join(", "))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(header_digest(response.headers())),
            status => Err(anyhow!("Failed to check manifest {}: {}", reference, status)),
        }
    }

    /// Stream a manifest by digest.
    pub async fn fetch_manifest(&self, digest: &OciDigest, media_type: &str) -> Result<BlobStream> {
        let url = self.manifest_url(&digest.to_string());
        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, media_type)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(anyhow!("Failed to fetch manifest {}: {}", digest, response.status()));
        }

        Ok(response.bytes_stream().map_err(anyhow::Error::from).boxed())
    }

    /// Stream a blob by digest.
    pub async fn fetch_blob_stream(&self, digest: &OciDigest) -> Result<BlobStream> {
        let response = self.client.get(self.blob_url(digest)).send().await?;

        if response.status() != StatusCode::OK {
            return Err(anyhow!("Failed to fetch blob {}: {}", digest, response.status()));
        }

        Ok(response.bytes_stream().map_err(anyhow::Error::from).boxed())
    }

    /// Check if a blob with the given digest exists.
    pub async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        let response = self.client.head(self.blob_url(digest)).send().await?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Upload a blob in a single request after opening an upload session.
    pub async fn upload_blob(&self, digest: &OciDigest, content: Bytes) -> Result<()> {
        let start_url = format!("{}/v2/{}/blobs/uploads/", self.registry_url, self.repository);
        debug!(repository = %self.repository, %digest, "Starting blob upload");
        let start_response = self.client.post(&start_url).send().await?;

        if start_response.status() != StatusCode::ACCEPTED {
            let status = start_response.status();
            let error_body = start_response.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to start upload: {} - {}", status, error_body));
        }

        let location = start_response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| anyhow!("No location header in response"))?
            .to_str()?;

        let upload_url = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{}", self.registry_url, location)
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let complete_url = format!("{}{}digest={}", upload_url, separator, digest);

        let complete_response = self
            .client
            .put(&complete_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, content.len())
            .body(content)
            .send()
            .await?;

        if complete_response.status() != StatusCode::CREATED {
            return Err(anyhow!("Failed to complete upload: {}", complete_response.status()));
        }

        Ok(())
    }

    /// Store a manifest under a tag or digest.
    pub async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        content: Bytes,
    ) -> Result<()> {
        let response = self
            .client
            .put(self.manifest_url(reference))
            .header(header::CONTENT_TYPE, media_type)
            .body(content)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED && response.status() != StatusCode::OK {
            return Err(anyhow!("Failed to register manifest {}: {}", reference, response.status()));
        }

        Ok(())
    }
}

fn content_type(headers: &header::HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    // Drop parameters such as "; charset=utf-8"
    let media_type = value.split(';').next()?.trim();
    (!media_type.is_empty()).then(|| media_type.to_string())
}

fn content_length(headers: &header::HeaderMap) -> Option<u64> {
    headers.get(header::CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

fn header_digest(headers: &header::HeaderMap) -> Option<OciDigest> {
    headers.get(CONTENT_DIGEST_HEADER)?.to_str().ok()?.parse().ok()
}
