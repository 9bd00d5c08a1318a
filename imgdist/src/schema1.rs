//! Conversion of legacy Docker schema 1 manifests into schema 2 images.
//!
//! The [`Converter`] is dispatched like any other handler: on the schema 1
//! manifest it reports the manifest's layers as children, and on each layer
//! it stores the blob and records its diff ID. Once the walk is done,
//! [`Converter::convert`] writes a schema 2 config and manifest built from
//! what was collected.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use futures::StreamExt;
use ociclient::{
    Descriptor, Digester, HistoryEntry, ImageManifest, OciDigest, Rootfs, Schema1Manifest,
    media_types,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::content::{self, ContentStore};
use crate::error::{Error, Result};
use crate::handlers::{Handled, Handler};
use crate::remotes::{ByteStream, Fetcher};

/// Keys of a v1 image JSON that have no place in a schema 2 config
const V1_ONLY_KEYS: [&str; 6] = ["id", "parent", "Size", "parent_id", "layer_id", "throwaway"];

#[derive(Debug, Clone)]
struct LayerState {
    size: u64,
    diff_id: OciDigest,
}

#[derive(Default)]
struct State {
    manifest: Option<Schema1Manifest>,
    layers: HashMap<OciDigest, LayerState>,
}

pub struct Converter {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<State>,
}

impl Converter {
    pub fn new(store: Arc<dyn ContentStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            state: Mutex::new(State::default()),
        }
    }

    async fn handle_manifest(&self, desc: &Descriptor) -> Result<Handled> {
        // Signed manifests hash differently than their payload, so the
        // digest is not checked here.
        let content = read_all(self.fetcher.fetch(desc).await?).await?;
        let manifest: Schema1Manifest = serde_json::from_slice(&content).map_err(|e| {
            Error::InvalidContent(format!("schema 1 manifest {}: {}", desc.digest, e))
        })?;

        if manifest.fs_layers.len() != manifest.history.len() {
            return Err(Error::InvalidContent(format!(
                "schema 1 manifest {} has {} layers but {} history entries",
                desc.digest,
                manifest.fs_layers.len(),
                manifest.history.len()
            )));
        }

        let mut children = Vec::new();
        for (layer, history) in manifest.fs_layers.iter().zip(&manifest.history).rev() {
            if is_throwaway(&history.v1_compatibility)? {
                continue;
            }
            // Size is unknown until the blob has been read
            children.push(Descriptor::new(
                media_types::DOCKER_SCHEMA2_LAYER_GZIP,
                layer.blob_sum.clone(),
                0,
            ));
        }

        debug!(digest = %desc.digest, layers = children.len(), "Parsed schema 1 manifest");
        self.lock()?.manifest = Some(manifest);

        Ok(Handled::Children(children))
    }

    async fn handle_layer(&self, desc: &Descriptor) -> Result<Handled> {
        let content = if self.store.has(&desc.digest).await? {
            self.store.read(&desc.digest).await?
        } else {
            let content = read_all(self.fetcher.fetch(desc).await?).await?;
            content::verify_digest(&desc.digest, &content)?;
            self.store.write(&desc.digest, content.clone()).await?;
            content
        };

        let size = content.len() as u64;
        let diff_id = diff_id(content).await?;
        debug!(digest = %desc.digest, %diff_id, size, "Converted schema 1 layer");

        self.lock()?.layers.insert(desc.digest.clone(), LayerState { size, diff_id });

        Ok(Handled::none())
    }

    /// Write a schema 2 config and manifest for the handled schema 1
    /// manifest and return the new manifest's descriptor.
    pub async fn convert(&self) -> Result<Descriptor> {
        let (config, manifest) = {
            let state = self.lock()?;
            let schema1 = state
                .manifest
                .as_ref()
                .ok_or_else(|| Error::Internal("no schema 1 manifest was handled".to_string()))?;
            build_image(schema1, &state.layers)?
        };

        let config_bytes = Bytes::from(serde_json::to_vec(&config)?);
        let config_desc =
            Descriptor::for_content(media_types::DOCKER_SCHEMA2_CONFIG, &config_bytes);
        self.store.write(&config_desc.digest, config_bytes).await?;

        let manifest = ImageManifest {
            config: config_desc,
            ..manifest
        };
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest)?);
        let manifest_desc =
            Descriptor::for_content(media_types::DOCKER_SCHEMA2_MANIFEST, &manifest_bytes);
        self.store.write(&manifest_desc.digest, manifest_bytes).await?;

        info!(
            digest = %manifest_desc.digest,
            layers = manifest.layers.len(),
            "Converted schema 1 image"
        );
        Ok(manifest_desc)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("schema 1 converter state poisoned".to_string()))
    }
}

#[async_trait]
impl Handler for Converter {
    async fn handle(&self, desc: &Descriptor) -> Result<Handled> {
        match desc.media_type.as_str() {
            mt if media_types::is_schema1(mt) => self.handle_manifest(desc).await,
            media_types::DOCKER_SCHEMA2_LAYER_GZIP => self.handle_layer(desc).await,
            other => Err(Error::UnsupportedFormat(format!(
                "{} ({}) in a schema 1 image",
                other, desc.digest
            ))),
        }
    }
}

/// Build the config JSON and a manifest whose config descriptor is still a
/// placeholder.
fn build_image(
    schema1: &Schema1Manifest,
    layers: &HashMap<OciDigest, LayerState>,
) -> Result<(Value, ImageManifest)> {
    let newest = schema1
        .history
        .first()
        .ok_or_else(|| Error::InvalidContent("schema 1 manifest has no history".to_string()))?;
    let mut config: Map<String, Value> = serde_json::from_str(&newest.v1_compatibility)
        .map_err(|e| Error::InvalidContent(format!("v1Compatibility: {}", e)))?;
    for key in V1_ONLY_KEYS {
        config.remove(key);
    }

    let mut diff_ids = Vec::new();
    let mut history = Vec::new();
    let mut manifest_layers = Vec::new();

    for (layer, entry) in schema1.fs_layers.iter().zip(&schema1.history).rev() {
        let v1: Value = serde_json::from_str(&entry.v1_compatibility)
            .map_err(|e| Error::InvalidContent(format!("v1Compatibility: {}", e)))?;
        let throwaway = v1.get("throwaway").and_then(Value::as_bool).unwrap_or(false);

        history.push(HistoryEntry {
            created: string_field(&v1, "created"),
            author: string_field(&v1, "author"),
            created_by: created_by(&v1),
            comment: string_field(&v1, "comment"),
            empty_layer: throwaway.then_some(true),
        });

        if throwaway {
            continue;
        }

        let state = layers.get(&layer.blob_sum).ok_or_else(|| {
            Error::Internal(format!("layer {} was not handled before conversion", layer.blob_sum))
        })?;
        diff_ids.push(state.diff_id.clone());
        manifest_layers.push(Descriptor::new(
            media_types::DOCKER_SCHEMA2_LAYER_GZIP,
            layer.blob_sum.clone(),
            state.size,
        ));
    }

    let rootfs = Rootfs {
        rootfs_type: "layers".to_string(),
        diff_ids,
    };
    config.insert("rootfs".to_string(), serde_json::to_value(rootfs)?);
    config.insert("history".to_string(), serde_json::to_value(history)?);

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(media_types::DOCKER_SCHEMA2_MANIFEST.to_string()),
        config: Descriptor::new(media_types::DOCKER_SCHEMA2_CONFIG, OciDigest::sha256(b""), 0),
        layers: manifest_layers,
        annotations: None,
    };

    Ok((Value::Object(config), manifest))
}

fn is_throwaway(v1_compatibility: &str) -> Result<bool> {
    let v1: Value = serde_json::from_str(v1_compatibility)
        .map_err(|e| Error::InvalidContent(format!("v1Compatibility: {}", e)))?;
    Ok(v1.get("throwaway").and_then(Value::as_bool).unwrap_or(false))
}

fn string_field(v1: &Value, key: &str) -> Option<String> {
    v1.get(key).and_then(Value::as_str).map(str::to_string)
}

fn created_by(v1: &Value) -> Option<String> {
    let cmd = v1.get("container_config")?.get("Cmd")?.as_array()?;
    let parts: Vec<&str> = cmd.iter().filter_map(Value::as_str).collect();
    Some(parts.join(" "))
}

async fn read_all(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// sha256 of the uncompressed layer tar
async fn diff_id(compressed: Bytes) -> Result<OciDigest> {
    tokio::task::spawn_blocking(move || {
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut digester = Digester::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = decoder
                .read(&mut buf)
                .map_err(|e| Error::InvalidContent(format!("layer is not valid gzip: {}", e)))?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
        Ok::<_, Error>(digester.finish())
    })
    .await
    .map_err(|e| Error::Internal(format!("diff ID task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::dispatch::dispatch;
    use crate::storage::Storage;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use futures::stream;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct MapFetcher(HashMap<OciDigest, Bytes>);

    #[async_trait]
    impl Fetcher for MapFetcher {
        async fn fetch(&self, desc: &Descriptor) -> Result<ByteStream> {
            let content = self
                .0
                .get(&desc.digest)
                .cloned()
                .ok_or_else(|| Error::Fetch(format!("no blob {}", desc.digest)))?;
            Ok(stream::iter(vec![Ok(content)]).boxed())
        }
    }

    fn gzip(raw: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[tokio::test]
    async fn test_convert_legacy_image() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default().storage;
        config.fs_root = Some(dir.path().to_path_buf());
        let store = Arc::new(Storage::new(&config).unwrap());

        let (base_raw, top_raw) = (b"base layer tar".to_vec(), b"top layer tar".to_vec());
        let (base, top, empty) = (gzip(&base_raw), gzip(&top_raw), gzip(b""));
        let (base_digest, top_digest, empty_digest) =
            (OciDigest::sha256(&base), OciDigest::sha256(&top), OciDigest::sha256(&empty));

        // Newest first, as schema 1 lists them
        let manifest = serde_json::json!({
            "schemaVersion": 1,
            "name": "library/legacy",
            "tag": "latest",
            "architecture": "amd64",
            "fsLayers": [
                { "blobSum": top_digest.to_string() },
                { "blobSum": empty_digest.to_string() },
                { "blobSum": base_digest.to_string() },
            ],
            "history": [
                { "v1Compatibility": r#"{"id":"c","parent":"b","architecture":"amd64","os":"linux","created":"2016-01-03T00:00:00Z","container_config":{"Cmd":["/bin/sh","-c","echo top"]}}"# },
                { "v1Compatibility": r#"{"id":"b","parent":"a","throwaway":true,"created":"2016-01-02T00:00:00Z"}"# },
                { "v1Compatibility": r#"{"id":"a","created":"2016-01-01T00:00:00Z"}"# },
            ],
        });
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let root = Descriptor::for_content(media_types::DOCKER_SCHEMA1_MANIFEST, &manifest_bytes);

        let fetcher = Arc::new(MapFetcher(HashMap::from([
            (root.digest.clone(), manifest_bytes),
            (base_digest.clone(), base.clone()),
            (top_digest.clone(), top.clone()),
        ])));
        let converter = Arc::new(Converter::new(store.clone(), fetcher));

        dispatch(&CancellationToken::new(), converter.clone(), vec![root])
            .await
            .unwrap();
        let desc = converter.convert().await.unwrap();
        assert_eq!(desc.media_type, media_types::DOCKER_SCHEMA2_MANIFEST);

        let converted: ImageManifest =
            serde_json::from_slice(&store.read(&desc.digest).await.unwrap()).unwrap();
        let layers: Vec<_> = converted.layers.iter().map(|l| (l.digest.clone(), l.size)).collect();
        assert_eq!(layers, vec![(base_digest, base.len() as u64), (top_digest, top.len() as u64)]);
        assert!(!store.has(&empty_digest).await.unwrap());

        let config: Value =
            serde_json::from_slice(&store.read(&converted.config.digest).await.unwrap()).unwrap();
        assert!(config.get("id").is_none());
        assert!(config.get("parent").is_none());
        assert_eq!(config["architecture"], "amd64");
        assert_eq!(
            config["rootfs"]["diff_ids"],
            serde_json::json!([
                OciDigest::sha256(&base_raw).to_string(),
                OciDigest::sha256(&top_raw).to_string()
            ])
        );
        let history = config["history"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1]["empty_layer"], true);
        assert_eq!(history[2]["created_by"], "/bin/sh -c echo top");
    }

    #[tokio::test]
    async fn test_convert_before_handling_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default().storage;
        config.fs_root = Some(dir.path().to_path_buf());
        let store = Arc::new(Storage::new(&config).unwrap());
        let converter = Converter::new(store, Arc::new(MapFetcher(HashMap::new())));

        assert!(matches!(converter.convert().await, Err(Error::Internal(_))));
    }
}
