//! OCI image-layout tar archives.
//!
//! An archive holds `oci-layout`, an `index.json` pointing at the exported
//! roots and every blob under `blobs/<algorithm>/<hex>`. Tar work is
//! synchronous, so it runs on the blocking pool; talking to the stores
//! happens before or after it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use ociclient::{Descriptor, ImageIndex, ImageReference, OciDigest, OciLayout, media_types};
use tar::{Archive, Builder, EntryType, Header};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::ContentStore;
use crate::dispatch::dispatch;
use crate::error::{Error, Result};
use crate::handlers::{ChildrenHandler, Handled, Handlers, handler_fn};
use crate::images::{self, Image, ImageStore};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    /// OCI image layout
    #[default]
    Oci,
    /// `docker save` layout
    Docker,
}

impl ArchiveFormat {
    fn ensure_supported(self) -> Result<()> {
        match self {
            ArchiveFormat::Oci => Ok(()),
            ArchiveFormat::Docker => Err(Error::UnsupportedFormat(
                "docker archives are not supported, use the oci format".to_string(),
            )),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveFormat::Oci => write!(f, "oci"),
            ArchiveFormat::Docker => write!(f, "docker"),
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oci" => Ok(ArchiveFormat::Oci),
            "docker" => Ok(ArchiveFormat::Docker),
            other => Err(Error::UnsupportedFormat(format!("archive format {}", other))),
        }
    }
}

/// Write the graph below `desc` to `writer` as an image-layout tar and
/// hand the writer back.
pub async fn export<W>(
    store: Arc<dyn ContentStore>,
    cancel: &CancellationToken,
    desc: &Descriptor,
    ref_name: Option<&str>,
    format: ArchiveFormat,
    writer: W,
) -> Result<W>
where
    W: Write + Send + 'static,
{
    format.ensure_supported()?;

    let blobs = Arc::new(tokio::sync::Mutex::new(BTreeMap::new()));
    let collector = {
        let store = store.clone();
        let blobs = blobs.clone();
        handler_fn(move |desc: Descriptor| {
            let store = store.clone();
            let blobs = blobs.clone();
            async move {
                let content = store.read(&desc.digest).await?;
                blobs.lock().await.insert(desc.digest.clone(), content);
                Ok::<_, Error>(Handled::none())
            }
        })
    };
    let handler = Handlers::new(vec![collector, Arc::new(ChildrenHandler::new(store))]);
    dispatch(cancel, Arc::new(handler), vec![desc.clone()]).await?;

    let blobs = std::mem::take(&mut *blobs.lock().await);
    let mut root = desc.clone();
    if let Some(name) = ref_name {
        root.annotations
            .get_or_insert_with(HashMap::new)
            .insert(media_types::ANNOTATION_REF_NAME.to_string(), name.to_string());
    }
    let index = ImageIndex {
        schema_version: 2,
        media_type: Some(media_types::OCI_IMAGE_INDEX.to_string()),
        manifests: vec![root],
        annotations: None,
    };

    let count = blobs.len();
    let writer = tokio::task::spawn_blocking(move || write_layout(writer, &index, &blobs))
        .await
        .map_err(|e| Error::Internal(format!("export task failed: {}", e)))??;

    info!(digest = %desc.digest, blobs = count, "Exported image");
    Ok(writer)
}

fn write_layout<W: Write>(
    writer: W,
    index: &ImageIndex,
    blobs: &BTreeMap<OciDigest, Bytes>,
) -> Result<W> {
    let mut builder = Builder::new(writer);

    append_file(&mut builder, "oci-layout", &serde_json::to_vec(&OciLayout::default())?)?;
    append_file(&mut builder, "index.json", &serde_json::to_vec(index)?)?;

    append_dir(&mut builder, "blobs/")?;
    let mut algorithms: Vec<&str> = blobs.keys().map(OciDigest::algorithm).collect();
    algorithms.dedup();
    for algorithm in algorithms {
        append_dir(&mut builder, &format!("blobs/{}/", algorithm))?;
    }
    for (digest, content) in blobs {
        let path = format!("blobs/{}/{}", digest.algorithm(), digest.hex());
        append_file(&mut builder, &path, content)?;
    }

    Ok(builder.into_inner()?)
}

fn append_file<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut Builder<W>, path: &str) -> Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    builder.append_data(&mut header, path, std::io::empty())?;
    Ok(())
}

/// Contents of an image-layout archive
#[derive(Debug)]
struct Layout {
    index: ImageIndex,
    blobs: Vec<(OciDigest, Bytes)>,
}

/// Load an image-layout tar (plain or gzip) into the stores and record it
/// under `reference`. `ref_object` picks the index entry by ref name.
pub async fn import<R>(
    store: Arc<dyn ContentStore>,
    image_store: Arc<dyn ImageStore>,
    reference: &str,
    format: ArchiveFormat,
    ref_object: Option<&str>,
    reader: R,
) -> Result<Image>
where
    R: Read + Send + 'static,
{
    format.ensure_supported()?;
    let parsed: ImageReference = reference
        .parse()
        .map_err(|e| Error::resolve(reference, e))?;

    let layout = tokio::task::spawn_blocking(move || read_layout(reader))
        .await
        .map_err(|e| Error::Internal(format!("import task failed: {}", e)))??;

    let count = layout.blobs.len();
    for (digest, content) in layout.blobs {
        store.write(&digest, content).await?;
    }
    debug!(blobs = count, "Imported blobs");

    let target = match ref_object {
        Some(name) => named_entry(&layout.index, name)?
            .ok_or_else(|| Error::NotFound(format!("archive has no image named {}", name)))?,
        None => select_target(&layout.index, parsed.tag.as_deref())?,
    };
    if !store.has(&target.digest).await? {
        return Err(Error::NotFound(format!("archive has no blob for {}", target.digest)));
    }

    let image = images::upsert(image_store.as_ref(), Image::new(reference, target)).await?;
    info!(name = %image.name, digest = %image.target.digest, "Imported image");
    Ok(image)
}

/// The index entry whose ref name is `name`, if exactly one has it.
fn named_entry(index: &ImageIndex, name: &str) -> Result<Option<Descriptor>> {
    let mut named = index
        .manifests
        .iter()
        .filter(|m| m.annotation(media_types::ANNOTATION_REF_NAME) == Some(name));
    match (named.next(), named.next()) {
        (Some(_), Some(_)) => Err(Error::NotFound(format!(
            "archive names {} more than once",
            name
        ))),
        (found, _) => Ok(found.cloned()),
    }
}

/// The index entry named by `tag`, or the only entry of the index.
fn select_target(index: &ImageIndex, tag: Option<&str>) -> Result<Descriptor> {
    if let Some(found) = tag.map(|tag| named_entry(index, tag)).transpose()?.flatten() {
        return Ok(found);
    }

    match index.manifests.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(Error::NotFound("archive index is empty".to_string())),
        _ => Err(Error::NotFound(format!(
            "archive holds {} images and none is named {}",
            index.manifests.len(),
            tag.unwrap_or("<untagged>")
        ))),
    }
}

fn read_layout<R: Read>(reader: R) -> Result<Layout> {
    let mut reader = BufReader::new(reader);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    if is_gzip {
        read_entries(Archive::new(GzDecoder::new(reader)))
    } else {
        read_entries(Archive::new(reader))
    }
}

fn read_entries<R: Read>(mut archive: Archive<R>) -> Result<Layout> {
    let mut index = None;
    let mut blobs = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        match path.as_str() {
            "index.json" => {
                let parsed: ImageIndex = serde_json::from_slice(&data)
                    .map_err(|e| Error::InvalidContent(format!("index.json: {}", e)))?;
                index = Some(parsed);
            }
            "oci-layout" => {
                let layout: OciLayout = serde_json::from_slice(&data)
                    .map_err(|e| Error::InvalidContent(format!("oci-layout: {}", e)))?;
                if layout.image_layout_version != OciLayout::default().image_layout_version {
                    warn!(
                        version = %layout.image_layout_version,
                        "Unexpected image layout version"
                    );
                }
            }
            other => match other.strip_prefix("blobs/").and_then(|rest| rest.split_once('/')) {
                Some((algorithm, hex)) => {
                    let digest: OciDigest = format!("{}:{}", algorithm, hex)
                        .parse()
                        .map_err(|e| Error::InvalidContent(format!("{}: {}", other, e)))?;
                    blobs.push((digest, Bytes::from(data)));
                }
                None => debug!(path = other, "Ignoring archive entry"),
            },
        }
    }

    let index =
        index.ok_or_else(|| Error::InvalidContent("archive has no index.json".to_string()))?;
    Ok(Layout { index, blobs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::storage::Storage;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use ociclient::ImageManifest;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> Arc<Storage> {
        let mut config = AppConfig::default().storage;
        config.fs_root = Some(dir.path().to_path_buf());
        Arc::new(Storage::new(&config).unwrap())
    }

    /// Store a one-layer image and return its manifest descriptor
    async fn seed_image(store: &Storage, layer: &'static [u8]) -> Descriptor {
        let layer = Bytes::from_static(layer);
        let config = Bytes::from_static(b"{\"architecture\":\"amd64\"}");
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::OCI_IMAGE_MANIFEST.to_string()),
            config: Descriptor::for_content(media_types::OCI_IMAGE_CONFIG, &config),
            layers: vec![Descriptor::for_content(media_types::OCI_IMAGE_LAYER, &layer)],
            annotations: None,
        };
        let manifest = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        for blob in [layer, config, manifest.clone()] {
            store.write(&OciDigest::sha256(&blob), blob).await.unwrap();
        }
        Descriptor::for_content(media_types::OCI_IMAGE_MANIFEST, &manifest)
    }

    fn named(desc: &Descriptor, name: &str) -> Descriptor {
        let mut desc = desc.clone();
        desc.annotations = Some(HashMap::from([(
            media_types::ANNOTATION_REF_NAME.to_string(),
            name.to_string(),
        )]));
        desc
    }

    #[tokio::test]
    async fn test_export_then_import() {
        let (src_dir, dst_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (src, dst) = (storage(&src_dir), storage(&dst_dir));
        let root = seed_image(&src, b"layer tar").await;
        let cancel = CancellationToken::new();

        let tarball = export(src, &cancel, &root, Some("v1"), ArchiveFormat::Oci, Vec::new())
            .await
            .unwrap();

        let reader = std::io::Cursor::new(tarball);
        let reference = "example.com/app:v1";
        let image = import(dst.clone(), dst.clone(), reference, ArchiveFormat::Oci, None, reader)
            .await
            .unwrap();
        assert_eq!(image.target, root);
        assert_eq!(image.target.annotation(media_types::ANNOTATION_REF_NAME), Some("v1"));
        assert_eq!(dst.get(reference).await.unwrap().target, root);

        let manifest: ImageManifest =
            serde_json::from_slice(&dst.read(&root.digest).await.unwrap()).unwrap();
        assert!(dst.has(&manifest.config.digest).await.unwrap());
        assert!(dst.has(&manifest.layers[0].digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_import_accepts_gzip() {
        let (src_dir, dst_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (src, dst) = (storage(&src_dir), storage(&dst_dir));
        let root = seed_image(&src, b"layer tar").await;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let cancel = CancellationToken::new();
        let encoder = export(src, &cancel, &root, None, ArchiveFormat::Oci, encoder)
            .await
            .unwrap();
        let compressed = std::io::Cursor::new(encoder.finish().unwrap());

        // A single untagged entry is taken whatever the reference's tag
        let image = import(dst.clone(), dst, "app:anything", ArchiveFormat::Oci, None, compressed)
            .await
            .unwrap();
        assert_eq!(image.target, root);
    }

    #[tokio::test]
    async fn test_import_ref_object_overrides_tag() {
        let (src_dir, dst_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (src, dst) = (storage(&src_dir), storage(&dst_dir));
        let one = seed_image(&src, b"layer one").await;
        let two = seed_image(&src, b"layer two").await;

        let mut blobs = BTreeMap::new();
        for root in [&one, &two] {
            let content = src.read(&root.digest).await.unwrap();
            let manifest: ImageManifest = serde_json::from_slice(&content).unwrap();
            for desc in [&manifest.config, &manifest.layers[0]] {
                blobs.insert(desc.digest.clone(), src.read(&desc.digest).await.unwrap());
            }
            blobs.insert(root.digest.clone(), content);
        }
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(media_types::OCI_IMAGE_INDEX.to_string()),
            manifests: vec![named(&one, "v1"), named(&two, "v2")],
            annotations: None,
        };
        let tarball = write_layout(Vec::new(), &index, &blobs).unwrap();
        let reader = || std::io::Cursor::new(tarball.clone());
        let reference = "example.com/app:v1";

        let image = import(dst.clone(), dst.clone(), reference, ArchiveFormat::Oci, None, reader())
            .await
            .unwrap();
        assert_eq!(image.target, one);

        let image = import(
            dst.clone(),
            dst.clone(),
            reference,
            ArchiveFormat::Oci,
            Some("v2"),
            reader(),
        )
        .await
        .unwrap();
        assert_eq!(image.target, two);
        assert_eq!(dst.get(reference).await.unwrap().target, two);

        let err = import(dst.clone(), dst, reference, ArchiveFormat::Oci, Some("v3"), reader())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_export_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let root = Descriptor::for_content(media_types::OCI_IMAGE_MANIFEST, b"absent");
        let cancel = CancellationToken::new();
        let err = export(storage(&dir), &cancel, &root, None, ArchiveFormat::Oci, Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_docker_format_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let store = storage(&dir);
        let reader = std::io::empty();
        let err = import(store.clone(), store, "app:v1", ArchiveFormat::Docker, None, reader)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_select_target_by_ref_name() {
        let one = Descriptor::for_content(media_types::OCI_IMAGE_MANIFEST, b"one");
        let two = Descriptor::for_content(media_types::OCI_IMAGE_MANIFEST, b"two");
        let index = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: vec![named(&one, "v1"), named(&two, "v2")],
            annotations: None,
        };

        assert_eq!(select_target(&index, Some("v2")).unwrap(), two);
        assert!(select_target(&index, Some("v3")).unwrap_err().is_not_found());
        assert!(select_target(&index, None).unwrap_err().is_not_found());

        let twice = ImageIndex {
            manifests: vec![named(&one, "v1"), named(&two, "v1")],
            ..index
        };
        assert!(named_entry(&twice, "v1").unwrap_err().is_not_found());
    }
}
