//! Media type tags for the manifest and blob formats the distribution
//! engine dispatches on.

pub const DOCKER_SCHEMA1_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_SCHEMA1_MANIFEST_UNSIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_SCHEMA2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_SCHEMA2_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_SCHEMA2_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_SCHEMA2_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_SCHEMA2_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_SCHEMA2_LAYER_FOREIGN: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar";
pub const DOCKER_SCHEMA2_LAYER_FOREIGN_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_IMAGE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// Annotation carrying the tag of a manifest inside an OCI image layout
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Every manifest type a registry may answer a resolve with.
pub const MANIFEST_ACCEPT: [&str; 5] = [
    DOCKER_SCHEMA2_MANIFEST,
    DOCKER_SCHEMA2_MANIFEST_LIST,
    OCI_IMAGE_MANIFEST,
    OCI_IMAGE_INDEX,
    DOCKER_SCHEMA1_MANIFEST,
];

/// Single-image manifests (schema2 or OCI)
pub fn is_manifest(media_type: &str) -> bool {
    matches!(media_type, DOCKER_SCHEMA2_MANIFEST | OCI_IMAGE_MANIFEST)
}

/// Manifest lists and OCI indexes
pub fn is_index(media_type: &str) -> bool {
    matches!(media_type, DOCKER_SCHEMA2_MANIFEST_LIST | OCI_IMAGE_INDEX)
}

/// Anything that must be uploaded after the content it references
pub fn is_manifest_like(media_type: &str) -> bool {
    is_manifest(media_type) || is_index(media_type)
}

pub fn is_schema1(media_type: &str) -> bool {
    matches!(media_type, DOCKER_SCHEMA1_MANIFEST | DOCKER_SCHEMA1_MANIFEST_UNSIGNED)
}

pub fn is_layer(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.docker.image.rootfs.")
        || media_type.starts_with("application/vnd.oci.image.layer.")
}

pub fn is_config(media_type: &str) -> bool {
    matches!(media_type, DOCKER_SCHEMA2_CONFIG | OCI_IMAGE_CONFIG)
}
