pub mod client;
pub mod digest;
pub mod image_reference;
pub mod media_types;
pub mod models;

// Re-export main client types for convenience
pub use client::{BlobStream, Client, ClientSession};
pub use digest::{Digester, OciDigest};
pub use image_reference::ImageReference;
pub use models::{
    Descriptor, FsLayer, HistoryEntry, ImageIndex, ImageManifest, OciLayout, Platform, Rootfs,
    Schema1History, Schema1Manifest,
};
