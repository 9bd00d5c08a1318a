pub mod archive;
pub mod client;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod images;
pub mod remotes;
pub mod schema1;
pub mod storage;

pub use client::{Client, ExportOptions, ImportOptions, RemoteOptions, Unpacker, Version};
pub use error::{Error, Result};
