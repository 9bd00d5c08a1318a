use std::env;
use std::fmt;
use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub pull: PullConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub fs_root: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

/// How references are mapped onto registries
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registry used for references without a hostname
    pub default_host: String,
    /// Hosts spoken to over plain HTTP instead of HTTPS
    #[serde(default)]
    pub plain_http_hosts: Vec<String>,
}

/// Defaults applied to every pull unless the caller overrides them
#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    pub snapshotter: String,
    pub unpack: bool,
    pub convert_schema1: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let config = Config::builder()
            .set_default("storage.backend", "fs")?
            .set_default("storage.fs_root", "./data")?
            .set_default("registry.default_host", "registry-1.docker.io")?
            .set_default("registry.plain_http_hosts", Vec::<String>::new())?
            .set_default("pull.snapshotter", "overlayfs")?
            .set_default("pull.unpack", false)?
            .set_default("pull.convert_schema1", false)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // IMGDIST_STORAGE__FS_ROOT=/var/lib/imgdist
            .add_source(
                Environment::with_prefix("IMGDIST")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("registry.plain_http_hosts"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Fs,
                fs_root: Some(PathBuf::from("./data")),
                s3_bucket: None,
                s3_region: None,
                s3_endpoint: None,
                s3_access_key: None,
                s3_secret_key: None,
            },
            registry: RegistryConfig {
                default_host: "registry-1.docker.io".to_string(),
                plain_http_hosts: Vec::new(),
            },
            pull: PullConfig {
                snapshotter: "overlayfs".to_string(),
                unpack: false,
                convert_schema1: false,
            },
        }
    }
}
