//! On-disk state layout and atomic file helpers.
//!
//! Every write lands in a sibling temp file first and is renamed into place,
//! so a crash never leaves a half-written file behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Where the gateway keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl StateDir {
    /// XDG locations from `switchboard-paths`.
    pub fn from_env() -> Self {
        Self {
            config_dir: switchboard_paths::config_dir(),
            data_dir: switchboard_paths::data_dir(),
            cache_dir: switchboard_paths::cache_dir(),
        }
    }

    /// Everything under one root, for tests and portable installs.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
        }
    }

    pub fn providers_file(&self) -> PathBuf {
        self.config_dir.join("providers.toml")
    }

    pub fn favorites_file(&self) -> PathBuf {
        self.data_dir.join("favorites.json")
    }

    pub fn quota_file(&self) -> PathBuf {
        self.data_dir.join("quota.json")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.cache_dir.join("catalog")
    }
}

/// Read a JSON file, `None` if it does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a value as pretty JSON, atomically.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes).await
}

/// Read a TOML file, `None` if it does not exist.
pub async fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(toml::from_str(&text)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a value as TOML, atomically.
pub async fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = toml::to_string_pretty(value)?;
    write_atomic(path, text.as_bytes()).await
}

/// Delete a file. Returns whether it existed.
pub async fn remove_file(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
