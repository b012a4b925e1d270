//! Filesystem store
//!
//! One JSON document per record at `<files.path>/<identity>.json`. Enabled
//! when `files.enabled` is set and the directory exists.

use super::{ContentStore, StoreRecord};
use crate::config::{AgentSettings, StoreKind};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Default)]
pub struct FilesStore {
    path: Option<PathBuf>,
}

impl FilesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store rooted at `path`, enabled when the directory exists
    pub fn at(path: &Path) -> Self {
        Self {
            path: path.is_dir().then(|| path.to_path_buf()),
        }
    }

    fn record_path(&self, identity: &str) -> Result<PathBuf> {
        let dir = self.path.as_ref().context("files store is disabled")?;
        Ok(dir.join(format!("{}.{}", identity, RECORD_EXTENSION)))
    }
}

fn is_identity(stem: &str) -> bool {
    stem.len() == 40 && stem.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait::async_trait]
impl ContentStore for FilesStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Files
    }

    fn enabled(&self) -> bool {
        self.path.is_some()
    }

    async fn check(&mut self, settings: &AgentSettings, _cache_hosts: &[String]) -> bool {
        let files = &settings.files;
        self.path = if files.enabled && files.path.is_dir() {
            Some(files.path.clone())
        } else {
            if files.enabled {
                warn!("Files store directory {} not present", files.path.display());
            }
            None
        };
        self.enabled()
    }

    async fn get(&self, identity: &str) -> Result<Option<StoreRecord>> {
        let path = self.record_path(identity)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let record = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse record {}", path.display()))?;
        Ok(Some(record))
    }

    async fn set(&mut self, identity: &str, record: &StoreRecord) -> Result<()> {
        let path = self.record_path(identity)?;
        let contents = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn delete(&mut self, identity: &str) -> Result<()> {
        let path = self.record_path(identity)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let Some(dir) = &self.path else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_identity(stem) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(hash: &str) -> StoreRecord {
        StoreRecord {
            hash: hash.to_string(),
            dest: Some("/tmp/test_1".to_string()),
            env: None,
            store: StoreKind::Files,
            generation: 1,
        }
    }

    const IDENTITY: &str = "f9ac6090c76fd9e62fb0319abcea7ebb2266fab2";

    #[tokio::test]
    async fn test_one_file_per_record() {
        let dir = TempDir::new().unwrap();
        let mut store = FilesStore::at(dir.path());
        assert!(store.enabled());

        store.set(IDENTITY, &record("abc")).await.unwrap();
        assert!(dir.path().join(format!("{}.json", IDENTITY)).is_file());
        assert_eq!(store.get(IDENTITY).await.unwrap(), Some(record("abc")));

        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        assert_eq!(store.keys().await.unwrap(), vec![IDENTITY.to_string()]);

        store.delete(IDENTITY).await.unwrap();
        assert!(store.get(IDENTITY).await.unwrap().is_none());
        store.delete(IDENTITY).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_requires_enabled_directory() {
        let dir = TempDir::new().unwrap();
        let mut settings = AgentSettings::default();
        settings.files.path = dir.path().to_path_buf();

        let mut store = FilesStore::new();
        assert!(!store.check(&settings, &[]).await);
        settings.files.enabled = true;
        assert!(store.check(&settings, &[]).await);
        settings.files.path = dir.path().join("missing");
        assert!(!store.check(&settings, &[]).await);
        assert!(store.get(IDENTITY).await.is_err());
    }
}
