use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::WhepConfig;
use crate::error::Result;

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads. The file is created with defaults
/// when it does not exist yet.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<WhepConfig>>,
}

impl ConfigStore {
    /// Open (or create) the configuration file
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = Self::load_config(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        Ok(Self {
            path: path.to_path_buf(),
            cache,
        })
    }

    /// Load configuration from disk, writing defaults on first use
    async fn load_config(path: &Path) -> Result<WhepConfig> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = WhepConfig::default();
                Self::save_config_to_file(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write configuration through a temporary file so readers never see a partial file
    async fn save_config_to_file(path: &Path, config: &WhepConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<WhepConfig> {
        self.cache.load_full()
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; for concurrent updates the last write wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut WhepConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        // Persist first, then publish
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        Ok(())
    }
}
