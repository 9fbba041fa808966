use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by an optional JSON file
///
/// Uses `ArcSwap` for lock-free reads. Handlers call `get()` on every
/// request, writers replace the whole snapshot.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load configuration from `path`, or use defaults when no path is given
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::parse(&raw)?
            }
            None => AppConfig::default(),
        };

        Ok(Self {
            path: path.map(Path::to_path_buf),
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Wrap an in-memory configuration
    pub fn from_config(config: AppConfig) -> Self {
        Self {
            path: None,
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    fn parse(raw: &str) -> Result<AppConfig> {
        serde_json::from_str(raw).map_err(|e| AppError::Config(format!("Invalid config: {}", e)))
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration snapshot
    pub fn set(&self, config: AppConfig) {
        self.cache.store(Arc::new(config));
    }

    /// Apply an in-place modification to a copy and publish it
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.set(config);
    }

    /// File the configuration was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
