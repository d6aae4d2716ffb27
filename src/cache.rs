// 💾 JSON Cache - Named JSON files with a freshness window
//
// Writes go to a temp file that is renamed into place, so a crash never
// leaves a half-written cache behind.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct JsonCache {
    dir: PathBuf,
    max_age: Duration,
}

impl JsonCache {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        JsonCache {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn with_max_age_hours(dir: impl Into<PathBuf>, hours: u64) -> Self {
        Self::new(dir, Duration::from_secs(hours * 3600))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Cached value if present and younger than `max_age`
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path_for(name);
        match self.age(&path)? {
            Some(age) if age <= self.max_age => {
                debug!("Cache hit: {} ({}s old)", name, age.as_secs());
                self.read(&path)
            }
            Some(age) => {
                debug!("Cache stale: {} ({}h old)", name, age.as_secs() / 3600);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Cached value regardless of age; the fallback when a refresh fails
    pub fn load_stale<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path)
    }

    pub fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache dir: {:?}", self.dir))?;

        let path = self.path_for(name);
        let tmp = self.dir.join(format!(".{}.json.tmp", name));
        let body = serde_json::to_vec(value).context("Failed to serialize cache entry")?;

        fs::write(&tmp, body).with_context(|| format!("Failed to write cache: {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move cache into place: {:?}", path))?;

        debug!("Cache saved: {}", name);
        Ok(())
    }

    fn age(&self, path: &Path) -> Result<Option<Duration>> {
        if !path.exists() {
            return Ok(None);
        }
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat cache file: {:?}", path))?;
        // Clock skew: a file from the future counts as fresh
        Ok(Some(SystemTime::now().duration_since(modified).unwrap_or_default()))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache: {:?}", path))?;
        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Ignoring corrupt cache {:?}: {}", path, e);
                Ok(None)
            }
        }
    }
}
