//! Keyed result cache
//!
//! Any serializable result can be stored under a string key and loaded
//! back instead of recomputing it.

use crate::types::{VerdureError, VerdureResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Byte store behind [`Cached`]
pub trait CacheStore {
    fn load(&self, key: &str) -> VerdureResult<Option<Vec<u8>>>;
    fn store(&self, key: &str, bytes: &[u8]) -> VerdureResult<()>;
}

/// One JSON file per key in a directory
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// `<data dir>/verdure/jars`
    pub fn default_location() -> VerdureResult<Self> {
        let base = dirs::data_dir().ok_or_else(|| {
            VerdureError::Processing("No platform data directory for the cache".to_string())
        })?;
        Ok(Self::new(base.join("verdure").join("jars")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys must be plain file names so every entry stays inside `dir`
    fn path_for(&self, key: &str) -> VerdureResult<PathBuf> {
        let plain = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(|c: char| c == '/' || c == '\\' || c == '\0');
        if !plain {
            return Err(VerdureError::InvalidFormat(format!("Invalid cache key {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl CacheStore for FsCacheStore {
    fn load(&self, key: &str) -> VerdureResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }

    fn store(&self, key: &str, bytes: &[u8]) -> VerdureResult<()> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    fn entries(&self) -> VerdureResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| VerdureError::Processing("Cache lock poisoned".to_string()))
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, key: &str) -> VerdureResult<Option<Vec<u8>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn store(&self, key: &str, bytes: &[u8]) -> VerdureResult<()> {
        self.entries()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Load-or-compute wrapper over a [`CacheStore`]
pub struct Cached<S: CacheStore> {
    store: S,
}

impl<S: CacheStore> Cached<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// `base`, or `base_suffix` for a call-specific entry
    pub fn key(base: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}_{}", base, suffix),
            None => base.to_string(),
        }
    }

    /// Return the cached value, or compute and store it. `refresh` forces recomputation.
    pub fn get_or_compute<T, F>(&self, key: &str, refresh: bool, compute: F) -> VerdureResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> VerdureResult<T>,
    {
        if !refresh {
            if let Some(bytes) = self.store.load(key)? {
                log::debug!("Cache hit for {}", key);
                return Ok(serde_json::from_slice(&bytes)?);
            }
        }

        log::info!("Computing {}{}", key, if refresh { " (refresh)" } else { "" });
        let value = compute()?;
        self.store.store(key, &serde_json::to_vec(&value)?)?;
        Ok(value)
    }
}
