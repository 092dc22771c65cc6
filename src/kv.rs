// Single-file JSON key-value storage for local mode

use crate::error::ApiError;
use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One JSON object on disk mapping namespace keys to values.
///
/// Readers take a shared lock, writers an exclusive lock for the whole
/// read-modify-write, so concurrent processes never observe a half-written
/// file. A file that fails to parse is treated as empty.
#[derive(Debug, Clone)]
pub struct KvFile {
    path: PathBuf,
}

impl KvFile {
    /// Open a store at `path`. The file itself is created on first write;
    /// parent directories are created here.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one key. Missing file and missing key are both `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ApiError> {
        let map = self.read_map()?;
        match map.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Write one key, creating the file if needed.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ApiError> {
        let value = serde_json::to_value(value)?;
        self.with_map_mut(|map| {
            map.insert(key.to_string(), value);
            Ok(())
        })
    }

    /// Drop one key. Removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> Result<(), ApiError> {
        self.with_map_mut(|map| {
            map.remove(key);
            Ok(())
        })
    }

    /// Read-modify-write one key under a single exclusive lock.
    /// `make_default` seeds the value when the key is absent.
    pub fn update<T, R>(
        &self,
        key: &str,
        make_default: impl FnOnce() -> T,
        mutate: impl FnOnce(&mut T) -> Result<R, ApiError>,
    ) -> Result<R, ApiError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.with_map_mut(|map| {
            let mut value: T = match map.remove(key) {
                Some(raw) => serde_json::from_value(raw)?,
                None => make_default(),
            };
            let out = mutate(&mut value)?;
            map.insert(key.to_string(), serde_json::to_value(&value)?);
            Ok(out)
        })
    }

    fn read_map(&self) -> Result<Map<String, Value>, ApiError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;
        let mut raw = String::new();
        (&file).read_to_string(&mut raw)?;
        // Lock is released when file is dropped
        drop(file);

        Ok(parse_map(&self.path, &raw))
    }

    fn with_map_mut<R>(
        &self,
        f: impl FnOnce(&mut Map<String, Value>) -> Result<R, ApiError>,
    ) -> Result<R, ApiError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;

        // Exclusive lock covers the whole read-modify-write
        file.lock_exclusive()?;

        let mut raw = String::new();
        (&file).read_to_string(&mut raw)?;
        let mut map = parse_map(&self.path, &raw);

        let out = f(&mut map)?;

        let json = serde_json::to_string(&Value::Object(map))?;
        (&file).seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        (&file).write_all(json.as_bytes())?;
        file.sync_all()?;

        debug!(file = ?self.path, bytes = json.len(), "Wrote kv file");

        // Lock is released when file is dropped
        Ok(out)
    }
}

fn parse_map(path: &Path, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(file = ?path, "Top-level value is not an object, treating as empty");
            Map::new()
        }
        Err(e) => {
            warn!(file = ?path, error = ?e, "Failed to parse kv file, treating as empty");
            Map::new()
        }
    }
}
