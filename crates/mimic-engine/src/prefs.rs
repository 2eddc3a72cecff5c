//! Long-lived user preferences, stored as a flat JSON object.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::paths::ensure_dir;

pub const KEY_LATEST_VERSION: &str = "engine.latest";
pub const KEY_LATEST_CHECKED: &str = "engine.latestChecked";

/// Preferences file handle. Cheap to clone; clones share one write lock.
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Preferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .load()?
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    pub fn read_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.load()?.get(key).and_then(Value::as_i64))
    }

    /// Set `key` and rewrite the whole file.
    pub fn write(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut prefs = self.load()?;
        prefs.insert(key.to_string(), value.into());
        self.store(&prefs)
    }

    fn load(&self) -> Result<Map<String, Value>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Map::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Preferences file absent, treating as empty");
                Ok(Map::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, prefs: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let json = serde_json::to_string_pretty(prefs)?;
        let temp = self.path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&temp, json)?;
        if let Err(e) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }
}
